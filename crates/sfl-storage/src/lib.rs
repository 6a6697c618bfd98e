//! Resumable archive downloads + zip member streaming for SFL.

pub mod archive;

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, ETAG, IF_RANGE, LAST_MODIFIED, RANGE,
    REFERER,
};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};

pub use archive::{ArchiveError, ArchiveStreamer, MemberName, MemberNameRule, Members, ScanStats};

pub const CRATE_NAME: &str = "sfl-storage";

const PROGRESS_LOG_EVERY: u64 = 64 * 1024 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            referer: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> FetchError {
    let context = context.into();
    move |source| FetchError::Io { context, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampKind {
    EntityTag,
    LastModified,
    ContentLength,
}

impl StampKind {
    fn header(self) -> HeaderName {
        match self {
            Self::EntityTag => ETAG,
            Self::LastModified => LAST_MODIFIED,
            Self::ContentLength => CONTENT_LENGTH,
        }
    }
}

/// Liveness stamp derived from the HEAD response: entity tag, else
/// last-modified, else content length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStamp {
    value: String,
    kind: StampKind,
}

impl RemoteStamp {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        [StampKind::EntityTag, StampKind::LastModified, StampKind::ContentLength]
            .into_iter()
            .find_map(|kind| {
                let value = headers.get(kind.header())?.to_str().ok()?.trim();
                (!value.is_empty()).then(|| Self {
                    value: value.to_string(),
                    kind,
                })
            })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> StampKind {
        self.kind
    }

    /// Value usable as an `If-Range` validator. A content length is not one.
    pub fn if_range(&self) -> Option<&str> {
        match self.kind {
            StampKind::EntityTag | StampKind::LastModified => Some(&self.value),
            StampKind::ContentLength => None,
        }
    }
}

/// Destination file plus its `.part`, `.part.stamp` and `.stamp` siblings.
/// `.part.stamp` names the remote version the partial file was started under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePaths {
    pub dest: PathBuf,
    pub part: PathBuf,
    pub part_stamp: PathBuf,
    pub stamp: PathBuf,
}

impl ArchivePaths {
    pub fn for_destination(dest: impl Into<PathBuf>) -> Self {
        let dest = dest.into();
        Self {
            part: sibling_with_suffix(&dest, ".part"),
            part_stamp: sibling_with_suffix(&dest, ".part.stamp"),
            stamp: sibling_with_suffix(&dest, ".stamp"),
            dest,
        }
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Destination and recorded stamp match the remote; nothing transferred.
    AlreadyFresh,
    Downloaded { bytes: u64, resumed_from: u64 },
    /// Server answered 416 to a range request; the partial file was already whole.
    PartialWasComplete { bytes: u64 },
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub path: PathBuf,
    pub outcome: FetchOutcome,
    pub stamp: Option<String>,
}

#[derive(Debug)]
pub struct ArchiveFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl ArchiveFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        if let Some(referer) = config.referer.as_deref() {
            if let Ok(value) = HeaderValue::from_str(referer) {
                headers.insert(REFERER, value);
            }
        }

        // Transparent decompression would break byte-range resumes.
        let mut builder = reqwest::Client::builder()
            .no_gzip()
            .no_brotli()
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Download `url` to `dest`, resuming an interrupted `.part` transfer and
    /// skipping the transfer entirely when the recorded stamp is current.
    pub async fn fetch(
        &self,
        url: &str,
        dest: impl AsRef<Path>,
    ) -> Result<FetchReport, FetchError> {
        let paths = ArchivePaths::for_destination(dest.as_ref());
        let span = info_span!("archive_fetch", url, dest = %paths.dest.display());
        self.fetch_inner(url, paths).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str, paths: ArchivePaths) -> Result<FetchReport, FetchError> {
        if let Some(parent) = paths.dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(io_err(format!("creating {}", parent.display())))?;
        }

        let stamp = self.with_retries(url, "head", || self.head_stamp(url)).await?;

        if let Some(stamp) = &stamp {
            if recorded_stamp_matches(&paths, stamp).await? {
                info!(stamp = stamp.as_str(), "archive already up to date");
                return Ok(FetchReport {
                    path: paths.dest,
                    outcome: FetchOutcome::AlreadyFresh,
                    stamp: Some(stamp.value.clone()),
                });
            }
        }

        let outcome = self
            .with_retries(url, "transfer", || self.transfer_once(url, &paths, stamp.as_ref()))
            .await?;
        finalize(&paths, stamp.as_ref()).await?;

        info!(?outcome, "archive finalized");
        Ok(FetchReport {
            path: paths.dest,
            outcome,
            stamp: stamp.map(|s| s.value),
        })
    }

    async fn with_retries<T, F, Fut>(
        &self,
        url: &str,
        what: &str,
        mut op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "{what} failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(FetchError::Exhausted {
                        url: url.to_string(),
                        attempts,
                        last: Box::new(err),
                    })
                }
            }
        }
    }

    async fn head_stamp(&self, url: &str) -> Result<Option<RemoteStamp>, FetchError> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(RemoteStamp::from_headers(resp.headers()))
    }

    async fn transfer_once(
        &self,
        url: &str,
        paths: &ArchivePaths,
        stamp: Option<&RemoteStamp>,
    ) -> Result<FetchOutcome, FetchError> {
        let offset = resumable_offset(paths, stamp).await?;
        if offset == 0 {
            record_part_stamp(paths, stamp).await?;
        }

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
            // A changed resource answers 200 and the partial is rewritten.
            if let Some(validator) = stamp.and_then(RemoteStamp::if_range) {
                request = request.header(IF_RANGE, validator);
            }
        }
        let resp = request.send().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;

        let status = resp.status();
        match status {
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                debug!(offset, "range not satisfiable; partial file is complete");
                Ok(FetchOutcome::PartialWasComplete { bytes: offset })
            }
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                debug!(offset, "resuming partial transfer");
                let written = write_body(resp, &paths.part, true).await?;
                Ok(FetchOutcome::Downloaded {
                    bytes: offset + written,
                    resumed_from: offset,
                })
            }
            s if s.is_success() => {
                if offset > 0 {
                    debug!(offset, "full response; discarding partial file");
                }
                let written = write_body(resp, &paths.part, false).await?;
                Ok(FetchOutcome::Downloaded {
                    bytes: written,
                    resumed_from: 0,
                })
            }
            _ => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            }),
        }
    }
}

async fn existing_len(path: &Path) -> Result<u64, FetchError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(FetchError::Io {
            context: format!("inspecting {}", path.display()),
            source: err,
        }),
    }
}

/// Bytes of `.part` that may be extended with a range request. A partial
/// started under another remote version, or under no known version, is
/// discarded so its prefix is never joined to a different tail.
async fn resumable_offset(
    paths: &ArchivePaths,
    stamp: Option<&RemoteStamp>,
) -> Result<u64, FetchError> {
    let offset = existing_len(&paths.part).await?;
    if offset == 0 {
        return Ok(0);
    }
    let started_under = read_trimmed(&paths.part_stamp).await?;
    match (stamp, started_under.as_deref()) {
        (Some(stamp), Some(recorded)) if recorded == stamp.as_str() => Ok(offset),
        (_, recorded) => {
            warn!(
                offset,
                part_stamp = recorded.unwrap_or("<none>"),
                remote_stamp = stamp.map(RemoteStamp::as_str).unwrap_or("<none>"),
                "partial file belongs to another remote version; restarting"
            );
            remove_if_exists(&paths.part).await?;
            remove_if_exists(&paths.part_stamp).await?;
            Ok(0)
        }
    }
}

async fn record_part_stamp(
    paths: &ArchivePaths,
    stamp: Option<&RemoteStamp>,
) -> Result<(), FetchError> {
    match stamp {
        Some(stamp) => fs::write(&paths.part_stamp, stamp.as_str())
            .await
            .map_err(io_err(format!("writing {}", paths.part_stamp.display()))),
        None => remove_if_exists(&paths.part_stamp).await,
    }
}

async fn read_trimmed(path: &Path) -> Result<Option<String>, FetchError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(FetchError::Io {
            context: format!("reading {}", path.display()),
            source: err,
        }),
    }
}

async fn recorded_stamp_matches(
    paths: &ArchivePaths,
    stamp: &RemoteStamp,
) -> Result<bool, FetchError> {
    if !fs::try_exists(&paths.dest)
        .await
        .map_err(io_err(format!("checking {}", paths.dest.display())))?
    {
        return Ok(false);
    }
    Ok(read_trimmed(&paths.stamp).await?.as_deref() == Some(stamp.as_str()))
}

async fn write_body(
    mut resp: reqwest::Response,
    path: &Path,
    append: bool,
) -> Result<u64, FetchError> {
    let url = resp.url().to_string();
    let mut options = fs::OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    let mut file = options
        .open(path)
        .await
        .map_err(io_err(format!("opening {}", path.display())))?;

    let mut written = 0u64;
    let mut next_log = PROGRESS_LOG_EVERY;
    loop {
        let chunk = resp.chunk().await.map_err(|source| FetchError::Request {
            url: url.clone(),
            source,
        })?;
        let Some(chunk) = chunk else { break };
        file.write_all(&chunk)
            .await
            .map_err(io_err(format!("writing {}", path.display())))?;
        written += chunk.len() as u64;
        if written >= next_log {
            debug!(written, "transfer progress");
            next_log += PROGRESS_LOG_EVERY;
        }
    }

    file.flush()
        .await
        .map_err(io_err(format!("flushing {}", path.display())))?;
    file.sync_all()
        .await
        .map_err(io_err(format!("syncing {}", path.display())))?;
    Ok(written)
}

async fn remove_if_exists(path: &Path) -> Result<(), FetchError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FetchError::Io {
            context: format!("removing {}", path.display()),
            source: err,
        }),
    }
}

/// Old stamp out, stale destination out, `.part` renamed into place, new stamp
/// written via its own temp file. A crash at any step leaves no destination
/// paired with a stamp it was not downloaded under.
async fn finalize(paths: &ArchivePaths, stamp: Option<&RemoteStamp>) -> Result<(), FetchError> {
    remove_if_exists(&paths.stamp).await?;
    remove_if_exists(&paths.dest).await?;
    fs::rename(&paths.part, &paths.dest).await.map_err(io_err(format!(
        "renaming {} -> {}",
        paths.part.display(),
        paths.dest.display()
    )))?;
    remove_if_exists(&paths.part_stamp).await?;

    if let Some(stamp) = stamp {
        let tmp = sibling_with_suffix(&paths.stamp, ".tmp");
        fs::write(&tmp, stamp.as_str())
            .await
            .map_err(io_err(format!("writing {}", tmp.display())))?;
        fs::rename(&tmp, &paths.stamp)
            .await
            .map_err(io_err(format!("renaming {}", tmp.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &[u8] = b"PK\x03\x04 pretend this is a large companyfacts archive body";

    fn fast_fetcher(max_attempts: usize) -> ArchiveFetcher {
        ArchiveFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("sfl-tests/0.1 (ops@example.com)".into()),
            referer: None,
            backoff: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .expect("fetcher")
    }

    async fn mount_head(server: &MockServer, etag: &str) {
        Mock::given(method("HEAD"))
            .and(path("/companyfacts.zip"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", etag))
            .mount(server)
            .await;
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn stamp_prefers_etag_then_last_modified_then_length() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1234"));
        let length = RemoteStamp::from_headers(&headers).unwrap();
        assert_eq!(length.as_str(), "1234");
        assert_eq!(length.kind(), StampKind::ContentLength);
        assert_eq!(length.if_range(), None);

        headers.insert(LAST_MODIFIED, HeaderValue::from_static("Tue, 01 Oct 2024 06:00:00 GMT"));
        assert_eq!(
            RemoteStamp::from_headers(&headers).unwrap().as_str(),
            "Tue, 01 Oct 2024 06:00:00 GMT"
        );

        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        let etag = RemoteStamp::from_headers(&headers).unwrap();
        assert_eq!(etag.as_str(), "\"abc\"");
        assert_eq!(etag.if_range(), Some("\"abc\""));

        assert!(RemoteStamp::from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn sibling_paths_append_suffixes() {
        let paths = ArchivePaths::for_destination("/data/companyfacts.zip");
        assert_eq!(paths.part, PathBuf::from("/data/companyfacts.zip.part"));
        assert_eq!(paths.part_stamp, PathBuf::from("/data/companyfacts.zip.part.stamp"));
        assert_eq!(paths.stamp, PathBuf::from("/data/companyfacts.zip.stamp"));
    }

    #[tokio::test]
    async fn fresh_download_writes_file_and_stamp() {
        let server = MockServer::start().await;
        mount_head(&server, "\"v1\"").await;
        Mock::given(method("GET"))
            .and(path("/companyfacts.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("sec").join("companyfacts.zip");
        let report = fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch");

        assert_eq!(
            report.outcome,
            FetchOutcome::Downloaded {
                bytes: BODY.len() as u64,
                resumed_from: 0
            }
        );
        assert_eq!(std::fs::read(&dest).expect("dest"), BODY);
        let paths = ArchivePaths::for_destination(&dest);
        assert_eq!(std::fs::read_to_string(&paths.stamp).expect("stamp"), "\"v1\"");
        assert!(!paths.part.exists());
        assert!(!paths.part_stamp.exists());
    }

    #[tokio::test]
    async fn matching_stamp_short_circuits_transfer() {
        let server = MockServer::start().await;
        mount_head(&server, "\"v1\"").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        std::fs::write(&dest, b"existing").expect("dest");
        std::fs::write(ArchivePaths::for_destination(&dest).stamp, "\"v1\"\n").expect("stamp");

        let report = fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch");

        assert_eq!(report.outcome, FetchOutcome::AlreadyFresh);
        assert_eq!(std::fs::read(&dest).expect("dest"), b"existing");
    }

    #[tokio::test]
    async fn changed_stamp_replaces_destination() {
        let server = MockServer::start().await;
        mount_head(&server, "\"v2\"").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        let paths = ArchivePaths::for_destination(&dest);
        std::fs::write(&dest, b"stale archive").expect("dest");
        std::fs::write(&paths.stamp, "\"v1\"").expect("stamp");

        fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch");

        assert_eq!(std::fs::read(&dest).expect("dest"), BODY);
        assert_eq!(std::fs::read_to_string(&paths.stamp).expect("stamp"), "\"v2\"");
    }

    #[tokio::test]
    async fn interrupted_transfer_resumes_with_range_request() {
        let split = 11;
        let server = MockServer::start().await;
        mount_head(&server, "\"v1\"").await;
        Mock::given(method("GET"))
            .and(header("Range", format!("bytes={split}-").as_str()))
            .and(header("If-Range", "\"v1\""))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(&BODY[split..]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        let paths = ArchivePaths::for_destination(&dest);
        std::fs::write(&paths.part, &BODY[..split]).expect("part");
        std::fs::write(&paths.part_stamp, "\"v1\"").expect("part stamp");

        let report = fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch");

        assert_eq!(
            report.outcome,
            FetchOutcome::Downloaded {
                bytes: BODY.len() as u64,
                resumed_from: split as u64
            }
        );
        assert_eq!(std::fs::read(&dest).expect("dest"), BODY);
    }

    #[tokio::test]
    async fn full_response_discards_partial_file() {
        let server = MockServer::start().await;
        mount_head(&server, "\"v1\"").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        std::fs::write(ArchivePaths::for_destination(&dest).part, b"garbage-prefix").expect("part");

        fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch");

        assert_eq!(std::fs::read(&dest).expect("dest"), BODY);
    }

    #[tokio::test]
    async fn partial_from_previous_version_is_discarded_before_ranging() {
        const NEW_BODY: &[u8] = b"NEWVERSION-prefix-bytes-and-more-tail";
        let split = 11;
        let server = MockServer::start().await;
        mount_head(&server, "\"v2\"").await;
        Mock::given(method("GET"))
            .and(header("Range", format!("bytes={split}-").as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(&NEW_BODY[split..]))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(NEW_BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        let paths = ArchivePaths::for_destination(&dest);
        std::fs::write(&paths.part, b"OLDVERSION-").expect("part");
        std::fs::write(&paths.part_stamp, "\"v1\"").expect("part stamp");

        let report = fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch");

        assert_eq!(
            report.outcome,
            FetchOutcome::Downloaded {
                bytes: NEW_BODY.len() as u64,
                resumed_from: 0
            }
        );
        assert_eq!(std::fs::read(&dest).expect("dest"), NEW_BODY);
        assert_eq!(std::fs::read_to_string(&paths.stamp).expect("stamp"), "\"v2\"");
        assert!(!paths.part_stamp.exists());
    }

    #[tokio::test]
    async fn partial_without_recorded_version_is_not_resumed() {
        let server = MockServer::start().await;
        mount_head(&server, "\"v1\"").await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=14-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(&BODY[14..]))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        std::fs::write(ArchivePaths::for_destination(&dest).part, b"unknown-origin").expect("part");

        fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch");

        assert_eq!(std::fs::read(&dest).expect("dest"), BODY);
    }

    #[tokio::test]
    async fn range_not_satisfiable_finalizes_partial() {
        let server = MockServer::start().await;
        mount_head(&server, "\"v1\"").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        let paths = ArchivePaths::for_destination(&dest);
        std::fs::write(&paths.part, BODY).expect("part");
        std::fs::write(&paths.part_stamp, "\"v1\"").expect("part stamp");

        let report = fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch");

        assert_eq!(
            report.outcome,
            FetchOutcome::PartialWasComplete {
                bytes: BODY.len() as u64
            }
        );
        assert_eq!(std::fs::read(&dest).expect("dest"), BODY);
        assert_eq!(std::fs::read_to_string(&paths.stamp).expect("stamp"), "\"v1\"");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let server = MockServer::start().await;
        mount_head(&server, "\"v1\"").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect("fetch succeeds on third attempt");

        assert_eq!(std::fs::read(&dest).expect("dest"), BODY);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_terminal_error() {
        let server = MockServer::start().await;
        mount_head(&server, "\"v1\"").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("companyfacts.zip");
        let err = fast_fetcher(3)
            .fetch(&format!("{}/companyfacts.zip", server.uri()), &dest)
            .await
            .expect_err("all attempts fail");

        match err {
            FetchError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, FetchError::HttpStatus { status: 500, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dest.exists());
        assert!(!ArchivePaths::for_destination(&dest).stamp.exists());
    }
}
