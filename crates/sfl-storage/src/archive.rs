//! Zip member enumeration and single-member reads, without extracting the archive.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use sfl_core::MemberMeta;
use thiserror::Error;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("opening archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading zip directory of {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
    #[error("member {name} not found in {path}")]
    MissingMember { path: PathBuf, name: String },
    #[error("member {name}: {source}")]
    Member {
        name: String,
        #[source]
        source: ZipError,
    },
    #[error("reading member {name}: {source}")]
    ReadMember {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Naming convention for members that carry one entity each, e.g. `CIK0000320193.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberNameRule {
    pub prefix: String,
    pub extension: String,
}

impl Default for MemberNameRule {
    fn default() -> Self {
        Self {
            prefix: "CIK".to_string(),
            extension: ".json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberName {
    /// Does not follow the prefix/extension convention at all.
    NotCandidate,
    /// Follows the convention but the identity is not numeric.
    Malformed,
    Entity { entity_id: i64, natural_key: String },
}

impl MemberNameRule {
    pub fn classify(&self, name: &str) -> MemberName {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let Some(stem) = file_name
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_suffix(self.extension.as_str()))
        else {
            return MemberName::NotCandidate;
        };

        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return MemberName::Malformed;
        }
        match stem.parse::<i64>() {
            Ok(entity_id) => MemberName::Entity {
                entity_id,
                natural_key: stem.to_string(),
            },
            Err(_) => MemberName::Malformed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub entries: usize,
    pub candidates: usize,
    pub malformed: usize,
    pub filtered_out: usize,
    pub matched: usize,
}

pub struct ArchiveStreamer {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
}

impl ArchiveStreamer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| ArchiveError::Open {
            path: path.clone(),
            source,
        })?;
        let archive =
            ZipArchive::new(BufReader::new(file)).map_err(|source| ArchiveError::Directory {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), entries = archive.len(), "opened archive");
        Ok(Self { path, archive })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    /// Lazily walk the archive directory, yielding metadata for members whose
    /// name follows `rule` and whose identity passes `predicate`. Single pass;
    /// call again to restart.
    pub fn members<'a, P>(&'a mut self, rule: &'a MemberNameRule, predicate: P) -> Members<'a, P>
    where
        P: FnMut(i64) -> bool,
    {
        Members {
            archive: &mut self.archive,
            rule,
            predicate,
            index: 0,
            stats: ScanStats::default(),
        }
    }

    pub fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut file = match self.archive.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => {
                return Err(ArchiveError::MissingMember {
                    path: self.path.clone(),
                    name: name.to_string(),
                })
            }
            Err(source) => {
                return Err(ArchiveError::Member {
                    name: name.to_string(),
                    source,
                })
            }
        };
        let mut buf = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut buf)
            .map_err(|source| ArchiveError::ReadMember {
                name: name.to_string(),
                source,
            })?;
        Ok(buf)
    }
}

pub struct Members<'a, P> {
    archive: &'a mut ZipArchive<BufReader<File>>,
    rule: &'a MemberNameRule,
    predicate: P,
    index: usize,
    stats: ScanStats,
}

impl<P> Members<'_, P> {
    pub fn stats(&self) -> ScanStats {
        self.stats
    }
}

impl<P> Iterator for Members<'_, P>
where
    P: FnMut(i64) -> bool,
{
    type Item = Result<MemberMeta, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.archive.len() {
            let index = self.index;
            self.index += 1;

            let file = match self.archive.by_index_raw(index) {
                Ok(file) => file,
                Err(source) => {
                    return Some(Err(ArchiveError::Member {
                        name: format!("#{index}"),
                        source,
                    }))
                }
            };
            if file.is_dir() {
                continue;
            }
            self.stats.entries += 1;

            let (entity_id, natural_key) = match self.rule.classify(file.name()) {
                MemberName::NotCandidate => continue,
                MemberName::Malformed => {
                    self.stats.candidates += 1;
                    self.stats.malformed += 1;
                    debug!(name = file.name(), "skipping malformed member name");
                    continue;
                }
                MemberName::Entity {
                    entity_id,
                    natural_key,
                } => (entity_id, natural_key),
            };
            self.stats.candidates += 1;

            if !(self.predicate)(entity_id) {
                self.stats.filtered_out += 1;
                continue;
            }
            self.stats.matched += 1;

            return Some(Ok(MemberMeta {
                entity_id,
                natural_key,
                asset_path: file.name().to_string(),
                byte_size: file.size(),
                crc32: file.crc32(),
                sha256: None,
                last_modified: file.last_modified().and_then(zip_time_to_utc),
            }));
        }
        None
    }
}

/// Zip stores a naive local timestamp; it is pinned to UTC for stable comparisons.
fn zip_time_to_utc(time: zip::DateTime) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(
        i32::from(time.year()),
        u32::from(time.month()),
        u32::from(time.day()),
    )?
    .and_hms_opt(
        u32::from(time.hour()),
        u32::from(time.minute()),
        u32::from(time.second()),
    )?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};
    use zip::write::SimpleFileOptions;

    fn write_archive(members: &[(&str, &[u8])]) -> (TempDir, PathBuf) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("companyfacts.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).expect("create"));
        let stamp = zip::DateTime::from_date_and_time(2024, 3, 1, 4, 5, 6).expect("zip time");
        let options = || SimpleFileOptions::default().last_modified_time(stamp);
        writer.add_directory("docs/", options()).expect("dir");
        for (name, body) in members {
            writer.start_file(*name, options()).expect("start");
            writer.write_all(body).expect("write");
        }
        writer.finish().expect("finish");
        (dir, path)
    }

    #[test]
    fn classifies_member_names() {
        let rule = MemberNameRule::default();
        assert_eq!(
            rule.classify("CIK0000320193.json"),
            MemberName::Entity {
                entity_id: 320193,
                natural_key: "0000320193".into()
            }
        );
        assert_eq!(rule.classify("CIKabc.json"), MemberName::Malformed);
        assert_eq!(rule.classify("CIK.json"), MemberName::Malformed);
        assert_eq!(rule.classify("CIK00001.xml"), MemberName::NotCandidate);
        assert_eq!(rule.classify("README.txt"), MemberName::NotCandidate);
    }

    #[test]
    fn enumerates_only_matching_members_with_metadata() {
        let (_dir, path) = write_archive(&[
            ("CIK0000320193.json", b"{\"facts\":{}}"),
            ("CIK0000789019.json", b"{\"facts\":{\"us-gaap\":{}}}"),
            ("CIKnotanumber.json", b"{}"),
            ("README.txt", b"hello"),
        ]);
        let rule = MemberNameRule::default();
        let mut streamer = ArchiveStreamer::open(&path).expect("open");
        let mut members = streamer.members(&rule, |id| id == 320193);
        let found: Vec<MemberMeta> = members.by_ref().collect::<Result<_, _>>().expect("scan");
        let stats = members.stats();

        assert_eq!(found.len(), 1);
        let meta = &found[0];
        assert_eq!(meta.entity_id, 320193);
        assert_eq!(meta.natural_key, "0000320193");
        assert_eq!(meta.asset_path, "CIK0000320193.json");
        assert_eq!(meta.byte_size, 12);
        assert_ne!(meta.crc32, 0);
        assert_eq!(
            meta.last_modified,
            Utc.with_ymd_and_hms(2024, 3, 1, 4, 5, 6).single()
        );

        assert_eq!(
            stats,
            ScanStats {
                entries: 4,
                candidates: 3,
                malformed: 1,
                filtered_out: 1,
                matched: 1,
            }
        );
    }

    #[test]
    fn checksum_tracks_content() {
        let (_a, first) = write_archive(&[("CIK0000000001.json", b"{\"v\":1}")]);
        let (_b, second) = write_archive(&[("CIK0000000001.json", b"{\"v\":2}")]);
        let rule = MemberNameRule::default();

        let scan = |path: &Path| {
            let mut streamer = ArchiveStreamer::open(path).expect("open");
            let found: Vec<MemberMeta> = streamer
                .members(&rule, |_| true)
                .collect::<Result<_, _>>()
                .expect("scan");
            found.into_iter().next().expect("one member")
        };

        let a = scan(&first);
        let b = scan(&second);
        assert_eq!(a.byte_size, b.byte_size);
        assert_ne!(a.crc32, b.crc32);
        assert_eq!(a.crc32, scan(&first).crc32);
    }

    #[test]
    fn reads_single_member_bytes() {
        let body = br#"{"facts":{"us-gaap":{}}}"#;
        let (_dir, path) = write_archive(&[("CIK0000000042.json", body)]);
        let mut streamer = ArchiveStreamer::open(&path).expect("open");

        assert_eq!(streamer.read_member("CIK0000000042.json").expect("read"), body);
        assert!(matches!(
            streamer.read_member("CIK0000000043.json"),
            Err(ArchiveError::MissingMember { .. })
        ));
    }

    #[test]
    fn missing_archive_is_an_open_error() {
        let dir = tempdir().expect("tempdir");
        assert!(matches!(
            ArchiveStreamer::open(dir.path().join("absent.zip")),
            Err(ArchiveError::Open { .. })
        ));
    }
}
