//! Core domain model for SFL: archive members, ledger fingerprints, fact rows and run records.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sfl-core";

/// Ledger source kind for members of the companyfacts archive.
pub const COMPANYFACTS_SOURCE_KIND: &str = "companyfacts";

/// Reference set of entity identifiers (CIKs) supplied by the securities master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitySet {
    ids: HashSet<i64>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: i64) -> bool {
        self.ids.insert(id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<i64> for EntitySet {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// The tuple used to decide whether a member changed since it was last processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub asset_path: String,
    pub byte_size: i64,
    pub crc32: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Metadata for one archive member, read from the archive directory without
/// touching the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberMeta {
    pub entity_id: i64,
    /// Identity digits exactly as they appear in the member name (zero padded).
    pub natural_key: String,
    pub asset_path: String,
    pub byte_size: u64,
    pub crc32: u32,
    pub sha256: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl MemberMeta {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            asset_path: self.asset_path.clone(),
            byte_size: i64::try_from(self.byte_size).unwrap_or(i64::MAX),
            crc32: i64::from(self.crc32),
            last_modified: self.last_modified,
        }
    }
}

/// Outcome recorded against a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Ok,
    Rejected,
}

impl LedgerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Ok => "ok",
            LedgerStatus::Rejected => "rejected",
        }
    }
}

/// One live row per (source kind, natural key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub source_kind: String,
    pub natural_key: String,
    pub asset_path: String,
    pub byte_size: i64,
    pub crc32: i64,
    pub sha256: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub status: String,
}

impl LedgerEntry {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            asset_path: self.asset_path.clone(),
            byte_size: self.byte_size,
            crc32: self.crc32,
            last_modified: self.last_modified,
        }
    }
}

/// Normalized fact keyed by (cik, accession_no, tag, frame).
///
/// Field order is the staging column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFactRow {
    pub cik: i64,
    pub accession_no: String,
    pub fiscal_year: Option<i32>,
    pub fiscal_period: Option<String>,
    pub tag: String,
    pub value: f64,
    pub unit: String,
    pub frame: Option<String>,
    pub filing_date: Option<NaiveDate>,
    pub source_file: String,
}

impl CanonicalFactRow {
    pub const COLUMNS: [&'static str; 10] = [
        "cik",
        "accession_no",
        "fiscal_year",
        "fiscal_period",
        "tag",
        "value",
        "unit",
        "frame",
        "filing_date",
        "source_file",
    ];

    /// Rows without a date dimension are never persisted.
    pub fn is_loadable(&self) -> bool {
        self.filing_date.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Conflict,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Conflict => "conflict",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Written exactly once per orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub status: RunStatus,
    pub errors: Option<String>,
    pub notes: Option<String>,
}
