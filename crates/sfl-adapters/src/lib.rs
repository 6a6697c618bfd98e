//! Member payload extraction: companyfacts JSON into canonical fact rows.

pub mod units;

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sfl_core::{CanonicalFactRow, COMPANYFACTS_SOURCE_KIND};
use thiserror::Error;
use tracing::trace;

pub use units::{normalize_number, normalize_value_unit, parse_value, Normalized};

pub const CRATE_NAME: &str = "sfl-adapters";
pub const DEFAULT_TAXONOMY: &str = "us-gaap";

/// One canonical metric and its synonym tags, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMetric {
    pub canonical: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMap {
    #[serde(default = "default_taxonomy")]
    pub taxonomy: String,
    pub metrics: Vec<CanonicalMetric>,
}

fn default_taxonomy() -> String {
    DEFAULT_TAXONOMY.to_string()
}

const BUILTIN_METRICS: &[(&str, &[&str])] = &[
    ("AssetsCurrent", &["AssetsCurrent"]),
    ("LiabilitiesCurrent", &["LiabilitiesCurrent"]),
    ("Liabilities", &["Liabilities"]),
    (
        "StockholdersEquity",
        &[
            "StockholdersEquity",
            "StockholdersEquityIncludingPortionAttributableToNoncontrollingInterest",
        ],
    ),
    (
        "EarningsPerShare",
        &["EarningsPerShareDiluted", "EarningsPerShareBasic"],
    ),
    ("NetIncomeLoss", &["NetIncomeLoss", "ProfitLoss"]),
    (
        "OperatingCashFlow",
        &["NetCashProvidedByUsedInOperatingActivities"],
    ),
    (
        "DividendsPerShare",
        &["CommonStockDividendsPerShareDeclared"],
    ),
    ("DividendsPaidCash", &["PaymentsOfDividendsCommonStock"]),
    ("SharesOutstanding", &["CommonStockSharesOutstanding"]),
    ("DebtCurrent", &["DebtCurrent"]),
    ("DebtNoncurrent", &["DebtNoncurrent"]),
];

impl Default for TagMap {
    fn default() -> Self {
        Self {
            taxonomy: default_taxonomy(),
            metrics: BUILTIN_METRICS
                .iter()
                .map(|(canonical, tags)| CanonicalMetric {
                    canonical: canonical.to_string(),
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                })
                .collect(),
        }
    }
}

impl TagMap {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let map: TagMap = serde_yaml::from_str(text).context("parsing tag map yaml")?;
        anyhow::ensure!(!map.metrics.is_empty(), "tag map defines no metrics");
        Ok(map)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// First synonym present as an object wins; later synonyms are ignored.
    fn resolve<'a>(
        metric: &'a CanonicalMetric,
        taxonomy: &'a Map<String, JsonValue>,
    ) -> Option<(&'a str, &'a Map<String, JsonValue>)> {
        metric.tags.iter().find_map(|tag| {
            taxonomy
                .get(tag)
                .and_then(JsonValue::as_object)
                .map(|payload| (tag.as_str(), payload))
        })
    }
}

/// A member payload that cannot be traversed at all.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload root is not an object")]
    NotAnObject,
    #[error("unexpected shape at `{0}`")]
    UnexpectedShape(&'static str),
}

/// Per-entry drop reasons, reported rather than silently discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub missing_accession: usize,
    pub unparsable_value: usize,
    pub malformed_entry: usize,
}

impl DropCounts {
    pub fn total(&self) -> usize {
        self.missing_accession + self.unparsable_value + self.malformed_entry
    }

    pub fn absorb(&mut self, other: DropCounts) {
        self.missing_accession += other.missing_accession;
        self.unparsable_value += other.unparsable_value;
        self.malformed_entry += other.malformed_entry;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub rows: Vec<CanonicalFactRow>,
    pub dropped: DropCounts,
    pub unrecognized_suffixes: BTreeSet<String>,
}

/// Seam between the archive loop and a source-specific payload format.
pub trait MemberExtractor: Send + Sync {
    fn source_kind(&self) -> &'static str;

    fn extract(
        &self,
        entity_id: i64,
        payload: &[u8],
        source_member: &str,
    ) -> Result<Extraction, PayloadError>;
}

#[derive(Debug, Clone, Default)]
pub struct CompanyFactsExtractor {
    tag_map: TagMap,
}

impl CompanyFactsExtractor {
    pub fn new(tag_map: TagMap) -> Self {
        Self { tag_map }
    }

    pub fn tag_map(&self) -> &TagMap {
        &self.tag_map
    }
}

impl MemberExtractor for CompanyFactsExtractor {
    fn source_kind(&self) -> &'static str {
        COMPANYFACTS_SOURCE_KIND
    }

    fn extract(
        &self,
        entity_id: i64,
        payload: &[u8],
        source_member: &str,
    ) -> Result<Extraction, PayloadError> {
        let doc: JsonValue = serde_json::from_slice(payload)?;
        let extraction = extract_document(entity_id, &doc, source_member, &self.tag_map)?;
        trace!(
            entity_id,
            member = source_member,
            rows = extraction.rows.len(),
            dropped = extraction.dropped.total(),
            "member extracted"
        );
        Ok(extraction)
    }
}

/// Permissive form: unusable payloads yield no rows.
pub fn extract(
    entity_id: i64,
    payload: &[u8],
    source_member: &str,
    tag_map: &TagMap,
) -> Vec<CanonicalFactRow> {
    serde_json::from_slice::<JsonValue>(payload)
        .map_err(PayloadError::from)
        .and_then(|doc| extract_document(entity_id, &doc, source_member, tag_map))
        .map(|extraction| extraction.rows)
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct RawFact {
    #[serde(default)]
    val: JsonValue,
    #[serde(default)]
    accn: Option<String>,
    #[serde(default)]
    fy: Option<i32>,
    #[serde(default)]
    fp: Option<String>,
    #[serde(default)]
    frame: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

/// All shape checks for the `facts.<taxonomy>` nesting live here. A missing
/// level means "no facts"; a level of the wrong type rejects the payload.
fn taxonomy_facts<'a>(
    doc: &'a JsonValue,
    taxonomy: &str,
) -> Result<Option<&'a Map<String, JsonValue>>, PayloadError> {
    let root = doc.as_object().ok_or(PayloadError::NotAnObject)?;
    let Some(facts) = root.get("facts") else {
        return Ok(None);
    };
    let facts = facts
        .as_object()
        .ok_or(PayloadError::UnexpectedShape("facts"))?;
    match facts.get(taxonomy) {
        None => Ok(None),
        Some(JsonValue::Object(map)) => Ok(Some(map)),
        Some(_) => Err(PayloadError::UnexpectedShape("facts.<taxonomy>")),
    }
}

fn numeric_value(raw: &JsonValue) -> Option<f64> {
    match raw {
        JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        JsonValue::String(s) => parse_value(s),
        _ => None,
    }
}

fn effective_date(end: Option<&str>) -> Option<NaiveDate> {
    let end = end?;
    let day = end.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

pub fn extract_document(
    entity_id: i64,
    doc: &JsonValue,
    source_member: &str,
    tag_map: &TagMap,
) -> Result<Extraction, PayloadError> {
    let mut out = Extraction::default();
    let Some(taxonomy) = taxonomy_facts(doc, &tag_map.taxonomy)? else {
        return Ok(out);
    };

    for metric in &tag_map.metrics {
        let Some((tag, payload)) = TagMap::resolve(metric, taxonomy) else {
            continue;
        };
        let Some(units) = payload.get("units").and_then(JsonValue::as_object) else {
            continue;
        };

        for (unit, entries) in units {
            let Some(entries) = entries.as_array() else {
                out.dropped.malformed_entry += 1;
                continue;
            };
            for entry in entries {
                let fact = match RawFact::deserialize(entry) {
                    Ok(fact) => fact,
                    Err(_) => {
                        out.dropped.malformed_entry += 1;
                        continue;
                    }
                };
                let Some(accession_no) = fact.accn.filter(|a| !a.trim().is_empty()) else {
                    out.dropped.missing_accession += 1;
                    continue;
                };
                let Some(value) = numeric_value(&fact.val) else {
                    out.dropped.unparsable_value += 1;
                    continue;
                };

                let normalized = normalize_number(value, unit);
                if let Some(suffix) = normalized.unrecognized_suffix {
                    out.unrecognized_suffixes.insert(suffix);
                }

                out.rows.push(CanonicalFactRow {
                    cik: entity_id,
                    accession_no,
                    fiscal_year: fact.fy,
                    fiscal_period: fact.fp,
                    tag: tag.to_string(),
                    value: normalized.value,
                    unit: normalized.unit,
                    frame: fact.frame,
                    filing_date: effective_date(fact.end.as_deref()),
                    source_file: source_member.to_string(),
                });
            }
        }
    }

    Ok(out)
}
