//! Change ledger: one fingerprint row per (source kind, natural key).

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sfl_core::{Fingerprint, LedgerEntry, LedgerStatus, MemberMeta};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

/// Rows per INSERT statement; ten binds per row stays under the Postgres bind limit.
pub const LEDGER_WRITE_CHUNK: usize = 5_000;

/// Changed iff there is no prior entry or any fingerprint component differs.
pub fn is_changed(current: &Fingerprint, prior: Option<&Fingerprint>) -> bool {
    match prior {
        None => true,
        Some(prior) => current != prior,
    }
}

#[derive(Debug, Default)]
pub struct Partition {
    pub changed: Vec<MemberMeta>,
    pub unchanged: usize,
}

pub fn partition_changed(
    members: Vec<MemberMeta>,
    prior: &HashMap<String, LedgerEntry>,
) -> Partition {
    let mut out = Partition::default();
    for member in members {
        let prior_fp = prior.get(&member.natural_key).map(LedgerEntry::fingerprint);
        if is_changed(&member.fingerprint(), prior_fp.as_ref()) {
            out.changed.push(member);
        } else {
            out.unchanged += 1;
        }
    }
    out
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    source_kind: String,
    natural_key: String,
    asset_path: String,
    byte_size: i64,
    crc32: i64,
    sha256: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    etag: Option<String>,
    processed_at: DateTime<Utc>,
    status: String,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        LedgerEntry {
            source_kind: row.source_kind,
            natural_key: row.natural_key,
            asset_path: row.asset_path,
            byte_size: row.byte_size,
            crc32: row.crc32,
            sha256: row.sha256,
            last_modified: row.last_modified,
            etag: row.etag,
            processed_at: row.processed_at,
            status: row.status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeLedger {
    pool: PgPool,
}

impl ChangeLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One round trip regardless of how many keys are asked for.
    pub async fn bulk_get(
        &self,
        source_kind: &str,
        natural_keys: &[String],
    ) -> Result<HashMap<String, LedgerEntry>> {
        if natural_keys.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT source_kind, natural_key, asset_path, byte_size, crc32, sha256, \
                    last_modified, etag, processed_at, status \
             FROM etl_source_ledger \
             WHERE source_kind = $1 AND natural_key = ANY($2)",
        )
        .bind(source_kind)
        .bind(natural_keys)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading ledger entries for {source_kind}"))?;

        debug!(requested = natural_keys.len(), found = rows.len(), "ledger lookup");
        Ok(rows
            .into_iter()
            .map(|row| (row.natural_key.clone(), LedgerEntry::from(row)))
            .collect())
    }

    /// Upserts every member in a single transaction. Later duplicates of a
    /// natural key win.
    pub async fn bulk_upsert(
        &self,
        source_kind: &str,
        members: &[MemberMeta],
        status: LedgerStatus,
        etag: Option<&str>,
    ) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let deduped: BTreeMap<&str, &MemberMeta> = members
            .iter()
            .map(|m| (m.natural_key.as_str(), m))
            .collect();
        let deduped: Vec<&MemberMeta> = deduped.into_values().collect();
        let processed_at = Utc::now();

        let mut tx = self.pool.begin().await.context("opening ledger transaction")?;
        let mut written = 0u64;
        for chunk in deduped.chunks(LEDGER_WRITE_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO etl_source_ledger (source_kind, natural_key, asset_path, byte_size, \
                 crc32, sha256, last_modified, etag, processed_at, status) ",
            );
            builder.push_values(chunk, |mut b, member| {
                let fp = member.fingerprint();
                b.push_bind(source_kind)
                    .push_bind(&member.natural_key)
                    .push_bind(fp.asset_path)
                    .push_bind(fp.byte_size)
                    .push_bind(fp.crc32)
                    .push_bind(&member.sha256)
                    .push_bind(fp.last_modified)
                    .push_bind(etag)
                    .push_bind(processed_at)
                    .push_bind(status.as_str());
            });
            builder.push(
                " ON CONFLICT (source_kind, natural_key) DO UPDATE SET \
                 asset_path = EXCLUDED.asset_path, \
                 byte_size = EXCLUDED.byte_size, \
                 crc32 = EXCLUDED.crc32, \
                 sha256 = EXCLUDED.sha256, \
                 last_modified = EXCLUDED.last_modified, \
                 etag = EXCLUDED.etag, \
                 processed_at = EXCLUDED.processed_at, \
                 status = EXCLUDED.status",
            );
            written += builder
                .build()
                .execute(&mut *tx)
                .await
                .context("upserting ledger entries")?
                .rows_affected();
        }
        tx.commit().await.context("committing ledger transaction")?;

        debug!(source_kind, status = status.as_str(), written, "ledger upsert");
        Ok(written)
    }
}
