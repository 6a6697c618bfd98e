//! Bounded row buffer, COPY into staging, and the insert-if-absent merge.

use anyhow::{Context, Result};
use serde::Serialize;
use sfl_core::CanonicalFactRow;
use sqlx::PgPool;
use tracing::{debug, info};

pub const DEFAULT_CHUNK_ROWS: usize = 100_000;

const COPY_SEND_BYTES: usize = 1024 * 1024;

const MERGE_SQL: &str = "INSERT INTO fundamentals_raw \
     (cik, accession_no, fiscal_year, fiscal_period, tag, value, unit, frame, filing_date, source_file) \
     SELECT cik, accession_no, fiscal_year, fiscal_period, tag, value, unit, COALESCE(frame, ''), \
            filing_date, source_file \
     FROM staging_fundamentals \
     WHERE cik IS NOT NULL AND accession_no IS NOT NULL AND tag IS NOT NULL \
       AND value IS NOT NULL AND unit IS NOT NULL AND filing_date IS NOT NULL \
     ON CONFLICT (cik, accession_no, tag, frame) DO NOTHING";

/// Rows awaiting one flush. Owned by a single load cycle.
#[derive(Debug)]
pub struct StagingBuffer {
    rows: Vec<CanonicalFactRow>,
    capacity: usize,
}

impl StagingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rows: Vec::with_capacity(capacity.min(DEFAULT_CHUNK_ROWS)),
            capacity,
        }
    }

    pub fn push(&mut self, row: CanonicalFactRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rows(&self) -> &[CanonicalFactRow] {
        &self.rows
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// CSV in staging column order, no header. `None` becomes an empty field,
/// which COPY reads as NULL.
pub fn encode_csv(rows: &[CanonicalFactRow]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(rows.len() * 128));
    for row in rows {
        writer.serialize(row).context("serializing fact row")?;
    }
    writer.into_inner().context("finishing csv buffer")
}

fn copy_statement() -> String {
    format!(
        "COPY staging_fundamentals ({}) FROM STDIN WITH (FORMAT csv)",
        CanonicalFactRow::COLUMNS.join(", ")
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    pub staged: u64,
    pub inserted: u64,
}

#[derive(Debug, Clone)]
pub struct StagingLoader {
    pool: PgPool,
}

impl StagingLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bulk-load `rows` through the COPY protocol. Staged rows are committed
    /// on their own so they survive a failed merge.
    pub async fn copy_to_staging(&self, rows: &[CanonicalFactRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let payload = encode_csv(rows)?;
        let mut conn = self.pool.acquire().await.context("acquiring copy connection")?;
        let mut copy = conn
            .copy_in_raw(&copy_statement())
            .await
            .context("starting COPY into staging")?;

        for chunk in payload.chunks(COPY_SEND_BYTES) {
            if let Err(err) = copy.send(chunk).await {
                let _ = copy.abort("client send failed").await;
                return Err(err).context("streaming rows into staging");
            }
        }
        let staged = copy.finish().await.context("finishing COPY into staging")?;
        debug!(staged, bytes = payload.len(), "copied rows into staging");
        Ok(staged)
    }

    /// Merge all staged rows into the fact table, skipping keys that already
    /// exist, then empty staging. Both happen in one transaction; on failure
    /// staging keeps its rows.
    pub async fn merge_staging_into_store(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("opening merge transaction")?;
        let inserted = sqlx::query(MERGE_SQL)
            .execute(&mut *tx)
            .await
            .context("merging staging into fundamentals_raw")?
            .rows_affected();
        sqlx::query("TRUNCATE staging_fundamentals")
            .execute(&mut *tx)
            .await
            .context("truncating staging")?;
        tx.commit().await.context("committing merge")?;
        Ok(inserted)
    }

    /// One load cycle: COPY the buffer, merge, then clear the buffer. The
    /// buffer is left untouched if any step fails.
    pub async fn flush(&self, buffer: &mut StagingBuffer) -> Result<FlushStats> {
        if buffer.is_empty() {
            return Ok(FlushStats::default());
        }
        let staged = self.copy_to_staging(buffer.rows()).await?;
        let inserted = self.merge_staging_into_store().await?;
        info!(staged, inserted, "flushed staging chunk");
        buffer.clear();
        Ok(FlushStats { staged, inserted })
    }

    pub async fn staged_row_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM staging_fundamentals")
            .fetch_one(&self.pool)
            .await
            .context("counting staging rows")
    }
}
