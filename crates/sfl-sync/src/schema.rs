//! Table layout and the run log.

use anyhow::{Context, Result};
use sfl_core::RunRecord;
use sqlx::PgPool;
use tracing::debug;

pub const LEDGER_TABLE: &str = "etl_source_ledger";
pub const STAGING_TABLE: &str = "staging_fundamentals";
pub const FACT_TABLE: &str = "fundamentals_raw";
pub const RUN_LOG_TABLE: &str = "etl_logs";

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS etl_source_ledger (
        source_kind   TEXT        NOT NULL,
        natural_key   TEXT        NOT NULL,
        asset_path    TEXT        NOT NULL,
        byte_size     BIGINT      NOT NULL,
        crc32         BIGINT      NOT NULL,
        sha256        TEXT,
        last_modified TIMESTAMPTZ,
        etag          TEXT,
        processed_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        status        TEXT        NOT NULL,
        PRIMARY KEY (source_kind, natural_key)
    )"#,
    r#"CREATE UNLOGGED TABLE IF NOT EXISTS staging_fundamentals (
        cik           BIGINT,
        accession_no  TEXT,
        fiscal_year   INTEGER,
        fiscal_period TEXT,
        tag           TEXT,
        value         DOUBLE PRECISION,
        unit          TEXT,
        frame         TEXT,
        filing_date   DATE,
        source_file   TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS fundamentals_raw (
        cik           BIGINT           NOT NULL,
        accession_no  TEXT             NOT NULL,
        fiscal_year   INTEGER,
        fiscal_period TEXT,
        tag           TEXT             NOT NULL,
        value         DOUBLE PRECISION NOT NULL,
        unit          TEXT             NOT NULL,
        frame         TEXT             NOT NULL DEFAULT '',
        filing_date   DATE             NOT NULL,
        source_file   TEXT,
        PRIMARY KEY (cik, accession_no, tag, frame)
    )"#,
    "CREATE INDEX IF NOT EXISTS fundamentals_raw_cik_tag_idx ON fundamentals_raw (cik, tag)",
    r#"CREATE TABLE IF NOT EXISTS etl_logs (
        run_id        UUID        PRIMARY KEY,
        pipeline_name TEXT        NOT NULL,
        time_start    TIMESTAMPTZ NOT NULL,
        time_end      TIMESTAMPTZ NOT NULL,
        status        TEXT        NOT NULL,
        errors        TEXT,
        notes         TEXT
    )"#,
];

/// Idempotent; safe to run against an already provisioned database.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("applying schema statement: {}", first_line(statement)))?;
    }
    debug!(statements = SCHEMA_STATEMENTS.len(), "schema ensured");
    Ok(())
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or(statement).trim()
}

pub async fn record_run(pool: &PgPool, record: &RunRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO etl_logs (run_id, pipeline_name, time_start, time_end, status, errors, notes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(record.run_id)
    .bind(&record.pipeline_name)
    .bind(record.time_start)
    .bind(record.time_end)
    .bind(record.status.as_str())
    .bind(record.errors.as_deref())
    .bind(record.notes.as_deref())
    .execute(pool)
    .await
    .with_context(|| format!("writing {RUN_LOG_TABLE} row for run {}", record.run_id))?;
    Ok(())
}
