//! Session-level Postgres advisory lock guarding the load cycle.

use anyhow::{Context, Result};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use tracing::{debug, warn};

/// "SFL_FUND" as big-endian bytes.
pub const PIPELINE_LOCK_KEY: i64 = 0x5346_4c5f_4655_4e44;

/// Holds the lock on a dedicated pooled connection. Dropping without
/// [`AdvisoryLock::release`] closes that connection, which also ends the lock.
#[derive(Debug)]
pub struct AdvisoryLock {
    key: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl AdvisoryLock {
    /// `Ok(None)` means another session holds the key.
    pub async fn try_acquire(pool: &PgPool, key: i64) -> Result<Option<Self>> {
        let mut conn = pool.acquire().await.context("acquiring lock connection")?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .context("requesting advisory lock")?;
        if !acquired {
            debug!(key, "advisory lock busy");
            return Ok(None);
        }
        debug!(key, "advisory lock acquired");
        Ok(Some(Self {
            key,
            conn: Some(conn),
        }))
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub async fn release(mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(true) => {
                debug!(key = self.key, "advisory lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(key = self.key, "advisory lock was not held at release");
                Ok(())
            }
            Err(err) => {
                // Closing the session drops every lock it holds.
                let _ = conn.detach().close().await;
                Err(err).context("releasing advisory lock")
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(key = self.key, "advisory lock dropped without release; closing its session");
            drop(conn.detach());
        }
    }
}
