//! Job lock persistence (PostgreSQL)
//!
//! Lease times come from the database clock so instances with skewed clocks
//! agree on expiry.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::EngineResult;

use super::{JobLock, LockStore};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_locks_tb (
    lock_key    TEXT PRIMARY KEY,
    holder      TEXT NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL,
    metadata    JSONB NOT NULL DEFAULT '{}'::jsonb
);
"#;

pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl_secs: i64,
        metadata: &serde_json::Value,
    ) -> EngineResult<Option<JobLock>> {
        // Insert, or take over only an expired lease. Zero rows = held elsewhere.
        let row = sqlx::query(
            r#"
            INSERT INTO job_locks_tb (lock_key, holder, acquired_at, expires_at, metadata)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3::DOUBLE PRECISION), $4)
            ON CONFLICT (lock_key) DO UPDATE
                SET holder = EXCLUDED.holder,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at,
                    metadata = EXCLUDED.metadata
                WHERE job_locks_tb.expires_at <= NOW()
            RETURNING lock_key, holder, acquired_at, expires_at, metadata
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(ttl_secs as f64)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> EngineResult<JobLock> {
            Ok(JobLock {
                lock_key: row.try_get("lock_key")?,
                holder: row.try_get("holder")?,
                acquired_at: row.try_get("acquired_at")?,
                expires_at: row.try_get("expires_at")?,
                metadata: row.try_get("metadata")?,
            })
        })
        .transpose()
    }

    async fn release(&self, key: &str, holder: &str) -> EngineResult<bool> {
        let done = sqlx::query("DELETE FROM job_locks_tb WHERE lock_key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}
