//! Hold persistence (PostgreSQL)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::core_types::{HoldId, UserId};
use crate::db::parse_id;
use crate::error::{EngineError, EngineResult};

use super::store::HoldStore;
use super::{ActiveTotals, Hold, HoldKind, HoldStatus};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS holds_tb (
    hold_id      TEXT PRIMARY KEY,
    user_id      BIGINT NOT NULL,
    kind         SMALLINT NOT NULL,
    amount_cents BIGINT NOT NULL CHECK (amount_cents > 0),
    reference    TEXT NOT NULL,
    status       SMALLINT NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at   TIMESTAMPTZ,
    closed_at    TIMESTAMPTZ,
    UNIQUE (user_id, reference)
);

CREATE INDEX IF NOT EXISTS idx_holds_active ON holds_tb (user_id) WHERE status = 0;
"#;

const COLUMNS: &str =
    "hold_id, user_id, kind, amount_cents, reference, status, created_at, expires_at, closed_at";

pub struct PgHoldStore {
    pool: PgPool,
}

impl PgHoldStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_hold(row: &PgRow) -> EngineResult<Hold> {
        let hold_id: String = row.try_get("hold_id")?;
        let kind_id: i16 = row.try_get("kind")?;
        let status_id: i16 = row.try_get("status")?;
        Ok(Hold {
            hold_id: parse_id(&hold_id, "hold_id")?,
            user_id: row.try_get("user_id")?,
            kind: HoldKind::from_id(kind_id)
                .ok_or_else(|| EngineError::Internal(format!("Invalid hold kind: {kind_id}")))?,
            amount_cents: row.try_get("amount_cents")?,
            reference: row.try_get("reference")?,
            status: HoldStatus::from_id(status_id)
                .ok_or_else(|| EngineError::Internal(format!("Invalid hold status: {status_id}")))?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            closed_at: row.try_get("closed_at")?,
        })
    }
}

#[async_trait]
impl HoldStore for PgHoldStore {
    async fn insert(&self, hold: &Hold) -> EngineResult<Hold> {
        sqlx::query(
            r#"
            INSERT INTO holds_tb
                (hold_id, user_id, kind, amount_cents, reference, status, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, reference) DO NOTHING
            "#,
        )
        .bind(hold.hold_id.to_string())
        .bind(hold.user_id)
        .bind(hold.kind.id())
        .bind(hold.amount_cents)
        .bind(&hold.reference)
        .bind(hold.status.id())
        .bind(hold.created_at)
        .bind(hold.expires_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM holds_tb WHERE user_id = $1 AND reference = $2"
        ))
        .bind(hold.user_id)
        .bind(&hold.reference)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_hold(&row)
    }

    async fn get(&self, hold_id: HoldId) -> EngineResult<Option<Hold>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM holds_tb WHERE hold_id = $1"))
            .bind(hold_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_hold).transpose()
    }

    async fn close(
        &self,
        hold_id: HoldId,
        to: HoldStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE holds_tb
            SET status = $1, closed_at = $2
            WHERE hold_id = $3 AND status = $4
            "#,
        )
        .bind(to.id())
        .bind(at)
        .bind(hold_id.to_string())
        .bind(HoldStatus::Active.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE holds_tb
            SET status = $1, closed_at = $2
            WHERE status = $3 AND expires_at IS NOT NULL AND expires_at <= $2
            "#,
        )
        .bind(HoldStatus::Expired.id())
        .bind(now)
        .bind(HoldStatus::Active.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn active_totals(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<ActiveTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount_cents) FILTER (WHERE kind = $3), 0)::BIGINT AS holds_cents,
                COALESCE(SUM(amount_cents) FILTER (WHERE kind = $4), 0)::BIGINT AS reserves_cents
            FROM holds_tb
            WHERE user_id = $1 AND status = $5
              AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(HoldKind::Hold.id())
        .bind(HoldKind::Reserve.id())
        .bind(HoldStatus::Active.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(ActiveTotals {
            holds_cents: row.try_get("holds_cents")?,
            reserves_cents: row.try_get("reserves_cents")?,
        })
    }

    async fn active_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Hold>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM holds_tb \
             WHERE user_id = $1 AND status = $2 AND (expires_at IS NULL OR expires_at > $3) \
             ORDER BY created_at, hold_id"
        ))
        .bind(user_id)
        .bind(HoldStatus::Active.id())
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_hold).collect()
    }
}
