//! Quote and receipt persistence (PostgreSQL)
//!
//! Actions and prices are stored as JSONB / NUMERIC; receipts are unique on
//! `(user_id, idempotency_key)`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::core_types::{AgentId, QuoteId, UserId};
use crate::db::parse_id;
use crate::error::EngineResult;

use super::store::{QuoteStore, ReceiptInsert, ReceiptStore};
use super::types::{Quote, QuoteAction, Receipt};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quotes_tb (
    quote_id         TEXT PRIMARY KEY,
    user_id          BIGINT NOT NULL,
    agent_id         TEXT,
    action           JSONB NOT NULL,
    amount_cents     BIGINT NOT NULL,
    fee_cents        BIGINT NOT NULL,
    unit_price_cents NUMERIC(30, 8),
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at       TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS receipts_tb (
    receipt_id      TEXT PRIMARY KEY,
    user_id         BIGINT NOT NULL,
    agent_id        TEXT,
    quote_id        TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    action          JSONB NOT NULL,
    amount_cents    BIGINT NOT NULL,
    fee_cents       BIGINT NOT NULL,
    quantity        NUMERIC(30, 8),
    entry_id        TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (user_id, idempotency_key)
);

CREATE INDEX IF NOT EXISTS idx_receipts_user_created ON receipts_tb (user_id, created_at DESC);
"#;

const RECEIPT_COLUMNS: &str = "receipt_id, user_id, agent_id, quote_id, idempotency_key, action, \
    amount_cents, fee_cents, quantity, entry_id, created_at";

pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_agent(raw: Option<String>) -> EngineResult<Option<AgentId>> {
        raw.map(|s| parse_id(&s, "agent_id")).transpose()
    }

    fn row_to_quote(row: &PgRow) -> EngineResult<Quote> {
        let quote_id: String = row.try_get("quote_id")?;
        let action: serde_json::Value = row.try_get("action")?;
        Ok(Quote {
            quote_id: parse_id(&quote_id, "quote_id")?,
            user_id: row.try_get("user_id")?,
            agent_id: Self::parse_agent(row.try_get("agent_id")?)?,
            action: serde_json::from_value::<QuoteAction>(action)?,
            amount_cents: row.try_get("amount_cents")?,
            fee_cents: row.try_get("fee_cents")?,
            unit_price_cents: row.try_get::<Option<Decimal>, _>("unit_price_cents")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn row_to_receipt(row: &PgRow) -> EngineResult<Receipt> {
        let receipt_id: String = row.try_get("receipt_id")?;
        let quote_id: String = row.try_get("quote_id")?;
        let entry_id: String = row.try_get("entry_id")?;
        let action: serde_json::Value = row.try_get("action")?;
        Ok(Receipt {
            receipt_id: parse_id(&receipt_id, "receipt_id")?,
            user_id: row.try_get("user_id")?,
            agent_id: Self::parse_agent(row.try_get("agent_id")?)?,
            quote_id: parse_id(&quote_id, "quote_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            action: serde_json::from_value::<QuoteAction>(action)?,
            amount_cents: row.try_get("amount_cents")?,
            fee_cents: row.try_get("fee_cents")?,
            quantity: row.try_get::<Option<Decimal>, _>("quantity")?,
            entry_id: parse_id(&entry_id, "entry_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl QuoteStore for PgExecutionStore {
    async fn insert_quote(&self, quote: &Quote) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quotes_tb
                (quote_id, user_id, agent_id, action, amount_cents, fee_cents,
                 unit_price_cents, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(quote.quote_id.to_string())
        .bind(quote.user_id)
        .bind(quote.agent_id.map(|a| a.to_string()))
        .bind(serde_json::to_value(&quote.action)?)
        .bind(quote.amount_cents)
        .bind(quote.fee_cents)
        .bind(quote.unit_price_cents)
        .bind(quote.created_at)
        .bind(quote.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_quote(&self, quote_id: QuoteId) -> EngineResult<Option<Quote>> {
        let row = sqlx::query(
            r#"
            SELECT quote_id, user_id, agent_id, action, amount_cents, fee_cents,
                   unit_price_cents, created_at, expires_at
            FROM quotes_tb WHERE quote_id = $1
            "#,
        )
        .bind(quote_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_quote).transpose()
    }
}

#[async_trait]
impl ReceiptStore for PgExecutionStore {
    async fn insert_receipt(&self, receipt: &Receipt) -> EngineResult<ReceiptInsert> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO receipts_tb
                (receipt_id, user_id, agent_id, quote_id, idempotency_key, action,
                 amount_cents, fee_cents, quantity, entry_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id, idempotency_key) DO NOTHING
            RETURNING {RECEIPT_COLUMNS}
            "#
        ))
        .bind(receipt.receipt_id.to_string())
        .bind(receipt.user_id)
        .bind(receipt.agent_id.map(|a| a.to_string()))
        .bind(receipt.quote_id.to_string())
        .bind(&receipt.idempotency_key)
        .bind(serde_json::to_value(&receipt.action)?)
        .bind(receipt.amount_cents)
        .bind(receipt.fee_cents)
        .bind(receipt.quantity)
        .bind(receipt.entry_id.to_string())
        .bind(receipt.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(ReceiptInsert::Created(Self::row_to_receipt(&row)?)),
            None => {
                let existing = self
                    .find_receipt(receipt.user_id, &receipt.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        crate::error::EngineError::Internal(format!(
                            "receipt {} conflicted but is not readable",
                            receipt.idempotency_key
                        ))
                    })?;
                Ok(ReceiptInsert::Existing(existing))
            }
        }
    }

    async fn find_receipt(
        &self,
        user_id: UserId,
        idempotency_key: &str,
    ) -> EngineResult<Option<Receipt>> {
        let row = sqlx::query(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts_tb WHERE user_id = $1 AND idempotency_key = $2"
        ))
        .bind(user_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_receipt).transpose()
    }

    async fn list_for_user(&self, user_id: UserId, limit: usize) -> EngineResult<Vec<Receipt>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts_tb WHERE user_id = $1 \
             ORDER BY created_at DESC, receipt_id DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_receipt).collect()
    }
}
