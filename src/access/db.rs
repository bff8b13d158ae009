use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::core_types::{AgentId, UserId};
use crate::db::parse_id;
use crate::error::{EngineError, EngineResult};

use super::store::AccessStore;
use super::{AgentStatus, AgentToken, UserFlags};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user_flags_tb (
    user_id    BIGINT PRIMARY KEY,
    frozen     BOOLEAN NOT NULL DEFAULT FALSE,
    reason     TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS agent_tokens_tb (
    agent_id   TEXT PRIMARY KEY,
    user_id    BIGINT NOT NULL,
    status     SMALLINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    revoked_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_agent_tokens_user ON agent_tokens_tb (user_id);
"#;

pub struct PgAccessStore {
    pool: PgPool,
}

impl PgAccessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_flags(row: &PgRow) -> EngineResult<UserFlags> {
        Ok(UserFlags {
            user_id: row.try_get("user_id")?,
            frozen: row.try_get("frozen")?,
            reason: row.try_get("reason")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_token(row: &PgRow) -> EngineResult<AgentToken> {
        let agent_id: String = row.try_get("agent_id")?;
        let status_id: i16 = row.try_get("status")?;
        Ok(AgentToken {
            agent_id: parse_id(&agent_id, "agent_id")?,
            user_id: row.try_get("user_id")?,
            status: AgentStatus::from_id(status_id)
                .ok_or_else(|| EngineError::Internal(format!("Invalid agent status: {status_id}")))?,
            created_at: row.try_get("created_at")?,
            revoked_at: row.try_get("revoked_at")?,
        })
    }
}

#[async_trait]
impl AccessStore for PgAccessStore {
    async fn get_flags(&self, user_id: UserId) -> EngineResult<Option<UserFlags>> {
        let row = sqlx::query(
            "SELECT user_id, frozen, reason, updated_at FROM user_flags_tb WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_flags).transpose()
    }

    async fn set_flags(
        &self,
        user_id: UserId,
        frozen: bool,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> EngineResult<UserFlags> {
        let row = sqlx::query(
            r#"
            INSERT INTO user_flags_tb (user_id, frozen, reason, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
                SET frozen = EXCLUDED.frozen, reason = EXCLUDED.reason, updated_at = EXCLUDED.updated_at
            RETURNING user_id, frozen, reason, updated_at
            "#,
        )
        .bind(user_id)
        .bind(frozen)
        .bind(reason)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_flags(&row)
    }

    async fn insert_agent(&self, token: &AgentToken) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_tokens_tb (agent_id, user_id, status, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(token.agent_id.to_string())
        .bind(token.user_id)
        .bind(token.status.id())
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: AgentId) -> EngineResult<Option<AgentToken>> {
        let row = sqlx::query(
            "SELECT agent_id, user_id, status, created_at, revoked_at \
             FROM agent_tokens_tb WHERE agent_id = $1",
        )
        .bind(agent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_token).transpose()
    }

    async fn revoke_agent(
        &self,
        user_id: UserId,
        agent_id: AgentId,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<AgentToken>> {
        sqlx::query(
            r#"
            UPDATE agent_tokens_tb
            SET status = $1, revoked_at = $2
            WHERE agent_id = $3 AND user_id = $4 AND status = $5
            "#,
        )
        .bind(AgentStatus::Revoked.id())
        .bind(at)
        .bind(agent_id.to_string())
        .bind(user_id)
        .bind(AgentStatus::Active.id())
        .execute(&self.pool)
        .await?;

        let token = self.get_agent(agent_id).await?;
        Ok(token.filter(|t| t.user_id == user_id))
    }
}
