use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::core_types::{AgentId, UserId};
use crate::error::EngineResult;

use super::{AgentStatus, AgentToken, UserFlags};

#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn get_flags(&self, user_id: UserId) -> EngineResult<Option<UserFlags>>;

    /// Upsert the freeze flag
    async fn set_flags(
        &self,
        user_id: UserId,
        frozen: bool,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> EngineResult<UserFlags>;

    async fn insert_agent(&self, token: &AgentToken) -> EngineResult<()>;

    async fn get_agent(&self, agent_id: AgentId) -> EngineResult<Option<AgentToken>>;

    /// Mark the user's agent revoked. None if the agent does not belong to the user.
    async fn revoke_agent(
        &self,
        user_id: UserId,
        agent_id: AgentId,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<AgentToken>>;
}

#[derive(Default)]
pub struct MemoryAccessStore {
    flags: DashMap<UserId, UserFlags>,
    agents: DashMap<AgentId, AgentToken>,
}

impl MemoryAccessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccessStore for MemoryAccessStore {
    async fn get_flags(&self, user_id: UserId) -> EngineResult<Option<UserFlags>> {
        Ok(self.flags.get(&user_id).map(|f| f.clone()))
    }

    async fn set_flags(
        &self,
        user_id: UserId,
        frozen: bool,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> EngineResult<UserFlags> {
        let flags = UserFlags {
            user_id,
            frozen,
            reason: reason.map(str::to_string),
            updated_at: Some(at),
        };
        self.flags.insert(user_id, flags.clone());
        Ok(flags)
    }

    async fn insert_agent(&self, token: &AgentToken) -> EngineResult<()> {
        self.agents.insert(token.agent_id, token.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: AgentId) -> EngineResult<Option<AgentToken>> {
        Ok(self.agents.get(&agent_id).map(|t| t.clone()))
    }

    async fn revoke_agent(
        &self,
        user_id: UserId,
        agent_id: AgentId,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<AgentToken>> {
        let Some(mut token) = self.agents.get_mut(&agent_id) else {
            return Ok(None);
        };
        if token.user_id != user_id {
            return Ok(None);
        }
        if token.status == AgentStatus::Active {
            token.status = AgentStatus::Revoked;
            token.revoked_at = Some(at);
        }
        Ok(Some(token.clone()))
    }
}
