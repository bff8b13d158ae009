//! Account capability gates
//!
//! `UserFlags.frozen` blocks every money-moving operation. Agent tokens carry
//! delegated authority for one user and are checked on each delegated call.

pub mod db;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{AgentId, UserId};
use crate::error::{EngineError, EngineResult};

pub use db::PgAccessStore;
pub use store::{AccessStore, MemoryAccessStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFlags {
    pub user_id: UserId,
    pub frozen: bool,
    pub reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserFlags {
    pub fn unfrozen(user_id: UserId) -> Self {
        Self {
            user_id,
            frozen: false,
            reason: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AgentStatus {
    Active = 0,
    Revoked = 1,
}

impl AgentStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(AgentStatus::Active),
            1 => Some(AgentStatus::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentToken {
    pub agent_id: AgentId,
    pub user_id: UserId,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Freeze toggle input
#[derive(Debug, Clone, Deserialize)]
pub struct FreezeRequest {
    pub user_id: UserId,
    pub frozen: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevokeAgentRequest {
    pub user_id: UserId,
    pub agent_id: AgentId,
}

/// Authenticated principal, resolved by the caller's auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: UserId,
    /// Set when the call is made through a delegated agent
    pub agent_id: Option<AgentId>,
}

impl Caller {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            agent_id: None,
        }
    }

    pub fn agent(user_id: UserId, agent_id: AgentId) -> Self {
        Self {
            user_id,
            agent_id: Some(agent_id),
        }
    }
}

pub struct AccessControl {
    store: Arc<dyn AccessStore>,
}

impl AccessControl {
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self { store }
    }

    pub async fn flags(&self, user_id: UserId) -> EngineResult<UserFlags> {
        Ok(self
            .store
            .get_flags(user_id)
            .await?
            .unwrap_or_else(|| UserFlags::unfrozen(user_id)))
    }

    /// Fails with `FrozenAccount` when the user is frozen
    pub async fn ensure_not_frozen(&self, user_id: UserId) -> EngineResult<()> {
        let flags = self.flags(user_id).await?;
        if flags.frozen {
            return Err(EngineError::FrozenAccount {
                reason: flags.reason,
            });
        }
        Ok(())
    }

    /// Administrative freeze toggle. Applies to every later operation.
    pub async fn freeze_user(&self, req: FreezeRequest) -> EngineResult<UserFlags> {
        let reason = req.reason.filter(|r| !r.trim().is_empty());
        let flags = self
            .store
            .set_flags(req.user_id, req.frozen, reason.as_deref(), Utc::now())
            .await?;
        tracing::warn!(
            user_id = req.user_id,
            frozen = flags.frozen,
            reason = ?flags.reason,
            "User freeze flag updated"
        );
        Ok(flags)
    }

    pub async fn register_agent(&self, user_id: UserId) -> EngineResult<AgentToken> {
        let token = AgentToken {
            agent_id: AgentId::new(),
            user_id,
            status: AgentStatus::Active,
            created_at: Utc::now(),
            revoked_at: None,
        };
        self.store.insert_agent(&token).await?;
        tracing::info!(user_id, agent_id = %token.agent_id, "Agent registered");
        Ok(token)
    }

    /// Revoke an agent. Revoking twice returns the already-revoked token.
    pub async fn revoke_agent(&self, req: RevokeAgentRequest) -> EngineResult<AgentToken> {
        let token = self
            .store
            .revoke_agent(req.user_id, req.agent_id, Utc::now())
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("agent {} for user {}", req.agent_id, req.user_id))
            })?;
        tracing::warn!(user_id = req.user_id, agent_id = %req.agent_id, "Agent revoked");
        Ok(token)
    }

    /// Resolve who is acting for `caller`: the user directly, or an active
    /// agent owned by the user
    pub async fn authorize(&self, caller: &Caller) -> EngineResult<()> {
        let Some(agent_id) = caller.agent_id else {
            return Ok(());
        };
        let token = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| EngineError::Unauthorized(format!("unknown agent {agent_id}")))?;
        if token.user_id != caller.user_id {
            return Err(EngineError::Unauthorized(format!(
                "agent {agent_id} does not act for user {}",
                caller.user_id
            )));
        }
        if token.status != AgentStatus::Active {
            return Err(EngineError::Unauthorized(format!(
                "agent {agent_id} is revoked"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access() -> AccessControl {
        AccessControl::new(Arc::new(MemoryAccessStore::new()))
    }

    #[tokio::test]
    async fn test_freeze_toggle() {
        let access = access();
        assert!(access.ensure_not_frozen(1).await.is_ok());

        let flags = access
            .freeze_user(FreezeRequest {
                user_id: 1,
                frozen: true,
                reason: Some("chargeback".into()),
            })
            .await
            .unwrap();
        assert!(flags.frozen);
        assert_eq!(
            access.ensure_not_frozen(1).await,
            Err(EngineError::FrozenAccount {
                reason: Some("chargeback".into())
            })
        );
        assert!(access.ensure_not_frozen(2).await.is_ok());

        let flags = access
            .freeze_user(FreezeRequest {
                user_id: 1,
                frozen: false,
                reason: None,
            })
            .await
            .unwrap();
        assert!(!flags.frozen);
        assert!(flags.reason.is_none());
        assert!(access.ensure_not_frozen(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_agent_authorization() {
        let access = access();
        let token = access.register_agent(1).await.unwrap();

        assert!(access.authorize(&Caller::user(1)).await.is_ok());
        assert!(access.authorize(&Caller::agent(1, token.agent_id)).await.is_ok());
        assert!(matches!(
            access.authorize(&Caller::agent(2, token.agent_id)).await,
            Err(EngineError::Unauthorized(_))
        ));
        assert!(matches!(
            access.authorize(&Caller::agent(1, AgentId::new())).await,
            Err(EngineError::Unauthorized(_))
        ));

        let revoked = access
            .revoke_agent(RevokeAgentRequest {
                user_id: 1,
                agent_id: token.agent_id,
            })
            .await
            .unwrap();
        assert_eq!(revoked.status, AgentStatus::Revoked);
        assert!(matches!(
            access.authorize(&Caller::agent(1, token.agent_id)).await,
            Err(EngineError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke_requires_owner() {
        let access = access();
        let token = access.register_agent(1).await.unwrap();
        assert!(matches!(
            access
                .revoke_agent(RevokeAgentRequest {
                    user_id: 2,
                    agent_id: token.agent_id,
                })
                .await,
            Err(EngineError::NotFound(_))
        ));
        assert!(access.authorize(&Caller::agent(1, token.agent_id)).await.is_ok());
    }
}
