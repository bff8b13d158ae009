//! Command intents
//!
//! One row per `(user_id, idempotency_key)`. The first confirm creates it in
//! PENDING and owns execution; everyone else reads it. PENDING -> SUCCEEDED |
//! FAILED happens once, carrying the serialized result.
//!
//! Ownership of a PENDING intent is a claim token. A claim older than the
//! TTL, or one released after an unknown outcome, can be taken over with a
//! single CAS; only the current claim holder can complete.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::core_types::{IntentId, UserId};
use crate::error::EngineResult;

use super::types::CommandAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum IntentState {
    Pending = 0,
    Succeeded = 10,
    Failed = -10,
}

impl IntentState {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(IntentState::Pending),
            10 => Some(IntentState::Succeeded),
            -10 => Some(IntentState::Failed),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IntentState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Pending => "PENDING",
            IntentState::Succeeded => "SUCCEEDED",
            IntentState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandIntent {
    pub intent_id: IntentId,
    pub user_id: UserId,
    pub idempotency_key: String,
    pub action: CommandAction,
    pub state: IntentState,
    /// Serialized `CommandResult`, set when terminal
    pub result: Option<serde_json::Value>,
    /// Holder of the execution claim while PENDING
    pub claim_token: Option<String>,
    /// None once released
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CommandIntent {
    pub fn pending(user_id: UserId, idempotency_key: &str, action: CommandAction) -> Self {
        let now = Utc::now();
        Self {
            intent_id: IntentId::new(),
            user_id,
            idempotency_key: idempotency_key.to_string(),
            action,
            state: IntentState::Pending,
            result: None,
            claim_token: Some(new_claim_token()),
            claimed_at: Some(now),
            created_at: now,
            completed_at: None,
        }
    }

    /// PENDING with no live claim: released, or claimed before `stale_before`
    pub fn is_reclaimable(&self, stale_before: DateTime<Utc>) -> bool {
        self.state == IntentState::Pending && self.claimed_at.is_none_or(|t| t < stale_before)
    }
}

pub fn new_claim_token() -> String {
    ulid::Ulid::new().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// Caller owns execution
    Created(CommandIntent),
    /// Another confirm got there first
    Existing(CommandIntent),
}

#[async_trait]
pub trait IntentStore: Send + Sync {
    async fn begin(&self, intent: &CommandIntent) -> EngineResult<BeginOutcome>;

    async fn get(&self, user_id: UserId, idempotency_key: &str)
    -> EngineResult<Option<CommandIntent>>;

    /// CAS PENDING -> `state` for the claim holder. Returns false if the
    /// intent is terminal or the claim was taken over.
    async fn complete(
        &self,
        intent_id: IntentId,
        claim_token: &str,
        state: IntentState,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Take over a PENDING intent whose claim is released or older than
    /// `stale_before`. At most one concurrent caller gets `Some`.
    async fn reclaim(
        &self,
        intent_id: IntentId,
        claim_token: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> EngineResult<Option<CommandIntent>>;

    /// Give up the claim so the next confirm can take over immediately
    async fn release(&self, intent_id: IntentId, claim_token: &str) -> EngineResult<bool>;
}

#[derive(Default)]
pub struct MemoryIntentStore {
    intents: DashMap<(UserId, String), CommandIntent>,
}

impl MemoryIntentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntentStore for MemoryIntentStore {
    async fn begin(&self, intent: &CommandIntent) -> EngineResult<BeginOutcome> {
        match self
            .intents
            .entry((intent.user_id, intent.idempotency_key.clone()))
        {
            Entry::Occupied(existing) => Ok(BeginOutcome::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(intent.clone());
                Ok(BeginOutcome::Created(intent.clone()))
            }
        }
    }

    async fn get(
        &self,
        user_id: UserId,
        idempotency_key: &str,
    ) -> EngineResult<Option<CommandIntent>> {
        Ok(self
            .intents
            .get(&(user_id, idempotency_key.to_string()))
            .map(|i| i.clone()))
    }

    async fn complete(
        &self,
        intent_id: IntentId,
        claim_token: &str,
        state: IntentState,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let Some(mut intent) = self
            .intents
            .iter_mut()
            .find(|i| i.intent_id == intent_id)
        else {
            return Ok(false);
        };
        if intent.state.is_terminal() || intent.claim_token.as_deref() != Some(claim_token) {
            return Ok(false);
        }
        intent.state = state;
        intent.result = Some(result.clone());
        intent.claim_token = None;
        intent.claimed_at = None;
        intent.completed_at = Some(at);
        Ok(true)
    }

    async fn reclaim(
        &self,
        intent_id: IntentId,
        claim_token: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> EngineResult<Option<CommandIntent>> {
        let Some(mut intent) = self
            .intents
            .iter_mut()
            .find(|i| i.intent_id == intent_id)
        else {
            return Ok(None);
        };
        if !intent.is_reclaimable(stale_before) {
            return Ok(None);
        }
        intent.claim_token = Some(claim_token.to_string());
        intent.claimed_at = Some(now);
        Ok(Some(intent.clone()))
    }

    async fn release(&self, intent_id: IntentId, claim_token: &str) -> EngineResult<bool> {
        let Some(mut intent) = self
            .intents
            .iter_mut()
            .find(|i| i.intent_id == intent_id)
        else {
            return Ok(false);
        };
        if intent.state.is_terminal() || intent.claim_token.as_deref() != Some(claim_token) {
            return Ok(false);
        }
        intent.claim_token = None;
        intent.claimed_at = None;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send() -> CommandAction {
        CommandAction::Send {
            recipient: "alice".into(),
            amount_cents: 100,
        }
    }

    #[tokio::test]
    async fn test_begin_is_exclusive() {
        let store = MemoryIntentStore::new();
        let first = CommandIntent::pending(1, "k1", send());
        let second = CommandIntent::pending(1, "k1", send());

        assert!(matches!(store.begin(&first).await.unwrap(), BeginOutcome::Created(_)));
        match store.begin(&second).await.unwrap() {
            BeginOutcome::Existing(i) => assert_eq!(i.intent_id, first.intent_id),
            other => panic!("expected existing, got {other:?}"),
        }
        // Keys are per user
        let other_user = CommandIntent::pending(2, "k1", send());
        assert!(matches!(
            store.begin(&other_user).await.unwrap(),
            BeginOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn test_complete_once() {
        let store = MemoryIntentStore::new();
        let intent = CommandIntent::pending(1, "k1", send());
        store.begin(&intent).await.unwrap();

        let token = intent.claim_token.clone().unwrap();
        let result = serde_json::json!({"ok": true});
        assert!(
            !store
                .complete(intent.intent_id, "not-the-holder", IntentState::Failed, &result, Utc::now())
                .await
                .unwrap()
        );
        assert!(
            store
                .complete(intent.intent_id, &token, IntentState::Succeeded, &result, Utc::now())
                .await
                .unwrap()
        );
        assert!(
            !store
                .complete(intent.intent_id, &token, IntentState::Failed, &result, Utc::now())
                .await
                .unwrap()
        );
        let stored = store.get(1, "k1").await.unwrap().unwrap();
        assert_eq!(stored.state, IntentState::Succeeded);
        assert_eq!(stored.result, Some(result));
    }

    #[tokio::test]
    async fn test_reclaim_only_stale_or_released_claims() {
        let store = MemoryIntentStore::new();
        let intent = CommandIntent::pending(1, "k1", send());
        let original = intent.claim_token.clone().unwrap();
        store.begin(&intent).await.unwrap();

        let now = Utc::now();
        let ttl = chrono::Duration::seconds(60);
        // Fresh claim is left alone
        assert!(
            store
                .reclaim(intent.intent_id, "t2", now, now - ttl)
                .await
                .unwrap()
                .is_none()
        );

        // Once stale, exactly one taker wins
        let later = now + ttl * 2;
        let taken = store
            .reclaim(intent.intent_id, "t2", later, later - ttl)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.claim_token.as_deref(), Some("t2"));
        assert!(
            store
                .reclaim(intent.intent_id, "t3", later, later - ttl)
                .await
                .unwrap()
                .is_none()
        );

        // The displaced holder can no longer complete or release
        let result = serde_json::json!({});
        assert!(
            !store
                .complete(intent.intent_id, &original, IntentState::Succeeded, &result, later)
                .await
                .unwrap()
        );
        assert!(!store.release(intent.intent_id, &original).await.unwrap());

        // A released claim is immediately reclaimable
        assert!(store.release(intent.intent_id, "t2").await.unwrap());
        assert!(
            store
                .reclaim(intent.intent_id, "t4", later, later - ttl)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_state_ids_roundtrip() {
        for s in [IntentState::Pending, IntentState::Succeeded, IntentState::Failed] {
            assert_eq!(IntentState::from_id(s.id()), Some(s));
        }
        assert!(!IntentState::Pending.is_terminal());
        assert!(IntentState::Failed.is_terminal());
    }
}
