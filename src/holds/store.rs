use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::core_types::{HoldId, UserId};
use crate::error::EngineResult;

use super::{ActiveTotals, Hold, HoldKind, HoldStatus};

#[async_trait]
pub trait HoldStore: Send + Sync {
    /// Insert, or return the hold already stored under `(user_id, reference)`
    async fn insert(&self, hold: &Hold) -> EngineResult<Hold>;

    async fn get(&self, hold_id: HoldId) -> EngineResult<Option<Hold>>;

    /// CAS ACTIVE -> `to`. Returns false if the hold was not active.
    async fn close(&self, hold_id: HoldId, to: HoldStatus, at: DateTime<Utc>)
    -> EngineResult<bool>;

    /// Close every active hold whose expiry is at or before `now`
    async fn expire_due(&self, now: DateTime<Utc>) -> EngineResult<usize>;

    async fn active_totals(&self, user_id: UserId, now: DateTime<Utc>)
    -> EngineResult<ActiveTotals>;

    async fn active_for_user(&self, user_id: UserId, now: DateTime<Utc>)
    -> EngineResult<Vec<Hold>>;
}

#[derive(Default)]
pub struct MemoryHoldStore {
    holds: DashMap<HoldId, Hold>,
    by_reference: DashMap<(UserId, String), HoldId>,
}

impl MemoryHoldStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HoldStore for MemoryHoldStore {
    async fn insert(&self, hold: &Hold) -> EngineResult<Hold> {
        match self.by_reference.entry((hold.user_id, hold.reference.clone())) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                drop(existing);
                Ok(self
                    .holds
                    .get(&id)
                    .map(|h| h.clone())
                    .unwrap_or_else(|| hold.clone()))
            }
            Entry::Vacant(slot) => {
                self.holds.insert(hold.hold_id, hold.clone());
                slot.insert(hold.hold_id);
                Ok(hold.clone())
            }
        }
    }

    async fn get(&self, hold_id: HoldId) -> EngineResult<Option<Hold>> {
        Ok(self.holds.get(&hold_id).map(|h| h.clone()))
    }

    async fn close(
        &self,
        hold_id: HoldId,
        to: HoldStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let Some(mut hold) = self.holds.get_mut(&hold_id) else {
            return Ok(false);
        };
        if hold.status != HoldStatus::Active {
            return Ok(false);
        }
        hold.status = to;
        hold.closed_at = Some(at);
        Ok(true)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut expired = 0;
        for mut hold in self.holds.iter_mut() {
            if hold.status == HoldStatus::Active && hold.expires_at.is_some_and(|t| t <= now) {
                hold.status = HoldStatus::Expired;
                hold.closed_at = Some(now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn active_totals(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<ActiveTotals> {
        let mut totals = ActiveTotals::default();
        for hold in self.holds.iter() {
            if hold.user_id != user_id || !hold.is_active_at(now) {
                continue;
            }
            match hold.kind {
                HoldKind::Hold => totals.holds_cents += hold.amount_cents,
                HoldKind::Reserve => totals.reserves_cents += hold.amount_cents,
            }
        }
        Ok(totals)
    }

    async fn active_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Hold>> {
        let mut holds: Vec<Hold> = self
            .holds
            .iter()
            .filter(|h| h.user_id == user_id && h.is_active_at(now))
            .map(|h| h.clone())
            .collect();
        holds.sort_by_key(|h| (h.created_at, h.hold_id));
        Ok(holds)
    }
}
