//! Holds and Reserves
//!
//! Time-bounded deductions against spendable cash. A card authorization is a
//! hold; money set aside for a purpose is a reserve. Both are closed, never
//! deleted.

pub mod db;
pub mod store;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Cents, HoldId, UserId};
use crate::error::{EngineError, EngineResult};

pub use db::PgHoldStore;
pub use store::{HoldStore, MemoryHoldStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum HoldKind {
    Hold = 1,
    Reserve = 2,
}

impl HoldKind {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(HoldKind::Hold),
            2 => Some(HoldKind::Reserve),
            _ => None,
        }
    }
}

/// Hold lifecycle: ACTIVE -> SETTLED | EXPIRED | CANCELLED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum HoldStatus {
    Active = 0,
    Settled = 10,
    Expired = 20,
    Cancelled = 30,
}

impl HoldStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(HoldStatus::Active),
            10 => Some(HoldStatus::Settled),
            20 => Some(HoldStatus::Expired),
            30 => Some(HoldStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "ACTIVE",
            HoldStatus::Settled => "SETTLED",
            HoldStatus::Expired => "EXPIRED",
            HoldStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, HoldStatus::Active)
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub hold_id: HoldId,
    pub user_id: UserId,
    pub kind: HoldKind,
    pub amount_cents: Cents,
    /// Caller reference, unique per user (authorization id, intent key)
    pub reference: String,
    pub status: HoldStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Hold {
    /// Counts against spend power at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == HoldStatus::Active && self.expires_at.is_none_or(|t| t > now)
    }
}

/// Sums of active deductions for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTotals {
    pub holds_cents: Cents,
    pub reserves_cents: Cents,
}

pub struct Holds {
    store: Arc<dyn HoldStore>,
}

impl Holds {
    pub fn new(store: Arc<dyn HoldStore>) -> Self {
        Self { store }
    }

    /// Place a hold or reserve. Re-placing the same reference returns the
    /// original hold.
    pub async fn place_hold(
        &self,
        user_id: UserId,
        kind: HoldKind,
        amount_cents: Cents,
        reference: &str,
        ttl: Option<Duration>,
    ) -> EngineResult<Hold> {
        if amount_cents <= 0 {
            return Err(EngineError::Validation(
                "hold amount must be positive".into(),
            ));
        }
        if reference.trim().is_empty() {
            return Err(EngineError::Validation("hold reference is required".into()));
        }
        let now = Utc::now();
        let hold = Hold {
            hold_id: HoldId::new(),
            user_id,
            kind,
            amount_cents,
            reference: reference.to_string(),
            status: HoldStatus::Active,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
            closed_at: None,
        };
        let stored = self.store.insert(&hold).await?;
        tracing::info!(
            user_id,
            hold_id = %stored.hold_id,
            kind = ?stored.kind,
            amount_cents = stored.amount_cents,
            reference = %stored.reference,
            "Hold placed"
        );
        Ok(stored)
    }

    /// Close an active hold as settled or cancelled
    pub async fn close_hold(&self, hold_id: HoldId, outcome: HoldStatus) -> EngineResult<Hold> {
        if !matches!(outcome, HoldStatus::Settled | HoldStatus::Cancelled) {
            return Err(EngineError::InvalidStateTransition(format!(
                "holds are closed as SETTLED or CANCELLED, not {outcome}"
            )));
        }
        let hold = self
            .store
            .get(hold_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("hold {hold_id}")))?;
        if hold.status == outcome {
            return Ok(hold);
        }
        if !self.store.close(hold_id, outcome, Utc::now()).await? {
            let current = self
                .store
                .get(hold_id)
                .await?
                .map(|h| h.status.to_string())
                .unwrap_or_default();
            return Err(EngineError::InvalidStateTransition(format!(
                "hold {hold_id} is {current}"
            )));
        }
        tracing::info!(hold_id = %hold_id, status = %outcome, "Hold closed");
        self.store
            .get(hold_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("hold {hold_id}")))
    }

    /// Move every active hold past its expiry to EXPIRED
    pub async fn expire_holds(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let expired = self.store.expire_due(now).await?;
        if expired > 0 {
            tracing::info!(expired, "Expired holds");
        }
        Ok(expired)
    }

    pub async fn active_totals(&self, user_id: UserId) -> EngineResult<ActiveTotals> {
        self.store.active_totals(user_id, Utc::now()).await
    }

    pub async fn active_for_user(&self, user_id: UserId) -> EngineResult<Vec<Hold>> {
        self.store.active_for_user(user_id, Utc::now()).await
    }
}
