use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Cents, TaskId, UserId};

use super::state::LiquidationState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationTask {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub shortfall_cents: Cents,
    pub state: LiquidationState,
    /// Failed execution attempts so far
    pub attempts: i32,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Holder of the current PROCESSING claim
    pub claim_token: Option<String>,
    pub liquidated_cents: Cents,
    pub residual_shortfall_cents: Cents,
    pub error: Option<String>,
}

impl LiquidationTask {
    pub fn queued(user_id: UserId, shortfall_cents: Cents, now: DateTime<Utc>) -> Self {
        Self {
            task_id: TaskId::new(),
            user_id,
            shortfall_cents,
            state: LiquidationState::Queued,
            attempts: 0,
            enqueued_at: now,
            updated_at: now,
            claimed_at: None,
            claim_token: None,
            liquidated_cents: 0,
            residual_shortfall_cents: 0,
            error: None,
        }
    }

    /// DONE without fully covering the shortfall
    pub fn has_residual(&self) -> bool {
        self.state == LiquidationState::Done && self.residual_shortfall_cents > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(LiquidationTask),
    /// The user already has an active task
    Existing(LiquidationTask),
    /// Spend power covers obligations
    NotNeeded,
    /// The user's last task failed past its attempt budget
    Exhausted(LiquidationTask),
}

impl EnqueueOutcome {
    pub fn task(&self) -> Option<&LiquidationTask> {
        match self {
            EnqueueOutcome::Created(t) | EnqueueOutcome::Existing(t) | EnqueueOutcome::Exhausted(t) => {
                Some(t)
            }
            EnqueueOutcome::NotNeeded => None,
        }
    }
}

/// Result of one `process_queued` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub claimed: usize,
    pub done: usize,
    pub residual: usize,
    pub failed: usize,
}
