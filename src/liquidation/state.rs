//! Liquidation task states
//!
//! A user with no task is in the implicit NONE state.
//! QUEUED -> PROCESSING -> DONE | FAILED, and FAILED -> QUEUED while attempts
//! remain.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum LiquidationState {
    Queued = 10,
    Processing = 20,
    /// Terminal: shortfall covered, or holdings exhausted (residual recorded)
    Done = 40,
    /// Execution error; requeued while attempts remain
    Failed = -10,
}

impl LiquidationState {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            10 => Some(LiquidationState::Queued),
            20 => Some(LiquidationState::Processing),
            40 => Some(LiquidationState::Done),
            -10 => Some(LiquidationState::Failed),
            _ => None,
        }
    }

    /// Occupies the user's single active slot
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, LiquidationState::Queued | LiquidationState::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LiquidationState::Queued => "QUEUED",
            LiquidationState::Processing => "PROCESSING",
            LiquidationState::Done => "DONE",
            LiquidationState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LiquidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
