use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Cents, EntryId, HoldId, IntentId, UserId, format_cents};
use crate::error::{EngineError, EngineResult};

/// Closed set of command actions, each with its own payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandAction {
    Send { recipient: String, amount_cents: Cents },
    Buy { symbol: String, amount_cents: Cents },
    Sell { symbol: String, amount_cents: Cents },
    Reserve { purpose: String, amount_cents: Cents },
}

impl CommandAction {
    pub fn amount_cents(&self) -> Cents {
        match self {
            CommandAction::Send { amount_cents, .. }
            | CommandAction::Buy { amount_cents, .. }
            | CommandAction::Sell { amount_cents, .. }
            | CommandAction::Reserve { amount_cents, .. } => *amount_cents,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CommandAction::Send { .. } => "send",
            CommandAction::Buy { .. } => "buy",
            CommandAction::Sell { .. } => "sell",
            CommandAction::Reserve { .. } => "reserve",
        }
    }

    /// Whether the action draws on spend power
    pub fn consumes_spend_power(&self) -> bool {
        !matches!(self, CommandAction::Sell { .. })
    }

    /// Payload checks for actions that arrive already structured
    pub fn validate(&self) -> EngineResult<()> {
        if self.amount_cents() <= 0 {
            return Err(EngineError::Validation(format!(
                "amount_cents must be positive, got {}",
                self.amount_cents()
            )));
        }
        let (field, value) = match self {
            CommandAction::Send { recipient, .. } => ("recipient", recipient),
            CommandAction::Buy { symbol, .. } | CommandAction::Sell { symbol, .. } => {
                ("symbol", symbol)
            }
            CommandAction::Reserve { purpose, .. } => ("purpose", purpose),
        };
        if value.trim().is_empty() {
            return Err(EngineError::Validation(format!("{field} is empty")));
        }
        Ok(())
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandAction::Send {
                recipient,
                amount_cents,
            } => write!(f, "Send ${} to {recipient}", format_cents(*amount_cents)),
            CommandAction::Buy {
                symbol,
                amount_cents,
            } => write!(f, "Buy ${} of {symbol}", format_cents(*amount_cents)),
            CommandAction::Sell {
                symbol,
                amount_cents,
            } => write!(f, "Sell ${} of {symbol}", format_cents(*amount_cents)),
            CommandAction::Reserve {
                purpose,
                amount_cents,
            } => write!(f, "Reserve ${} for {purpose}", format_cents(*amount_cents)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewRequest {
    pub text: String,
}

/// Structured interpretation of a command. Nothing is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandPreview {
    pub action: CommandAction,
    pub summary: String,
    pub amount_cents: Cents,
    pub fee_cents: Cents,
    pub total_cents: Cents,
    pub spendable_cents: Cents,
    pub sufficient_funds: bool,
}

/// `{action, idempotency_key, ...payload}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub idempotency_key: String,
    #[serde(flatten)]
    pub action: CommandAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub code: String,
    pub message: String,
}

impl From<&EngineError> for CommandFailure {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Terminal result of a confirmed command. Replays return it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub intent_id: IntentId,
    pub user_id: UserId,
    pub idempotency_key: String,
    pub action: CommandAction,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_id: Option<HoldId>,
    pub amount_cents: Cents,
    pub fee_cents: Cents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandFailure>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_payload_shape() {
        let json = serde_json::json!({
            "action": "send",
            "idempotency_key": "k1",
            "recipient": "alice",
            "amount_cents": 2000,
        });
        let req: ConfirmRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.idempotency_key, "k1");
        assert_eq!(
            req.action,
            CommandAction::Send {
                recipient: "alice".into(),
                amount_cents: 2_000
            }
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        let json = serde_json::json!({
            "action": "teleport",
            "idempotency_key": "k1",
            "amount_cents": 1,
        });
        assert!(serde_json::from_value::<ConfirmRequest>(json).is_err());
    }

    #[test]
    fn test_validate() {
        let bad = CommandAction::Reserve {
            purpose: " ".into(),
            amount_cents: 100,
        };
        assert!(matches!(bad.validate(), Err(EngineError::Validation(_))));
        let bad = CommandAction::Buy {
            symbol: "BTC".into(),
            amount_cents: 0,
        };
        assert!(matches!(bad.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_summary() {
        let action = CommandAction::Send {
            recipient: "alice".into(),
            amount_cents: 2_050,
        };
        assert_eq!(action.to_string(), "Send $20.50 to alice");
    }
}
