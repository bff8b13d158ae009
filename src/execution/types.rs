use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{AgentId, Cents, EntryId, QuoteId, ReceiptId, UserId};
use crate::providers::OrderSide;

/// What a quote executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuoteAction {
    /// Pay an external recipient from cash
    Transfer { recipient: String },
    /// Buy or sell a custodial asset for `amount_cents` worth
    Trade { symbol: String, side: OrderSide },
}

impl QuoteAction {
    /// Whether executing takes cash out of the user's account
    pub fn is_debit(&self) -> bool {
        match self {
            QuoteAction::Transfer { .. } => true,
            QuoteAction::Trade { side, .. } => *side == OrderSide::Buy,
        }
    }
}

/// Priced, time-limited offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: QuoteId,
    pub user_id: UserId,
    pub agent_id: Option<AgentId>,
    pub action: QuoteAction,
    pub amount_cents: Cents,
    pub fee_cents: Cents,
    /// Unit price at quote time, trades only
    pub unit_price_cents: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Quote {
    pub fn total_cents(&self) -> Cents {
        self.amount_cents.saturating_add(self.fee_cents)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Immutable record of a completed execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: ReceiptId,
    pub user_id: UserId,
    pub agent_id: Option<AgentId>,
    pub quote_id: QuoteId,
    pub idempotency_key: String,
    pub action: QuoteAction,
    /// Cash value actually moved, before fees
    pub amount_cents: Cents,
    pub fee_cents: Cents,
    /// Units filled, trades only
    pub quantity: Option<Decimal>,
    pub entry_id: EntryId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateQuoteRequest {
    pub action: QuoteAction,
    pub amount_cents: Cents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub quote_id: QuoteId,
    pub idempotency_key: String,
    #[serde(default)]
    pub step_up_token: Option<String>,
    /// Client-signed copy of the request; must agree with it when present
    #[serde(default)]
    pub signed_payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListReceiptsRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_tagging() {
        let action = QuoteAction::Trade {
            symbol: "BTC".into(),
            side: OrderSide::Sell,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "trade");
        assert_eq!(json["side"], "sell");
        assert!(!action.is_debit());
        assert!(
            QuoteAction::Transfer {
                recipient: "alice".into()
            }
            .is_debit()
        );
    }
}
