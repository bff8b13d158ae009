//! External Collaborators
//!
//! Shapes of the data exchanged with custody venues, price feeds and
//! settlement providers. How those providers are reached is outside this
//! crate; production deployments plug their own clients in behind these
//! traits. The `paper` implementations back tests and the dev binary.

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_types::{Cents, UserId};

pub use paper::{PaperSettlementFeed, PaperVenue};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("{0} timed out")]
    Timeout(String),

    #[error("Rejected by provider: {0}")]
    Rejected(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// A custodial position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub holding_id: String,
    pub symbol: String,
    pub quantity: Decimal,
    /// 0 = most liquid. Venues rank by how quickly a position converts to cash.
    pub liquidity_rank: u8,
    pub acquired_at: DateTime<Utc>,
}

impl Holding {
    /// Market value in cents, rounded down
    pub fn market_value_cents(&self, price_cents: Decimal) -> Cents {
        (self.quantity * price_cents).floor().to_i64().unwrap_or(0)
    }
}

/// Unit price quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    /// Price of one unit, in cents
    pub price_cents: Decimal,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Market order sent to a custody venue
///
/// Venues must treat `client_order_id` as an idempotency key: re-sending the
/// same order returns the original fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub client_order_id: String,
    pub user_id: UserId,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Cash value of the fill before fees
    pub gross_cents: Cents,
}

/// One line of account activity as seen by the external settlement provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub source: String,
    pub external_id: String,
    /// Signed cash movement for the user
    pub amount_cents: Cents,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait CustodyVenue: Send + Sync {
    fn name(&self) -> &'static str;

    async fn holdings(&self, user_id: UserId) -> Result<Vec<Holding>, ProviderError>;

    async fn place_order(&self, order: &VenueOrder) -> Result<Fill, ProviderError>;
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn price(&self, symbol: &str) -> Result<PriceQuote, ProviderError>;

    /// Time of the freshest trusted price/balance refresh, if any
    async fn last_refreshed_at(&self) -> Result<Option<DateTime<Utc>>, ProviderError>;
}

#[async_trait]
pub trait SettlementFeed: Send + Sync {
    async fn activity(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, ProviderError>;
}
