//! Paper providers
//!
//! In-memory custody venue, price feed and settlement feed. Used by the test
//! suite and by the binary when no real provider clients are wired in.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::debug;

use super::{
    CustodyVenue, ExternalEvent, Fill, Holding, OrderSide, PriceFeed, PriceQuote, ProviderError,
    SettlementFeed, VenueOrder,
};
use crate::core_types::UserId;

/// Paper custody venue + price feed
#[derive(Default)]
pub struct PaperVenue {
    holdings: DashMap<UserId, Vec<Holding>>,
    prices: DashMap<String, Decimal>,
    fills: DashMap<String, Fill>,
    rejected_symbols: Mutex<HashSet<String>>,
    /// Millis since epoch of the last price refresh, 0 = never
    refreshed_at_ms: AtomicI64,
    latency_ms: AtomicI64,
    executed_orders: AtomicUsize,
    next_holding: AtomicUsize,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a unit price (cents) and mark the feed refreshed now
    pub fn set_price(&self, symbol: &str, price_cents: Decimal) {
        self.prices.insert(symbol.to_uppercase(), price_cents);
        self.mark_refreshed(Utc::now());
    }

    pub fn mark_refreshed(&self, at: DateTime<Utc>) {
        self.refreshed_at_ms
            .store(at.timestamp_millis(), Ordering::Release);
    }

    pub fn add_holding(&self, user_id: UserId, holding: Holding) {
        self.holdings.entry(user_id).or_default().push(holding);
    }

    /// Orders for this symbol are rejected by the venue
    pub fn reject_symbol(&self, symbol: &str) {
        if let Ok(mut set) = self.rejected_symbols.lock() {
            set.insert(symbol.to_uppercase());
        }
    }

    pub fn clear_rejections(&self) {
        if let Ok(mut set) = self.rejected_symbols.lock() {
            set.clear();
        }
    }

    /// Artificial latency applied to every venue call
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as i64, Ordering::Release);
    }

    /// Orders actually executed (replays of a known client_order_id excluded)
    pub fn executed_orders(&self) -> usize {
        self.executed_orders.load(Ordering::Acquire)
    }

    pub fn quantity_of(&self, user_id: UserId, symbol: &str) -> Decimal {
        self.holdings
            .get(&user_id)
            .map(|hs| {
                hs.iter()
                    .filter(|h| h.symbol.eq_ignore_ascii_case(symbol))
                    .map(|h| h.quantity)
                    .sum()
            })
            .unwrap_or(Decimal::ZERO)
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Acquire);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
    }

    fn is_rejected(&self, symbol: &str) -> bool {
        self.rejected_symbols
            .lock()
            .map(|set| set.contains(&symbol.to_uppercase()))
            .unwrap_or(false)
    }

    fn execute(&self, order: &VenueOrder) -> Result<Fill, ProviderError> {
        let symbol = order.symbol.to_uppercase();
        if self.is_rejected(&symbol) {
            return Err(ProviderError::Rejected(format!("{symbol} trading halted")));
        }
        let price = self
            .prices
            .get(&symbol)
            .map(|p| *p)
            .ok_or_else(|| ProviderError::Rejected(format!("no market for {symbol}")))?;

        let quantity = match order.side {
            OrderSide::Sell => {
                let mut positions = self.holdings.entry(order.user_id).or_default();
                let mut remaining = order.quantity;
                for h in positions
                    .iter_mut()
                    .filter(|h| h.symbol.eq_ignore_ascii_case(&symbol))
                {
                    let take = remaining.min(h.quantity);
                    h.quantity -= take;
                    remaining -= take;
                    if remaining.is_zero() {
                        break;
                    }
                }
                positions.retain(|h| !h.quantity.is_zero());
                let filled = order.quantity - remaining;
                if filled.is_zero() {
                    return Err(ProviderError::Rejected(format!("no {symbol} position")));
                }
                filled
            }
            OrderSide::Buy => {
                let n = self.next_holding.fetch_add(1, Ordering::AcqRel);
                self.add_holding(
                    order.user_id,
                    Holding {
                        holding_id: format!("paper-{n}"),
                        symbol: symbol.clone(),
                        quantity: order.quantity,
                        liquidity_rank: 0,
                        acquired_at: Utc::now(),
                    },
                );
                order.quantity
            }
        };

        self.executed_orders.fetch_add(1, Ordering::AcqRel);
        Ok(Fill {
            client_order_id: order.client_order_id.clone(),
            symbol,
            side: order.side,
            quantity,
            gross_cents: (quantity * price).floor().to_i64().unwrap_or(0),
        })
    }
}

#[async_trait]
impl CustodyVenue for PaperVenue {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn holdings(&self, user_id: UserId) -> Result<Vec<Holding>, ProviderError> {
        self.simulate_latency().await;
        Ok(self
            .holdings
            .get(&user_id)
            .map(|hs| hs.clone())
            .unwrap_or_default())
    }

    async fn place_order(&self, order: &VenueOrder) -> Result<Fill, ProviderError> {
        self.simulate_latency().await;

        // The entry guard serializes concurrent submissions of one client_order_id
        match self.fills.entry(order.client_order_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                debug!(client_order_id = %order.client_order_id, "Order replay");
                Ok(existing.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let fill = self.execute(order)?;
                slot.insert(fill.clone());
                Ok(fill)
            }
        }
    }
}

#[async_trait]
impl PriceFeed for PaperVenue {
    async fn price(&self, symbol: &str) -> Result<PriceQuote, ProviderError> {
        let symbol = symbol.to_uppercase();
        let price = self
            .prices
            .get(&symbol)
            .map(|p| *p)
            .ok_or_else(|| ProviderError::Unavailable(format!("no price for {symbol}")))?;
        let as_of = self.last_refreshed_at().await?.unwrap_or_else(Utc::now);
        Ok(PriceQuote {
            symbol,
            price_cents: price,
            as_of,
        })
    }

    async fn last_refreshed_at(&self) -> Result<Option<DateTime<Utc>>, ProviderError> {
        let ms = self.refreshed_at_ms.load(Ordering::Acquire);
        if ms == 0 {
            return Ok(None);
        }
        Ok(Utc.timestamp_millis_opt(ms).single())
    }
}

/// Paper settlement provider feed
#[derive(Default)]
pub struct PaperSettlementFeed {
    events: DashMap<UserId, Vec<ExternalEvent>>,
    unavailable: AtomicBool,
}

impl PaperSettlementFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, user_id: UserId, event: ExternalEvent) {
        self.events.entry(user_id).or_default().push(event);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }
}

#[async_trait]
impl SettlementFeed for PaperSettlementFeed {
    async fn activity(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExternalEvent>, ProviderError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(ProviderError::Unavailable("settlement feed".into()));
        }
        Ok(self
            .events
            .get(&user_id)
            .map(|evs| {
                evs.iter()
                    .filter(|e| e.occurred_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
