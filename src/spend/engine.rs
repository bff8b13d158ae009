//! Spend-Authorization Engine
//!
//! `spend_power = max(0, settled_cash - holds - reserves - safety - degradation)`
//!
//! One engine serves both settlement models; the model only changes field
//! naming in the spend-power report.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::access::AccessControl;
use crate::config::{SettlementModel, SpendConfig};
use crate::core_types::{Cents, UserId};
use crate::error::EngineResult;
use crate::execution::{Receipt, ReceiptStore};
use crate::holds::Holds;
use crate::ledger::Ledger;
use crate::liquidation::LiquidationStore;
use crate::providers::{CustodyVenue, PriceFeed};
use crate::retry::with_timeout;

use super::freshness::FreshnessStatus;

/// Inputs to the spend-power formula
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendInputs {
    pub settled_cash_cents: Cents,
    pub active_holds_cents: Cents,
    pub active_reserves_cents: Cents,
    pub freshness: FreshnessStatus,
}

/// Derived figure, computed on demand and never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendPowerSnapshot {
    pub user_id: UserId,
    pub settled_cash_cents: Cents,
    pub active_holds_cents: Cents,
    pub active_reserves_cents: Cents,
    pub safety_buffer_cents: Cents,
    pub degradation_buffer_cents: Cents,
    pub spend_power_cents: Cents,
    pub freshness_status: FreshnessStatus,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

/// Apply the formula. Deductions are computed with i128 and the result is
/// clamped to `[0, max(settled_cash, 0)]`.
pub fn compute_spend_power(inputs: &SpendInputs, config: &SpendConfig) -> (Cents, Cents, Cents) {
    let settled = inputs.settled_cash_cents as i128;
    let scaled = settled.max(0) * config.safety_buffer_bps as i128 / 10_000;
    let safety = (config.safety_buffer_floor_cents as i128).max(scaled);

    let base = (settled
        - inputs.active_holds_cents as i128
        - inputs.active_reserves_cents as i128
        - safety)
        .max(0);
    let degradation = base * inputs.freshness.buffer_bps(config) as i128 / 10_000;

    let spend_power = (base - degradation).clamp(0, settled.max(0));
    (
        to_cents(safety),
        to_cents(degradation),
        to_cents(spend_power),
    )
}

fn to_cents(v: i128) -> Cents {
    v.clamp(Cents::MIN as i128, Cents::MAX as i128) as Cents
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMode {
    /// Figures come straight from a fresh ledger view
    Ledger,
    /// Inputs are stale or a provider could not be reached
    Estimated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableNow {
    pub spendable_cents: Cents,
    pub spend_power_cents: Cents,
    pub bridge_outstanding_cents: Cents,
    pub balance_mode: BalanceMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionValue {
    pub holding_id: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub price_cents: Decimal,
    pub value_cents: Cents,
}

/// Market value of non-cash holdings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlipValuation {
    pub user_id: UserId,
    pub total_cents: Cents,
    pub positions: Vec<PositionValue>,
    /// Symbols with no price available; excluded from the total
    pub unpriced: Vec<String>,
    pub valued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    pub spendable_cents: Cents,
    pub total_value_cents: Cents,
    pub spend_power_cents: Cents,
    pub bridge_outstanding_cents: Cents,
    pub balance_mode: BalanceMode,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendBreakdown {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_cash_cents: Option<Cents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_balance_cents: Option<Cents>,
    pub active_holds_cents: Cents,
    pub active_reserves_cents: Cents,
    pub safety_buffer_cents: Cents,
    pub degradation_buffer_cents: Cents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendFlag {
    Frozen,
    StaleData,
    DegradedData,
    BridgeOutstanding,
    LiquidationPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendPowerReport {
    pub spend_power_cents: Cents,
    pub breakdown: SpendBreakdown,
    pub freshness_status: FreshnessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_ago_seconds: Option<i64>,
    pub flags: Vec<SpendFlag>,
    pub receipts_preview: Vec<Receipt>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct SpendPowerOptions {
    /// Skip the receipts preview
    #[serde(default)]
    pub without_receipts: bool,
}

pub struct SpendEngine {
    ledger: Arc<Ledger>,
    holds: Arc<Holds>,
    access: Arc<AccessControl>,
    venue: Arc<dyn CustodyVenue>,
    prices: Arc<dyn PriceFeed>,
    receipts: Arc<dyn ReceiptStore>,
    liquidations: Arc<dyn LiquidationStore>,
    config: SpendConfig,
    settlement_model: SettlementModel,
}

impl SpendEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        holds: Arc<Holds>,
        access: Arc<AccessControl>,
        venue: Arc<dyn CustodyVenue>,
        prices: Arc<dyn PriceFeed>,
        receipts: Arc<dyn ReceiptStore>,
        liquidations: Arc<dyn LiquidationStore>,
        config: SpendConfig,
        settlement_model: SettlementModel,
    ) -> Self {
        Self {
            ledger,
            holds,
            access,
            venue,
            prices,
            receipts,
            liquidations,
            config,
            settlement_model,
        }
    }

    fn price_timeout(&self) -> Duration {
        Duration::from_millis(self.config.price_timeout_ms)
    }

    /// Time of the freshest trusted refresh. A feed that cannot answer in
    /// time counts as never refreshed.
    async fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        match with_timeout(
            "price feed refresh time",
            self.price_timeout(),
            self.prices.last_refreshed_at(),
        )
        .await
        {
            Ok(at) => at,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read feed freshness - treating as degraded");
                None
            }
        }
    }

    pub async fn snapshot(&self, user_id: UserId) -> EngineResult<SpendPowerSnapshot> {
        let now = Utc::now();
        let cash = self.ledger.cash_account(user_id).await?;
        let settled_cash_cents = self.ledger.get_settled_balance(&cash).await?;
        let totals = self.holds.active_totals(user_id).await?;
        let last_refreshed_at = self.last_refreshed_at().await;
        let freshness = FreshnessStatus::classify(last_refreshed_at, now, &self.config);

        let inputs = SpendInputs {
            settled_cash_cents,
            active_holds_cents: totals.holds_cents,
            active_reserves_cents: totals.reserves_cents,
            freshness,
        };
        let (safety, degradation, spend_power) = compute_spend_power(&inputs, &self.config);

        tracing::debug!(
            user_id,
            settled_cash_cents,
            holds = totals.holds_cents,
            reserves = totals.reserves_cents,
            safety,
            degradation,
            spend_power,
            freshness = ?freshness,
            "Spend power computed"
        );

        Ok(SpendPowerSnapshot {
            user_id,
            settled_cash_cents,
            active_holds_cents: totals.holds_cents,
            active_reserves_cents: totals.reserves_cents,
            safety_buffer_cents: safety,
            degradation_buffer_cents: degradation,
            spend_power_cents: spend_power,
            freshness_status: freshness,
            last_refreshed_at,
            computed_at: now,
        })
    }

    /// Spend power minus outstanding bridge advances
    pub async fn compute_spendable_now(&self, user_id: UserId) -> EngineResult<SpendableNow> {
        let snapshot = self.snapshot(user_id).await?;
        let bridge_outstanding_cents = self.ledger.bridge_outstanding(user_id).await?;
        Ok(SpendableNow {
            spendable_cents: (snapshot.spend_power_cents - bridge_outstanding_cents).max(0),
            spend_power_cents: snapshot.spend_power_cents,
            bridge_outstanding_cents,
            balance_mode: match snapshot.freshness_status {
                FreshnessStatus::Fresh => BalanceMode::Ledger,
                _ => BalanceMode::Estimated,
            },
        })
    }

    pub async fn calculate_spend_power(
        &self,
        user_id: UserId,
        opts: SpendPowerOptions,
    ) -> EngineResult<SpendPowerReport> {
        let snapshot = self.snapshot(user_id).await?;

        let mut flags = Vec::new();
        if self.access.flags(user_id).await?.frozen {
            flags.push(SpendFlag::Frozen);
        }
        match snapshot.freshness_status {
            FreshnessStatus::Fresh => {}
            FreshnessStatus::Stale => flags.push(SpendFlag::StaleData),
            FreshnessStatus::Degraded => flags.push(SpendFlag::DegradedData),
        }
        if self.ledger.bridge_outstanding(user_id).await? > 0 {
            flags.push(SpendFlag::BridgeOutstanding);
        }
        if self.liquidations.active_for_user(user_id).await?.is_some() {
            flags.push(SpendFlag::LiquidationPending);
        }

        let receipts_preview = if opts.without_receipts || self.config.receipts_preview == 0 {
            Vec::new()
        } else {
            self.receipts
                .list_for_user(user_id, self.config.receipts_preview)
                .await?
        };

        let (settled_cash_cents, confirmed_balance_cents, updated_at, updated_ago_seconds) =
            match self.settlement_model {
                SettlementModel::Fiat => (
                    Some(snapshot.settled_cash_cents),
                    None,
                    Some(snapshot.last_refreshed_at.unwrap_or(snapshot.computed_at)),
                    None,
                ),
                SettlementModel::Stablecoin => (
                    None,
                    Some(snapshot.settled_cash_cents),
                    None,
                    snapshot
                        .last_refreshed_at
                        .map(|at| (snapshot.computed_at - at).num_seconds().max(0)),
                ),
            };

        Ok(SpendPowerReport {
            spend_power_cents: snapshot.spend_power_cents,
            breakdown: SpendBreakdown {
                settled_cash_cents,
                confirmed_balance_cents,
                active_holds_cents: snapshot.active_holds_cents,
                active_reserves_cents: snapshot.active_reserves_cents,
                safety_buffer_cents: snapshot.safety_buffer_cents,
                degradation_buffer_cents: snapshot.degradation_buffer_cents,
            },
            freshness_status: snapshot.freshness_status,
            updated_at,
            updated_ago_seconds,
            flags,
            receipts_preview,
        })
    }

    /// Market value of all non-cash holdings. Read-only.
    pub async fn compute_flip(&self, user_id: UserId) -> EngineResult<FlipValuation> {
        let timeout = self.price_timeout();
        let holdings = with_timeout("venue holdings", timeout, self.venue.holdings(user_id)).await?;

        let mut positions = Vec::with_capacity(holdings.len());
        let mut unpriced = Vec::new();
        let mut total: i128 = 0;
        for holding in holdings {
            match with_timeout("price", timeout, self.prices.price(&holding.symbol)).await {
                Ok(quote) => {
                    let value_cents = holding.market_value_cents(quote.price_cents);
                    total += value_cents as i128;
                    positions.push(PositionValue {
                        holding_id: holding.holding_id,
                        symbol: holding.symbol,
                        quantity: holding.quantity,
                        price_cents: quote.price_cents,
                        value_cents,
                    });
                }
                Err(e) => {
                    tracing::warn!(user_id, symbol = %holding.symbol, error = %e, "Holding left unpriced");
                    if !unpriced.contains(&holding.symbol) {
                        unpriced.push(holding.symbol);
                    }
                }
            }
        }

        Ok(FlipValuation {
            user_id,
            total_cents: to_cents(total),
            positions,
            unpriced,
            valued_at: Utc::now(),
        })
    }

    /// Balance view: spendable figure plus total value (settled cash + flip)
    pub async fn balance(&self, user_id: UserId) -> EngineResult<BalanceView> {
        let spendable = self.compute_spendable_now(user_id).await?;
        let cash = self.ledger.cash_account(user_id).await?;
        let settled_cash = self.ledger.get_settled_balance(&cash).await?;

        let (flip_cents, mode) = match self.compute_flip(user_id).await {
            Ok(flip) if flip.unpriced.is_empty() => (flip.total_cents, spendable.balance_mode),
            Ok(flip) => (flip.total_cents, BalanceMode::Estimated),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Flip valuation unavailable - reporting cash only");
                (0, BalanceMode::Estimated)
            }
        };

        Ok(BalanceView {
            spendable_cents: spendable.spendable_cents,
            total_value_cents: settled_cash.saturating_add(flip_cents),
            spend_power_cents: spendable.spend_power_cents,
            bridge_outstanding_cents: spendable.bridge_outstanding_cents,
            balance_mode: mode,
            updated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(settled: Cents, holds: Cents, reserves: Cents, freshness: FreshnessStatus) -> SpendInputs {
        SpendInputs {
            settled_cash_cents: settled,
            active_holds_cents: holds,
            active_reserves_cents: reserves,
            freshness,
        }
    }

    #[test]
    fn test_formula_with_fresh_data() {
        let config = SpendConfig::default();
        let (safety, degradation, power) =
            compute_spend_power(&inputs(10_000, 2_000, 1_000, FreshnessStatus::Fresh), &config);
        assert_eq!(safety, 500);
        assert_eq!(degradation, 0);
        assert_eq!(power, 6_500);
    }

    #[test]
    fn test_degradation_scales_with_tier() {
        let config = SpendConfig::default();
        let (_, stale, stale_power) =
            compute_spend_power(&inputs(10_000, 0, 0, FreshnessStatus::Stale), &config);
        let (_, degraded, degraded_power) =
            compute_spend_power(&inputs(10_000, 0, 0, FreshnessStatus::Degraded), &config);
        // base 9_500; 2% and 10%
        assert_eq!(stale, 190);
        assert_eq!(degraded, 950);
        assert!(degraded_power < stale_power);
    }

    #[test]
    fn test_never_negative_and_never_above_cash() {
        let config = SpendConfig::default();
        for (settled, holds, reserves) in [
            (0, 0, 0),
            (100, 5_000, 0),
            (-2_000, 0, 0),
            (1_000_000, 0, 0),
            (Cents::MAX, 0, 0),
            (400, 0, 0),
        ] {
            for freshness in [
                FreshnessStatus::Fresh,
                FreshnessStatus::Stale,
                FreshnessStatus::Degraded,
            ] {
                let (_, _, power) =
                    compute_spend_power(&inputs(settled, holds, reserves, freshness), &config);
                assert!(power >= 0);
                assert!(power <= settled.max(0));
            }
        }
    }

    #[test]
    fn test_safety_buffer_bps_wins_when_larger() {
        let config = SpendConfig {
            safety_buffer_bps: 100,
            ..SpendConfig::default()
        };
        let (safety, _, power) =
            compute_spend_power(&inputs(100_000, 0, 0, FreshnessStatus::Fresh), &config);
        assert_eq!(safety, 1_000);
        assert_eq!(power, 99_000);
    }

    #[test]
    fn test_report_field_naming() {
        let report = SpendPowerReport {
            spend_power_cents: 1,
            breakdown: SpendBreakdown {
                settled_cash_cents: None,
                confirmed_balance_cents: Some(10),
                active_holds_cents: 0,
                active_reserves_cents: 0,
                safety_buffer_cents: 0,
                degradation_buffer_cents: 0,
            },
            freshness_status: FreshnessStatus::Fresh,
            updated_at: None,
            updated_ago_seconds: Some(3),
            flags: vec![SpendFlag::StaleData],
            receipts_preview: vec![],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["breakdown"]["confirmed_balance_cents"], 10);
        assert!(json["breakdown"].get("settled_cash_cents").is_none());
        assert_eq!(json["updated_ago_seconds"], 3);
        assert!(json.get("updated_at").is_none());
        assert_eq!(json["flags"][0], "stale_data");
        assert_eq!(json["freshness_status"], "fresh");
    }
}
