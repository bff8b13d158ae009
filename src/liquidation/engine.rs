//! Liquidation Engine
//!
//! Converts holdings to cash when a user's obligations exceed their spend
//! power. Each fill is posted as its own journal entry keyed by the venue
//! order id `{task_id}-{holding_id}`, so a retried or taken-over task never
//! books the same sale twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::LiquidationConfig;
use crate::core_types::{Cents, UserId};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{Ledger, PostEntryRequest, Posting};
use crate::providers::{CustodyVenue, OrderSide, PriceFeed, ProviderError, VenueOrder};
use crate::retry::{retry_async, with_timeout};
use crate::spend::SpendEngine;

use super::state::LiquidationState;
use super::store::{InsertResult, LiquidationStore};
use super::types::{EnqueueOutcome, LiquidationTask, ProcessSummary};

pub const LIQUIDATION_SOURCE: &str = "liquidation";

/// Decimal places used when sizing a partial sale
const QUANTITY_DP: u32 = 8;

/// `max(0, obligations - spend_power)`
pub fn shortfall_cents(obligations_cents: Cents, spend_power_cents: Cents) -> Cents {
    obligations_cents.saturating_sub(spend_power_cents).max(0)
}

/// One full sweep: requeue, enqueue, process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepSummary {
    pub requeued: usize,
    pub enqueued: usize,
    pub processed: ProcessSummary,
}

pub struct LiquidationEngine {
    store: Arc<dyn LiquidationStore>,
    ledger: Arc<Ledger>,
    spend: Arc<SpendEngine>,
    venue: Arc<dyn CustodyVenue>,
    prices: Arc<dyn PriceFeed>,
    config: LiquidationConfig,
    instance_id: String,
}

impl LiquidationEngine {
    pub fn new(
        store: Arc<dyn LiquidationStore>,
        ledger: Arc<Ledger>,
        spend: Arc<SpendEngine>,
        venue: Arc<dyn CustodyVenue>,
        prices: Arc<dyn PriceFeed>,
        config: LiquidationConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            spend,
            venue,
            prices,
            config,
            instance_id: format!("liq-{}", Ulid::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn LiquidationStore> {
        &self.store
    }

    /// Outstanding obligations: bridge advances not yet repaid
    pub async fn pending_obligations(&self, user_id: UserId) -> EngineResult<Cents> {
        self.ledger.bridge_outstanding(user_id).await
    }

    pub async fn current_shortfall(&self, user_id: UserId) -> EngineResult<Cents> {
        let obligations = self.pending_obligations(user_id).await?;
        let snapshot = self.spend.snapshot(user_id).await?;
        Ok(shortfall_cents(obligations, snapshot.spend_power_cents))
    }

    /// Create a QUEUED task when obligations exceed spend power and the user
    /// has no task in flight
    pub async fn enqueue_if_needed(&self, user_id: UserId) -> EngineResult<EnqueueOutcome> {
        let shortfall = self.current_shortfall(user_id).await?;
        if shortfall <= 0 {
            return Ok(EnqueueOutcome::NotNeeded);
        }

        if let Some(active) = self.store.active_for_user(user_id).await? {
            return Ok(EnqueueOutcome::Existing(active));
        }
        let latest = self.store.latest_for_user(user_id).await?;
        if let Some(latest) = latest.filter(|t| t.state == LiquidationState::Failed) {
            if latest.attempts >= self.config.max_attempts {
                warn!(
                    user_id,
                    task_id = %latest.task_id,
                    attempts = latest.attempts,
                    "Liquidation attempts exhausted - operator action required"
                );
                return Ok(EnqueueOutcome::Exhausted(latest));
            }
            // Awaiting requeue
            return Ok(EnqueueOutcome::Existing(latest));
        }

        let task = LiquidationTask::queued(user_id, shortfall, Utc::now());
        match self.store.insert_if_idle(&task).await? {
            InsertResult::Created(task) => {
                info!(
                    user_id,
                    task_id = %task.task_id,
                    shortfall_cents = shortfall,
                    "Liquidation task queued"
                );
                Ok(EnqueueOutcome::Created(task))
            }
            InsertResult::Existing(task) => Ok(EnqueueOutcome::Existing(task)),
        }
    }

    /// Claim and run up to `batch_limit` tasks
    pub async fn process_queued(&self, batch_limit: usize) -> EngineResult<ProcessSummary> {
        let claim_token = format!("{}:{}", self.instance_id, Ulid::new());
        let claim_ttl = chrono::Duration::seconds(self.config.claim_ttl_secs);
        let tasks = self
            .store
            .claim_batch(batch_limit, &claim_token, Utc::now(), claim_ttl)
            .await?;

        let mut summary = ProcessSummary {
            claimed: tasks.len(),
            ..ProcessSummary::default()
        };
        if tasks.is_empty() {
            debug!("No liquidation tasks to process");
            return Ok(summary);
        }

        for task in tasks {
            match self.execute_task(&task).await {
                Ok((liquidated, residual)) => {
                    if self
                        .store
                        .complete(task.task_id, &claim_token, liquidated, residual)
                        .await?
                    {
                        summary.done += 1;
                        if residual > 0 {
                            summary.residual += 1;
                            warn!(
                                user_id = task.user_id,
                                task_id = %task.task_id,
                                liquidated_cents = liquidated,
                                residual_shortfall_cents = residual,
                                "Holdings exhausted before shortfall was covered"
                            );
                        } else {
                            info!(
                                user_id = task.user_id,
                                task_id = %task.task_id,
                                liquidated_cents = liquidated,
                                "Liquidation task done"
                            );
                        }
                    } else {
                        warn!(task_id = %task.task_id, "Claim lost before completion");
                    }
                }
                Err(e) => {
                    error!(
                        user_id = task.user_id,
                        task_id = %task.task_id,
                        attempt = task.attempts + 1,
                        error = %e,
                        "Liquidation task failed"
                    );
                    if self
                        .store
                        .fail(task.task_id, &claim_token, &e.to_string())
                        .await?
                    {
                        summary.failed += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// FAILED -> QUEUED for tasks with attempts left
    pub async fn requeue_failed(&self) -> EngineResult<usize> {
        let requeued = self.store.requeue_failed(self.config.max_attempts).await?;
        if requeued > 0 {
            info!(requeued, "Requeued failed liquidation tasks");
        }
        Ok(requeued)
    }

    pub async fn sweep(&self) -> EngineResult<SweepSummary> {
        let requeued = self.requeue_failed().await?;
        let mut enqueued = 0;
        for user_id in self.ledger.user_ids().await? {
            match self.enqueue_if_needed(user_id).await {
                Ok(EnqueueOutcome::Created(_)) => enqueued += 1,
                Ok(_) => {}
                Err(e) => error!(user_id, error = %e, "Shortfall check failed"),
            }
        }
        let processed = self.process_queued(self.config.batch_size).await?;
        Ok(SweepSummary {
            requeued,
            enqueued,
            processed,
        })
    }

    /// Sell holdings in policy order until the live shortfall is covered.
    /// Returns `(liquidated_cents, residual_shortfall_cents)`.
    async fn execute_task(&self, task: &LiquidationTask) -> EngineResult<(Cents, Cents)> {
        let user_id = task.user_id;
        // Fills already booked by an earlier attempt show up in spend power
        let target = task.shortfall_cents.min(self.current_shortfall(user_id).await?);
        if target <= 0 {
            return Ok((0, 0));
        }

        let mut holdings = self
            .call_venue("venue holdings", || self.venue.holdings(user_id))
            .await?;
        self.config.ordering.sort(&mut holdings);

        let cash = self.ledger.cash_account(user_id).await?;
        let custody = self.ledger.custody_account(user_id).await?;

        let mut remaining = target;
        let mut liquidated: Cents = 0;
        for holding in holdings {
            if remaining <= 0 {
                break;
            }
            if holding.quantity <= Decimal::ZERO {
                continue;
            }

            let quote = match self
                .call_venue("price", || self.prices.price(&holding.symbol))
                .await
            {
                Ok(quote) => quote,
                Err(ProviderError::Timeout(op)) => return Err(EngineError::ProviderTimeout(op)),
                Err(e) => {
                    warn!(user_id, symbol = %holding.symbol, error = %e, "Skipping unpriced holding");
                    continue;
                }
            };
            if quote.price_cents <= Decimal::ZERO {
                continue;
            }

            let value = holding.market_value_cents(quote.price_cents);
            let quantity = if value <= remaining {
                holding.quantity
            } else {
                (Decimal::from(remaining) / quote.price_cents)
                    .round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::AwayFromZero)
                    .min(holding.quantity)
            };

            let order = VenueOrder {
                client_order_id: format!("{}-{}", task.task_id, holding.holding_id),
                user_id,
                symbol: holding.symbol.clone(),
                side: OrderSide::Sell,
                quantity,
            };
            let fill = self
                .call_venue("sell order", || self.venue.place_order(&order))
                .await?;

            if fill.gross_cents > 0 {
                self.ledger
                    .post_entry(PostEntryRequest::new(
                        LIQUIDATION_SOURCE,
                        order.client_order_id.clone(),
                        format!("liquidate {} {}", fill.quantity, fill.symbol),
                        vec![
                            Posting::new(custody.account_id, -fill.gross_cents),
                            Posting::new(cash.account_id, fill.gross_cents),
                        ],
                    ))
                    .await?;
            }
            debug!(
                user_id,
                task_id = %task.task_id,
                client_order_id = %order.client_order_id,
                gross_cents = fill.gross_cents,
                "Holding sold"
            );
            liquidated += fill.gross_cents;
            remaining -= fill.gross_cents;
        }

        Ok((liquidated, remaining.max(0)))
    }

    /// Bounded, retried venue call
    async fn call_venue<T, F, Fut>(&self, op: &str, f: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let timeout = Duration::from_millis(self.config.venue_timeout_ms);
        retry_async(
            |_| with_timeout(op, timeout, f()),
            self.config.venue_retry_attempts.max(1),
            Duration::from_millis(self.config.venue_retry_backoff_ms),
        )
        .await
    }
}
