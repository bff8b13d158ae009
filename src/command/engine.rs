//! Command Engine
//!
//! `preview` interprets text and prices it without writing anything.
//! `confirm` runs a structured action exactly once per
//! `(user_id, idempotency_key)`: the first caller creates the intent and
//! executes, later and concurrent callers get the recorded result.
//!
//! A confirm whose outcome is unknown (venue timeout, database error) leaves
//! the intent PENDING and releases its claim. The next confirm for the key
//! takes the claim over and re-runs; every effect is keyed on the intent, so
//! a re-run never applies twice. A claim that is never released goes stale
//! after `intent_claim_ttl_secs` and is taken over the same way.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::access::AccessControl;
use crate::config::CommandConfig;
use crate::core_types::{Cents, EntryId, HoldId, UserId};
use crate::error::{EngineError, EngineResult};
use crate::execution::size_order;
use crate::fee::calculate_fee_with_flat;
use crate::holds::{HoldKind, Holds};
use crate::ledger::{Ledger, PostEntryRequest, Posting};
use crate::providers::{CustodyVenue, OrderSide, PriceFeed, ProviderError, VenueOrder};
use crate::retry::{retry_async, with_timeout};
use crate::spend::SpendEngine;

use super::intent::{BeginOutcome, CommandIntent, IntentState, IntentStore, new_claim_token};
use super::parser::parse;
use super::types::{
    CommandAction, CommandFailure, CommandPreview, CommandResult, CommandStatus, ConfirmRequest,
};

pub const COMMAND_SOURCE: &str = "command";

/// Poll interval while waiting on another confirm
const CONFIRM_POLL_MS: u64 = 25;

/// What executing an action changed
#[derive(Debug, Default)]
struct Effects {
    entry_id: Option<EntryId>,
    hold_id: Option<HoldId>,
    amount_cents: Cents,
    fee_cents: Cents,
}

pub struct CommandEngine {
    intents: Arc<dyn IntentStore>,
    ledger: Arc<Ledger>,
    holds: Arc<Holds>,
    spend: Arc<SpendEngine>,
    access: Arc<AccessControl>,
    venue: Arc<dyn CustodyVenue>,
    prices: Arc<dyn PriceFeed>,
    config: CommandConfig,
}

impl CommandEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        intents: Arc<dyn IntentStore>,
        ledger: Arc<Ledger>,
        holds: Arc<Holds>,
        spend: Arc<SpendEngine>,
        access: Arc<AccessControl>,
        venue: Arc<dyn CustodyVenue>,
        prices: Arc<dyn PriceFeed>,
        config: CommandConfig,
    ) -> Self {
        Self {
            intents,
            ledger,
            holds,
            spend,
            access,
            venue,
            prices,
            config,
        }
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

    fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.intent_claim_ttl_secs.max(1))
    }

    pub fn estimate_fee(&self, action: &CommandAction) -> Cents {
        match action {
            CommandAction::Reserve { .. } => 0,
            _ => calculate_fee_with_flat(
                action.amount_cents(),
                self.config.fee_bps,
                self.config.flat_fee_cents,
            ),
        }
    }

    /// Parse and price a command. Reads spend power; writes nothing.
    pub async fn preview(&self, user_id: UserId, text: &str) -> EngineResult<CommandPreview> {
        let action = parse(text)?;
        let fee_cents = self.estimate_fee(&action);
        let amount_cents = action.amount_cents();
        let total_cents = amount_cents.saturating_add(fee_cents);
        let spendable = self.spend.compute_spendable_now(user_id).await?;
        let sufficient_funds =
            !action.consumes_spend_power() || total_cents <= spendable.spendable_cents;
        debug!(user_id, action = action.kind(), amount_cents, fee_cents, "Command previewed");
        Ok(CommandPreview {
            summary: action.to_string(),
            action,
            amount_cents,
            fee_cents,
            total_cents,
            spendable_cents: spendable.spendable_cents,
            sufficient_funds,
        })
    }

    /// Execute once per idempotency key and return the terminal result.
    /// A recorded result is returned even if the account was frozen since.
    pub async fn confirm(&self, user_id: UserId, req: ConfirmRequest) -> EngineResult<CommandResult> {
        let key = req.idempotency_key.trim();
        if key.is_empty() || key.len() > 200 {
            return Err(EngineError::Validation(
                "idempotency_key must be 1..=200 bytes".into(),
            ));
        }
        req.action.validate()?;

        if let Some(existing) = self.intents.get(user_id, key).await? {
            return self.replay(existing, &req.action).await;
        }

        self.access.ensure_not_frozen(user_id).await?;
        let intent = CommandIntent::pending(user_id, key, req.action);
        match self.intents.begin(&intent).await? {
            BeginOutcome::Created(intent) => self.run(intent, false).await,
            BeginOutcome::Existing(existing) => self.replay(existing, &intent.action).await,
        }
    }

    async fn replay(
        &self,
        existing: CommandIntent,
        action: &CommandAction,
    ) -> EngineResult<CommandResult> {
        if existing.action != *action {
            return Err(EngineError::Validation(format!(
                "idempotency_key {} was used for a different action",
                existing.idempotency_key
            )));
        }
        self.await_result(existing).await
    }

    /// Execute under the intent's claim. `resumed` is set when taking over
    /// from an earlier claim whose effects may already be applied.
    async fn run(&self, intent: CommandIntent, resumed: bool) -> EngineResult<CommandResult> {
        let user_id = intent.user_id;
        let claim_token = intent.claim_token.clone().ok_or_else(|| {
            EngineError::Internal(format!("intent {} run without a claim", intent.intent_id))
        })?;
        let outcome = self.execute_action(&intent, resumed).await;

        let result = match outcome {
            Ok(effects) => CommandResult {
                intent_id: intent.intent_id,
                user_id,
                idempotency_key: intent.idempotency_key.clone(),
                action: intent.action.clone(),
                status: CommandStatus::Succeeded,
                entry_id: effects.entry_id,
                hold_id: effects.hold_id,
                amount_cents: effects.amount_cents,
                fee_cents: effects.fee_cents,
                error: None,
                completed_at: Utc::now(),
            },
            Err(e) if outcome_unknown(&e) => {
                warn!(
                    user_id,
                    idempotency_key = %intent.idempotency_key,
                    action = intent.action.kind(),
                    error = %e,
                    "Command outcome unknown, releasing claim"
                );
                if let Err(release_err) = self.intents.release(intent.intent_id, &claim_token).await {
                    warn!(intent_id = %intent.intent_id, error = %release_err, "Claim release failed");
                }
                return Err(e);
            }
            Err(e) => {
                warn!(
                    user_id,
                    idempotency_key = %intent.idempotency_key,
                    action = intent.action.kind(),
                    error = %e,
                    "Command failed"
                );
                CommandResult {
                    intent_id: intent.intent_id,
                    user_id,
                    idempotency_key: intent.idempotency_key.clone(),
                    action: intent.action.clone(),
                    status: CommandStatus::Failed,
                    entry_id: None,
                    hold_id: None,
                    amount_cents: 0,
                    fee_cents: 0,
                    error: Some(CommandFailure::from(&e)),
                    completed_at: Utc::now(),
                }
            }
        };

        let state = match result.status {
            CommandStatus::Succeeded => IntentState::Succeeded,
            CommandStatus::Failed => IntentState::Failed,
        };
        let payload = serde_json::to_value(&result)?;
        if !self
            .intents
            .complete(intent.intent_id, &claim_token, state, &payload, result.completed_at)
            .await?
        {
            // Terminal or taken over: the stored row is authoritative
            let stored = self
                .intents
                .get(user_id, &intent.idempotency_key)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("intent {}", intent.intent_id)))?;
            if !stored.state.is_terminal() {
                return Err(EngineError::CommandInProgress(stored.idempotency_key));
            }
            return decode_result(&stored);
        }
        info!(
            user_id,
            idempotency_key = %intent.idempotency_key,
            intent_id = %intent.intent_id,
            state = %state,
            resumed,
            "Command completed"
        );
        Ok(result)
    }

    /// Return the recorded result, waiting up to `confirm_wait_ms` for an
    /// in-flight execution. A PENDING intent with no live claim is taken over
    /// and re-run.
    async fn await_result(&self, mut intent: CommandIntent) -> EngineResult<CommandResult> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.confirm_wait_ms);
        loop {
            if intent.state.is_terminal() {
                debug!(
                    user_id = intent.user_id,
                    idempotency_key = %intent.idempotency_key,
                    "Confirm replay - returning recorded result"
                );
                return decode_result(&intent);
            }
            let now = Utc::now();
            if intent.is_reclaimable(now - self.claim_ttl()) {
                // Re-running is new execution, so the freeze gate applies
                self.access.ensure_not_frozen(intent.user_id).await?;
                let token = new_claim_token();
                if let Some(claimed) = self
                    .intents
                    .reclaim(intent.intent_id, &token, now, now - self.claim_ttl())
                    .await?
                {
                    info!(
                        user_id = claimed.user_id,
                        idempotency_key = %claimed.idempotency_key,
                        intent_id = %claimed.intent_id,
                        "Taking over pending command"
                    );
                    return self.run(claimed, true).await;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::CommandInProgress(intent.idempotency_key));
            }
            tokio::time::sleep(Duration::from_millis(CONFIRM_POLL_MS)).await;
            intent = self
                .intents
                .get(intent.user_id, &intent.idempotency_key)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("intent {}", intent.intent_id)))?;
        }
    }

    /// Whether an earlier claim already applied this intent's ledger or hold
    /// effect
    async fn already_applied(&self, intent: &CommandIntent) -> EngineResult<bool> {
        match &intent.action {
            CommandAction::Reserve { purpose, .. } => {
                let reference = reserve_reference(&intent.idempotency_key, purpose);
                Ok(self
                    .holds
                    .active_for_user(intent.user_id)
                    .await?
                    .iter()
                    .any(|h| h.reference == reference))
            }
            _ => Ok(self
                .ledger
                .find_entry(COMMAND_SOURCE, &entry_external_id(intent))
                .await?
                .is_some()),
        }
    }

    async fn execute_action(&self, intent: &CommandIntent, resumed: bool) -> EngineResult<Effects> {
        let user_id = intent.user_id;
        let action = &intent.action;
        let fee_cents = self.estimate_fee(action);

        // Applied effects already count against spend power; re-applying is a no-op
        let gate = action.consumes_spend_power() && !(resumed && self.already_applied(intent).await?);
        if gate {
            let required = action.amount_cents().saturating_add(fee_cents);
            let spendable = self.spend.compute_spendable_now(user_id).await?;
            if required > spendable.spendable_cents {
                return Err(EngineError::InsufficientSpendPower {
                    required,
                    available: spendable.spendable_cents,
                });
            }
        }

        let external_id = entry_external_id(intent);
        match action {
            CommandAction::Send {
                recipient,
                amount_cents,
            } => {
                let house = self.ledger.house_accounts().await?;
                let cash = self.ledger.cash_account(user_id).await?;
                let mut postings = vec![
                    Posting::new(cash.account_id, -(amount_cents + fee_cents)),
                    Posting::new(house.clearing.account_id, *amount_cents),
                ];
                if fee_cents > 0 {
                    postings.push(Posting::new(house.fees.account_id, fee_cents));
                }
                let entry = self
                    .ledger
                    .post_entry(
                        PostEntryRequest::new(
                            COMMAND_SOURCE,
                            external_id,
                            format!("send to {recipient}"),
                            postings,
                        )
                        .cross_user(),
                    )
                    .await?;
                Ok(Effects {
                    entry_id: Some(entry.entry_id),
                    hold_id: None,
                    amount_cents: *amount_cents,
                    fee_cents,
                })
            }
            CommandAction::Buy {
                symbol,
                amount_cents,
            } => {
                self.trade(intent, symbol, OrderSide::Buy, *amount_cents, fee_cents, external_id)
                    .await
            }
            CommandAction::Sell {
                symbol,
                amount_cents,
            } => {
                self.trade(intent, symbol, OrderSide::Sell, *amount_cents, fee_cents, external_id)
                    .await
            }
            CommandAction::Reserve {
                purpose,
                amount_cents,
            } => {
                let ttl = (self.config.reserve_ttl_hours > 0)
                    .then(|| chrono::Duration::hours(self.config.reserve_ttl_hours));
                let hold = self
                    .holds
                    .place_hold(
                        user_id,
                        HoldKind::Reserve,
                        *amount_cents,
                        &reserve_reference(&intent.idempotency_key, purpose),
                        ttl,
                    )
                    .await?;
                Ok(Effects {
                    entry_id: None,
                    hold_id: Some(hold.hold_id),
                    amount_cents: hold.amount_cents,
                    fee_cents: 0,
                })
            }
        }
    }

    async fn trade(
        &self,
        intent: &CommandIntent,
        symbol: &str,
        side: OrderSide,
        amount_cents: Cents,
        fee_cents: Cents,
        external_id: String,
    ) -> EngineResult<Effects> {
        let user_id = intent.user_id;
        let price = self.call_venue("price", || self.prices.price(symbol)).await?;
        let quantity = size_order(amount_cents, price.price_cents);
        if quantity.is_zero() {
            return Err(EngineError::Validation(format!(
                "amount {amount_cents} is below one unit step of {symbol}"
            )));
        }
        let order = VenueOrder {
            client_order_id: format!("cmd-{user_id}-{}", intent.idempotency_key),
            user_id,
            symbol: symbol.to_string(),
            side,
            quantity,
        };
        let fill = self
            .call_venue("venue order", || self.venue.place_order(&order))
            .await?;
        let gross = fill.gross_cents;
        if gross <= 0 {
            return Err(EngineError::Provider(format!("{symbol} order filled nothing")));
        }

        let house = self.ledger.house_accounts().await?;
        let cash = self.ledger.cash_account(user_id).await?;
        let custody = self.ledger.custody_account(user_id).await?;
        let fee = match side {
            OrderSide::Buy => fee_cents,
            OrderSide::Sell => fee_cents.min(gross),
        };
        let mut postings = match side {
            OrderSide::Buy => vec![
                Posting::new(cash.account_id, -(gross + fee)),
                Posting::new(custody.account_id, gross),
            ],
            OrderSide::Sell => vec![
                Posting::new(custody.account_id, -gross),
                Posting::new(cash.account_id, gross - fee),
            ],
        };
        if fee > 0 {
            postings.push(Posting::new(house.fees.account_id, fee));
        }
        postings.retain(|p| p.amount_cents != 0);

        let entry = self
            .ledger
            .post_entry(
                PostEntryRequest::new(
                    COMMAND_SOURCE,
                    external_id,
                    format!("{} {} {}", intent.action.kind(), fill.quantity, fill.symbol),
                    postings,
                )
                .cross_user(),
            )
            .await?;
        Ok(Effects {
            entry_id: Some(entry.entry_id),
            hold_id: None,
            amount_cents: gross,
            fee_cents: fee,
        })
    }
}

/// Errors after which the action may or may not have taken effect
fn outcome_unknown(e: &EngineError) -> bool {
    matches!(e, EngineError::ProviderTimeout(_) | EngineError::Database(_))
}

fn entry_external_id(intent: &CommandIntent) -> String {
    format!("{}:{}", intent.user_id, intent.idempotency_key)
}

fn reserve_reference(idempotency_key: &str, purpose: &str) -> String {
    format!("{COMMAND_SOURCE}:{idempotency_key}:{purpose}")
}

fn decode_result(intent: &CommandIntent) -> EngineResult<CommandResult> {
    let value = intent.result.clone().ok_or_else(|| {
        EngineError::Internal(format!("terminal intent {} has no result", intent.intent_id))
    })?;
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{FreezeRequest, MemoryAccessStore};
    use crate::command::MemoryIntentStore;
    use crate::config::{SettlementModel, SpendConfig};
    use crate::execution::MemoryExecutionStore;
    use crate::holds::MemoryHoldStore;
    use crate::ledger::MemoryLedgerStore;
    use crate::liquidation::MemoryLiquidationStore;
    use crate::providers::PaperVenue;
    use rust_decimal::Decimal;

    struct Fixture {
        ledger: Arc<Ledger>,
        holds: Arc<Holds>,
        access: Arc<AccessControl>,
        venue: Arc<PaperVenue>,
        intents: Arc<MemoryIntentStore>,
        engine: Arc<CommandEngine>,
    }

    fn fixture(config: CommandConfig) -> Fixture {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new()), "USD"));
        let holds = Arc::new(Holds::new(Arc::new(MemoryHoldStore::new())));
        let access = Arc::new(AccessControl::new(Arc::new(MemoryAccessStore::new())));
        let venue = Arc::new(PaperVenue::new());
        venue.set_price("BTC", Decimal::from(5_000_000));
        let spend = Arc::new(SpendEngine::new(
            ledger.clone(),
            holds.clone(),
            access.clone(),
            venue.clone(),
            venue.clone(),
            Arc::new(MemoryExecutionStore::new()),
            Arc::new(MemoryLiquidationStore::new()),
            SpendConfig::default(),
            SettlementModel::Fiat,
        ));
        let intents = Arc::new(MemoryIntentStore::new());
        let engine = Arc::new(CommandEngine::new(
            intents.clone(),
            ledger.clone(),
            holds.clone(),
            spend,
            access.clone(),
            venue.clone(),
            venue.clone(),
            config,
        ));
        Fixture {
            ledger,
            holds,
            access,
            venue,
            intents,
            engine,
        }
    }

    async fn freeze(access: &AccessControl, user_id: UserId) {
        access
            .freeze_user(FreezeRequest {
                user_id,
                frozen: true,
                reason: None,
            })
            .await
            .unwrap();
    }

    fn buy_btc(amount_cents: Cents) -> CommandAction {
        CommandAction::Buy {
            symbol: "BTC".into(),
            amount_cents,
        }
    }

    async fn fund(ledger: &Ledger, user_id: UserId, amount: Cents) {
        let cash = ledger.cash_account(user_id).await.unwrap();
        let house = ledger.house_accounts().await.unwrap();
        ledger
            .post_entry(
                PostEntryRequest::new(
                    "deposit",
                    format!("dep-{user_id}"),
                    "deposit",
                    vec![
                        Posting::new(house.clearing.account_id, -amount),
                        Posting::new(cash.account_id, amount),
                    ],
                )
                .cross_user(),
            )
            .await
            .unwrap();
    }

    fn confirm_req(key: &str, action: CommandAction) -> ConfirmRequest {
        ConfirmRequest {
            idempotency_key: key.into(),
            action,
        }
    }

    fn send(amount_cents: Cents) -> CommandAction {
        CommandAction::Send {
            recipient: "alice".into(),
            amount_cents,
        }
    }

    #[tokio::test]
    async fn test_preview_has_no_side_effects() {
        let f = fixture(CommandConfig {
            fee_bps: 100,
            flat_fee_cents: 25,
            ..CommandConfig::default()
        });
        fund(&f.ledger, 1, 10_000).await;
        let preview = f.engine.preview(1, "send $20 to alice").await.unwrap();
        assert_eq!(preview.amount_cents, 2_000);
        assert_eq!(preview.fee_cents, 45);
        assert_eq!(preview.total_cents, 2_045);
        assert!(preview.sufficient_funds);
        assert_eq!(preview.summary, "Send $20.00 to alice");

        let cash = f.ledger.cash_account(1).await.unwrap();
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 10_000);

        assert!(matches!(
            f.engine.preview(1, "teleport $5 to mars").await,
            Err(EngineError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_twice_returns_identical_result() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 10_000).await;

        let first = f.engine.confirm(1, confirm_req("k1", send(2_000))).await.unwrap();
        let second = f.engine.confirm(1, confirm_req("k1", send(2_000))).await.unwrap();
        assert_eq!(first.status, CommandStatus::Succeeded);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );

        let cash = f.ledger.cash_account(1).await.unwrap();
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 8_000);
    }

    #[tokio::test]
    async fn test_concurrent_confirms_execute_once() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 10_000).await;

        let a = {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.confirm(1, confirm_req("k1", send(1_500))).await })
        };
        let b = {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.confirm(1, confirm_req("k1", send(1_500))).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a, b);

        let cash = f.ledger.cash_account(1).await.unwrap();
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 8_500);
    }

    #[tokio::test]
    async fn test_business_failure_is_recorded() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 1_000).await;

        let first = f.engine.confirm(1, confirm_req("big", send(5_000))).await.unwrap();
        assert_eq!(first.status, CommandStatus::Failed);
        assert_eq!(
            first.error.as_ref().map(|e| e.code.as_str()),
            Some("INSUFFICIENT_SPEND_POWER")
        );

        let again = f.engine.confirm(1, confirm_req("big", send(5_000))).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_key_reuse_with_other_action_rejected() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 10_000).await;
        f.engine.confirm(1, confirm_req("k1", send(100))).await.unwrap();
        let err = f
            .engine
            .confirm(1, confirm_req("k1", send(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_frozen_user_cannot_confirm() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 10_000).await;
        freeze(&f.access, 1).await;
        let err = f
            .engine
            .confirm(1, confirm_req("k1", send(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FrozenAccount { .. }));
    }

    #[tokio::test]
    async fn test_reserve_places_hold() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 10_000).await;
        let action = CommandAction::Reserve {
            purpose: "rent".into(),
            amount_cents: 3_000,
        };
        let result = f.engine.confirm(1, confirm_req("r1", action)).await.unwrap();
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert!(result.hold_id.is_some());
        assert_eq!(f.holds.active_totals(1).await.unwrap().reserves_cents, 3_000);
    }

    #[tokio::test]
    async fn test_buy_then_sell() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 100_000).await;
        let buy = CommandAction::Buy {
            symbol: "BTC".into(),
            amount_cents: 10_000,
        };
        let result = f.engine.confirm(1, confirm_req("b1", buy)).await.unwrap();
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert_eq!(f.venue.quantity_of(1, "BTC"), Decimal::new(2, 3));

        let sell = CommandAction::Sell {
            symbol: "BTC".into(),
            amount_cents: 5_000,
        };
        let result = f.engine.confirm(1, confirm_req("s1", sell)).await.unwrap();
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert_eq!(result.amount_cents, 5_000);
        assert_eq!(f.venue.quantity_of(1, "BTC"), Decimal::new(1, 3));

        let cash = f.ledger.cash_account(1).await.unwrap();
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 95_000);
    }

    #[tokio::test]
    async fn test_replay_after_freeze_returns_recorded_result() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 10_000).await;
        let first = f.engine.confirm(1, confirm_req("k1", send(1_000))).await.unwrap();
        assert_eq!(first.status, CommandStatus::Succeeded);

        freeze(&f.access, 1).await;
        let replay = f.engine.confirm(1, confirm_req("k1", send(1_000))).await.unwrap();
        assert_eq!(first, replay);

        // New keys are still gated
        assert!(matches!(
            f.engine.confirm(1, confirm_req("k2", send(1_000))).await,
            Err(EngineError::FrozenAccount { .. })
        ));
    }

    #[tokio::test]
    async fn test_fresh_pending_intent_reports_in_progress() {
        let f = fixture(CommandConfig {
            confirm_wait_ms: 60,
            ..CommandConfig::default()
        });
        fund(&f.ledger, 1, 10_000).await;
        let held = CommandIntent::pending(1, "k1", send(1_000));
        f.intents.begin(&held).await.unwrap();

        let err = f
            .engine
            .confirm(1, confirm_req("k1", send(1_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CommandInProgress(_)));
        let cash = f.ledger.cash_account(1).await.unwrap();
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 10_000);
    }

    #[tokio::test]
    async fn test_stale_pending_intent_is_taken_over() {
        let f = fixture(CommandConfig {
            intent_claim_ttl_secs: 60,
            ..CommandConfig::default()
        });
        fund(&f.ledger, 1, 10_000).await;
        // A confirm that died mid-flight two minutes ago
        let mut abandoned = CommandIntent::pending(1, "k1", send(1_000));
        abandoned.claimed_at = Some(Utc::now() - chrono::Duration::minutes(2));
        f.intents.begin(&abandoned).await.unwrap();

        let result = f.engine.confirm(1, confirm_req("k1", send(1_000))).await.unwrap();
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert_eq!(result.intent_id, abandoned.intent_id);

        let stored = f.intents.get(1, "k1").await.unwrap().unwrap();
        assert_eq!(stored.state, IntentState::Succeeded);
        assert_ne!(stored.claim_token, abandoned.claim_token);

        // The displaced claim can no longer record anything
        let late = serde_json::json!({});
        assert!(
            !f.intents
                .complete(
                    abandoned.intent_id,
                    abandoned.claim_token.as_deref().unwrap(),
                    IntentState::Failed,
                    &late,
                    Utc::now()
                )
                .await
                .unwrap()
        );
        let cash = f.ledger.cash_account(1).await.unwrap();
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 9_000);
    }

    #[tokio::test]
    async fn test_takeover_does_not_reapply_posted_send() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 1_500).await;
        let mut abandoned = CommandIntent::pending(1, "k1", send(1_000));
        abandoned.claimed_at = Some(Utc::now() - chrono::Duration::minutes(5));
        f.intents.begin(&abandoned).await.unwrap();

        // The first claim posted its entry before dying
        let house = f.ledger.house_accounts().await.unwrap();
        let cash = f.ledger.cash_account(1).await.unwrap();
        f.ledger
            .post_entry(
                PostEntryRequest::new(
                    COMMAND_SOURCE,
                    entry_external_id(&abandoned),
                    "send to alice",
                    vec![
                        Posting::new(cash.account_id, -1_000),
                        Posting::new(house.clearing.account_id, 1_000),
                    ],
                )
                .cross_user(),
            )
            .await
            .unwrap();

        // Only 500 spendable now, yet the re-run completes instead of failing
        let result = f.engine.confirm(1, confirm_req("k1", send(1_000))).await.unwrap();
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_venue_timeout_is_not_recorded_as_failure() {
        let f = fixture(CommandConfig {
            venue_timeout_ms: 20,
            venue_retry_attempts: 2,
            venue_retry_backoff_ms: 1,
            ..CommandConfig::default()
        });
        fund(&f.ledger, 1, 100_000).await;
        f.venue.set_latency(Duration::from_millis(200));

        let err = f
            .engine
            .confirm(1, confirm_req("b1", buy_btc(10_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProviderTimeout(_)));
        let stored = f.intents.get(1, "b1").await.unwrap().unwrap();
        assert_eq!(stored.state, IntentState::Pending);
        assert!(stored.claimed_at.is_none());
        assert_eq!(f.venue.executed_orders(), 0);

        // Venue recovers: the same key now executes exactly once
        f.venue.set_latency(Duration::ZERO);
        let result = f.engine.confirm(1, confirm_req("b1", buy_btc(10_000))).await.unwrap();
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert_eq!(f.venue.quantity_of(1, "BTC"), Decimal::new(2, 3));
        let again = f.engine.confirm(1, confirm_req("b1", buy_btc(10_000))).await.unwrap();
        assert_eq!(result, again);
        assert_eq!(f.venue.executed_orders(), 1);
    }

    #[tokio::test]
    async fn test_frozen_account_cannot_take_over() {
        let f = fixture(CommandConfig::default());
        fund(&f.ledger, 1, 10_000).await;
        let mut abandoned = CommandIntent::pending(1, "k1", send(1_000));
        abandoned.claimed_at = None;
        f.intents.begin(&abandoned).await.unwrap();
        freeze(&f.access, 1).await;

        assert!(matches!(
            f.engine.confirm(1, confirm_req("k1", send(1_000))).await,
            Err(EngineError::FrozenAccount { .. })
        ));
        let stored = f.intents.get(1, "k1").await.unwrap().unwrap();
        assert_eq!(stored.state, IntentState::Pending);
    }
}
