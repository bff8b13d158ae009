//! Execution / Receipts Service
//!
//! Turns a quote into ledger effects and a receipt. Checks run in a fixed
//! order: freeze, caller authority, replay, quote validity, step-up, funds.
//! Every side effect is keyed by `(user_id, idempotency_key)`, so a replayed
//! or concurrent execute never moves money twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, warn};

use crate::access::{AccessControl, AgentToken, Caller, FreezeRequest, RevokeAgentRequest, UserFlags};
use crate::config::ExecutionConfig;
use crate::core_types::{Cents, QuoteId, ReceiptId, UserId};
use crate::error::{EngineError, EngineResult};
use crate::fee::calculate_fee;
use crate::ledger::{JournalEntry, Ledger, PostEntryRequest, Posting};
use crate::providers::{CustodyVenue, Fill, OrderSide, PriceFeed, VenueOrder};
use crate::retry::with_timeout;
use crate::spend::SpendEngine;

use super::step_up;
use super::store::{QuoteStore, ReceiptInsert, ReceiptStore};
use super::types::{CreateQuoteRequest, ExecuteRequest, Quote, QuoteAction, Receipt};

pub const EXECUTION_SOURCE: &str = "execution";

const QUANTITY_DP: u32 = 8;

/// Units purchasable for `amount_cents` at `unit_price_cents`, rounded down
/// to the venue step. Zero when the price is not positive.
pub fn size_order(amount_cents: Cents, unit_price_cents: Decimal) -> Decimal {
    if unit_price_cents <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (Decimal::from(amount_cents) / unit_price_cents)
        .round_dp_with_strategy(QUANTITY_DP, RoundingStrategy::ToZero)
}

pub struct Executor {
    quotes: Arc<dyn QuoteStore>,
    receipts: Arc<dyn ReceiptStore>,
    ledger: Arc<Ledger>,
    spend: Arc<SpendEngine>,
    access: Arc<AccessControl>,
    venue: Arc<dyn CustodyVenue>,
    prices: Arc<dyn PriceFeed>,
    config: ExecutionConfig,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        quotes: Arc<dyn QuoteStore>,
        receipts: Arc<dyn ReceiptStore>,
        ledger: Arc<Ledger>,
        spend: Arc<SpendEngine>,
        access: Arc<AccessControl>,
        venue: Arc<dyn CustodyVenue>,
        prices: Arc<dyn PriceFeed>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            quotes,
            receipts,
            ledger,
            spend,
            access,
            venue,
            prices,
            config,
        }
    }

    fn venue_timeout(&self) -> Duration {
        Duration::from_millis(self.config.venue_timeout_ms)
    }

    /// Price an action. Trades are priced from the feed at quote time.
    pub async fn create_quote(&self, caller: Caller, req: CreateQuoteRequest) -> EngineResult<Quote> {
        self.access.ensure_not_frozen(caller.user_id).await?;
        self.access.authorize(&caller).await?;

        if req.amount_cents <= 0 {
            return Err(EngineError::Validation(format!(
                "amount must be positive, got {}",
                req.amount_cents
            )));
        }
        let unit_price_cents = match &req.action {
            QuoteAction::Transfer { recipient } => {
                if recipient.trim().is_empty() {
                    return Err(EngineError::Validation("recipient is empty".into()));
                }
                None
            }
            QuoteAction::Trade { symbol, .. } => {
                if symbol.trim().is_empty() {
                    return Err(EngineError::Validation("symbol is empty".into()));
                }
                let quote =
                    with_timeout("price", self.venue_timeout(), self.prices.price(symbol)).await?;
                if quote.price_cents <= Decimal::ZERO {
                    return Err(EngineError::Provider(format!("no usable price for {symbol}")));
                }
                Some(quote.price_cents)
            }
        };

        let now = Utc::now();
        let quote = Quote {
            quote_id: QuoteId::new(),
            user_id: caller.user_id,
            agent_id: caller.agent_id,
            action: req.action,
            amount_cents: req.amount_cents,
            fee_cents: calculate_fee(req.amount_cents, self.config.fee_bps),
            unit_price_cents,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.config.quote_ttl_secs),
        };
        self.quotes.insert_quote(&quote).await?;
        info!(
            user_id = quote.user_id,
            quote_id = %quote.quote_id,
            amount_cents = quote.amount_cents,
            fee_cents = quote.fee_cents,
            "Quote created"
        );
        Ok(quote)
    }

    /// Execute a quote, or return the receipt already issued for the key
    pub async fn execute(&self, caller: Caller, req: ExecuteRequest) -> EngineResult<Receipt> {
        let user_id = caller.user_id;
        // Frozen accounts fail before anything about the request is looked at
        self.access.ensure_not_frozen(user_id).await?;
        self.access.authorize(&caller).await?;

        let key = req.idempotency_key.trim();
        if key.is_empty() || key.len() > 200 {
            return Err(EngineError::Validation(
                "idempotency_key must be 1..=200 bytes".into(),
            ));
        }
        check_signed_payload(&req, key)?;

        if let Some(existing) = self.receipts.find_receipt(user_id, key).await? {
            if existing.quote_id != req.quote_id {
                return Err(EngineError::Validation(format!(
                    "idempotency_key {key} was used for quote {}",
                    existing.quote_id
                )));
            }
            info!(user_id, idempotency_key = key, "Execute replay - returning receipt");
            return Ok(existing);
        }

        let quote = self
            .quotes
            .get_quote(req.quote_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("quote {}", req.quote_id)))?;
        self.check_quote_authority(&caller, &quote).await?;
        if quote.is_expired_at(Utc::now()) {
            return Err(EngineError::QuoteExpired);
        }

        if quote.total_cents() >= self.config.step_up_threshold_cents {
            let verified = req.step_up_token.as_deref().is_some_and(|token| {
                step_up::verify(&self.config.step_up_secret, user_id, quote.quote_id, token)
            });
            if !verified {
                warn!(
                    user_id,
                    quote_id = %quote.quote_id,
                    total_cents = quote.total_cents(),
                    "Step-up required"
                );
                return Err(EngineError::StepUpRequired);
            }
        }

        if quote.action.is_debit() {
            let spendable = self.spend.compute_spendable_now(user_id).await?;
            if quote.total_cents() > spendable.spendable_cents {
                return Err(EngineError::InsufficientSpendPower {
                    required: quote.total_cents(),
                    available: spendable.spendable_cents,
                });
            }
        }

        let (entry, amount_cents, fee_cents, quantity) = self.apply(&quote, key).await?;

        let receipt = Receipt {
            receipt_id: ReceiptId::new(),
            user_id,
            agent_id: caller.agent_id,
            quote_id: quote.quote_id,
            idempotency_key: key.to_string(),
            action: quote.action.clone(),
            amount_cents,
            fee_cents,
            quantity,
            entry_id: entry.entry_id,
            created_at: Utc::now(),
        };
        match self.receipts.insert_receipt(&receipt).await? {
            ReceiptInsert::Created(receipt) => {
                info!(
                    user_id,
                    idempotency_key = key,
                    receipt_id = %receipt.receipt_id,
                    entry_id = %receipt.entry_id,
                    amount_cents,
                    fee_cents,
                    "Quote executed"
                );
                Ok(receipt)
            }
            ReceiptInsert::Existing(receipt) => {
                info!(user_id, idempotency_key = key, "Concurrent execute won - returning its receipt");
                Ok(receipt)
            }
        }
    }

    /// The quote must belong to the caller's user. A quote created by an
    /// agent stays usable only while that agent is active.
    async fn check_quote_authority(&self, caller: &Caller, quote: &Quote) -> EngineResult<()> {
        if quote.user_id != caller.user_id {
            return Err(EngineError::Unauthorized(format!(
                "quote {} belongs to another user",
                quote.quote_id
            )));
        }
        if let Some(bound) = quote.agent_id {
            if caller.agent_id.is_some_and(|agent| agent != bound) {
                return Err(EngineError::Unauthorized(format!(
                    "quote {} is bound to another agent",
                    quote.quote_id
                )));
            }
            self.access
                .authorize(&Caller::agent(quote.user_id, bound))
                .await?;
        }
        Ok(())
    }

    /// Move the money. Returns the entry, cash amount, fee and filled quantity.
    async fn apply(
        &self,
        quote: &Quote,
        key: &str,
    ) -> EngineResult<(JournalEntry, Cents, Cents, Option<Decimal>)> {
        let user_id = quote.user_id;
        let house = self.ledger.house_accounts().await?;
        let cash = self.ledger.cash_account(user_id).await?;
        let external_id = format!("{user_id}:{key}");

        let (postings, amount, fee, quantity, memo) = match &quote.action {
            QuoteAction::Transfer { recipient } => {
                let amount = quote.amount_cents;
                let fee = quote.fee_cents;
                let mut postings = vec![
                    Posting::new(cash.account_id, -(amount + fee)),
                    Posting::new(house.clearing.account_id, amount),
                ];
                if fee > 0 {
                    postings.push(Posting::new(house.fees.account_id, fee));
                }
                (postings, amount, fee, None, format!("transfer to {recipient}"))
            }
            QuoteAction::Trade { symbol, side } => {
                let custody = self.ledger.custody_account(user_id).await?;
                let fill = self.place_trade(quote, symbol, *side, key).await?;
                let gross = fill.gross_cents;
                let mut postings = match side {
                    OrderSide::Buy => vec![
                        Posting::new(cash.account_id, -(gross + quote.fee_cents)),
                        Posting::new(custody.account_id, gross),
                    ],
                    OrderSide::Sell => vec![
                        Posting::new(custody.account_id, -gross),
                        Posting::new(cash.account_id, gross - quote.fee_cents.min(gross)),
                    ],
                };
                let fee = match side {
                    OrderSide::Buy => quote.fee_cents,
                    OrderSide::Sell => quote.fee_cents.min(gross),
                };
                if fee > 0 {
                    postings.push(Posting::new(house.fees.account_id, fee));
                }
                let verb = match side {
                    OrderSide::Buy => "buy",
                    OrderSide::Sell => "sell",
                };
                (
                    postings,
                    gross,
                    fee,
                    Some(fill.quantity),
                    format!("{verb} {} {}", fill.quantity, fill.symbol),
                )
            }
        };

        if amount <= 0 {
            return Err(EngineError::Provider(format!(
                "execution of quote {} filled nothing",
                quote.quote_id
            )));
        }
        // Drop zero legs (a sell whose fee ate the whole fill)
        let postings: Vec<Posting> = postings.into_iter().filter(|p| p.amount_cents != 0).collect();

        let entry = self
            .ledger
            .post_entry(
                PostEntryRequest::new(EXECUTION_SOURCE, external_id, memo, postings).cross_user(),
            )
            .await?;
        Ok((entry, amount, fee, quantity))
    }

    async fn place_trade(
        &self,
        quote: &Quote,
        symbol: &str,
        side: OrderSide,
        key: &str,
    ) -> EngineResult<Fill> {
        let price = quote.unit_price_cents.ok_or_else(|| {
            EngineError::Internal(format!("trade quote {} has no unit price", quote.quote_id))
        })?;
        let quantity = size_order(quote.amount_cents, price);
        if quantity <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "amount {} is below one unit step of {symbol}",
                quote.amount_cents
            )));
        }
        let order = VenueOrder {
            client_order_id: format!("exec-{}-{key}", quote.user_id),
            user_id: quote.user_id,
            symbol: symbol.to_string(),
            side,
            quantity,
        };
        let fill = with_timeout("venue order", self.venue_timeout(), self.venue.place_order(&order))
            .await?;
        Ok(fill)
    }

    /// Newest first; `limit` is clamped to `1..=max_receipts_page`
    pub async fn list_receipts(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> EngineResult<Vec<Receipt>> {
        let max = self.config.max_receipts_page.max(1);
        let limit = limit.unwrap_or(max).clamp(1, max);
        self.receipts.list_for_user(user_id, limit).await
    }

    pub async fn freeze_user(&self, req: FreezeRequest) -> EngineResult<UserFlags> {
        self.access.freeze_user(req).await
    }

    pub async fn revoke_agent(&self, req: RevokeAgentRequest) -> EngineResult<AgentToken> {
        self.access.revoke_agent(req).await
    }

    pub async fn register_agent(&self, user_id: UserId) -> EngineResult<AgentToken> {
        self.access.register_agent(user_id).await
    }
}

/// A signed copy of the request, when supplied, must name the same quote and
/// the trimmed key
fn check_signed_payload(req: &ExecuteRequest, key: &str) -> EngineResult<()> {
    let Some(payload) = &req.signed_payload else {
        return Ok(());
    };
    let quote_id = payload.get("quote_id").and_then(|v| v.as_str());
    let signed_key = payload.get("idempotency_key").and_then(|v| v.as_str());
    let matches =
        quote_id == Some(req.quote_id.to_string().as_str()) && signed_key == Some(key);
    if !matches {
        return Err(EngineError::Unauthorized(
            "signed payload does not match the request".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemoryAccessStore;
    use crate::config::{SettlementModel, SpendConfig};
    use crate::execution::MemoryExecutionStore;
    use crate::holds::{Holds, MemoryHoldStore};
    use crate::ledger::{AccountType, MemoryLedgerStore};
    use crate::liquidation::MemoryLiquidationStore;
    use crate::providers::PaperVenue;

    struct Fixture {
        ledger: Arc<Ledger>,
        venue: Arc<PaperVenue>,
        executor: Executor,
    }

    fn fixture(config: ExecutionConfig) -> Fixture {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryLedgerStore::new()), "USD"));
        let holds = Arc::new(Holds::new(Arc::new(MemoryHoldStore::new())));
        let access = Arc::new(AccessControl::new(Arc::new(MemoryAccessStore::new())));
        let venue = Arc::new(PaperVenue::new());
        venue.set_price("BTC", Decimal::from(5_000_000));
        let store = Arc::new(MemoryExecutionStore::new());
        let spend = Arc::new(SpendEngine::new(
            ledger.clone(),
            holds,
            access.clone(),
            venue.clone(),
            venue.clone(),
            store.clone(),
            Arc::new(MemoryLiquidationStore::new()),
            SpendConfig::default(),
            SettlementModel::Fiat,
        ));
        let executor = Executor::new(
            store.clone(),
            store,
            ledger.clone(),
            spend,
            access,
            venue.clone(),
            venue.clone(),
            config,
        );
        Fixture {
            ledger,
            venue,
            executor,
        }
    }

    async fn fund(ledger: &Ledger, user_id: UserId, amount: Cents) {
        let cash = ledger.cash_account(user_id).await.unwrap();
        let house = ledger.house_accounts().await.unwrap();
        ledger
            .post_entry(
                PostEntryRequest::new(
                    "deposit",
                    format!("dep-{user_id}-{amount}"),
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

    fn transfer(amount_cents: Cents) -> CreateQuoteRequest {
        CreateQuoteRequest {
            action: QuoteAction::Transfer {
                recipient: "alice".into(),
            },
            amount_cents,
        }
    }

    fn exec(quote_id: QuoteId, key: &str) -> ExecuteRequest {
        ExecuteRequest {
            quote_id,
            idempotency_key: key.into(),
            step_up_token: None,
            signed_payload: None,
        }
    }

    #[tokio::test]
    async fn test_execute_transfer_is_idempotent() {
        let f = fixture(ExecutionConfig::default());
        fund(&f.ledger, 1, 100_000).await;

        let quote = f.executor.create_quote(Caller::user(1), transfer(2_000)).await.unwrap();
        let first = f
            .executor
            .execute(Caller::user(1), exec(quote.quote_id, "k1"))
            .await
            .unwrap();
        let second = f
            .executor
            .execute(Caller::user(1), exec(quote.quote_id, "k1"))
            .await
            .unwrap();
        assert_eq!(first, second);

        let cash = f.ledger.cash_account(1).await.unwrap();
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 98_000);
        assert_eq!(f.executor.list_receipts(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_frozen_wins_over_everything() {
        let f = fixture(ExecutionConfig::default());
        fund(&f.ledger, 1, 100_000).await;
        let quote = f.executor.create_quote(Caller::user(1), transfer(2_000)).await.unwrap();

        f.executor
            .freeze_user(FreezeRequest {
                user_id: 1,
                frozen: true,
                reason: Some("review".into()),
            })
            .await
            .unwrap();

        // Unknown quote and empty key still report the freeze
        let err = f
            .executor
            .execute(Caller::user(1), exec(QuoteId::new(), ""))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FrozenAccount { .. }));
        let err = f
            .executor
            .execute(Caller::user(1), exec(quote.quote_id, "k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FrozenAccount { .. }));
        assert!(f.executor.list_receipts(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_up_above_threshold() {
        let config = ExecutionConfig {
            step_up_threshold_cents: 5_000,
            step_up_secret: "2fa".into(),
            ..ExecutionConfig::default()
        };
        let f = fixture(config);
        fund(&f.ledger, 1, 100_000).await;
        let quote = f.executor.create_quote(Caller::user(1), transfer(5_000)).await.unwrap();

        let err = f
            .executor
            .execute(Caller::user(1), exec(quote.quote_id, "k1"))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::StepUpRequired);

        let mut req = exec(quote.quote_id, "k1");
        req.step_up_token = step_up::issue("2fa", 1, quote.quote_id);
        assert!(f.executor.execute(Caller::user(1), req).await.is_ok());
    }

    #[tokio::test]
    async fn test_insufficient_spend_power() {
        let f = fixture(ExecutionConfig::default());
        fund(&f.ledger, 1, 1_000).await;
        let quote = f.executor.create_quote(Caller::user(1), transfer(900)).await.unwrap();
        // 1_000 - 500 safety floor = 500 available
        let err = f
            .executor
            .execute(Caller::user(1), exec(quote.quote_id, "k1"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientSpendPower {
                required: 900,
                available: 500
            }
        );
    }

    #[tokio::test]
    async fn test_revoked_agent_quote_is_unusable() {
        let f = fixture(ExecutionConfig::default());
        fund(&f.ledger, 1, 100_000).await;
        let agent = f.executor.register_agent(1).await.unwrap();
        let quote = f
            .executor
            .create_quote(Caller::agent(1, agent.agent_id), transfer(1_000))
            .await
            .unwrap();

        f.executor
            .revoke_agent(RevokeAgentRequest {
                user_id: 1,
                agent_id: agent.agent_id,
            })
            .await
            .unwrap();

        for caller in [Caller::agent(1, agent.agent_id), Caller::user(1)] {
            let err = f
                .executor
                .execute(caller, exec(quote.quote_id, "k1"))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Unauthorized(_)));
        }
    }

    #[tokio::test]
    async fn test_quote_of_other_user_rejected() {
        let f = fixture(ExecutionConfig::default());
        fund(&f.ledger, 1, 100_000).await;
        let quote = f.executor.create_quote(Caller::user(1), transfer(1_000)).await.unwrap();
        let err = f
            .executor
            .execute(Caller::user(2), exec(quote.quote_id, "k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_expired_quote() {
        let config = ExecutionConfig {
            quote_ttl_secs: 0,
            ..ExecutionConfig::default()
        };
        let f = fixture(config);
        fund(&f.ledger, 1, 100_000).await;
        let quote = f.executor.create_quote(Caller::user(1), transfer(1_000)).await.unwrap();
        let err = f
            .executor
            .execute(Caller::user(1), exec(quote.quote_id, "k1"))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::QuoteExpired);
    }

    #[tokio::test]
    async fn test_buy_trade_books_custody() {
        let f = fixture(ExecutionConfig {
            fee_bps: 100,
            ..ExecutionConfig::default()
        });
        fund(&f.ledger, 1, 100_000).await;
        let quote = f
            .executor
            .create_quote(
                Caller::user(1),
                CreateQuoteRequest {
                    action: QuoteAction::Trade {
                        symbol: "BTC".into(),
                        side: OrderSide::Buy,
                    },
                    amount_cents: 10_000,
                },
            )
            .await
            .unwrap();
        assert_eq!(quote.fee_cents, 100);

        let receipt = f
            .executor
            .execute(Caller::user(1), exec(quote.quote_id, "buy-1"))
            .await
            .unwrap();
        assert_eq!(receipt.quantity, Some(Decimal::new(2, 3)));
        assert_eq!(receipt.amount_cents, 10_000);
        assert_eq!(f.venue.quantity_of(1, "BTC"), Decimal::new(2, 3));

        let custody = f.ledger.custody_account(1).await.unwrap();
        assert_eq!(custody.account_type, AccountType::Custody);
        assert_eq!(f.ledger.get_account_balance(&custody).await.unwrap(), 10_000);
        let cash = f.ledger.cash_account(1).await.unwrap();
        assert_eq!(f.ledger.get_account_balance(&cash).await.unwrap(), 89_900);
    }

    #[tokio::test]
    async fn test_signed_payload_must_match() {
        let f = fixture(ExecutionConfig::default());
        fund(&f.ledger, 1, 100_000).await;
        let quote = f.executor.create_quote(Caller::user(1), transfer(1_000)).await.unwrap();

        let mut req = exec(quote.quote_id, "k1");
        req.signed_payload = Some(serde_json::json!({
            "quote_id": quote.quote_id.to_string(),
            "idempotency_key": "other",
        }));
        let err = f.executor.execute(Caller::user(1), req).await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_signed_payload_names_the_trimmed_key() {
        let f = fixture(ExecutionConfig::default());
        fund(&f.ledger, 1, 100_000).await;
        let quote = f.executor.create_quote(Caller::user(1), transfer(1_000)).await.unwrap();

        let mut req = exec(quote.quote_id, "  k1 ");
        req.signed_payload = Some(serde_json::json!({
            "quote_id": quote.quote_id.to_string(),
            "idempotency_key": "k1",
        }));
        let receipt = f.executor.execute(Caller::user(1), req).await.unwrap();

        // Replaying with the bare key resolves to the same receipt
        let replay = f
            .executor
            .execute(Caller::user(1), exec(quote.quote_id, "k1"))
            .await
            .unwrap();
        assert_eq!(receipt, replay);
    }

    #[tokio::test]
    async fn test_receipt_page_is_capped() {
        let f = fixture(ExecutionConfig {
            max_receipts_page: 2,
            ..ExecutionConfig::default()
        });
        fund(&f.ledger, 1, 100_000).await;
        for key in ["a", "b", "c"] {
            let quote = f.executor.create_quote(Caller::user(1), transfer(100)).await.unwrap();
            f.executor
                .execute(Caller::user(1), exec(quote.quote_id, key))
                .await
                .unwrap();
        }
        let page = f.executor.list_receipts(1, Some(50)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].created_at >= page[1].created_at);
    }
}
