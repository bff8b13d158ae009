//! Application wiring
//!
//! Builds every service over one set of stores. PostgreSQL stores in
//! production, in-memory stores for tests and the paper dev mode; the
//! services themselves are identical in both.

use std::sync::Arc;

use crate::access::{AccessControl, AccessStore, MemoryAccessStore, PgAccessStore};
use crate::command::{CommandEngine, IntentStore, MemoryIntentStore, PgIntentStore};
use crate::config::AppConfig;
use crate::db::Database;
use crate::execution::{
    Executor, MemoryExecutionStore, PgExecutionStore, QuoteStore, ReceiptStore,
};
use crate::holds::{HoldStore, Holds, MemoryHoldStore, PgHoldStore};
use crate::ledger::{Ledger, LedgerStore, MemoryLedgerStore, PgLedgerStore};
use crate::liquidation::{
    LiquidationEngine, LiquidationStore, MemoryLiquidationStore, PgLiquidationStore,
};
use crate::locks::{JobLocks, LockStore, MemoryLockStore, PgLockStore};
use crate::providers::{CustodyVenue, PriceFeed, SettlementFeed};
use crate::reconciliation::{MemoryReportStore, PgReportStore, ReconciliationService, ReportStore};
use crate::spend::SpendEngine;
use crate::webhook::WebhookHandler;

/// External collaborators
#[derive(Clone)]
pub struct Providers {
    pub venue: Arc<dyn CustodyVenue>,
    pub prices: Arc<dyn PriceFeed>,
    pub settlement: Arc<dyn SettlementFeed>,
}

/// One implementation per store seam
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub holds: Arc<dyn HoldStore>,
    pub access: Arc<dyn AccessStore>,
    pub liquidations: Arc<dyn LiquidationStore>,
    pub quotes: Arc<dyn QuoteStore>,
    pub receipts: Arc<dyn ReceiptStore>,
    pub intents: Arc<dyn IntentStore>,
    pub reports: Arc<dyn ReportStore>,
    pub locks: Arc<dyn LockStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let execution = Arc::new(MemoryExecutionStore::new());
        Self {
            ledger: Arc::new(MemoryLedgerStore::new()),
            holds: Arc::new(MemoryHoldStore::new()),
            access: Arc::new(MemoryAccessStore::new()),
            liquidations: Arc::new(MemoryLiquidationStore::new()),
            quotes: execution.clone(),
            receipts: execution,
            intents: Arc::new(MemoryIntentStore::new()),
            reports: Arc::new(MemoryReportStore::new()),
            locks: Arc::new(MemoryLockStore::new()),
        }
    }

    pub fn postgres(db: &Database) -> Self {
        let pool = db.pool().clone();
        let execution = Arc::new(PgExecutionStore::new(pool.clone()));
        Self {
            ledger: Arc::new(PgLedgerStore::new(pool.clone())),
            holds: Arc::new(PgHoldStore::new(pool.clone())),
            access: Arc::new(PgAccessStore::new(pool.clone())),
            liquidations: Arc::new(PgLiquidationStore::new(pool.clone())),
            quotes: execution.clone(),
            receipts: execution,
            intents: Arc::new(PgIntentStore::new(pool.clone())),
            reports: Arc::new(PgReportStore::new(pool.clone())),
            locks: Arc::new(PgLockStore::new(pool)),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ledger: Arc<Ledger>,
    pub holds: Arc<Holds>,
    pub access: Arc<AccessControl>,
    pub spend: Arc<SpendEngine>,
    pub liquidation: Arc<LiquidationEngine>,
    pub executor: Arc<Executor>,
    pub commands: Arc<CommandEngine>,
    pub reconciliation: Arc<ReconciliationService>,
    pub locks: Arc<JobLocks>,
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    pub fn new(config: AppConfig, stores: Stores, providers: Providers) -> Self {
        let ledger = Arc::new(Ledger::new(stores.ledger, config.ledger.currency.clone()));
        let holds = Arc::new(Holds::new(stores.holds));
        let access = Arc::new(AccessControl::new(stores.access));
        let spend = Arc::new(SpendEngine::new(
            ledger.clone(),
            holds.clone(),
            access.clone(),
            providers.venue.clone(),
            providers.prices.clone(),
            stores.receipts.clone(),
            stores.liquidations.clone(),
            config.spend.clone(),
            config.ledger.settlement_model,
        ));
        let liquidation = Arc::new(LiquidationEngine::new(
            stores.liquidations,
            ledger.clone(),
            spend.clone(),
            providers.venue.clone(),
            providers.prices.clone(),
            config.liquidation.clone(),
        ));
        let executor = Arc::new(Executor::new(
            stores.quotes,
            stores.receipts,
            ledger.clone(),
            spend.clone(),
            access.clone(),
            providers.venue.clone(),
            providers.prices.clone(),
            config.execution.clone(),
        ));
        let commands = Arc::new(CommandEngine::new(
            stores.intents,
            ledger.clone(),
            holds.clone(),
            spend.clone(),
            access.clone(),
            providers.venue.clone(),
            providers.prices.clone(),
            config.command.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            ledger.clone(),
            providers.settlement,
            stores.reports,
            config.reconciliation.clone(),
        ));
        let locks = Arc::new(JobLocks::new(stores.locks));
        let webhooks = Arc::new(WebhookHandler::new(&config.webhook, ledger.clone()));

        tracing::info!(
            currency = %config.ledger.currency,
            settlement_model = ?config.ledger.settlement_model,
            venue = providers.venue.name(),
            "Application state assembled"
        );

        Self {
            config: Arc::new(config),
            ledger,
            holds,
            access,
            spend,
            liquidation,
            executor,
            commands,
            reconciliation,
            locks,
            webhooks,
        }
    }

    pub fn in_memory(config: AppConfig, providers: Providers) -> Self {
        Self::new(config, Stores::in_memory(), providers)
    }

    pub fn postgres(db: &Database, config: AppConfig, providers: Providers) -> Self {
        Self::new(config, Stores::postgres(db), providers)
    }
}
