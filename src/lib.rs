//! SpendGuard - personal ledger and spend-authorization engine
//!
//! # Modules
//!
//! - [`ledger`] - Double-entry journal with idempotent posting
//! - [`holds`] - Holds and reserves against spendable cash
//! - [`access`] - Freeze flags and agent tokens
//! - [`spend`] - Spend power and spendable-now computation
//! - [`liquidation`] - Shortfall detection and the liquidation task queue
//! - [`execution`] - Quotes, step-up, idempotent execution and receipts
//! - [`command`] - Text commands: parse, preview, confirm exactly once
//! - [`reconciliation`] - Ledger vs settlement provider reports
//! - [`locks`] - Named TTL job locks
//! - [`webhook`] - Signed settlement webhooks
//! - [`scheduler`] - Periodic jobs under job locks
//! - [`state`] - Service wiring over memory or PostgreSQL stores

// Core types - must be first!
pub mod core_types;
pub mod error;

pub mod config;
pub mod db;
pub mod fee;
pub mod logging;
pub mod providers;
pub mod retry;

// Ledger and balances
pub mod access;
pub mod holds;
pub mod ledger;
pub mod spend;

// Engines and services
pub mod command;
pub mod execution;
pub mod liquidation;
pub mod reconciliation;

// Background and integration
pub mod locks;
pub mod scheduler;
pub mod state;
pub mod webhook;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{Cents, UserId};
pub use error::{EngineError, EngineResult};
pub use ledger::{JournalEntry, Ledger, PostEntryRequest, Posting};
pub use scheduler::JobScheduler;
pub use spend::SpendEngine;
pub use state::{AppState, Providers, Stores};
