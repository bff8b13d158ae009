//! Liquidation
//!
//! Queue and state machine that sells holdings to cover shortfalls.
//! At most one QUEUED/PROCESSING task per user; claims are exclusive and
//! expire after `claim_ttl_secs`.

pub mod db;
pub mod engine;
pub mod policy;
pub mod state;
pub mod store;
pub mod types;

pub use db::PgLiquidationStore;
pub use engine::{LIQUIDATION_SOURCE, LiquidationEngine, SweepSummary, shortfall_cents};
pub use policy::LiquidationOrdering;
pub use state::LiquidationState;
pub use store::{InsertResult, LiquidationStore, MemoryLiquidationStore};
pub use types::{EnqueueOutcome, LiquidationTask, ProcessSummary};
