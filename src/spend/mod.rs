//! Spend authorization
//!
//! Derives how much a user may safely spend right now from settled ledger
//! cash, active holds and reserves, and data freshness.

pub mod engine;
pub mod freshness;

pub use engine::{
    BalanceMode, BalanceView, FlipValuation, SpendEngine, SpendFlag, SpendPowerOptions,
    SpendPowerReport, SpendPowerSnapshot, SpendableNow, compute_spend_power,
};
pub use freshness::FreshnessStatus;
