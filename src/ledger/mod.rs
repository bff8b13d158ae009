//! Double-entry ledger
//!
//! Append-only journal of balanced entries. Balances are never stored; they
//! are projections over postings.

pub mod db;
pub mod memory;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;

pub use db::PgLedgerStore;
pub use memory::MemoryLedgerStore;
pub use service::{HouseAccounts, Ledger};
pub use store::LedgerStore;
pub use types::{
    AccountBalance, AccountType, EntryStatus, JournalEntry, LedgerAccount, PostEntryRequest,
    PostOutcome, Posting,
};
