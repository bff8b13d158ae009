//! Execution / Receipts
//!
//! Quotes, idempotent execution and the receipt history.

pub mod db;
pub mod service;
pub mod step_up;
pub mod store;
pub mod types;

pub use db::PgExecutionStore;
pub use service::{EXECUTION_SOURCE, Executor, size_order};
pub use store::{MemoryExecutionStore, QuoteStore, ReceiptInsert, ReceiptStore};
pub use types::{
    CreateQuoteRequest, ExecuteRequest, ListReceiptsRequest, Quote, QuoteAction, Receipt,
};
