//! Reconciliation
//!
//! External settlement activity vs. the journal, reported and persisted.

pub mod db;
pub mod service;
pub mod store;
pub mod types;

pub use db::PgReportStore;
pub use service::{ReconciliationService, ReconciliationSweep, diff};
pub use store::{MemoryReportStore, ReportStore};
pub use types::{
    Discrepancy, DiscrepancyKind, ReconciliationReport, ReportStatus, fingerprint,
};
