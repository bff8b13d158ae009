use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core_types::{Cents, ReportId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Provider reports it, the ledger has no entry
    MissingInternal,
    /// Ledger has it, the provider does not
    MissingExternal,
    /// Both sides have it with different amounts
    AmountMismatch,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::MissingInternal => "missing_internal",
            DiscrepancyKind::MissingExternal => "missing_external",
            DiscrepancyKind::AmountMismatch => "amount_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Discrepancy {
    pub source: String,
    pub external_id: String,
    pub kind: DiscrepancyKind,
    pub internal_amount_cents: Option<Cents>,
    pub external_amount_cents: Option<Cents>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum ReportStatus {
    Completed = 10,
    /// The external side could not be read; nothing was compared
    Failed = -10,
}

impl ReportStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            10 => Some(ReportStatus::Completed),
            -10 => Some(ReportStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted outcome of one reconciliation run. Reports are never acted on
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub report_id: ReportId,
    pub user_id: UserId,
    pub status: ReportStatus,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub external_count: usize,
    pub internal_count: usize,
    pub matched_count: usize,
    /// Sorted by `(source, external_id, kind)`
    pub discrepancies: Vec<Discrepancy>,
    /// SHA-256 over the user and the sorted discrepancies
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.status == ReportStatus::Completed && self.discrepancies.is_empty()
    }
}

/// Fingerprint of a discrepancy list. Independent of run time and report id.
pub fn fingerprint(user_id: UserId, status: ReportStatus, discrepancies: &[Discrepancy]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.to_be_bytes());
    hasher.update(status.id().to_be_bytes());
    for d in discrepancies {
        hasher.update(d.source.as_bytes());
        hasher.update([0u8]);
        hasher.update(d.external_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(d.kind.as_str().as_bytes());
        hasher.update(d.internal_amount_cents.unwrap_or(0).to_be_bytes());
        hasher.update(d.external_amount_cents.unwrap_or(0).to_be_bytes());
        hasher.update([d.internal_amount_cents.is_some() as u8, d.external_amount_cents.is_some() as u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing(id: &str) -> Discrepancy {
        Discrepancy {
            source: "provider".into(),
            external_id: id.into(),
            kind: DiscrepancyKind::MissingInternal,
            internal_amount_cents: None,
            external_amount_cents: Some(100),
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = vec![missing("a"), missing("b")];
        let f1 = fingerprint(1, ReportStatus::Completed, &a);
        let f2 = fingerprint(1, ReportStatus::Completed, &a.clone());
        assert_eq!(f1, f2);
        assert_eq!(f1.len(), 64);
        assert_ne!(f1, fingerprint(2, ReportStatus::Completed, &a));
        assert_ne!(f1, fingerprint(1, ReportStatus::Completed, &a[..1]));
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_value(DiscrepancyKind::AmountMismatch).unwrap();
        assert_eq!(json, "amount_mismatch");
    }
}
