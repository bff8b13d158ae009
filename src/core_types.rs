//! Core types used throughout the system
//!
//! Identifiers and money units shared by every module.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User ID - globally unique, immutable after assignment.
///
/// Stored as BIGINT in PostgreSQL.
pub type UserId = i64;

/// Signed amount in minor currency units (cents for USD).
///
/// Postings are signed: positive increases the account, negative decreases it.
pub type Cents = i64;

/// Reserved user that owns the house accounts (clearing, fees, bridge funding).
pub const HOUSE_USER_ID: UserId = 0;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            /// Generate a new unique id
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }

            /// Get the inner ULID value
            pub fn inner(&self) -> ulid::Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(ulid::Ulid::from_string(s)?))
            }
        }
    };
}

ulid_id!(
    /// Ledger account id
    AccountId
);
ulid_id!(
    /// Journal entry id
    EntryId
);
ulid_id!(
    /// Hold / reserve id
    HoldId
);
ulid_id!(
    /// Liquidation task id
    TaskId
);
ulid_id!(
    /// Quote id
    QuoteId
);
ulid_id!(
    /// Receipt id
    ReceiptId
);
ulid_id!(
    /// Delegated agent id
    AgentId
);
ulid_id!(
    /// Reconciliation report id
    ReportId
);
ulid_id!(
    /// Command intent id
    IntentId
);

/// Format cents as a human-readable decimal string ("1234" -> "12.34")
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}
