//! Ledger Core Types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, Cents, EntryId, UserId};

/// Ledger account type
///
/// IDs are stored in PostgreSQL as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum AccountType {
    /// Spendable money
    Cash = 1,
    /// Cash value of custodial positions
    Custody = 2,
    /// Money set aside (house fees, bridge funding)
    Reserve = 3,
    /// Amounts the user owes (bridge advances)
    Liability = 4,
}

impl AccountType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(AccountType::Cash),
            2 => Some(AccountType::Custody),
            3 => Some(AccountType::Reserve),
            4 => Some(AccountType::Liability),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Cash => "CASH",
            AccountType::Custody => "CUSTODY",
            AccountType::Reserve => "RESERVE",
            AccountType::Liability => "LIABILITY",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Account label used when a user has a single account of a type
pub const MAIN_LABEL: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub account_type: AccountType,
    pub currency: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// Settlement status of a journal entry
///
/// The only mutation a journal entry ever sees is Pending -> Settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum EntryStatus {
    Pending = 0,
    Settled = 1,
}

impl EntryStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(EntryStatus::Pending),
            1 => Some(EntryStatus::Settled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account_id: AccountId,
    /// Signed amount in minor units
    pub amount_cents: Cents,
}

impl Posting {
    pub fn new(account_id: AccountId, amount_cents: Cents) -> Self {
        Self {
            account_id,
            amount_cents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: EntryId,
    pub external_source: String,
    pub external_id: String,
    pub memo: String,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub postings: Vec<Posting>,
}

impl JournalEntry {
    /// Sum of posting amounts. Zero for every accepted entry.
    pub fn posting_sum(&self) -> i128 {
        self.postings.iter().map(|p| p.amount_cents as i128).sum()
    }

    /// Net movement on one account within this entry
    pub fn net_for(&self, account_id: AccountId) -> Cents {
        self.postings
            .iter()
            .filter(|p| p.account_id == account_id)
            .map(|p| p.amount_cents)
            .sum()
    }
}

/// Request to post a journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEntryRequest {
    pub source: String,
    pub external_id: String,
    pub memo: String,
    pub status: EntryStatus,
    /// Allow postings across exactly two users (transfers to/from house accounts)
    #[serde(default)]
    pub cross_user: bool,
    pub postings: Vec<Posting>,
}

impl PostEntryRequest {
    /// Settled entry within a single user's accounts
    pub fn new(
        source: impl Into<String>,
        external_id: impl Into<String>,
        memo: impl Into<String>,
        postings: Vec<Posting>,
    ) -> Self {
        Self {
            source: source.into(),
            external_id: external_id.into(),
            memo: memo.into(),
            status: EntryStatus::Settled,
            cross_user: false,
            postings,
        }
    }

    pub fn pending(mut self) -> Self {
        self.status = EntryStatus::Pending;
        self
    }

    pub fn cross_user(mut self) -> Self {
        self.cross_user = true;
        self
    }
}

/// Result of an idempotent insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    Created(JournalEntry),
    /// `(source, external_id)` was already recorded; nothing was written
    Existing(JournalEntry),
}

impl PostOutcome {
    pub fn into_entry(self) -> JournalEntry {
        match self {
            PostOutcome::Created(e) | PostOutcome::Existing(e) => e,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, PostOutcome::Created(_))
    }
}

/// Admin projection: account with its current balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    #[serde(flatten)]
    pub account: LedgerAccount,
    pub balance_cents: Cents,
    pub settled_balance_cents: Cents,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_type_roundtrip() {
        for ty in [
            AccountType::Cash,
            AccountType::Custody,
            AccountType::Reserve,
            AccountType::Liability,
        ] {
            assert_eq!(AccountType::from_id(ty.id()), Some(ty));
        }
        assert_eq!(AccountType::from_id(0), None);
        assert_eq!(AccountType::Liability.to_string(), "LIABILITY");
    }

    #[test]
    fn test_net_for() {
        let a = AccountId::new();
        let b = AccountId::new();
        let entry = JournalEntry {
            entry_id: EntryId::new(),
            external_source: "cron".into(),
            external_id: "a".into(),
            memo: String::new(),
            status: EntryStatus::Settled,
            created_at: Utc::now(),
            postings: vec![Posting::new(a, -500), Posting::new(b, 300), Posting::new(b, 200)],
        };
        assert_eq!(entry.net_for(b), 500);
        assert_eq!(entry.net_for(a), -500);
        assert_eq!(entry.posting_sum(), 0);
    }
}
