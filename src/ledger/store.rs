//! Ledger persistence seam

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core_types::{AccountId, Cents, UserId};
use crate::error::EngineResult;

use super::types::{AccountType, JournalEntry, LedgerAccount, PostEntryRequest, PostOutcome};

/// Append-only journal storage
///
/// Implementations must make `insert_entry` atomic (all postings or none) and
/// resolve a `(source, external_id)` conflict to the already-stored entry.
/// Accounts are never deleted, so validating against a previously read
/// account set stays valid at insert time.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get-or-create the account identified by `(user, type, currency, label)`
    async fn ensure_account(
        &self,
        user_id: UserId,
        account_type: AccountType,
        currency: &str,
        label: &str,
    ) -> EngineResult<LedgerAccount>;

    async fn get_accounts(
        &self,
        account_ids: &[AccountId],
    ) -> EngineResult<HashMap<AccountId, LedgerAccount>>;

    async fn accounts_for_user(&self, user_id: UserId) -> EngineResult<Vec<LedgerAccount>>;

    /// All accounts, house accounts included, ordered by user then type
    async fn all_accounts(&self) -> EngineResult<Vec<LedgerAccount>>;

    async fn find_entry(&self, source: &str, external_id: &str)
    -> EngineResult<Option<JournalEntry>>;

    /// Write a validated entry. Never writes twice for the same external key.
    async fn insert_entry(&self, req: &PostEntryRequest) -> EngineResult<PostOutcome>;

    /// Flip a pending entry to settled. Returns the entry as stored afterwards.
    async fn mark_settled(
        &self,
        source: &str,
        external_id: &str,
    ) -> EngineResult<Option<JournalEntry>>;

    /// Sum of postings against the account, optionally settled entries only
    async fn account_balance(&self, account_id: AccountId, settled_only: bool)
    -> EngineResult<Cents>;

    /// Newest first
    async fn recent_entries(&self, limit: usize) -> EngineResult<Vec<JournalEntry>>;

    /// Entries touching any account of the user, oldest first
    async fn entries_for_user_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<JournalEntry>>;

    /// Users owning at least one account, excluding the house
    async fn user_ids(&self) -> EngineResult<Vec<UserId>>;
}
