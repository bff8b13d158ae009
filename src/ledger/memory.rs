//! In-memory ledger store
//!
//! A single lock guards the account and journal maps so that an entry and its
//! postings appear together or not at all.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core_types::{AccountId, Cents, EntryId, HOUSE_USER_ID, UserId};
use crate::error::EngineResult;

use super::store::LedgerStore;
use super::types::{
    AccountType, EntryStatus, JournalEntry, LedgerAccount, PostEntryRequest, PostOutcome,
};

type AccountKey = (UserId, AccountType, String, String);

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, LedgerAccount>,
    account_index: HashMap<AccountKey, AccountId>,
    entries: Vec<JournalEntry>,
    entry_index: HashMap<(String, String), usize>,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    state: RwLock<State>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries (test helper)
    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_account(
        &self,
        user_id: UserId,
        account_type: AccountType,
        currency: &str,
        label: &str,
    ) -> EngineResult<LedgerAccount> {
        let key = (user_id, account_type, currency.to_string(), label.to_string());
        let mut state = self.state.write().await;
        if let Some(account) = state
            .account_index
            .get(&key)
            .and_then(|id| state.accounts.get(id))
        {
            return Ok(account.clone());
        }

        let account = LedgerAccount {
            account_id: AccountId::new(),
            user_id,
            account_type,
            currency: currency.to_string(),
            label: label.to_string(),
            created_at: Utc::now(),
        };
        state.account_index.insert(key, account.account_id);
        state.accounts.insert(account.account_id, account.clone());
        Ok(account)
    }

    async fn get_accounts(
        &self,
        account_ids: &[AccountId],
    ) -> EngineResult<HashMap<AccountId, LedgerAccount>> {
        let state = self.state.read().await;
        Ok(account_ids
            .iter()
            .filter_map(|id| state.accounts.get(id).map(|a| (*id, a.clone())))
            .collect())
    }

    async fn accounts_for_user(&self, user_id: UserId) -> EngineResult<Vec<LedgerAccount>> {
        let state = self.state.read().await;
        let mut accounts: Vec<_> = state
            .accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| (a.account_type.id(), a.label.clone()));
        Ok(accounts)
    }

    async fn all_accounts(&self) -> EngineResult<Vec<LedgerAccount>> {
        let state = self.state.read().await;
        let mut accounts: Vec<_> = state.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| (a.user_id, a.account_type.id(), a.label.clone()));
        Ok(accounts)
    }

    async fn find_entry(
        &self,
        source: &str,
        external_id: &str,
    ) -> EngineResult<Option<JournalEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entry_index
            .get(&(source.to_string(), external_id.to_string()))
            .map(|&idx| state.entries[idx].clone()))
    }

    async fn insert_entry(&self, req: &PostEntryRequest) -> EngineResult<PostOutcome> {
        let key = (req.source.clone(), req.external_id.clone());
        let mut state = self.state.write().await;
        if let Some(&idx) = state.entry_index.get(&key) {
            return Ok(PostOutcome::Existing(state.entries[idx].clone()));
        }

        let entry = JournalEntry {
            entry_id: EntryId::new(),
            external_source: req.source.clone(),
            external_id: req.external_id.clone(),
            memo: req.memo.clone(),
            status: req.status,
            created_at: Utc::now(),
            postings: req.postings.clone(),
        };
        let idx = state.entries.len();
        state.entries.push(entry.clone());
        state.entry_index.insert(key, idx);
        Ok(PostOutcome::Created(entry))
    }

    async fn mark_settled(
        &self,
        source: &str,
        external_id: &str,
    ) -> EngineResult<Option<JournalEntry>> {
        let mut state = self.state.write().await;
        let Some(&idx) = state
            .entry_index
            .get(&(source.to_string(), external_id.to_string()))
        else {
            return Ok(None);
        };
        let entry = &mut state.entries[idx];
        entry.status = EntryStatus::Settled;
        Ok(Some(entry.clone()))
    }

    async fn account_balance(
        &self,
        account_id: AccountId,
        settled_only: bool,
    ) -> EngineResult<Cents> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| !settled_only || e.status == EntryStatus::Settled)
            .map(|e| e.net_for(account_id))
            .sum())
    }

    async fn recent_entries(&self, limit: usize) -> EngineResult<Vec<JournalEntry>> {
        let state = self.state.read().await;
        Ok(state.entries.iter().rev().take(limit).cloned().collect())
    }

    async fn entries_for_user_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<JournalEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.created_at >= since)
            .filter(|e| {
                e.postings.iter().any(|p| {
                    state
                        .accounts
                        .get(&p.account_id)
                        .is_some_and(|a| a.user_id == user_id)
                })
            })
            .cloned()
            .collect())
    }

    async fn user_ids(&self) -> EngineResult<Vec<UserId>> {
        let state = self.state.read().await;
        let users: BTreeSet<UserId> = state
            .accounts
            .values()
            .map(|a| a.user_id)
            .filter(|&u| u != HOUSE_USER_ID)
            .collect();
        Ok(users.into_iter().collect())
    }
}
