//! Ledger service
//!
//! Entry point for every caller that writes to or reads from the journal.
//! Validation happens here so all writers share one set of invariants.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core_types::{Cents, HOUSE_USER_ID, UserId};
use crate::error::{EngineError, EngineResult};

use super::store::LedgerStore;
use super::types::{
    AccountBalance, AccountType, JournalEntry, LedgerAccount, MAIN_LABEL, PostEntryRequest,
    PostOutcome, Posting,
};
use super::validation::validate_entry;

/// Source tag for bridge advances
pub const BRIDGE_SOURCE: &str = "bridge";

/// System accounts owned by the house user
#[derive(Debug, Clone)]
pub struct HouseAccounts {
    /// Counterparty for money entering or leaving the system
    pub clearing: LedgerAccount,
    /// Collected fees
    pub fees: LedgerAccount,
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    currency: String,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, currency: impl Into<String>) -> Self {
        Self {
            store,
            currency: currency.into(),
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Post a balanced entry, or return the entry already recorded under the
    /// same `(source, external_id)`
    pub async fn post_entry(&self, req: PostEntryRequest) -> EngineResult<JournalEntry> {
        Ok(self.post_entry_outcome(req).await?.into_entry())
    }

    pub async fn post_entry_outcome(&self, req: PostEntryRequest) -> EngineResult<PostOutcome> {
        // Replays skip validation: the stored entry is the answer
        if let Some(existing) = self.store.find_entry(&req.source, &req.external_id).await? {
            tracing::debug!(
                source = %req.source,
                external_id = %req.external_id,
                entry_id = %existing.entry_id,
                "Entry already recorded - returning existing entry"
            );
            return Ok(PostOutcome::Existing(existing));
        }

        let ids: Vec<_> = req.postings.iter().map(|p| p.account_id).collect();
        let accounts = self.store.get_accounts(&ids).await?;
        if let Err(e) = validate_entry(&req, &accounts) {
            tracing::warn!(
                source = %req.source,
                external_id = %req.external_id,
                error = %e,
                "Rejected journal entry"
            );
            return Err(e);
        }

        let outcome = self.store.insert_entry(&req).await?;
        match &outcome {
            PostOutcome::Created(entry) => tracing::info!(
                source = %entry.external_source,
                external_id = %entry.external_id,
                entry_id = %entry.entry_id,
                postings = entry.postings.len(),
                "Journal entry posted"
            ),
            PostOutcome::Existing(entry) => tracing::info!(
                source = %entry.external_source,
                external_id = %entry.external_id,
                entry_id = %entry.entry_id,
                "Concurrent writer won - returning existing entry"
            ),
        }
        Ok(outcome)
    }

    /// Sum of all postings against the account
    pub async fn get_account_balance(&self, account: &LedgerAccount) -> EngineResult<Cents> {
        self.store.account_balance(account.account_id, false).await
    }

    /// Sum of postings whose entry is settled
    pub async fn get_settled_balance(&self, account: &LedgerAccount) -> EngineResult<Cents> {
        self.store.account_balance(account.account_id, true).await
    }

    pub async fn ensure_account(
        &self,
        user_id: UserId,
        account_type: AccountType,
        label: &str,
    ) -> EngineResult<LedgerAccount> {
        self.store
            .ensure_account(user_id, account_type, &self.currency, label)
            .await
    }

    pub async fn cash_account(&self, user_id: UserId) -> EngineResult<LedgerAccount> {
        self.ensure_account(user_id, AccountType::Cash, MAIN_LABEL)
            .await
    }

    pub async fn custody_account(&self, user_id: UserId) -> EngineResult<LedgerAccount> {
        self.ensure_account(user_id, AccountType::Custody, MAIN_LABEL)
            .await
    }

    pub async fn liability_account(&self, user_id: UserId) -> EngineResult<LedgerAccount> {
        self.ensure_account(user_id, AccountType::Liability, MAIN_LABEL)
            .await
    }

    pub async fn house_accounts(&self) -> EngineResult<HouseAccounts> {
        Ok(HouseAccounts {
            clearing: self
                .ensure_account(HOUSE_USER_ID, AccountType::Cash, "clearing")
                .await?,
            fees: self
                .ensure_account(HOUSE_USER_ID, AccountType::Reserve, "fees")
                .await?,
        })
    }

    /// Amount the user currently owes on bridge advances
    pub async fn bridge_outstanding(&self, user_id: UserId) -> EngineResult<Cents> {
        let liability = self.liability_account(user_id).await?;
        let balance = self.get_account_balance(&liability).await?;
        Ok((-balance).max(0))
    }

    /// Advance cash against a future settlement. The advance is owed back
    /// through the user's liability account.
    pub async fn advance_bridge(
        &self,
        user_id: UserId,
        amount_cents: Cents,
        external_id: &str,
    ) -> EngineResult<JournalEntry> {
        if amount_cents <= 0 {
            return Err(EngineError::Validation(
                "bridge advance must be positive".into(),
            ));
        }
        let cash = self.cash_account(user_id).await?;
        let liability = self.liability_account(user_id).await?;
        self.post_entry(PostEntryRequest::new(
            BRIDGE_SOURCE,
            external_id,
            "bridge advance",
            vec![
                Posting::new(cash.account_id, amount_cents),
                Posting::new(liability.account_id, -amount_cents),
            ],
        ))
        .await
    }

    /// Mark a pending entry settled. Idempotent: settling twice is a no-op.
    pub async fn settle_entry(&self, source: &str, external_id: &str) -> EngineResult<JournalEntry> {
        let entry = self
            .store
            .mark_settled(source, external_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("entry ({source}, {external_id})")))?;
        tracing::info!(
            source = %source,
            external_id = %external_id,
            entry_id = %entry.entry_id,
            "Journal entry settled"
        );
        Ok(entry)
    }

    /// Admin view: every account with its balances
    pub async fn accounts_with_balances(&self) -> EngineResult<Vec<AccountBalance>> {
        let accounts = self.store.all_accounts().await?;
        let mut out = Vec::with_capacity(accounts.len());
        for account in accounts {
            let balance_cents = self.store.account_balance(account.account_id, false).await?;
            let settled_balance_cents = self.store.account_balance(account.account_id, true).await?;
            out.push(AccountBalance {
                account,
                balance_cents,
                settled_balance_cents,
            });
        }
        Ok(out)
    }

    /// Admin view: newest entries first
    pub async fn recent_entries(&self, limit: usize) -> EngineResult<Vec<JournalEntry>> {
        self.store.recent_entries(limit).await
    }

    pub async fn find_entry(
        &self,
        source: &str,
        external_id: &str,
    ) -> EngineResult<Option<JournalEntry>> {
        self.store.find_entry(source, external_id).await
    }

    pub async fn entries_for_user_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<JournalEntry>> {
        self.store.entries_for_user_since(user_id, since).await
    }

    pub async fn user_ids(&self) -> EngineResult<Vec<UserId>> {
        self.store.user_ids().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedgerStore;

    fn ledger() -> (Ledger, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        (Ledger::new(store.clone(), "USD"), store)
    }

    #[tokio::test]
    async fn test_duplicate_post_records_once() {
        let (ledger, store) = ledger();
        let cash = ledger.cash_account(1).await.unwrap();
        let custody = ledger.custody_account(1).await.unwrap();
        let req = PostEntryRequest::new(
            "cron",
            "a",
            "",
            vec![
                Posting::new(cash.account_id, -500),
                Posting::new(custody.account_id, 500),
            ],
        );

        let first = ledger.post_entry(req.clone()).await.unwrap();
        let second = ledger.post_entry(req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.entry_count().await, 1);
        assert_eq!(ledger.get_account_balance(&cash).await.unwrap(), -500);
        assert_eq!(ledger.get_account_balance(&custody).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_unbalanced_post_writes_nothing() {
        let (ledger, store) = ledger();
        let cash = ledger.cash_account(1).await.unwrap();
        let custody = ledger.custody_account(1).await.unwrap();
        let err = ledger
            .post_entry(PostEntryRequest::new(
                "admin",
                "bad",
                "",
                vec![
                    Posting::new(cash.account_id, -500),
                    Posting::new(custody.account_id, 400),
                ],
            ))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::UnbalancedEntry { sum: -100 });
        assert_eq!(store.entry_count().await, 0);
        assert_eq!(ledger.get_account_balance(&cash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_returns_original_even_if_resubmitted_differently() {
        let (ledger, _) = ledger();
        let cash = ledger.cash_account(1).await.unwrap();
        let custody = ledger.custody_account(1).await.unwrap();
        let original = ledger
            .post_entry(PostEntryRequest::new(
                "webhook",
                "evt-1",
                "",
                vec![
                    Posting::new(cash.account_id, 300),
                    Posting::new(custody.account_id, -300),
                ],
            ))
            .await
            .unwrap();
        let replay = ledger
            .post_entry(PostEntryRequest::new(
                "webhook",
                "evt-1",
                "",
                vec![
                    Posting::new(cash.account_id, 900),
                    Posting::new(custody.account_id, -900),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(original, replay);
        assert_eq!(ledger.get_account_balance(&cash).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_bridge_advance_creates_obligation() {
        let (ledger, _) = ledger();
        ledger.advance_bridge(4, 7_000, "adv-1").await.unwrap();
        ledger.advance_bridge(4, 7_000, "adv-1").await.unwrap();
        assert_eq!(ledger.bridge_outstanding(4).await.unwrap(), 7_000);
        let cash = ledger.cash_account(4).await.unwrap();
        assert_eq!(ledger.get_settled_balance(&cash).await.unwrap(), 7_000);
        assert!(ledger.advance_bridge(4, 0, "adv-2").await.is_err());
    }

    #[tokio::test]
    async fn test_settle_entry_and_admin_views() {
        let (ledger, _) = ledger();
        let cash = ledger.cash_account(2).await.unwrap();
        let house = ledger.house_accounts().await.unwrap();
        ledger
            .post_entry(
                PostEntryRequest::new(
                    "provider",
                    "dep-9",
                    "deposit",
                    vec![
                        Posting::new(house.clearing.account_id, -2_500),
                        Posting::new(cash.account_id, 2_500),
                    ],
                )
                .pending()
                .cross_user(),
            )
            .await
            .unwrap();
        assert_eq!(ledger.get_settled_balance(&cash).await.unwrap(), 0);

        ledger.settle_entry("provider", "dep-9").await.unwrap();
        ledger.settle_entry("provider", "dep-9").await.unwrap();
        assert_eq!(ledger.get_settled_balance(&cash).await.unwrap(), 2_500);
        assert!(matches!(
            ledger.settle_entry("provider", "missing").await,
            Err(EngineError::NotFound(_))
        ));

        let views = ledger.accounts_with_balances().await.unwrap();
        let total: Cents = views.iter().map(|v| v.balance_cents).sum();
        assert_eq!(total, 0);
        assert_eq!(ledger.recent_entries(10).await.unwrap().len(), 1);
        assert_eq!(ledger.user_ids().await.unwrap(), vec![2]);
    }
}
