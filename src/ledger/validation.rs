//! Entry validation
//!
//! Shape and balance rules every journal entry passes before anything is
//! written. A failing entry is rejected whole.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core_types::{AccountId, UserId};
use crate::error::{EngineError, EngineResult};

use super::types::{LedgerAccount, PostEntryRequest};

const MAX_KEY_LEN: usize = 200;

/// Validate an entry request against the accounts it references
pub fn validate_entry(
    req: &PostEntryRequest,
    accounts: &HashMap<AccountId, LedgerAccount>,
) -> EngineResult<()> {
    validate_keys(req)?;

    if req.postings.is_empty() {
        return Err(EngineError::Validation("entry has no postings".into()));
    }

    let mut seen: HashSet<AccountId> = HashSet::with_capacity(req.postings.len());
    let mut users: BTreeSet<UserId> = BTreeSet::new();
    let mut currencies: BTreeSet<&str> = BTreeSet::new();
    let mut sum: i64 = 0;

    for posting in &req.postings {
        if posting.amount_cents == 0 {
            return Err(EngineError::Validation(format!(
                "zero-amount posting on account {}",
                posting.account_id
            )));
        }
        if !seen.insert(posting.account_id) {
            return Err(EngineError::Validation(format!(
                "account {} posted more than once",
                posting.account_id
            )));
        }
        let account = accounts.get(&posting.account_id).ok_or_else(|| {
            EngineError::NotFound(format!("ledger account {}", posting.account_id))
        })?;
        users.insert(account.user_id);
        currencies.insert(account.currency.as_str());

        sum = sum
            .checked_add(posting.amount_cents)
            .ok_or_else(|| EngineError::Validation("posting amounts overflow".into()))?;
    }

    if currencies.len() > 1 {
        return Err(EngineError::Validation(format!(
            "postings span currencies {:?}",
            currencies
        )));
    }

    match (users.len(), req.cross_user) {
        (1, _) => {}
        (2, true) => {}
        (2, false) => {
            return Err(EngineError::Validation(
                "postings span two users but the entry is not a cross-user transfer".into(),
            ));
        }
        (n, _) => {
            return Err(EngineError::Validation(format!(
                "postings span {n} users (at most a transfer pair is allowed)"
            )));
        }
    }

    if sum != 0 {
        return Err(EngineError::UnbalancedEntry { sum });
    }

    Ok(())
}

fn validate_keys(req: &PostEntryRequest) -> EngineResult<()> {
    if req.source.trim().is_empty() {
        return Err(EngineError::Validation("external_source is required".into()));
    }
    if req.external_id.trim().is_empty() {
        return Err(EngineError::Validation("external_id is required".into()));
    }
    if req.source.len() > MAX_KEY_LEN || req.external_id.len() > MAX_KEY_LEN {
        return Err(EngineError::Validation(format!(
            "external keys are limited to {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::{AccountType, Posting};
    use chrono::Utc;

    fn account(user_id: UserId, ty: AccountType, currency: &str) -> LedgerAccount {
        LedgerAccount {
            account_id: AccountId::new(),
            user_id,
            account_type: ty,
            currency: currency.into(),
            label: "main".into(),
            created_at: Utc::now(),
        }
    }

    fn index(accounts: &[&LedgerAccount]) -> HashMap<AccountId, LedgerAccount> {
        accounts
            .iter()
            .map(|a| (a.account_id, (*a).clone()))
            .collect()
    }

    #[test]
    fn test_balanced_entry_passes() {
        let cash = account(1, AccountType::Cash, "USD");
        let custody = account(1, AccountType::Custody, "USD");
        let req = PostEntryRequest::new(
            "cron",
            "a",
            "",
            vec![Posting::new(cash.account_id, -500), Posting::new(custody.account_id, 500)],
        );
        assert!(validate_entry(&req, &index(&[&cash, &custody])).is_ok());
    }

    #[test]
    fn test_unbalanced_entry_rejected() {
        let cash = account(1, AccountType::Cash, "USD");
        let custody = account(1, AccountType::Custody, "USD");
        let req = PostEntryRequest::new(
            "cron",
            "a",
            "",
            vec![Posting::new(cash.account_id, -500), Posting::new(custody.account_id, 499)],
        );
        assert_eq!(
            validate_entry(&req, &index(&[&cash, &custody])),
            Err(EngineError::UnbalancedEntry { sum: -1 })
        );
    }

    #[test]
    fn test_empty_and_zero_postings_rejected() {
        let cash = account(1, AccountType::Cash, "USD");
        let req = PostEntryRequest::new("cron", "a", "", vec![]);
        assert!(matches!(
            validate_entry(&req, &index(&[&cash])),
            Err(EngineError::Validation(_))
        ));

        let req = PostEntryRequest::new("cron", "a", "", vec![Posting::new(cash.account_id, 0)]);
        assert!(matches!(
            validate_entry(&req, &index(&[&cash])),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_repeated_account_rejected() {
        let cash = account(1, AccountType::Cash, "USD");
        let custody = account(1, AccountType::Custody, "USD");
        let req = PostEntryRequest::new(
            "cron",
            "a",
            "",
            vec![
                Posting::new(cash.account_id, -500),
                Posting::new(custody.account_id, 300),
                Posting::new(cash.account_id, 200),
            ],
        );
        assert!(matches!(
            validate_entry(&req, &index(&[&cash, &custody])),
            Err(EngineError::Validation(msg)) if msg.contains("more than once")
        ));
    }

    #[test]
    fn test_cross_user_requires_flag() {
        let a = account(1, AccountType::Cash, "USD");
        let b = account(2, AccountType::Cash, "USD");
        let postings = vec![Posting::new(a.account_id, -100), Posting::new(b.account_id, 100)];
        let accounts = index(&[&a, &b]);

        let req = PostEntryRequest::new("cmd", "x", "", postings.clone());
        assert!(matches!(
            validate_entry(&req, &accounts),
            Err(EngineError::Validation(_))
        ));

        let req = PostEntryRequest::new("cmd", "x", "", postings).cross_user();
        assert!(validate_entry(&req, &accounts).is_ok());
    }

    #[test]
    fn test_three_users_rejected_even_when_cross_user() {
        let a = account(1, AccountType::Cash, "USD");
        let b = account(2, AccountType::Cash, "USD");
        let c = account(3, AccountType::Cash, "USD");
        let req = PostEntryRequest::new(
            "cmd",
            "x",
            "",
            vec![
                Posting::new(a.account_id, -200),
                Posting::new(b.account_id, 100),
                Posting::new(c.account_id, 100),
            ],
        )
        .cross_user();
        assert!(matches!(
            validate_entry(&req, &index(&[&a, &b, &c])),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_account_and_mixed_currency() {
        let usd = account(1, AccountType::Cash, "USD");
        let eur = account(1, AccountType::Custody, "EUR");
        let req = PostEntryRequest::new(
            "cmd",
            "x",
            "",
            vec![Posting::new(usd.account_id, -1), Posting::new(eur.account_id, 1)],
        );
        assert!(matches!(
            validate_entry(&req, &index(&[&usd, &eur])),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_entry(&req, &index(&[&usd])),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_missing_external_keys() {
        let cash = account(1, AccountType::Cash, "USD");
        let req = PostEntryRequest::new(" ", "a", "", vec![Posting::new(cash.account_id, 1)]);
        assert!(matches!(
            validate_entry(&req, &index(&[&cash])),
            Err(EngineError::Validation(_))
        ));
    }
}
