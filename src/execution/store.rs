use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::core_types::{QuoteId, UserId};
use crate::error::EngineResult;

use super::types::{Quote, Receipt};

#[async_trait]
pub trait QuoteStore: Send + Sync {
    async fn insert_quote(&self, quote: &Quote) -> EngineResult<()>;

    async fn get_quote(&self, quote_id: QuoteId) -> EngineResult<Option<Quote>>;
}

/// Outcome of inserting a receipt keyed by `(user_id, idempotency_key)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptInsert {
    Created(Receipt),
    Existing(Receipt),
}

impl ReceiptInsert {
    pub fn into_receipt(self) -> Receipt {
        match self {
            ReceiptInsert::Created(r) | ReceiptInsert::Existing(r) => r,
        }
    }
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    async fn insert_receipt(&self, receipt: &Receipt) -> EngineResult<ReceiptInsert>;

    async fn find_receipt(
        &self,
        user_id: UserId,
        idempotency_key: &str,
    ) -> EngineResult<Option<Receipt>>;

    /// Newest first
    async fn list_for_user(&self, user_id: UserId, limit: usize) -> EngineResult<Vec<Receipt>>;
}

#[derive(Default)]
pub struct MemoryExecutionStore {
    quotes: DashMap<QuoteId, Quote>,
    receipts: DashMap<(UserId, String), Receipt>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuoteStore for MemoryExecutionStore {
    async fn insert_quote(&self, quote: &Quote) -> EngineResult<()> {
        self.quotes.insert(quote.quote_id, quote.clone());
        Ok(())
    }

    async fn get_quote(&self, quote_id: QuoteId) -> EngineResult<Option<Quote>> {
        Ok(self.quotes.get(&quote_id).map(|q| q.clone()))
    }
}

#[async_trait]
impl ReceiptStore for MemoryExecutionStore {
    async fn insert_receipt(&self, receipt: &Receipt) -> EngineResult<ReceiptInsert> {
        match self
            .receipts
            .entry((receipt.user_id, receipt.idempotency_key.clone()))
        {
            Entry::Occupied(existing) => Ok(ReceiptInsert::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(receipt.clone());
                Ok(ReceiptInsert::Created(receipt.clone()))
            }
        }
    }

    async fn find_receipt(
        &self,
        user_id: UserId,
        idempotency_key: &str,
    ) -> EngineResult<Option<Receipt>> {
        Ok(self
            .receipts
            .get(&(user_id, idempotency_key.to_string()))
            .map(|r| r.clone()))
    }

    async fn list_for_user(&self, user_id: UserId, limit: usize) -> EngineResult<Vec<Receipt>> {
        let mut receipts: Vec<Receipt> = self
            .receipts
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        receipts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.receipt_id.cmp(&a.receipt_id))
        });
        receipts.truncate(limit);
        Ok(receipts)
    }
}
