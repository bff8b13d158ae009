//! Named TTL job locks
//!
//! A lock is a single row per key. Acquisition is one atomic conditional
//! write that succeeds only when no unexpired lease exists, so two instances
//! can never both see "expired" and both take the lock.

pub mod db;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::error::{EngineError, EngineResult};

pub use db::PgLockStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub lock_key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// `{acquired, lock?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockAcquisition {
    pub acquired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<JobLock>,
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` for `holder` unless an unexpired lease exists
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl_secs: i64,
        metadata: &serde_json::Value,
    ) -> EngineResult<Option<JobLock>>;

    /// Drop the lease if `holder` still owns it
    async fn release(&self, key: &str, holder: &str) -> EngineResult<bool>;
}

#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, JobLock>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl_secs: i64,
        metadata: &serde_json::Value,
    ) -> EngineResult<Option<JobLock>> {
        let now = Utc::now();
        let mut locks = self.locks.lock().await;
        if locks.get(key).is_some_and(|l| l.expires_at > now) {
            return Ok(None);
        }
        let lock = JobLock {
            lock_key: key.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            metadata: metadata.clone(),
        };
        locks.insert(key.to_string(), lock.clone());
        Ok(Some(lock))
    }

    async fn release(&self, key: &str, holder: &str) -> EngineResult<bool> {
        let mut locks = self.locks.lock().await;
        if locks.get(key).is_some_and(|l| l.holder == holder) {
            locks.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Per-instance handle onto the shared lock table
pub struct JobLocks {
    store: Arc<dyn LockStore>,
    holder: String,
}

impl JobLocks {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            holder: format!("node-{}", Ulid::new()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn acquire(
        &self,
        key: &str,
        ttl_secs: i64,
        metadata: serde_json::Value,
    ) -> EngineResult<LockAcquisition> {
        if key.trim().is_empty() {
            return Err(EngineError::Validation("lock key is empty".into()));
        }
        if ttl_secs <= 0 {
            return Err(EngineError::Validation(format!(
                "lock ttl must be positive, got {ttl_secs}"
            )));
        }
        let lock = self
            .store
            .try_acquire(key, &self.holder, ttl_secs, &metadata)
            .await?;
        match &lock {
            Some(l) => tracing::debug!(lock_key = key, holder = %self.holder, expires_at = %l.expires_at, "Lock acquired"),
            None => tracing::debug!(lock_key = key, "Lock held elsewhere"),
        }
        Ok(LockAcquisition {
            acquired: lock.is_some(),
            lock,
        })
    }

    pub async fn release(&self, key: &str) -> EngineResult<bool> {
        let released = self.store.release(key, &self.holder).await?;
        if !released {
            tracing::warn!(lock_key = key, holder = %self.holder, "Lock was not held at release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_holder() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let a = JobLocks::new(store.clone());
        let b = JobLocks::new(store);

        let first = a.acquire("liquidation", 60, serde_json::json!({})).await.unwrap();
        assert!(first.acquired);
        let second = b.acquire("liquidation", 60, serde_json::json!({})).await.unwrap();
        assert!(!second.acquired);
        assert!(second.lock.is_none());

        // Only the holder can release
        assert!(!b.release("liquidation").await.unwrap());
        assert!(a.release("liquidation").await.unwrap());
        assert!(b.acquire("liquidation", 60, serde_json::json!({})).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let store = Arc::new(MemoryLockStore::new());
        let stale = JobLock {
            lock_key: "holds".into(),
            holder: "dead-node".into(),
            acquired_at: Utc::now() - chrono::Duration::seconds(120),
            expires_at: Utc::now() - chrono::Duration::seconds(60),
            metadata: serde_json::Value::Null,
        };
        store.locks.lock().await.insert("holds".into(), stale);

        let locks = JobLocks::new(store);
        let got = locks
            .acquire("holds", 30, serde_json::json!({"job": "expire_holds"}))
            .await
            .unwrap();
        assert!(got.acquired);
        assert_eq!(got.lock.unwrap().holder, locks.holder());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = JobLocks::new(store.clone());
            handles.push(tokio::spawn(async move {
                locks.acquire("recon", 60, serde_json::Value::Null).await.unwrap().acquired
            }));
        }
        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let locks = JobLocks::new(Arc::new(MemoryLockStore::new()));
        assert!(locks.acquire("", 10, serde_json::Value::Null).await.is_err());
        assert!(locks.acquire("k", 0, serde_json::Value::Null).await.is_err());
    }
}
