//! Liquidation task persistence seam

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::core_types::{Cents, TaskId, UserId};
use crate::error::EngineResult;

use super::state::LiquidationState;
use super::types::LiquidationTask;

/// Insert result when the user may already hold the active slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    Created(LiquidationTask),
    Existing(LiquidationTask),
}

#[async_trait]
pub trait LiquidationStore: Send + Sync {
    /// Insert a QUEUED task unless the user already has an active one
    async fn insert_if_idle(&self, task: &LiquidationTask) -> EngineResult<InsertResult>;

    async fn get(&self, task_id: TaskId) -> EngineResult<Option<LiquidationTask>>;

    /// The user's QUEUED or PROCESSING task
    async fn active_for_user(&self, user_id: UserId) -> EngineResult<Option<LiquidationTask>>;

    /// Most recently enqueued task of any state
    async fn latest_for_user(&self, user_id: UserId) -> EngineResult<Option<LiquidationTask>>;

    /// Claim up to `limit` tasks for `claim_token`: QUEUED ones, plus
    /// PROCESSING ones whose claim is older than `claim_ttl`
    async fn claim_batch(
        &self,
        limit: usize,
        claim_token: &str,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> EngineResult<Vec<LiquidationTask>>;

    /// PROCESSING -> DONE, only for the current claim holder
    async fn complete(
        &self,
        task_id: TaskId,
        claim_token: &str,
        liquidated_cents: Cents,
        residual_shortfall_cents: Cents,
    ) -> EngineResult<bool>;

    /// PROCESSING -> FAILED with attempts + 1, only for the current claim holder
    async fn fail(&self, task_id: TaskId, claim_token: &str, error: &str) -> EngineResult<bool>;

    /// FAILED -> QUEUED for tasks under `max_attempts` whose user has no
    /// other active task
    async fn requeue_failed(&self, max_attempts: i32) -> EngineResult<usize>;
}

#[derive(Default)]
pub struct MemoryLiquidationStore {
    tasks: Mutex<HashMap<TaskId, LiquidationTask>>,
}

impl MemoryLiquidationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<LiquidationTask> {
        let mut tasks: Vec<_> = self.tasks.lock().await.values().cloned().collect();
        tasks.sort_by_key(|t| (t.enqueued_at, t.task_id));
        tasks
    }
}

fn transition_if_claimed<'a>(
    task: Option<&'a mut LiquidationTask>,
    claim_token: &str,
) -> Option<&'a mut LiquidationTask> {
    task.filter(|t| {
        t.state == LiquidationState::Processing && t.claim_token.as_deref() == Some(claim_token)
    })
}

#[async_trait]
impl LiquidationStore for MemoryLiquidationStore {
    async fn insert_if_idle(&self, task: &LiquidationTask) -> EngineResult<InsertResult> {
        let mut tasks = self.tasks.lock().await;
        if let Some(active) = tasks
            .values()
            .find(|t| t.user_id == task.user_id && t.state.is_active())
        {
            return Ok(InsertResult::Existing(active.clone()));
        }
        tasks.insert(task.task_id, task.clone());
        Ok(InsertResult::Created(task.clone()))
    }

    async fn get(&self, task_id: TaskId) -> EngineResult<Option<LiquidationTask>> {
        Ok(self.tasks.lock().await.get(&task_id).cloned())
    }

    async fn active_for_user(&self, user_id: UserId) -> EngineResult<Option<LiquidationTask>> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .find(|t| t.user_id == user_id && t.state.is_active())
            .cloned())
    }

    async fn latest_for_user(&self, user_id: UserId) -> EngineResult<Option<LiquidationTask>> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.user_id == user_id)
            .max_by_key(|t| (t.enqueued_at, t.task_id))
            .cloned())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        claim_token: &str,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> EngineResult<Vec<LiquidationTask>> {
        let stale_before = now - claim_ttl;
        let mut tasks = self.tasks.lock().await;
        let mut claimable: Vec<TaskId> = tasks
            .values()
            .filter(|t| match t.state {
                LiquidationState::Queued => true,
                LiquidationState::Processing => t.claimed_at.is_some_and(|c| c < stale_before),
                _ => false,
            })
            .map(|t| t.task_id)
            .collect();
        claimable.sort_by_key(|id| tasks.get(id).map(|t| (t.enqueued_at, t.task_id)));
        claimable.truncate(limit);

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            if let Some(task) = tasks.get_mut(&id) {
                task.state = LiquidationState::Processing;
                task.claim_token = Some(claim_token.to_string());
                task.claimed_at = Some(now);
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        task_id: TaskId,
        claim_token: &str,
        liquidated_cents: Cents,
        residual_shortfall_cents: Cents,
    ) -> EngineResult<bool> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = transition_if_claimed(tasks.get_mut(&task_id), claim_token) else {
            return Ok(false);
        };
        task.state = LiquidationState::Done;
        task.liquidated_cents = liquidated_cents;
        task.residual_shortfall_cents = residual_shortfall_cents;
        task.error = None;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail(&self, task_id: TaskId, claim_token: &str, error: &str) -> EngineResult<bool> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = transition_if_claimed(tasks.get_mut(&task_id), claim_token) else {
            return Ok(false);
        };
        task.state = LiquidationState::Failed;
        task.attempts += 1;
        task.error = Some(error.to_string());
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn requeue_failed(&self, max_attempts: i32) -> EngineResult<usize> {
        let mut tasks = self.tasks.lock().await;
        let mut candidates: Vec<&LiquidationTask> = tasks
            .values()
            .filter(|t| t.state == LiquidationState::Failed && t.attempts < max_attempts)
            .filter(|t| {
                !tasks
                    .values()
                    .any(|o| o.user_id == t.user_id && o.state.is_active())
            })
            .collect();
        // One task per user: the newest
        candidates.sort_by_key(|t| (t.user_id, std::cmp::Reverse((t.enqueued_at, t.task_id))));
        candidates.dedup_by_key(|t| t.user_id);
        let ids: Vec<TaskId> = candidates.iter().map(|t| t.task_id).collect();

        let now = Utc::now();
        for id in &ids {
            if let Some(task) = tasks.get_mut(id) {
                task.state = LiquidationState::Queued;
                task.claim_token = None;
                task.claimed_at = None;
                task.updated_at = now;
            }
        }
        Ok(ids.len())
    }
}
