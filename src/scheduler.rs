//! Periodic jobs
//!
//! Liquidation sweeps, hold expiry and reconciliation each run under a named
//! job lock, so with several instances sharing one database a job runs on
//! at most one of them per tick.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::EngineResult;
use crate::liquidation::SweepSummary;
use crate::reconciliation::ReconciliationSweep;
use crate::state::AppState;

pub const LIQUIDATION_LOCK: &str = "liquidation_sweep";
pub const HOLDS_LOCK: &str = "expire_holds";
pub const RECONCILIATION_LOCK: &str = "reconciliation_sweep";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome<T> {
    Completed { summary: T },
    /// Another instance holds the lock
    Skipped,
    Failed { error: String },
}

impl<T> JobOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }

    pub fn summary(&self) -> Option<&T> {
        match self {
            JobOutcome::Completed { summary } => Some(summary),
            _ => None,
        }
    }
}

/// One scheduler tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerRun {
    pub liquidation: JobOutcome<SweepSummary>,
    pub expired_holds: JobOutcome<usize>,
    pub reconciliation: JobOutcome<ReconciliationSweep>,
}

pub struct JobScheduler {
    state: AppState,
    interval: Duration,
}

impl JobScheduler {
    pub fn new(state: AppState) -> Self {
        let interval = Duration::from_secs(state.config.scheduler.interval_secs.max(1));
        Self { state, interval }
    }

    /// Run forever, one tick per interval
    pub async fn run(&self) -> ! {
        info!(
            interval_secs = self.interval.as_secs(),
            holder = self.state.locks.holder(),
            "Starting job scheduler"
        );

        loop {
            let run = self.run_once().await;
            debug!(?run, "Scheduler tick finished");
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn run_once(&self) -> SchedulerRun {
        let cfg = &self.state.config.scheduler;
        let liquidation = self
            .locked(LIQUIDATION_LOCK, cfg.liquidation_lock_ttl_secs, || {
                self.state.liquidation.sweep()
            })
            .await;
        let expired_holds = self
            .locked(HOLDS_LOCK, cfg.holds_lock_ttl_secs, || {
                self.state.holds.expire_holds(Utc::now())
            })
            .await;
        let reconciliation = self
            .locked(RECONCILIATION_LOCK, cfg.reconciliation_lock_ttl_secs, || {
                self.state.reconciliation.reconcile_all()
            })
            .await;

        SchedulerRun {
            liquidation,
            expired_holds,
            reconciliation,
        }
    }

    async fn locked<T, F, Fut>(&self, key: &str, ttl_secs: i64, job: F) -> JobOutcome<T>
    where
        T: std::fmt::Debug,
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let metadata = serde_json::json!({ "job": key, "started_at": Utc::now() });
        match self.state.locks.acquire(key, ttl_secs, metadata).await {
            Ok(acq) if acq.acquired => {}
            Ok(_) => {
                debug!(job = key, "Job skipped, lock held elsewhere");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                error!(job = key, error = %e, "Job lock acquisition failed");
                return JobOutcome::Failed {
                    error: e.to_string(),
                };
            }
        }

        let outcome = match job().await {
            Ok(summary) => {
                info!(job = key, ?summary, "Job completed");
                JobOutcome::Completed { summary }
            }
            Err(e) => {
                error!(job = key, error = %e, "Job failed");
                JobOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        if let Err(e) = self.state.locks.release(key).await {
            error!(job = key, error = %e, "Job lock release failed");
        }
        outcome
    }
}
