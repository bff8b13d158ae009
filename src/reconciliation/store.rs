use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core_types::UserId;
use crate::error::EngineResult;

use super::types::ReconciliationReport;

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn insert_report(&self, report: &ReconciliationReport) -> EngineResult<()>;

    /// Newest first
    async fn reports_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> EngineResult<Vec<ReconciliationReport>>;
}

#[derive(Default)]
pub struct MemoryReportStore {
    reports: RwLock<Vec<ReconciliationReport>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn insert_report(&self, report: &ReconciliationReport) -> EngineResult<()> {
        self.reports.write().await.push(report.clone());
        Ok(())
    }

    async fn reports_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> EngineResult<Vec<ReconciliationReport>> {
        let reports = self.reports.read().await;
        Ok(reports
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
