//! Reconciliation report persistence (PostgreSQL)

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::core_types::UserId;
use crate::db::parse_id;
use crate::error::{EngineError, EngineResult};

use super::store::ReportStore;
use super::types::{ReconciliationReport, ReportStatus};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reconciliation_reports_tb (
    report_id      TEXT PRIMARY KEY,
    user_id        BIGINT NOT NULL,
    status         SMALLINT NOT NULL,
    window_start   TIMESTAMPTZ NOT NULL,
    window_end     TIMESTAMPTZ NOT NULL,
    external_count BIGINT NOT NULL,
    internal_count BIGINT NOT NULL,
    matched_count  BIGINT NOT NULL,
    discrepancies  JSONB NOT NULL,
    fingerprint    TEXT NOT NULL,
    error          TEXT,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_recon_reports_user ON reconciliation_reports_tb (user_id, created_at DESC);
"#;

pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_report(row: &PgRow) -> EngineResult<ReconciliationReport> {
        let report_id: String = row.try_get("report_id")?;
        let status_id: i16 = row.try_get("status")?;
        let discrepancies: serde_json::Value = row.try_get("discrepancies")?;
        let count = |col: &str| -> EngineResult<usize> {
            let n: i64 = row.try_get(col)?;
            Ok(n.max(0) as usize)
        };
        Ok(ReconciliationReport {
            report_id: parse_id(&report_id, "report_id")?,
            user_id: row.try_get("user_id")?,
            status: ReportStatus::from_id(status_id).ok_or_else(|| {
                EngineError::Internal(format!("Invalid report status: {status_id}"))
            })?,
            window_start: row.try_get("window_start")?,
            window_end: row.try_get("window_end")?,
            external_count: count("external_count")?,
            internal_count: count("internal_count")?,
            matched_count: count("matched_count")?,
            discrepancies: serde_json::from_value(discrepancies)?,
            fingerprint: row.try_get("fingerprint")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn insert_report(&self, report: &ReconciliationReport) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_reports_tb
                (report_id, user_id, status, window_start, window_end, external_count,
                 internal_count, matched_count, discrepancies, fingerprint, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(report.report_id.to_string())
        .bind(report.user_id)
        .bind(report.status.id())
        .bind(report.window_start)
        .bind(report.window_end)
        .bind(report.external_count as i64)
        .bind(report.internal_count as i64)
        .bind(report.matched_count as i64)
        .bind(serde_json::to_value(&report.discrepancies)?)
        .bind(&report.fingerprint)
        .bind(report.error.as_deref())
        .bind(report.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reports_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> EngineResult<Vec<ReconciliationReport>> {
        let rows = sqlx::query(
            r#"
            SELECT report_id, user_id, status, window_start, window_end, external_count,
                   internal_count, matched_count, discrepancies, fingerprint, error, created_at
            FROM reconciliation_reports_tb
            WHERE user_id = $1
            ORDER BY created_at DESC, report_id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_report).collect()
    }
}
