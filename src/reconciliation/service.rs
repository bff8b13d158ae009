//! Reconciliation Service
//!
//! Diffs the settlement provider's view of a user's cash activity against
//! the journal over a lookback window. Matching is by
//! `(source, external_id)`; the internal amount is the entry's net movement
//! on the user's cash account. Findings are persisted, never corrected.
//!
//! The provider dates events by `occurred_at`, the journal by `created_at`.
//! Both sides are fetched from `window_pad_hours` before the window start,
//! and a key is in scope when either side dates it inside the window, so an
//! event booked across the boundary still matches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::ReconciliationConfig;
use crate::core_types::{Cents, ReportId, UserId};
use crate::error::EngineResult;
use crate::ledger::Ledger;
use crate::providers::SettlementFeed;
use crate::retry::{retry_async, with_timeout};

use super::store::ReportStore;
use super::types::{
    Discrepancy, DiscrepancyKind, ReconciliationReport, ReportStatus, fingerprint,
};

/// Totals of one sweep over all users
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReconciliationSweep {
    pub users: usize,
    pub clean: usize,
    pub with_discrepancies: usize,
    pub failed: usize,
}

/// Compare both sides. Output is sorted, so equal inputs give equal output.
pub fn diff(
    internal: &BTreeMap<(String, String), Cents>,
    external: &BTreeMap<(String, String), Cents>,
) -> (Vec<Discrepancy>, usize) {
    let mut discrepancies = Vec::new();
    let mut matched = 0;
    for ((source, external_id), ext_amount) in external {
        match internal.get(&(source.clone(), external_id.clone())) {
            None => discrepancies.push(Discrepancy {
                source: source.clone(),
                external_id: external_id.clone(),
                kind: DiscrepancyKind::MissingInternal,
                internal_amount_cents: None,
                external_amount_cents: Some(*ext_amount),
            }),
            Some(int_amount) if int_amount != ext_amount => discrepancies.push(Discrepancy {
                source: source.clone(),
                external_id: external_id.clone(),
                kind: DiscrepancyKind::AmountMismatch,
                internal_amount_cents: Some(*int_amount),
                external_amount_cents: Some(*ext_amount),
            }),
            Some(_) => matched += 1,
        }
    }
    for ((source, external_id), int_amount) in internal {
        if !external.contains_key(&(source.clone(), external_id.clone())) {
            discrepancies.push(Discrepancy {
                source: source.clone(),
                external_id: external_id.clone(),
                kind: DiscrepancyKind::MissingExternal,
                internal_amount_cents: Some(*int_amount),
                external_amount_cents: None,
            });
        }
    }
    discrepancies.sort();
    (discrepancies, matched)
}

pub struct ReconciliationService {
    ledger: Arc<Ledger>,
    feed: Arc<dyn SettlementFeed>,
    reports: Arc<dyn ReportStore>,
    config: ReconciliationConfig,
}

impl ReconciliationService {
    pub fn new(
        ledger: Arc<Ledger>,
        feed: Arc<dyn SettlementFeed>,
        reports: Arc<dyn ReportStore>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            ledger,
            feed,
            reports,
            config,
        }
    }

    fn reconciled(&self, source: &str) -> bool {
        self.config.sources.iter().any(|s| s == source)
    }

    pub async fn reconcile_user(&self, user_id: UserId) -> EngineResult<ReconciliationReport> {
        let window_end = Utc::now();
        let window_start = window_end - chrono::Duration::days(self.config.lookback_days);
        let fetch_start = window_start - chrono::Duration::hours(self.config.window_pad_hours.max(0));
        let timeout = Duration::from_millis(self.config.provider_timeout_ms);

        let fetched = retry_async(
            |_| with_timeout("settlement activity", timeout, self.feed.activity(user_id, fetch_start)),
            self.config.retry_attempts.max(1),
            Duration::from_millis(self.config.retry_backoff_ms),
        )
        .await;

        let events = match fetched {
            Ok(events) => events,
            Err(e) => {
                error!(user_id, error = %e, "Settlement activity unavailable - reconciliation failed");
                let report = ReconciliationReport {
                    report_id: ReportId::new(),
                    user_id,
                    status: ReportStatus::Failed,
                    window_start,
                    window_end,
                    external_count: 0,
                    internal_count: 0,
                    matched_count: 0,
                    discrepancies: Vec::new(),
                    fingerprint: fingerprint(user_id, ReportStatus::Failed, &[]),
                    error: Some(e.to_string()),
                    created_at: window_end,
                };
                self.reports.insert_report(&report).await?;
                return Ok(report);
            }
        };

        // key -> (amount, dated inside the window)
        let mut external_all: BTreeMap<(String, String), (Cents, bool)> = BTreeMap::new();
        for event in events
            .into_iter()
            .filter(|e| e.occurred_at >= fetch_start && self.reconciled(&e.source))
        {
            let key = (event.source, event.external_id);
            if external_all.contains_key(&key) {
                warn!(user_id, source = %key.0, external_id = %key.1, "Provider reported duplicate event");
                continue;
            }
            external_all.insert(key, (event.amount_cents, event.occurred_at >= window_start));
        }

        let cash = self.ledger.cash_account(user_id).await?;
        let mut internal_all: BTreeMap<(String, String), (Cents, bool)> = BTreeMap::new();
        for entry in self
            .ledger
            .entries_for_user_since(user_id, fetch_start)
            .await?
            .into_iter()
            .filter(|e| self.reconciled(&e.external_source))
        {
            let net = entry.net_for(cash.account_id);
            let in_window = entry.created_at >= window_start;
            internal_all.insert((entry.external_source, entry.external_id), (net, in_window));
        }

        let in_scope: BTreeSet<&(String, String)> = external_all
            .iter()
            .chain(internal_all.iter())
            .filter(|(_, (_, in_window))| *in_window)
            .map(|(key, _)| key)
            .collect();
        let scoped = |side: &BTreeMap<(String, String), (Cents, bool)>| {
            side.iter()
                .filter(|(key, _)| in_scope.contains(key))
                .map(|(key, (amount, _))| (key.clone(), *amount))
                .collect::<BTreeMap<_, _>>()
        };
        let external = scoped(&external_all);
        let internal = scoped(&internal_all);

        let (discrepancies, matched_count) = diff(&internal, &external);
        let report = ReconciliationReport {
            report_id: ReportId::new(),
            user_id,
            status: ReportStatus::Completed,
            window_start,
            window_end,
            external_count: external.len(),
            internal_count: internal.len(),
            matched_count,
            fingerprint: fingerprint(user_id, ReportStatus::Completed, &discrepancies),
            discrepancies,
            error: None,
            created_at: window_end,
        };
        self.reports.insert_report(&report).await?;

        if report.discrepancies.is_empty() {
            info!(user_id, matched = matched_count, "Reconciliation clean");
        } else {
            warn!(
                user_id,
                report_id = %report.report_id,
                discrepancies = report.discrepancies.len(),
                fingerprint = %report.fingerprint,
                "Reconciliation found discrepancies"
            );
        }
        Ok(report)
    }

    /// Reconcile every user with ledger accounts
    pub async fn reconcile_all(&self) -> EngineResult<ReconciliationSweep> {
        let mut sweep = ReconciliationSweep::default();
        for user_id in self.ledger.user_ids().await? {
            sweep.users += 1;
            let report = self.reconcile_user(user_id).await?;
            match report.status {
                ReportStatus::Failed => sweep.failed += 1,
                ReportStatus::Completed if report.discrepancies.is_empty() => sweep.clean += 1,
                ReportStatus::Completed => sweep.with_discrepancies += 1,
            }
        }
        Ok(sweep)
    }

    pub async fn reports_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> EngineResult<Vec<ReconciliationReport>> {
        self.reports.reports_for_user(user_id, limit.max(1)).await
    }
}
