//! Scheduled jobs that keep stored reservations in step with the calendar.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{Engine, StoreError};
use crate::lifecycle::next_status;
use crate::model::*;
use crate::notify::Notifier;
use crate::scheduler::{Job, JobError, JobReport};
use crate::store::ReservationStore;

/// Moves `confirmed`/`checked_in` reservations to the status today implies.
///
/// Each change is compare-and-set on the status that was read, so a
/// concurrent cancellation wins and the item is skipped.
pub struct StatusReconciler {
    store: Arc<dyn ReservationStore>,
}

impl StatusReconciler {
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Job for StatusReconciler {
    fn name(&self) -> &'static str {
        "status_reconciliation"
    }

    async fn run(&self, today: NaiveDate, cancel: &CancellationToken) -> Result<JobReport, JobError> {
        let mut candidates = self.store.list_by_status(ReservationStatus::Confirmed).await?;
        candidates.extend(self.store.list_by_status(ReservationStatus::CheckedIn).await?);

        let mut report = JobReport { examined: candidates.len(), ..JobReport::default() };
        for r in candidates {
            if cancel.is_cancelled() {
                debug!("status reconciliation interrupted");
                break;
            }
            let Some(to) = next_status(r.status, &r.window, today) else {
                continue;
            };
            let change = StatusChange { id: r.id, from: r.status, to };
            // One change per call, so an outer error is still this item's failure.
            let results = match self.store.batch_update_status(vec![change]).await {
                Ok(results) => results,
                Err(e) => {
                    report.failed += 1;
                    warn!(reservation_id = %r.id, %to, error = %e, "status update failed");
                    continue;
                }
            };
            for (id, result) in results {
                match result {
                    Ok(()) => {
                        report.changed += 1;
                        metrics::counter!(
                            crate::observability::STATUS_TRANSITIONS_TOTAL,
                            "to" => to.as_str()
                        )
                        .increment(1);
                    }
                    Err(StoreError::StaleStatus { actual, .. }) => {
                        debug!(reservation_id = %id, %actual, "status moved concurrently, skipped");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(reservation_id = %id, %to, error = %e, "status update failed");
                    }
                }
            }
        }
        Ok(report)
    }
}

/// Sends a reminder for confirmed stays checking in exactly
/// `threshold_days` from today, then marks them reminded.
pub struct ReminderJob {
    store: Arc<dyn ReservationStore>,
    notifier: Arc<dyn Notifier>,
    threshold_days: u32,
}

impl ReminderJob {
    pub fn new(store: Arc<dyn ReservationStore>, notifier: Arc<dyn Notifier>, threshold_days: u32) -> Self {
        Self { store, notifier, threshold_days }
    }
}

#[async_trait]
impl Job for ReminderJob {
    fn name(&self) -> &'static str {
        "check_in_reminders"
    }

    async fn run(&self, today: NaiveDate, cancel: &CancellationToken) -> Result<JobReport, JobError> {
        let Some(target) = today.checked_add_days(Days::new(u64::from(self.threshold_days))) else {
            return Ok(JobReport::default());
        };
        let due: Vec<_> = self
            .store
            .list_upcoming_check_ins(today)
            .await?
            .into_iter()
            .filter(|u| u.window.check_in == target)
            .collect();

        let mut report = JobReport { examined: due.len(), ..JobReport::default() };
        if due.is_empty() || cancel.is_cancelled() {
            return Ok(report);
        }

        // Nothing is marked unless the notifier accepted the batch, so a
        // failed send is retried on the next run of the same day.
        self.notifier.remind(&due).await?;

        for u in &due {
            match self.store.mark_reminded(u.reservation_id).await {
                Ok(()) => report.changed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(reservation_id = %u.reservation_id, error = %e, "mark reminded failed");
                }
            }
        }
        metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL).increment(report.changed as u64);
        Ok(report)
    }
}

/// Compacts the WAL once enough appends accumulate.
pub struct CompactionJob {
    engine: Arc<Engine>,
    threshold: u64,
}

impl CompactionJob {
    pub fn new(engine: Arc<Engine>, threshold: u64) -> Self {
        Self { engine, threshold }
    }
}

#[async_trait]
impl Job for CompactionJob {
    fn name(&self) -> &'static str {
        "wal_compaction"
    }

    async fn run(&self, _today: NaiveDate, _cancel: &CancellationToken) -> Result<JobReport, JobError> {
        let appends = self.engine.wal_appends_since_compact().await;
        let mut report = JobReport { examined: appends as usize, ..JobReport::default() };
        if appends < self.threshold {
            return Ok(report);
        }
        if self.engine.compact_wal().await? {
            report.changed = 1;
        } else {
            debug!("compaction deferred, a house is busy");
        }
        Ok(report)
    }
}
