use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_SCAN_BATCH;
use crate::model::*;
use crate::observability::{SCAN_DURATION_SECONDS, SCAN_LOANS_TOTAL};
use crate::store::DocumentStore;

use super::{Engine, EngineError};

/// Bounds for one scan invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Checkpoint from a previous partial scan: only activities with a larger id are visited.
    pub resume_after: Option<Ulid>,
    /// Stop after the activity during which this instant passes.
    pub deadline: Option<Instant>,
    /// Activities per store query; the engine's configured size when `None`.
    pub batch_size: Option<usize>,
}

impl ScanOptions {
    pub fn resume(after: Option<Ulid>) -> Self {
        Self {
            resume_after: after,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Activities visited, cancelled ones included.
    pub activities: usize,
    pub processed: usize,
    /// Loans this scan moved to `por_devolver`.
    pub succeeded: usize,
    /// Loans another writer had already moved on.
    pub unchanged: usize,
    pub failed: usize,
    /// Where the next invocation should resume. `None` once complete.
    pub resume_after: Option<Ulid>,
    /// Every ended activity up to the cutoff was visited.
    pub complete: bool,
}

impl<S: DocumentStore> Engine<S> {
    /// Move `en_uso` loans of ended activities to `por_devolver`.
    ///
    /// Idempotent: a second scan finds nothing to do. Per-loan failures are
    /// counted and skipped. Stops early at the deadline and reports the
    /// checkpoint to resume from.
    pub async fn scan_overdue(&self, options: ScanOptions) -> Result<ScanReport, EngineError> {
        self.run_scan(options, true).await
    }

    /// `invalidate_each`: drop matching overdue cache entries after every
    /// marked loan. The overdue listing scans with it off and invalidates
    /// once at the end, sparing its own in-flight key.
    pub(super) async fn run_scan(
        &self,
        options: ScanOptions,
        invalidate_each: bool,
    ) -> Result<ScanReport, EngineError> {
        let started = std::time::Instant::now();
        let cutoff = self.now().saturating_sub(self.config.overdue_grace_ms);
        let batch_size = options
            .batch_size
            .unwrap_or(self.config.scan_batch_size)
            .clamp(1, MAX_SCAN_BATCH);

        let mut report = ScanReport {
            resume_after: options.resume_after,
            ..ScanReport::default()
        };

        'batches: loop {
            let batch = self
                .store
                .activities_ended(cutoff, report.resume_after, batch_size)
                .await?;
            let exhausted = batch.len() < batch_size;

            for activity in batch {
                report.resume_after = Some(activity.id);
                report.activities += 1;
                if activity.state == ActivityState::Cancelled {
                    debug!(activity_id = %activity.id, "scan: skipping cancelled activity");
                } else {
                    self.scan_activity(activity, cutoff, invalidate_each, &mut report)
                        .await;
                }
                if options.deadline.is_some_and(|d| Instant::now() >= d) {
                    break 'batches;
                }
            }

            if exhausted {
                report.complete = true;
                report.resume_after = None;
                break;
            }
        }

        metrics::histogram!(SCAN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        metrics::counter!(SCAN_LOANS_TOTAL, "outcome" => "marked").increment(report.succeeded as u64);
        metrics::counter!(SCAN_LOANS_TOTAL, "outcome" => "unchanged").increment(report.unchanged as u64);
        metrics::counter!(SCAN_LOANS_TOTAL, "outcome" => "failed").increment(report.failed as u64);

        if report.succeeded > 0 || report.failed > 0 || !report.complete {
            info!(
                activities = report.activities,
                processed = report.processed,
                succeeded = report.succeeded,
                unchanged = report.unchanged,
                failed = report.failed,
                complete = report.complete,
                "overdue scan"
            );
        } else {
            debug!(activities = report.activities, "overdue scan: nothing to mark");
        }
        Ok(report)
    }

    async fn scan_activity(
        &self,
        activity: Activity,
        cutoff: Ms,
        invalidate_each: bool,
        report: &mut ScanReport,
    ) {
        let loans = match self
            .store
            .loans_by_activity(activity.id, Some(LoanState::InUse))
            .await
        {
            Ok(loans) => loans,
            Err(e) => {
                report.failed += 1;
                warn!(activity_id = %activity.id, error = %e, "scan: loan query failed");
                return;
            }
        };

        for loan in loans {
            report.processed += 1;
            match self.auto_mark(&loan, activity.clone(), cutoff).await {
                Ok(t) if t.changed => {
                    report.succeeded += 1;
                    debug!(loan_id = %loan.id, activity_id = %activity.id, "scan: marked pending return");
                    if invalidate_each {
                        self.invalidate_overdue(&t.loan);
                    }
                }
                Ok(_) => report.unchanged += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(loan_id = %loan.id, error = %e, "scan: transition failed");
                }
            }
        }
    }
}
