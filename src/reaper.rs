use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ScanOptions, ScanReport};
use crate::store::{DocumentStore, MemStore, StoreResult};

/// Periodically moves loans of ended activities to `por_devolver`.
/// A scan cut short by its budget resumes from its checkpoint next tick.
pub async fn run_overdue_scanner<S: DocumentStore>(engine: Engine<S>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let mut cursor = None;
    loop {
        interval.tick().await;
        if let Err(e) = scan_once(&engine, &mut cursor).await {
            error!(error = %e, "overdue scan failed");
        }
    }
}

/// One budgeted scan from `cursor`. The cursor advances on success and is
/// left alone on failure so the next tick retries the same range.
pub async fn scan_once<S: DocumentStore>(
    engine: &Engine<S>,
    cursor: &mut Option<Ulid>,
) -> Result<ScanReport, EngineError> {
    let mut options = ScanOptions::resume(*cursor);
    if let Some(budget) = engine.config().scan_budget {
        options = options.with_deadline(tokio::time::Instant::now() + budget);
    }
    let report = engine.scan_overdue(options).await?;
    *cursor = report.resume_after;
    Ok(report)
}

/// Periodically recomputes every material's counter from its loans.
pub async fn run_reconciler<S: DocumentStore>(engine: Engine<S>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately; skip it so startup isn't a full pass.
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(e) = engine.reconcile().await {
            error!(error = %e, "reconciliation failed");
        }
    }
}

/// Rewrites the WAL once enough commits have accumulated.
pub async fn run_compactor(store: Arc<MemStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            error!(error = %e, "WAL compaction failed");
        }
    }
}

pub async fn compact_if_needed(store: &MemStore, threshold: u64) -> StoreResult<bool> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return Ok(false);
    }
    store.compact_wal().await?;
    info!(appends, "WAL compacted");
    Ok(true)
}
