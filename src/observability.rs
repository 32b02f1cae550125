use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Ledger metrics (request-driven) ─────────────────────────────

/// Counter: loans opened.
pub const LOANS_OPENED_TOTAL: &str = "loanledger_loans_opened_total";

/// Counter: loans returned. Labels: incident (none|perdida|rotura|desgaste|otro).
pub const LOANS_RETURNED_TOTAL: &str = "loanledger_loans_returned_total";

/// Counter: loans moved to pending return. Labels: trigger (manual|overdue).
pub const LOANS_MARKED_PENDING_TOTAL: &str = "loanledger_loans_marked_pending_total";

/// Counter: transitions that were idempotent no-ops. Labels: operation.
pub const TRANSITION_NOOPS_TOTAL: &str = "loanledger_transition_noops_total";

/// Counter: rejected operations. Labels: operation, kind.
pub const TRANSITIONS_REJECTED_TOTAL: &str = "loanledger_transitions_rejected_total";

// ── Background jobs ─────────────────────────────────────────────

/// Histogram: one overdue scan invocation, in seconds.
pub const SCAN_DURATION_SECONDS: &str = "loanledger_scan_duration_seconds";

/// Counter: loans visited by the scanner. Labels: outcome (marked|unchanged|failed).
pub const SCAN_LOANS_TOTAL: &str = "loanledger_scan_loans_total";

/// Counter: materials whose stored counter or state was corrected.
pub const AVAILABILITY_CORRECTIONS_TOTAL: &str = "loanledger_availability_corrections_total";

/// Counter: integrity violations surfaced. Labels: violation.
pub const INTEGRITY_VIOLATIONS_TOTAL: &str = "loanledger_integrity_violations_total";

// ── Overdue cache ───────────────────────────────────────────────

/// Counter: overdue cache lookups. Labels: outcome (hit|miss|coalesced).
pub const CACHE_REQUESTS_TOTAL: &str = "loanledger_cache_requests_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "loanledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "loanledger_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Label for the incident carried by a return.
pub fn incident_label(kind: Option<crate::model::IncidentKind>) -> &'static str {
    kind.map_or("none", |k| k.as_str())
}
