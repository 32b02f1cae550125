mod availability;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod scanner;

pub use availability::{Availability, Violation, can_lend, derive_availability, derived_state};
pub use error::{EngineError, ErrorKind};
pub use lifecycle::{IncidentEffect, MarkTrigger, MaterialChange, Transition, incident_effect};
pub use mutations::ReconcileReport;
pub use scanner::{ScanOptions, ScanReport};

use std::sync::{Arc, Mutex};

use tracing::warn;
use ulid::Ulid;

use crate::audit::{AuditHub, LedgerEvent};
use crate::cache::SingleFlightCache;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::model::*;
use crate::observability::{INTEGRITY_VIOLATIONS_TOTAL, TRANSITIONS_REJECTED_TOTAL};
use crate::store::DocumentStore;

type OverdueCache = SingleFlightCache<OverdueFilter, Vec<Loan>, EngineError>;

/// The loan ledger. Cheap to clone; clones share the store, cache and audit hub.
pub struct Engine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditHub>,
    overdue: Arc<OverdueCache>,
    /// Where the next on-demand listing scan resumes.
    listing_checkpoint: Arc<Mutex<Option<Ulid>>>,
    config: EngineConfig,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            audit: self.audit.clone(),
            overdue: self.overdue.clone(),
            listing_checkpoint: self.listing_checkpoint.clone(),
            config: self.config,
        }
    }
}

impl<S: DocumentStore> Engine<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditHub>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            overdue: Arc::new(SingleFlightCache::new(config.cache_ttl)),
            listing_checkpoint: Arc::default(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn audit(&self) -> &AuditHub {
        &self.audit
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(super) fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Integrity violations always reach the metric, the log and the audit feed.
    pub(super) fn surface(&self, violation: &Violation) {
        metrics::counter!(INTEGRITY_VIOLATIONS_TOTAL, "violation" => violation.label()).increment(1);
        warn!(%violation, "integrity violation");
        self.audit.send(
            violation.material_id(),
            LedgerEvent::IntegrityViolation(violation.clone()),
        );
    }

    /// Count a failed operation; violations carried by the error are surfaced.
    pub(super) fn rejected(&self, operation: &'static str, error: &EngineError) {
        metrics::counter!(
            TRANSITIONS_REJECTED_TOTAL,
            "operation" => operation,
            "kind" => error.kind().as_str()
        )
        .increment(1);
        if let EngineError::IntegrityViolation(v) = error {
            self.surface(v);
        }
    }

    /// Drop cached overdue listings that could contain `loan`.
    pub(super) fn invalidate_overdue(&self, loan: &Loan) {
        self.overdue.invalidate(|filter| filter.matches(loan));
    }

    /// Publish a committed loan transition. No-ops publish nothing.
    pub(super) fn publish(&self, transition: &Transition, event: LedgerEvent) {
        if let Some(v) = &transition.violation {
            self.surface(v);
        }
        if !transition.changed {
            return;
        }
        let material = &transition.material;
        self.audit.send(Some(material.id), event);
        if transition.material_before != material.state {
            self.audit.send(
                Some(material.id),
                LedgerEvent::MaterialStateChanged {
                    material_id: material.id,
                    from: transition.material_before,
                    to: material.state,
                },
            );
        }
    }

    pub(super) fn publish_material(&self, change: &MaterialChange) {
        if let Some(v) = &change.violation {
            self.surface(v);
        }
        let (before, after) = (&change.before, &change.material);
        if before.state != after.state {
            self.audit.send(
                Some(after.id),
                LedgerEvent::MaterialStateChanged {
                    material_id: after.id,
                    from: before.state,
                    to: after.state,
                },
            );
        }
        if before.total != after.total {
            self.audit.send(
                Some(after.id),
                LedgerEvent::MaterialTotalChanged {
                    material_id: after.id,
                    from: before.total,
                    to: after.total,
                },
            );
        }
    }
}
