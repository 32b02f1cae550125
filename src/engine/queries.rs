use std::sync::{Arc, MutexGuard, PoisonError};

use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::store::{DocumentStore, TxnScope};

use super::availability::{Availability, can_lend, derive_availability};
use super::scanner::ScanOptions;
use super::{Engine, EngineError};

impl<S: DocumentStore> Engine<S> {
    pub async fn material(&self, id: Ulid) -> Result<Material, EngineError> {
        self.store.material(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn loan(&self, id: Ulid) -> Result<Loan, EngineError> {
        self.store.loan(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Full loan history of a material, oldest first.
    pub async fn loans_for_material(&self, material_id: Ulid) -> Result<Vec<Loan>, EngineError> {
        self.material(material_id).await?;
        let mut loans = self.store.loans_by_material(material_id).await?;
        loans.sort_by_key(|l| (l.lent_at, l.id));
        Ok(loans)
    }

    /// Availability derived from the material's active loans, read inside a
    /// transaction so it cannot interleave with a transition.
    pub async fn availability(&self, material_id: Ulid) -> Result<Availability, EngineError> {
        let (availability, violation) = self
            .store
            .transact(TxnScope::material(material_id), |txn| {
                Ok::<_, EngineError>(derive_availability(txn.material(), txn.loans()))
            })
            .await?;
        if let Some(v) = &violation {
            self.surface(v);
        }
        Ok(availability)
    }

    pub async fn available_quantity(&self, material_id: Ulid) -> Result<u32, EngineError> {
        Ok(self.availability(material_id).await?.available)
    }

    pub async fn is_available(&self, material_id: Ulid, requested: u32) -> Result<bool, EngineError> {
        Ok(can_lend(&self.availability(material_id).await?, requested))
    }

    // ── Overdue ──────────────────────────────────────────────────

    /// Overdue loans matching `filter`, sorted by due date then id. Served
    /// from the TTL cache; concurrent misses share one computation.
    pub async fn list_overdue_loans(
        &self,
        filter: OverdueFilter,
    ) -> Result<Arc<Vec<Loan>>, EngineError> {
        let engine = self.clone();
        let key = filter.clone();
        self.overdue
            .get_or_compute(key, move || async move { engine.compute_overdue(filter).await })
            .await
    }

    pub async fn overdue_count(&self, filter: OverdueFilter) -> Result<usize, EngineError> {
        Ok(self.list_overdue_loans(filter).await?.len())
    }

    /// Scan, then query. A loan is overdue if it is `por_devolver`, or `en_uso`
    /// without an activity and past its caller-supplied due date plus grace.
    ///
    /// A budgeted scan resumes where the previous listing's scan stopped, so
    /// successive misses walk every ended activity in turn.
    async fn compute_overdue(&self, filter: OverdueFilter) -> Result<Vec<Loan>, EngineError> {
        let report = self.run_scan(self.listing_scan_options(), false).await?;
        *self.listing_checkpoint() = report.resume_after;
        if report.succeeded > 0 {
            // Our own key stays in flight so this result can be cached.
            self.overdue.invalidate(|k| *k != filter);
        }
        if !report.complete {
            debug!(resume_after = ?report.resume_after, "overdue listing served from a partial scan");
        }

        let now = self.now();
        let grace = self.config.overdue_grace_ms;
        let past_due = |l: &Loan| {
            l.state == LoanState::InUse
                && l.activity_id.is_none()
                && l.due_at.is_some_and(|d| d.saturating_add(grace) <= now)
        };

        let candidates = if let Some(activity_id) = filter.activity_id {
            self.store
                .loans_by_activity(activity_id, Some(LoanState::PendingReturn))
                .await?
        } else if let Some(material_id) = filter.material_id {
            self.store.loans_by_material(material_id).await?
        } else {
            let mut loans = self.store.loans_by_state(LoanState::PendingReturn).await?;
            loans.extend(self.store.loans_by_state(LoanState::InUse).await?);
            loans
        };

        let mut overdue: Vec<Loan> = candidates
            .into_iter()
            .filter(|l| (l.state == LoanState::PendingReturn || past_due(l)) && filter.matches(l))
            .collect();
        overdue.sort_by_key(|l| (l.due_at.unwrap_or(Ms::MAX), l.id));
        Ok(overdue)
    }

    fn listing_checkpoint(&self) -> MutexGuard<'_, Option<Ulid>> {
        self.listing_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listing_scan_options(&self) -> ScanOptions {
        ScanOptions {
            resume_after: *self.listing_checkpoint(),
            deadline: self
                .config
                .scan_budget
                .map(|budget| tokio::time::Instant::now() + budget),
            batch_size: None,
        }
    }
}
