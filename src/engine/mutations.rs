use serde_json::Value;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::audit::LedgerEvent;
use crate::document::{loan_from_document, material_from_document};
use crate::limits::*;
use crate::model::*;
use crate::observability::*;
use crate::store::{DocumentStore, MaterialTxn, TxnScope};

use super::availability::{derive_availability, derived_state};
use super::lifecycle::{self, MarkTrigger, MaterialChange, Transition};
use super::{Engine, EngineError};

/// Outcome of a reconciliation pass over every material.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub processed: usize,
    pub corrected: usize,
    pub failed: usize,
    pub violations: usize,
}

fn validate_user(user_id: &str) -> Result<(), EngineError> {
    if user_id.trim().is_empty() {
        return Err(EngineError::InvalidRequest("usuarioId is required"));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

fn validate_quantity(quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 {
        return Err(EngineError::InvalidRequest("quantity must be positive"));
    }
    if quantity > MAX_MATERIAL_QUANTITY {
        return Err(EngineError::LimitExceeded("quantity too large"));
    }
    Ok(())
}

impl<S: DocumentStore> Engine<S> {
    /// Run `f` in a transaction scoped to `loan_id` and its material.
    async fn loan_txn<T, F>(&self, loan_id: Ulid, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut MaterialTxn) -> Result<T, EngineError> + Send + 'static,
    {
        let loan = self
            .store
            .loan(loan_id)
            .await?
            .ok_or(EngineError::NotFound(loan_id))?;
        self.store
            .transact(TxnScope::loan(loan.material_id, loan_id), f)
            .await
    }

    // ── Loans ────────────────────────────────────────────────────

    /// Open a loan. When an activity is given, its end date becomes the due date.
    pub async fn create_loan(&self, request: LoanRequest) -> Result<Loan, EngineError> {
        self.try_create_loan(request)
            .await
            .inspect_err(|e| self.rejected("create_loan", e))
    }

    async fn try_create_loan(&self, request: LoanRequest) -> Result<Loan, EngineError> {
        validate_quantity(request.quantity)?;
        validate_user(&request.user_id)?;

        let due_at = match request.activity_id {
            Some(activity_id) => {
                let activity = self
                    .store
                    .activity(activity_id)
                    .await?
                    .ok_or(EngineError::NotFound(activity_id))?;
                if activity.state == ActivityState::Cancelled {
                    return Err(EngineError::InvalidRequest("activity is cancelled"));
                }
                Some(activity.ends_at)
            }
            None => request.due_at,
        };

        let loan = Loan {
            id: Ulid::new(),
            material_id: request.material_id,
            user_id: request.user_id,
            activity_id: request.activity_id,
            quantity: request.quantity,
            lent_at: self.now(),
            due_at,
            returned_at: None,
            state: LoanState::InUse,
            auto_marked: false,
            incident: None,
        };
        let t = self
            .store
            .transact(TxnScope::material(loan.material_id), move |txn| {
                lifecycle::open_loan(txn, loan)
            })
            .await?;

        metrics::counter!(LOANS_OPENED_TOTAL).increment(1);
        info!(
            loan_id = %t.loan.id,
            material_id = %t.loan.material_id,
            quantity = t.loan.quantity,
            available = t.availability.available,
            "loan opened"
        );
        self.invalidate_overdue(&t.loan);
        self.publish(&t, LedgerEvent::LoanOpened { loan: t.loan.clone() });
        Ok(t.loan)
    }

    /// `en_uso → por_devolver`, by a human. Idempotent.
    pub async fn mark_pending_return(&self, loan_id: Ulid) -> Result<Transition, EngineError> {
        let t = self
            .loan_txn(loan_id, move |txn| {
                lifecycle::mark_pending(txn, loan_id, MarkTrigger::Manual)
            })
            .await
            .inspect_err(|e| self.rejected("mark_pending_return", e))?;

        if t.changed {
            metrics::counter!(LOANS_MARKED_PENDING_TOTAL, "trigger" => "manual").increment(1);
            info!(%loan_id, "loan marked pending return");
            self.invalidate_overdue(&t.loan);
        } else {
            metrics::counter!(TRANSITION_NOOPS_TOTAL, "operation" => "mark_pending_return")
                .increment(1);
            debug!(%loan_id, state = %t.loan.state, "mark pending: no-op");
        }
        self.publish(
            &t,
            LedgerEvent::LoanMarkedPending {
                loan_id,
                material_id: t.loan.material_id,
                automatic: false,
            },
        );
        Ok(t)
    }

    /// Scanner path: re-checks the overdue guard inside the transaction.
    pub(super) async fn auto_mark(
        &self,
        loan: &Loan,
        activity: Activity,
        cutoff: Ms,
    ) -> Result<Transition, EngineError> {
        let loan_id = loan.id;
        let t = self
            .store
            .transact(TxnScope::loan(loan.material_id, loan_id), move |txn| {
                lifecycle::mark_pending(txn, loan_id, MarkTrigger::Overdue { activity, cutoff })
            })
            .await?;
        if t.changed {
            metrics::counter!(LOANS_MARKED_PENDING_TOTAL, "trigger" => "overdue").increment(1);
        }
        self.publish(
            &t,
            LedgerEvent::LoanMarkedPending {
                loan_id,
                material_id: t.loan.material_id,
                automatic: true,
            },
        );
        Ok(t)
    }

    /// `en_uso | por_devolver → devuelto`, restoring availability in the same
    /// transaction. With an incident, the material effect is applied too.
    pub async fn return_loan(
        &self,
        loan_id: Ulid,
        incident: Option<Incident>,
    ) -> Result<Transition, EngineError> {
        self.try_return_loan(loan_id, incident)
            .await
            .inspect_err(|e| self.rejected("return_loan", e))
    }

    async fn try_return_loan(
        &self,
        loan_id: Ulid,
        incident: Option<Incident>,
    ) -> Result<Transition, EngineError> {
        if let Some(i) = &incident
            && i.description.len() > MAX_DESCRIPTION_LEN
        {
            return Err(EngineError::LimitExceeded("incident description too long"));
        }
        let now = self.now();
        let t = self
            .loan_txn(loan_id, move |txn| lifecycle::close_loan(txn, loan_id, incident, now))
            .await?;

        let incident_kind = t.loan.incident.as_ref().map(|i| i.kind);
        if t.changed {
            metrics::counter!(LOANS_RETURNED_TOTAL, "incident" => incident_label(incident_kind))
                .increment(1);
            info!(
                %loan_id,
                material_id = %t.loan.material_id,
                incident = incident_label(incident_kind),
                material_state = %t.material.state,
                available = t.availability.available,
                "loan returned"
            );
            self.invalidate_overdue(&t.loan);
        } else {
            metrics::counter!(TRANSITION_NOOPS_TOTAL, "operation" => "return_loan").increment(1);
            debug!(%loan_id, "return: already returned");
        }
        self.publish(
            &t,
            LedgerEvent::LoanReturned {
                loan_id,
                material_id: t.loan.material_id,
                incident: incident_kind,
            },
        );
        Ok(t)
    }

    /// `por_devolver → en_uso`. Human correction for a loan marked in error.
    pub async fn revert_pending_return(&self, loan_id: Ulid) -> Result<Transition, EngineError> {
        let t = self
            .loan_txn(loan_id, move |txn| lifecycle::reopen(txn, loan_id))
            .await
            .inspect_err(|e| self.rejected("revert_pending_return", e))?;
        if t.changed {
            info!(%loan_id, "pending return reverted");
            self.invalidate_overdue(&t.loan);
        } else {
            metrics::counter!(TRANSITION_NOOPS_TOTAL, "operation" => "revert_pending_return")
                .increment(1);
        }
        self.publish(
            &t,
            LedgerEvent::LoanReopened {
                loan_id,
                material_id: t.loan.material_id,
            },
        );
        Ok(t)
    }

    // ── Materials ────────────────────────────────────────────────

    pub async fn create_material(&self, new: NewMaterial) -> Result<Material, EngineError> {
        self.try_create_material(new)
            .await
            .inspect_err(|e| self.rejected("create_material", e))
    }

    async fn try_create_material(&self, new: NewMaterial) -> Result<Material, EngineError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidRequest("nombre is required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("material name too long"));
        }
        validate_quantity(new.total)?;
        if new.kind == MaterialKind::Rope && new.total != 1 {
            return Err(EngineError::InvalidRequest("ropes are tracked one per record"));
        }

        let material = Material::new(Ulid::new(), name.to_string(), new.kind, new.total);
        self.store.insert_material(material.clone()).await?;
        info!(material_id = %material.id, kind = ?material.kind, total = material.total, "material created");
        self.audit.send(
            Some(material.id),
            LedgerEvent::MaterialCreated {
                material: material.clone(),
            },
        );
        Ok(material)
    }

    /// Administrative state change; availability recomputed in the same transaction.
    pub async fn set_material_state(
        &self,
        material_id: Ulid,
        state: MaterialState,
    ) -> Result<MaterialChange, EngineError> {
        let change = self
            .store
            .transact(TxnScope::material(material_id), move |txn| {
                lifecycle::change_material_state(txn, state)
            })
            .await
            .inspect_err(|e| self.rejected("set_material_state", e))?;
        if change.changed {
            info!(%material_id, from = %change.before.state, to = %change.material.state, "material state set");
        }
        self.publish_material(&change);
        Ok(change)
    }

    /// Restock or correct a quantifiable material's owned quantity.
    pub async fn set_total_quantity(
        &self,
        material_id: Ulid,
        total: u32,
    ) -> Result<MaterialChange, EngineError> {
        let result = if total > MAX_MATERIAL_QUANTITY {
            Err(EngineError::LimitExceeded("quantity too large"))
        } else {
            self.store
                .transact(TxnScope::material(material_id), move |txn| {
                    lifecycle::set_total(txn, total)
                })
                .await
        };
        let change = result.inspect_err(|e| self.rejected("set_total_quantity", e))?;
        if change.changed {
            info!(%material_id, from = change.before.total, to = total, "material total set");
        }
        self.publish_material(&change);
        Ok(change)
    }

    /// Recompute every material's counter and state from its loans.
    /// Per-material failures are logged and counted; the pass continues.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let materials = self.store.materials().await?;
        let mut report = ReconcileReport::default();

        for material in materials {
            report.processed += 1;
            let result = self
                .store
                .transact(TxnScope::material(material.id), |txn| {
                    Ok::<_, EngineError>(lifecycle::reconcile_material(txn))
                })
                .await;
            let change = match result {
                Ok(change) => change,
                Err(e) => {
                    report.failed += 1;
                    warn!(material_id = %material.id, error = %e, "reconcile failed");
                    continue;
                }
            };
            if change.violation.is_some() {
                report.violations += 1;
            }
            if change.changed {
                report.corrected += 1;
                metrics::counter!(AVAILABILITY_CORRECTIONS_TOTAL).increment(1);
                info!(
                    material_id = %material.id,
                    stored = change.before.available,
                    derived = change.material.available,
                    "availability corrected"
                );
                self.audit.send(
                    Some(material.id),
                    LedgerEvent::AvailabilityCorrected {
                        material_id: material.id,
                        stored: change.before.available,
                        derived: change.material.available,
                    },
                );
            }
            self.publish_material(&change);
        }

        if report.corrected > 0 || report.failed > 0 || report.violations > 0 {
            info!(
                processed = report.processed,
                corrected = report.corrected,
                failed = report.failed,
                violations = report.violations,
                "reconciliation finished"
            );
        } else {
            debug!(processed = report.processed, "reconciliation: nothing to correct");
        }
        Ok(report)
    }

    // ── Historical documents ─────────────────────────────────────

    /// Adopt a material document. The display counter is recomputed, never copied.
    pub async fn import_material(&self, doc: &Value) -> Result<Material, EngineError> {
        self.try_import_material(doc)
            .await
            .inspect_err(|e| self.rejected("import_material", e))
    }

    async fn try_import_material(&self, doc: &Value) -> Result<Material, EngineError> {
        let (mut material, violation) = material_from_document(doc)?;
        let (availability, _) = derive_availability(&material, std::iter::empty());
        material.available = availability.available;
        material.state = derived_state(&availability);

        self.store.insert_material(material.clone()).await?;
        if let Some(v) = &violation {
            self.surface(v);
        }
        info!(material_id = %material.id, "material imported");
        self.audit.send(
            Some(material.id),
            LedgerEvent::MaterialCreated {
                material: material.clone(),
            },
        );
        Ok(material)
    }

    /// Adopt a loan document as historical fact. Overcommitment is accepted
    /// and surfaced; the material's counter is recomputed in the same transaction.
    pub async fn import_loan(&self, doc: &Value) -> Result<Transition, EngineError> {
        self.try_import_loan(doc)
            .await
            .inspect_err(|e| self.rejected("import_loan", e))
    }

    async fn try_import_loan(&self, doc: &Value) -> Result<Transition, EngineError> {
        let loan = loan_from_document(doc)?;
        if self.store.loan(loan.id).await?.is_some() {
            return Err(EngineError::AlreadyExists(loan.id));
        }
        let t = self
            .store
            .transact(TxnScope::loan(loan.material_id, loan.id), move |txn| {
                lifecycle::adopt_loan(txn, loan)
            })
            .await?;
        info!(loan_id = %t.loan.id, material_id = %t.loan.material_id, state = %t.loan.state, "loan imported");
        self.invalidate_overdue(&t.loan);
        self.publish(
            &t,
            LedgerEvent::LoanImported {
                loan_id: t.loan.id,
                material_id: t.loan.material_id,
            },
        );
        Ok(t)
    }
}
