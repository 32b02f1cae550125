//! Loan and material transitions.
//!
//! Everything here is synchronous and runs inside a store transaction: the
//! guards see the same snapshot the writes are committed against, and every
//! path that touches a loan recomputes the material's counter before the
//! transaction commits.

use ulid::Ulid;

use crate::model::*;
use crate::store::MaterialTxn;

use super::availability::{Availability, Violation, can_lend, derive_availability, derived_state};
use super::error::EngineError;

/// Result of a loan transition, as committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub loan: Loan,
    /// False for idempotent no-ops; nothing was written.
    pub changed: bool,
    pub material_before: MaterialState,
    pub material: Material,
    pub availability: Availability,
    pub violation: Option<Violation>,
}

/// Result of an administrative change to a material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialChange {
    pub changed: bool,
    pub before: Material,
    pub material: Material,
    pub availability: Availability,
    pub violation: Option<Violation>,
}

/// Who is moving a loan to pending return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkTrigger {
    Manual,
    /// The overdue scanner, acting on `activity` with the given cutoff.
    Overdue { activity: Activity, cutoff: Ms },
}

/// What an incident does to the material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentEffect {
    WriteOff,
    Maintenance,
    None,
}

pub fn incident_effect(kind: IncidentKind) -> IncidentEffect {
    match kind {
        IncidentKind::Loss => IncidentEffect::WriteOff,
        IncidentKind::Breakage | IncidentKind::Wear => IncidentEffect::Maintenance,
        IncidentKind::Other => IncidentEffect::None,
    }
}

/// Recompute the counter and derived state; write back only on change.
pub fn refresh_material(txn: &mut MaterialTxn) -> (Availability, Option<Violation>) {
    let (mut availability, violation) = derive_availability(txn.material(), txn.loans());
    let state = derived_state(&availability);
    let m = txn.material();
    if m.available != availability.available || m.state != state {
        let m = txn.material_mut();
        m.available = availability.available;
        m.state = state;
    }
    availability.state = state;
    (availability, violation)
}

fn settle(txn: &mut MaterialTxn, loan: Loan, material_before: MaterialState, changed: bool) -> Transition {
    let (availability, violation) = if changed {
        refresh_material(txn)
    } else {
        derive_availability(txn.material(), txn.loans())
    };
    Transition {
        loan,
        changed,
        material_before,
        material: txn.material().clone(),
        availability,
        violation,
    }
}

fn focus(txn: &MaterialTxn, loan_id: Ulid) -> Result<Loan, EngineError> {
    txn.loan(loan_id).cloned().ok_or(EngineError::NotFound(loan_id))
}

/// Apply `edit` to the focus loan and return the updated copy.
fn edit_loan(
    txn: &mut MaterialTxn,
    loan_id: Ulid,
    edit: impl FnOnce(&mut Loan),
) -> Result<Loan, EngineError> {
    let loan = txn.loan_mut(loan_id).ok_or(EngineError::NotFound(loan_id))?;
    edit(loan);
    Ok(loan.clone())
}

// ── Loan transitions ──────────────────────────────────────────────

/// `∅ → en_uso`. The loan is inserted only if availability covers it.
pub fn open_loan(txn: &mut MaterialTxn, loan: Loan) -> Result<Transition, EngineError> {
    let material_before = txn.material().state;
    let (availability, violation) = derive_availability(txn.material(), txn.loans());
    if let Some(v) = violation {
        return Err(EngineError::IntegrityViolation(v));
    }
    if !can_lend(&availability, loan.quantity) {
        return Err(EngineError::InsufficientAvailability {
            material_id: availability.material_id,
            requested: loan.quantity,
            available: availability.available,
        });
    }
    txn.insert_loan(loan.clone());
    Ok(settle(txn, loan, material_before, true))
}

/// `en_uso → por_devolver`. No-op on `por_devolver` and `devuelto`.
pub fn mark_pending(
    txn: &mut MaterialTxn,
    loan_id: Ulid,
    trigger: MarkTrigger,
) -> Result<Transition, EngineError> {
    let material_before = txn.material().state;
    let loan = focus(txn, loan_id)?;
    if loan.state != LoanState::InUse {
        return Ok(settle(txn, loan, material_before, false));
    }

    let automatic = match &trigger {
        MarkTrigger::Manual => false,
        MarkTrigger::Overdue { activity, cutoff } => {
            let due = loan.activity_id == Some(activity.id)
                && activity.state != ActivityState::Cancelled
                && activity.ends_at <= *cutoff;
            if !due {
                return Err(EngineError::InvalidTransition {
                    loan_id,
                    from: loan.state,
                    action: "auto-mark",
                });
            }
            true
        }
    };

    let loan = edit_loan(txn, loan_id, |l| {
        l.state = LoanState::PendingReturn;
        l.auto_marked = automatic;
    })?;
    Ok(settle(txn, loan, material_before, true))
}

/// `por_devolver → en_uso`. Human correction only.
pub fn reopen(txn: &mut MaterialTxn, loan_id: Ulid) -> Result<Transition, EngineError> {
    let material_before = txn.material().state;
    let loan = focus(txn, loan_id)?;
    match loan.state {
        LoanState::InUse => Ok(settle(txn, loan, material_before, false)),
        LoanState::Returned => Err(EngineError::InvalidTransition {
            loan_id,
            from: loan.state,
            action: "reopen",
        }),
        LoanState::PendingReturn => {
            let loan = edit_loan(txn, loan_id, |l| {
                l.state = LoanState::InUse;
                l.auto_marked = false;
            })?;
            Ok(settle(txn, loan, material_before, true))
        }
    }
}

/// `en_uso | por_devolver → devuelto`, optionally with an incident.
///
/// A returned loan is immutable: a plain return is a no-op, and repeating
/// the exact incident already recorded is a no-op. Anything else is rejected.
pub fn close_loan(
    txn: &mut MaterialTxn,
    loan_id: Ulid,
    incident: Option<Incident>,
    now: Ms,
) -> Result<Transition, EngineError> {
    let material_before = txn.material().state;
    let loan = focus(txn, loan_id)?;
    if loan.state == LoanState::Returned {
        return match &incident {
            Some(i) if loan.incident.as_ref() != Some(i) => Err(EngineError::InvalidTransition {
                loan_id,
                from: loan.state,
                action: "attach an incident to",
            }),
            _ => Ok(settle(txn, loan, material_before, false)),
        };
    }

    let effect = incident.as_ref().map(|i| incident_effect(i.kind));
    let loan = edit_loan(txn, loan_id, |l| {
        l.state = LoanState::Returned;
        l.returned_at = Some(now);
        l.incident = incident;
    })?;
    if let Some(effect) = effect {
        apply_incident_effect(txn, effect, loan.quantity);
    }
    Ok(settle(txn, loan, material_before, true))
}

fn apply_incident_effect(txn: &mut MaterialTxn, effect: IncidentEffect, quantity: u32) {
    match effect {
        IncidentEffect::WriteOff => {
            let m = txn.material_mut();
            if m.is_unique() {
                m.state = MaterialState::Lost;
            } else {
                m.total = m.total.saturating_sub(quantity);
                if m.total == 0 {
                    m.state = MaterialState::Lost;
                }
            }
        }
        IncidentEffect::Maintenance => {
            if !matches!(
                txn.material().state,
                MaterialState::Lost | MaterialState::Retired
            ) {
                txn.material_mut().state = MaterialState::Maintenance;
            }
        }
        IncidentEffect::None => {}
    }
}

/// Adopt a historical loan as-is. Overcommitment is accepted and reported.
pub fn adopt_loan(txn: &mut MaterialTxn, loan: Loan) -> Result<Transition, EngineError> {
    if txn.loan(loan.id).is_some() {
        return Err(EngineError::AlreadyExists(loan.id));
    }
    let material_before = txn.material().state;
    txn.insert_loan(loan.clone());
    Ok(settle(txn, loan, material_before, true))
}

// ── Material transitions ──────────────────────────────────────────

fn material_change(txn: &mut MaterialTxn, before: Material) -> MaterialChange {
    let (availability, violation) = refresh_material(txn);
    MaterialChange {
        changed: *txn.material() != before,
        before,
        material: txn.material().clone(),
        availability,
        violation,
    }
}

/// Administrative state change. `prestado` is derived and cannot be set;
/// `baja` is terminal.
pub fn change_material_state(
    txn: &mut MaterialTxn,
    to: MaterialState,
) -> Result<MaterialChange, EngineError> {
    let before = txn.material().clone();
    let reject = || EngineError::InvalidMaterialTransition {
        material_id: before.id,
        from: before.state,
        to,
    };

    if to == MaterialState::OnLoan {
        return Err(reject());
    }
    if before.state == MaterialState::Retired && to != MaterialState::Retired {
        return Err(reject());
    }
    let active = txn.active_loans().count();
    let blocked = match to {
        MaterialState::Retired | MaterialState::Lost => active > 0,
        MaterialState::Maintenance => before.is_unique() && active > 0,
        _ => false,
    };
    if blocked && before.state != to {
        return Err(reject());
    }

    if before.state != to {
        txn.material_mut().state = to;
    }
    Ok(material_change(txn, before))
}

/// Restock or correct the owned quantity of a quantifiable material.
pub fn set_total(txn: &mut MaterialTxn, total: u32) -> Result<MaterialChange, EngineError> {
    let before = txn.material().clone();
    if before.is_unique() {
        return Err(EngineError::InvalidRequest("unique materials always own exactly 1"));
    }
    let (availability, _) = derive_availability(&before, txn.loans());
    if u64::from(total) < availability.outstanding {
        return Err(EngineError::IntegrityViolation(Violation::Overcommitted {
            material_id: before.id,
            total,
            outstanding: availability.outstanding,
        }));
    }
    if before.total != total {
        txn.material_mut().total = total;
    }
    Ok(material_change(txn, before))
}

/// Recompute the stored counter from the loans. Corrects drift.
pub fn reconcile_material(txn: &mut MaterialTxn) -> MaterialChange {
    let before = txn.material().clone();
    material_change(txn, before)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Ms = 10 * DAY_MS;

    fn anchors(total: u32) -> Material {
        Material::new(Ulid::new(), "Anclajes".into(), MaterialKind::Anchor, total)
    }

    fn rope() -> Material {
        Material::new(Ulid::new(), "Cuerda 60m".into(), MaterialKind::Rope, 1)
    }

    fn new_loan(material: &Material, quantity: u32, activity_id: Option<Ulid>) -> Loan {
        Loan {
            id: Ulid::new(),
            material_id: material.id,
            user_id: "socio".into(),
            activity_id,
            quantity,
            lent_at: NOW - DAY_MS,
            due_at: None,
            returned_at: None,
            state: LoanState::InUse,
            auto_marked: false,
            incident: None,
        }
    }

    fn activity(ends_at: Ms, state: ActivityState) -> Activity {
        Activity {
            id: Ulid::new(),
            name: "Barranco".into(),
            ends_at,
            state,
        }
    }

    fn lent(material: Material, quantity: u32) -> (MaterialTxn, Ulid) {
        let loan = new_loan(&material, quantity, None);
        let id = loan.id;
        let mut txn = MaterialTxn::new(material, vec![]);
        open_loan(&mut txn, loan).unwrap();
        (txn, id)
    }

    #[test]
    fn open_loan_updates_counter() {
        let m = anchors(5);
        let mut txn = MaterialTxn::new(m.clone(), vec![]);
        let t = open_loan(&mut txn, new_loan(&m, 2, None)).unwrap();
        assert!(t.changed);
        assert_eq!(t.material.available, 3);
        assert_eq!(t.material.state, MaterialState::Available);
    }

    #[test]
    fn open_loan_rejects_over_request_without_writing() {
        let (mut txn, _) = lent(anchors(5), 2);
        let m = txn.material().clone();
        let err = open_loan(&mut txn, new_loan(&m, 4, None)).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientAvailability {
                material_id: m.id,
                requested: 4,
                available: 3
            }
        );
        assert_eq!(txn.loans().len(), 1);
    }

    #[test]
    fn open_loan_on_unique_sets_on_loan() {
        let r = rope();
        let mut txn = MaterialTxn::new(r.clone(), vec![]);
        let t = open_loan(&mut txn, new_loan(&r, 1, None)).unwrap();
        assert_eq!(t.material.state, MaterialState::OnLoan);
        assert_eq!(t.material.available, 0);

        let second = open_loan(&mut txn, new_loan(&r, 1, None));
        assert!(matches!(second, Err(EngineError::InsufficientAvailability { .. })));
    }

    #[test]
    fn open_loan_refuses_maintenance() {
        let mut m = anchors(5);
        m.state = MaterialState::Maintenance;
        let mut txn = MaterialTxn::new(m.clone(), vec![]);
        let err = open_loan(&mut txn, new_loan(&m, 1, None)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientAvailability { available: 0, .. }));
    }

    #[test]
    fn open_loan_on_overcommitted_material_reports_violation() {
        let m = anchors(2);
        let existing = vec![new_loan(&m, 2, None), new_loan(&m, 1, None)];
        let mut txn = MaterialTxn::new(m.clone(), existing);
        let err = open_loan(&mut txn, new_loan(&m, 1, None)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::IntegrityViolation(Violation::Overcommitted { outstanding: 3, .. })
        ));
    }

    #[test]
    fn close_restores_availability_once() {
        let (mut txn, id) = lent(anchors(5), 2);
        let first = close_loan(&mut txn, id, None, NOW).unwrap();
        assert!(first.changed);
        assert_eq!(first.material.available, 5);
        assert_eq!(first.loan.returned_at, Some(NOW));

        let second = close_loan(&mut txn, id, None, NOW + 1).unwrap();
        assert!(!second.changed);
        assert_eq!(second.material.available, 5);
        assert_eq!(second.loan.returned_at, Some(NOW));
    }

    #[test]
    fn returned_loan_rejects_new_incident() {
        let (mut txn, id) = lent(anchors(5), 1);
        let wear = Incident::new(IncidentKind::Wear, Severity::Minor, "funda rozada");
        close_loan(&mut txn, id, Some(wear.clone()), NOW).unwrap();

        let same = close_loan(&mut txn, id, Some(wear), NOW).unwrap();
        assert!(!same.changed);

        let other = Incident::new(IncidentKind::Loss, Severity::Severe, "perdida");
        let err = close_loan(&mut txn, id, Some(other), NOW).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: LoanState::Returned,
                ..
            }
        ));
    }

    #[test]
    fn loss_on_unique_item_marks_lost() {
        let (mut txn, id) = lent(rope(), 1);
        let loss = Incident::new(IncidentKind::Loss, Severity::Severe, "caida al rio");
        let t = close_loan(&mut txn, id, Some(loss), NOW).unwrap();
        assert_eq!(t.material_before, MaterialState::OnLoan);
        assert_eq!(t.material.state, MaterialState::Lost);
        assert_eq!(t.availability.available, 0);
        assert!(t.violation.is_none());
    }

    #[test]
    fn loss_on_quantifiable_item_writes_off_quantity() {
        let (mut txn, id) = lent(anchors(5), 2);
        let loss = Incident::new(IncidentKind::Loss, Severity::Moderate, "dos chapas");
        let t = close_loan(&mut txn, id, Some(loss), NOW).unwrap();
        assert_eq!(t.material.total, 3);
        assert_eq!(t.material.available, 3);
        assert_eq!(t.material.state, MaterialState::Available);
    }

    #[test]
    fn losing_every_unit_marks_lost() {
        let (mut txn, id) = lent(anchors(2), 2);
        let loss = Incident::new(IncidentKind::Loss, Severity::Severe, "todo");
        let t = close_loan(&mut txn, id, Some(loss), NOW).unwrap();
        assert_eq!(t.material.total, 0);
        assert_eq!(t.material.state, MaterialState::Lost);
    }

    #[test]
    fn breakage_and_wear_send_to_maintenance() {
        for kind in [IncidentKind::Breakage, IncidentKind::Wear] {
            let (mut txn, id) = lent(rope(), 1);
            let t = close_loan(&mut txn, id, Some(Incident::new(kind, Severity::Minor, "")), NOW)
                .unwrap();
            assert_eq!(t.material.state, MaterialState::Maintenance);
            assert_eq!(t.material.available, 0);
        }
    }

    #[test]
    fn other_incident_changes_nothing_on_material() {
        let (mut txn, id) = lent(rope(), 1);
        let t = close_loan(
            &mut txn,
            id,
            Some(Incident::new(IncidentKind::Other, Severity::Minor, "sucia")),
            NOW,
        )
        .unwrap();
        assert_eq!(t.material.state, MaterialState::Available);
        assert_eq!(t.material.available, 1);
    }

    #[test]
    fn manual_mark_is_not_automatic() {
        let (mut txn, id) = lent(anchors(3), 1);
        let t = mark_pending(&mut txn, id, MarkTrigger::Manual).unwrap();
        assert_eq!(t.loan.state, LoanState::PendingReturn);
        assert!(!t.loan.auto_marked);
        assert_eq!(t.material.available, 2);

        let again = mark_pending(&mut txn, id, MarkTrigger::Manual).unwrap();
        assert!(!again.changed);
    }

    #[test]
    fn overdue_mark_requires_ended_activity() {
        let act = activity(NOW - DAY_MS, ActivityState::Finished);
        let m = anchors(3);
        let loan = new_loan(&m, 1, Some(act.id));
        let id = loan.id;
        let mut txn = MaterialTxn::new(m, vec![loan]);

        let early = MarkTrigger::Overdue {
            activity: act.clone(),
            cutoff: NOW - 2 * DAY_MS,
        };
        assert!(matches!(
            mark_pending(&mut txn, id, early),
            Err(EngineError::InvalidTransition { .. })
        ));

        let due = MarkTrigger::Overdue {
            activity: act,
            cutoff: NOW,
        };
        let t = mark_pending(&mut txn, id, due).unwrap();
        assert!(t.changed);
        assert!(t.loan.auto_marked);
    }

    #[test]
    fn overdue_mark_rejects_other_activity_and_cancelled() {
        let act = activity(NOW - DAY_MS, ActivityState::Finished);
        let m = anchors(3);
        let loan = new_loan(&m, 1, Some(Ulid::new()));
        let id = loan.id;
        let mut txn = MaterialTxn::new(m.clone(), vec![loan]);
        let wrong = MarkTrigger::Overdue {
            activity: act,
            cutoff: NOW,
        };
        assert!(mark_pending(&mut txn, id, wrong).is_err());

        let cancelled = activity(NOW - DAY_MS, ActivityState::Cancelled);
        let loan = new_loan(&m, 1, Some(cancelled.id));
        let id = loan.id;
        let mut txn = MaterialTxn::new(m, vec![loan]);
        let trigger = MarkTrigger::Overdue {
            activity: cancelled,
            cutoff: NOW,
        };
        assert!(mark_pending(&mut txn, id, trigger).is_err());
    }

    #[test]
    fn reopen_clears_auto_mark() {
        let act = activity(NOW - DAY_MS, ActivityState::Finished);
        let m = anchors(3);
        let loan = new_loan(&m, 1, Some(act.id));
        let id = loan.id;
        let mut txn = MaterialTxn::new(m, vec![loan]);
        mark_pending(&mut txn, id, MarkTrigger::Overdue { activity: act, cutoff: NOW }).unwrap();

        let t = reopen(&mut txn, id).unwrap();
        assert_eq!(t.loan.state, LoanState::InUse);
        assert!(!t.loan.auto_marked);
        assert!(!reopen(&mut txn, id).unwrap().changed);

        close_loan(&mut txn, id, None, NOW).unwrap();
        assert!(reopen(&mut txn, id).is_err());
    }

    #[test]
    fn on_loan_cannot_be_set_by_hand() {
        let mut txn = MaterialTxn::new(anchors(3), vec![]);
        assert!(change_material_state(&mut txn, MaterialState::OnLoan).is_err());
    }

    #[test]
    fn retire_requires_no_active_loans_and_is_terminal() {
        let (mut txn, id) = lent(anchors(3), 1);
        assert!(change_material_state(&mut txn, MaterialState::Retired).is_err());

        close_loan(&mut txn, id, None, NOW).unwrap();
        let c = change_material_state(&mut txn, MaterialState::Retired).unwrap();
        assert!(c.changed);
        assert_eq!(c.availability.available, 0);
        assert!(change_material_state(&mut txn, MaterialState::Available).is_err());
    }

    #[test]
    fn unique_maintenance_requires_no_active_loan() {
        let (mut txn, _) = lent(rope(), 1);
        assert!(change_material_state(&mut txn, MaterialState::Maintenance).is_err());

        let (mut txn, _) = lent(anchors(4), 1);
        let c = change_material_state(&mut txn, MaterialState::Maintenance).unwrap();
        assert_eq!(c.material.available, 0);
    }

    #[test]
    fn available_is_the_correction_out_of_lost() {
        let (mut txn, id) = lent(rope(), 1);
        close_loan(
            &mut txn,
            id,
            Some(Incident::new(IncidentKind::Loss, Severity::Severe, "")),
            NOW,
        )
        .unwrap();
        let c = change_material_state(&mut txn, MaterialState::Available).unwrap();
        assert_eq!(c.before.state, MaterialState::Lost);
        assert_eq!(c.material.state, MaterialState::Available);
        assert_eq!(c.material.available, 1);
    }

    #[test]
    fn set_total_cannot_drop_below_outstanding() {
        let (mut txn, _) = lent(anchors(5), 3);
        assert!(matches!(
            set_total(&mut txn, 2),
            Err(EngineError::IntegrityViolation(_))
        ));
        let c = set_total(&mut txn, 8).unwrap();
        assert_eq!(c.material.available, 5);

        let (mut txn, _) = lent(rope(), 1);
        assert!(set_total(&mut txn, 2).is_err());
    }

    #[test]
    fn reconcile_fixes_drift() {
        let mut m = anchors(5);
        m.available = 1;
        let loan = new_loan(&m, 2, None);
        let mut txn = MaterialTxn::new(m, vec![loan]);
        let c = reconcile_material(&mut txn);
        assert!(c.changed);
        assert_eq!(c.before.available, 1);
        assert_eq!(c.material.available, 3);

        let clean = reconcile_material(&mut txn);
        assert!(!clean.changed);
    }

    #[test]
    fn adopt_accepts_overcommitment_but_reports_it() {
        let m = anchors(2);
        let mut txn = MaterialTxn::new(m.clone(), vec![new_loan(&m, 2, None)]);
        let historic = new_loan(&m, 1, None);
        let t = adopt_loan(&mut txn, historic.clone()).unwrap();
        assert_eq!(t.material.available, 0);
        assert!(matches!(t.violation, Some(Violation::Overcommitted { .. })));
        assert!(matches!(
            adopt_loan(&mut txn, historic),
            Err(EngineError::AlreadyExists(_))
        ));
    }
}
