use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

// ── Integrity violations ──────────────────────────────────────────

/// A fact about stored data that contradicts the ledger's invariants.
/// Never fatal on its own: reported to the audit path and clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Violation {
    /// Σ active `cantidadPrestada` exceeds what the material owns.
    Overcommitted {
        material_id: Ulid,
        total: u32,
        outstanding: u64,
    },
    /// A unique item has an active loan while in a state that forbids one.
    InconsistentState {
        material_id: Ulid,
        state: MaterialState,
        active_loans: usize,
    },
    /// A numeric document field was missing, non-finite, fractional or out of range.
    MalformedField {
        document: String,
        field: &'static str,
        raw: String,
    },
    /// The stored display counter disagreed with the derived value.
    CounterDrift {
        material_id: Ulid,
        stored: u32,
        derived: u32,
    },
}

impl Violation {
    pub fn material_id(&self) -> Option<Ulid> {
        match self {
            Violation::Overcommitted { material_id, .. }
            | Violation::InconsistentState { material_id, .. }
            | Violation::CounterDrift { material_id, .. } => Some(*material_id),
            Violation::MalformedField { .. } => None,
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Violation::Overcommitted { .. } => "overcommitted",
            Violation::InconsistentState { .. } => "inconsistent_state",
            Violation::MalformedField { .. } => "malformed_field",
            Violation::CounterDrift { .. } => "counter_drift",
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Overcommitted {
                material_id,
                total,
                outstanding,
            } => write!(
                f,
                "material {material_id} has {outstanding} units on loan but owns {total}"
            ),
            Violation::InconsistentState {
                material_id,
                state,
                active_loans,
            } => write!(
                f,
                "unique material {material_id} is {state} with {active_loans} active loan(s)"
            ),
            Violation::MalformedField {
                document,
                field,
                raw,
            } => write!(f, "document {document}: malformed {field}: {raw}"),
            Violation::CounterDrift {
                material_id,
                stored,
                derived,
            } => write!(
                f,
                "material {material_id}: stored available {stored}, derived {derived}"
            ),
        }
    }
}

// ── Availability Algorithm ────────────────────────────────────────

/// Availability of one material, derived from its active loans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub material_id: Ulid,
    pub state: MaterialState,
    pub total: u32,
    /// Σ `cantidadPrestada` over active loans. Wider than `total` so
    /// overcommitted historical data is representable.
    pub outstanding: u64,
    /// Never negative; 0 when the material is not lendable.
    pub available: u32,
    pub active_loans: usize,
    pub lendable: bool,
}

/// Derive availability from the loans against a material. Loans for other
/// materials and returned loans are ignored, so callers may pass any superset.
///
/// Quantifiable: `total - outstanding`, clamped at 0 (with a violation).
/// Unique: 1 iff no active loan.
pub fn derive_availability<'a>(
    material: &Material,
    loans: impl IntoIterator<Item = &'a Loan>,
) -> (Availability, Option<Violation>) {
    let mut outstanding: u64 = 0;
    let mut active_loans = 0usize;
    for loan in loans {
        if loan.material_id == material.id && loan.is_active() {
            outstanding += u64::from(loan.quantity);
            active_loans += 1;
        }
    }

    let lendable = material.state.is_lendable();
    let (free, violation) = if material.is_unique() {
        let violation = if active_loans > 1 {
            Some(Violation::Overcommitted {
                material_id: material.id,
                total: material.total,
                outstanding,
            })
        } else if active_loans > 0 && !lendable {
            Some(Violation::InconsistentState {
                material_id: material.id,
                state: material.state,
                active_loans,
            })
        } else {
            None
        };
        (u32::from(active_loans == 0), violation)
    } else {
        let total = u64::from(material.total);
        if outstanding > total {
            (
                0,
                Some(Violation::Overcommitted {
                    material_id: material.id,
                    total: material.total,
                    outstanding,
                }),
            )
        } else {
            // outstanding <= total <= u32::MAX
            ((total - outstanding) as u32, None)
        }
    };

    let availability = Availability {
        material_id: material.id,
        state: material.state,
        total: material.total,
        outstanding,
        available: if lendable { free } else { 0 },
        active_loans,
        lendable,
    };
    (availability, violation)
}

pub fn can_lend(availability: &Availability, requested: u32) -> bool {
    availability.lendable && requested > 0 && requested <= availability.available
}

/// The state a material should be in given its availability.
/// Only `disponible`/`prestado` are derived; every other state is
/// administrative and left alone.
pub fn derived_state(availability: &Availability) -> MaterialState {
    match availability.state {
        MaterialState::Available | MaterialState::OnLoan => {
            if availability.outstanding > 0 && availability.available == 0 {
                MaterialState::OnLoan
            } else {
                MaterialState::Available
            }
        }
        other => other,
    }
}
