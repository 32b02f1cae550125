use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Material category. Ropes are tracked one per record; everything else is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaterialKind {
    #[serde(rename = "cuerda")]
    Rope,
    #[serde(rename = "anclaje")]
    Anchor,
    #[serde(rename = "varios")]
    Misc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaterialState {
    #[serde(rename = "disponible")]
    Available,
    /// Derived: set while outstanding loans leave nothing to lend.
    #[serde(rename = "prestado")]
    OnLoan,
    #[serde(rename = "mantenimiento")]
    Maintenance,
    #[serde(rename = "perdido")]
    Lost,
    /// Archived. Terminal.
    #[serde(rename = "baja")]
    Retired,
}

impl MaterialState {
    /// States in which new loans may be opened.
    pub fn is_lendable(self) -> bool {
        matches!(self, MaterialState::Available | MaterialState::OnLoan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MaterialState::Available => "disponible",
            MaterialState::OnLoan => "prestado",
            MaterialState::Maintenance => "mantenimiento",
            MaterialState::Lost => "perdido",
            MaterialState::Retired => "baja",
        }
    }
}

impl std::fmt::Display for MaterialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inventory item. Field names follow the document store schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub id: Ulid,
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "tipo")]
    pub kind: MaterialKind,
    /// Total owned quantity (1 for unique items).
    #[serde(rename = "cantidad")]
    pub total: u32,
    /// Denormalized display copy of the derived availability. Never read as a fact.
    #[serde(rename = "cantidadDisponible")]
    pub available: u32,
    #[serde(rename = "estado")]
    pub state: MaterialState,
}

impl Material {
    pub fn new(id: Ulid, name: String, kind: MaterialKind, total: u32) -> Self {
        Self {
            id,
            name,
            kind,
            total,
            available: total,
            state: MaterialState::Available,
        }
    }

    /// Unique items are lent whole: available is 1 or 0.
    pub fn is_unique(&self) -> bool {
        self.kind == MaterialKind::Rope
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoanState {
    #[serde(rename = "en_uso")]
    InUse,
    #[serde(rename = "por_devolver")]
    PendingReturn,
    #[serde(rename = "devuelto")]
    Returned,
}

impl LoanState {
    pub fn is_active(self) -> bool {
        self != LoanState::Returned
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoanState::InUse => "en_uso",
            LoanState::PendingReturn => "por_devolver",
            LoanState::Returned => "devuelto",
        }
    }
}

impl std::fmt::Display for LoanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentKind {
    #[serde(rename = "perdida")]
    Loss,
    #[serde(rename = "rotura")]
    Breakage,
    #[serde(rename = "desgaste")]
    Wear,
    #[serde(rename = "otro")]
    Other,
}

impl IncidentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentKind::Loss => "perdida",
            IncidentKind::Breakage => "rotura",
            IncidentKind::Wear => "desgaste",
            IncidentKind::Other => "otro",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "leve")]
    Minor,
    #[serde(rename = "moderada")]
    Moderate,
    #[serde(rename = "grave")]
    Severe,
}

/// Damage or loss reported when a loan is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    #[serde(rename = "tipo")]
    pub kind: IncidentKind,
    #[serde(rename = "gravedad")]
    pub severity: Severity,
    #[serde(rename = "descripcion")]
    pub description: String,
}

impl Incident {
    pub fn new(kind: IncidentKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
        }
    }
}

/// One borrowing event against a material. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: Ulid,
    #[serde(rename = "materialId")]
    pub material_id: Ulid,
    #[serde(rename = "usuarioId")]
    pub user_id: String,
    #[serde(rename = "actividadId")]
    pub activity_id: Option<Ulid>,
    #[serde(rename = "cantidadPrestada")]
    pub quantity: u32,
    #[serde(rename = "fechaPrestamo")]
    pub lent_at: Ms,
    #[serde(rename = "fechaDevolucionPrevista")]
    pub due_at: Option<Ms>,
    #[serde(rename = "fechaDevolucion")]
    pub returned_at: Option<Ms>,
    #[serde(rename = "estado")]
    pub state: LoanState,
    #[serde(rename = "marcadoAutomaticamente")]
    pub auto_marked: bool,
    #[serde(rename = "incidencia")]
    pub incident: Option<Incident>,
}

impl Loan {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityState {
    #[serde(rename = "planificada")]
    Planned,
    #[serde(rename = "en_curso")]
    Ongoing,
    #[serde(rename = "finalizada")]
    Finished,
    #[serde(rename = "cancelada")]
    Cancelled,
}

/// A club activity. Owned by another service; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Ulid,
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "fechaFin")]
    pub ends_at: Ms,
    #[serde(rename = "estado")]
    pub state: ActivityState,
}

/// A single document write inside a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Material(Material),
    Loan(Loan),
    Activity(Activity),
}

/// All records written by one transaction. This is the WAL record format:
/// a commit is replayed whole or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub records: Vec<Record>,
}

// ── Query types ──────────────────────────────────────────────────

/// Scope of an overdue listing. Empty filter means every loan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OverdueFilter {
    pub material_id: Option<Ulid>,
    pub user_id: Option<String>,
    pub activity_id: Option<Ulid>,
}

impl OverdueFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn material(id: Ulid) -> Self {
        Self {
            material_id: Some(id),
            ..Self::default()
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn activity(id: Ulid) -> Self {
        Self {
            activity_id: Some(id),
            ..Self::default()
        }
    }

    pub fn matches(&self, loan: &Loan) -> bool {
        self.material_id.is_none_or(|m| m == loan.material_id)
            && self.user_id.as_ref().is_none_or(|u| *u == loan.user_id)
            && self.activity_id.is_none_or(|a| loan.activity_id == Some(a))
    }
}

/// Input for opening a loan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanRequest {
    pub material_id: Ulid,
    pub user_id: String,
    pub quantity: u32,
    pub activity_id: Option<Ulid>,
    /// Ignored when `activity_id` is set: the activity's end date wins.
    pub due_at: Option<Ms>,
}

impl LoanRequest {
    pub fn new(material_id: Ulid, user_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            material_id,
            user_id: user_id.into(),
            quantity,
            activity_id: None,
            due_at: None,
        }
    }

    pub fn for_activity(mut self, activity_id: Ulid) -> Self {
        self.activity_id = Some(activity_id);
        self
    }

    pub fn due_at(mut self, due_at: Ms) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

/// Input for registering a material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMaterial {
    pub name: String,
    pub kind: MaterialKind,
    pub total: u32,
}

impl NewMaterial {
    pub fn new(name: impl Into<String>, kind: MaterialKind, total: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            total,
        }
    }

    pub fn rope(name: impl Into<String>) -> Self {
        Self::new(name, MaterialKind::Rope, 1)
    }
}
