use ulid::Ulid;

use crate::model::{LoanState, MaterialState};
use crate::store::StoreError;

use super::availability::Violation;

/// Stable, machine-readable classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InsufficientAvailability,
    NotFound,
    InvalidTransition,
    IntegrityViolation,
    UpstreamUnavailable,
    InvalidRequest,
    AlreadyExists,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InsufficientAvailability => "insufficient-availability",
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidTransition => "invalid-transition",
            ErrorKind::IntegrityViolation => "integrity-violation",
            ErrorKind::UpstreamUnavailable => "upstream-unavailable",
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::AlreadyExists => "already-exists",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("insufficient availability on {material_id}: requested {requested}, available {available}")]
    InsufficientAvailability {
        material_id: Ulid,
        requested: u32,
        available: u32,
    },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("cannot {action} loan {loan_id} in state {from}")]
    InvalidTransition {
        loan_id: Ulid,
        from: LoanState,
        action: &'static str,
    },
    #[error("cannot move material {material_id} from {from} to {to}")]
    InvalidMaterialTransition {
        material_id: Ulid,
        from: MaterialState,
        to: MaterialState,
    },
    #[error("integrity violation: {0}")]
    IntegrityViolation(Violation),
    #[error("upstream unavailable: {0}")]
    Upstream(String),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InsufficientAvailability { .. } => ErrorKind::InsufficientAvailability,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::InvalidTransition { .. } | EngineError::InvalidMaterialTransition { .. } => {
                ErrorKind::InvalidTransition
            }
            EngineError::IntegrityViolation(_) => ErrorKind::IntegrityViolation,
            EngineError::Upstream(_) => ErrorKind::UpstreamUnavailable,
            EngineError::InvalidRequest(_) | EngineError::LimitExceeded(_) => {
                ErrorKind::InvalidRequest
            }
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Duplicate(id) => EngineError::AlreadyExists(id),
            StoreError::Unavailable(msg) => EngineError::Upstream(msg),
        }
    }
}
