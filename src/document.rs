//! Validation of raw documents adopted from the document store.
//!
//! Historical records may carry missing, fractional or negative numbers.
//! Quantities that define a record are rejected as integrity violations;
//! the display counter is derived data, so a bad one is reported and the
//! record is accepted with the counter recomputed.

use serde::de::DeserializeOwned;
use serde_json::Value;
use ulid::Ulid;

use crate::engine::{EngineError, Violation};
use crate::limits::*;
use crate::model::*;

fn document_id(doc: &Value) -> String {
    match doc.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "<sin id>".into(),
    }
}

fn malformed(doc: &Value, field: &'static str) -> Violation {
    Violation::MalformedField {
        document: document_id(doc),
        field,
        raw: doc.get(field).map_or_else(|| "missing".into(), Value::to_string),
    }
}

/// A finite, non-negative, integral number that fits `u32`.
fn whole_quantity(doc: &Value, field: &'static str) -> Result<u32, Violation> {
    let n = doc.get(field).and_then(Value::as_f64);
    match n {
        Some(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= f64::from(u32::MAX) => {
            Ok(n as u32)
        }
        _ => Err(malformed(doc, field)),
    }
}

/// Unix milliseconds. Integral; fractional or non-finite values are malformed.
fn timestamp(doc: &Value, field: &'static str) -> Result<Option<Ms>, Violation> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            if let Some(ms) = v.as_i64() {
                return Ok(Some(ms));
            }
            match v.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Some(f as Ms)),
                _ => Err(malformed(doc, field)),
            }
        }
    }
}

fn ulid(doc: &Value, field: &str, msg: &'static str) -> Result<Ulid, EngineError> {
    doc.get(field)
        .and_then(Value::as_str)
        .and_then(|s| Ulid::from_string(s).ok())
        .ok_or(EngineError::InvalidRequest(msg))
}

fn optional_ulid(doc: &Value, field: &str, msg: &'static str) -> Result<Option<Ulid>, EngineError> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => ulid(doc, field, msg).map(Some),
    }
}

fn enum_field<T: DeserializeOwned>(
    doc: &Value,
    field: &str,
    default: Option<T>,
    msg: &'static str,
) -> Result<T, EngineError> {
    match doc.get(field) {
        None | Some(Value::Null) => default.ok_or(EngineError::InvalidRequest(msg)),
        Some(v) => serde_json::from_value(v.clone()).map_err(|_| EngineError::InvalidRequest(msg)),
    }
}

fn integrity(v: Violation) -> EngineError {
    EngineError::IntegrityViolation(v)
}

/// Parse a `materiales` document. The returned material keeps the stored
/// counter only if it is well-formed and in range; the caller recomputes it.
pub fn material_from_document(doc: &Value) -> Result<(Material, Option<Violation>), EngineError> {
    let id = ulid(doc, "id", "material document needs a valid id")?;
    let name = doc
        .get("nombre")
        .and_then(Value::as_str)
        .ok_or(EngineError::InvalidRequest("material document needs a nombre"))?;
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("material name too long"));
    }
    let kind: MaterialKind = enum_field(doc, "tipo", None, "unknown material tipo")?;
    let state: MaterialState = enum_field(
        doc,
        "estado",
        Some(MaterialState::Available),
        "unknown material estado",
    )?;

    let total = whole_quantity(doc, "cantidad").map_err(integrity)?;
    if total > MAX_MATERIAL_QUANTITY {
        return Err(EngineError::LimitExceeded("material quantity too large"));
    }
    if kind == MaterialKind::Rope && total != 1 {
        return Err(EngineError::InvalidRequest("ropes are tracked one per record"));
    }

    let mut material = Material::new(id, name.to_string(), kind, total);
    material.state = state;

    let violation = match doc.get("cantidadDisponible") {
        None | Some(Value::Null) => None,
        Some(_) => match whole_quantity(doc, "cantidadDisponible") {
            Err(v) => Some(v),
            Ok(stored) if stored > total => Some(Violation::CounterDrift {
                material_id: id,
                stored,
                derived: total,
            }),
            Ok(stored) => {
                material.available = stored;
                None
            }
        },
    };
    Ok((material, violation))
}

/// Parse a `prestamos` document.
pub fn loan_from_document(doc: &Value) -> Result<Loan, EngineError> {
    let id = ulid(doc, "id", "loan document needs a valid id")?;
    let material_id = ulid(doc, "materialId", "loan document needs a valid materialId")?;
    let activity_id = optional_ulid(doc, "actividadId", "malformed actividadId")?;
    let user_id = doc
        .get("usuarioId")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .ok_or(EngineError::InvalidRequest("loan document needs a usuarioId"))?;
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }

    let quantity = whole_quantity(doc, "cantidadPrestada").map_err(integrity)?;
    if quantity == 0 {
        return Err(integrity(malformed(doc, "cantidadPrestada")));
    }
    let lent_at = timestamp(doc, "fechaPrestamo")
        .map_err(integrity)?
        .ok_or_else(|| integrity(malformed(doc, "fechaPrestamo")))?;
    let due_at = timestamp(doc, "fechaDevolucionPrevista").map_err(integrity)?;
    let returned_at = timestamp(doc, "fechaDevolucion").map_err(integrity)?;

    let state: LoanState = enum_field(doc, "estado", Some(LoanState::InUse), "unknown loan estado")?;
    let auto_marked = match doc.get("marcadoAutomaticamente") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(EngineError::InvalidRequest("marcadoAutomaticamente must be a boolean")),
    };
    let incident: Option<Incident> = match doc.get("incidencia") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value(v.clone())
                .map_err(|_| EngineError::InvalidRequest("malformed incidencia"))?,
        ),
    };
    if incident.is_some() && state != LoanState::Returned {
        return Err(EngineError::InvalidRequest("incidents are only recorded on returned loans"));
    }
    if auto_marked && state == LoanState::InUse {
        return Err(EngineError::InvalidRequest("an en_uso loan cannot be auto-marked"));
    }

    Ok(Loan {
        id,
        material_id,
        user_id: user_id.to_string(),
        activity_id,
        quantity,
        lent_at,
        due_at,
        returned_at,
        state,
        auto_marked,
        incident,
    })
}
