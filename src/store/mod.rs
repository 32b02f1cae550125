//! The document database as seen by the engine.
//!
//! The engine only needs per-record reads, a handful of field queries and one
//! transactional primitive: a read-modify-write over a single material, the
//! loans currently active against it, and (optionally) one focus loan.
//! Everything the engine decides inside that transaction is synchronous, so
//! the store is the only place a ledger operation suspends.

mod memory;

pub use memory::MemStore;

use std::collections::HashSet;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(Ulid),
    #[error("record already exists: {0}")]
    Duplicate(Ulid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What a transaction locks and loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnScope {
    pub material_id: Ulid,
    /// Loaded whatever its state, so callers can detect already-terminal loans.
    pub loan_id: Option<Ulid>,
}

impl TxnScope {
    pub fn material(material_id: Ulid) -> Self {
        Self {
            material_id,
            loan_id: None,
        }
    }

    pub fn loan(material_id: Ulid, loan_id: Ulid) -> Self {
        Self {
            material_id,
            loan_id: Some(loan_id),
        }
    }
}

/// Working copy of the records a transaction may touch.
///
/// Reads see the snapshot taken when the transaction started; every mutable
/// accessor marks its record for write-back. Nothing reaches the store unless
/// the transaction closure returns `Ok`.
#[derive(Debug, Clone)]
pub struct MaterialTxn {
    material: Material,
    loans: Vec<Loan>,
    material_dirty: bool,
    touched: HashSet<Ulid>,
}

impl MaterialTxn {
    /// `loans` holds the material's active loans plus the focus loan, if any.
    pub fn new(material: Material, loans: Vec<Loan>) -> Self {
        Self {
            material,
            loans,
            material_dirty: false,
            touched: HashSet::new(),
        }
    }

    pub fn material(&self) -> &Material {
        &self.material
    }

    pub fn material_mut(&mut self) -> &mut Material {
        self.material_dirty = true;
        &mut self.material
    }

    /// Every loan loaded into this transaction, active or not.
    pub fn loans(&self) -> &[Loan] {
        &self.loans
    }

    pub fn active_loans(&self) -> impl Iterator<Item = &Loan> {
        self.loans.iter().filter(|l| l.is_active())
    }

    pub fn loan(&self, id: Ulid) -> Option<&Loan> {
        self.loans.iter().find(|l| l.id == id)
    }

    pub fn loan_mut(&mut self, id: Ulid) -> Option<&mut Loan> {
        let loan = self.loans.iter_mut().find(|l| l.id == id)?;
        self.touched.insert(id);
        Some(loan)
    }

    pub fn insert_loan(&mut self, loan: Loan) {
        self.touched.insert(loan.id);
        self.loans.push(loan);
    }

    pub fn is_dirty(&self) -> bool {
        self.material_dirty || !self.touched.is_empty()
    }

    /// The records to write back, material first.
    pub fn into_records(self) -> Vec<Record> {
        let mut records = Vec::with_capacity(self.touched.len() + 1);
        if self.material_dirty {
            records.push(Record::Material(self.material));
        }
        records.extend(
            self.loans
                .into_iter()
                .filter(|l| self.touched.contains(&l.id))
                .map(Record::Loan),
        );
        records
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn material(&self, id: Ulid) -> StoreResult<Option<Material>>;

    async fn materials(&self) -> StoreResult<Vec<Material>>;

    /// Fails with `Duplicate` if the id is taken.
    async fn insert_material(&self, material: Material) -> StoreResult<()>;

    async fn loan(&self, id: Ulid) -> StoreResult<Option<Loan>>;

    /// `materialId ==`, full history.
    async fn loans_by_material(&self, material_id: Ulid) -> StoreResult<Vec<Loan>>;

    /// `actividadId ==`, optionally also `estado ==`.
    async fn loans_by_activity(
        &self,
        activity_id: Ulid,
        state: Option<LoanState>,
    ) -> StoreResult<Vec<Loan>>;

    /// `estado ==`.
    async fn loans_by_state(&self, state: LoanState) -> StoreResult<Vec<Loan>>;

    async fn activity(&self, id: Ulid) -> StoreResult<Option<Activity>>;

    async fn put_activity(&self, activity: Activity) -> StoreResult<()>;

    /// `fechaFin <= until`, ordered by id, strictly after `after`, at most `limit`.
    async fn activities_ended(
        &self,
        until: Ms,
        after: Option<Ulid>,
        limit: usize,
    ) -> StoreResult<Vec<Activity>>;

    /// Atomic read-modify-write over one material, its active loans and the
    /// scope's focus loan. Writes made through the `MaterialTxn` are committed
    /// together iff `f` returns `Ok`. Concurrent transactions on the same
    /// material are serialized.
    async fn transact<T, E, F>(&self, scope: TxnScope, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut MaterialTxn) -> Result<T, E> + Send + 'static;
}
