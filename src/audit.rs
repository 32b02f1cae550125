use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::engine::Violation;
use crate::model::*;

const CHANNEL_CAPACITY: usize = 256;

/// Change feed of the ledger. Every committed transition and every detected
/// integrity violation is published here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LedgerEvent {
    LoanOpened {
        loan: Loan,
    },
    LoanMarkedPending {
        loan_id: Ulid,
        material_id: Ulid,
        automatic: bool,
    },
    LoanReopened {
        loan_id: Ulid,
        material_id: Ulid,
    },
    LoanReturned {
        loan_id: Ulid,
        material_id: Ulid,
        incident: Option<IncidentKind>,
    },
    LoanImported {
        loan_id: Ulid,
        material_id: Ulid,
    },
    MaterialCreated {
        material: Material,
    },
    MaterialStateChanged {
        material_id: Ulid,
        from: MaterialState,
        to: MaterialState,
    },
    MaterialTotalChanged {
        material_id: Ulid,
        from: u32,
        to: u32,
    },
    AvailabilityCorrected {
        material_id: Ulid,
        stored: u32,
        derived: u32,
    },
    IntegrityViolation(Violation),
}

/// Broadcast hub: one global feed plus per-material feeds.
pub struct AuditHub {
    all: broadcast::Sender<LedgerEvent>,
    channels: DashMap<Ulid, broadcast::Sender<LedgerEvent>>,
}

impl Default for AuditHub {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    /// Every event, for the audit-log consumer.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.all.subscribe()
    }

    /// Events about one material. Creates the channel if needed.
    pub fn subscribe_material(&self, material_id: Ulid) -> broadcast::Receiver<LedgerEvent> {
        let sender = self
            .channels
            .entry(material_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish. No-op if nobody is listening.
    pub fn send(&self, material_id: Option<Ulid>, event: LedgerEvent) {
        if let Some(id) = material_id
            && let Some(sender) = self.channels.get(&id)
        {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }
}
