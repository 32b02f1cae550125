use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use ulid::Ulid;

use loanledger::audit::AuditHub;
use loanledger::clock::ManualClock;
use loanledger::config::EngineConfig;
use loanledger::engine::Engine;
use loanledger::model::*;
use loanledger::store::{DocumentStore, MemStore};

const NOW: Ms = 1_760_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("loanledger_test_durability");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn ledger(path: &PathBuf) -> (Engine<MemStore>, Arc<MemStore>) {
    let store = Arc::new(MemStore::open(path.clone()).unwrap());
    let engine = Engine::new(
        store.clone(),
        Arc::new(ManualClock::new(NOW)),
        Arc::new(AuditHub::new()),
        EngineConfig::default(),
    );
    (engine, store)
}

#[tokio::test]
async fn reopen_restores_ledger() {
    let path = test_wal_path("reopen.wal");
    let (material, open_loan, returned_loan, activity_id) = {
        let (engine, _) = ledger(&path);
        let m = engine
            .create_material(NewMaterial::new("Anclajes", MaterialKind::Anchor, 6))
            .await
            .unwrap();
        let activity = Activity {
            id: Ulid::new(),
            name: "Barranco".into(),
            ends_at: NOW - DAY_MS,
            state: ActivityState::Finished,
        };
        engine.store().put_activity(activity.clone()).await.unwrap();
        let open = engine
            .create_loan(LoanRequest::new(m.id, "pau", 2).for_activity(activity.id))
            .await
            .unwrap();
        let done = engine
            .create_loan(LoanRequest::new(m.id, "pau", 1))
            .await
            .unwrap();
        engine.return_loan(done.id, None).await.unwrap();
        (m, open, done, activity.id)
    };

    let (engine, store) = ledger(&path);
    assert!(store.is_durable());

    let m = engine.material(material.id).await.unwrap();
    assert_eq!(m.total, 6);
    assert_eq!(m.available, 4);
    assert_eq!(engine.loan(open_loan.id).await.unwrap().state, LoanState::InUse);
    let done = engine.loan(returned_loan.id).await.unwrap();
    assert_eq!(done.state, LoanState::Returned);
    assert_eq!(done.returned_at, Some(NOW));
    assert!(engine.store().activity(activity_id).await.unwrap().is_some());

    // Recovered activities and indexes feed the scanner.
    let report = engine
        .scan_overdue(loanledger::engine::ScanOptions::default())
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn reopen_after_compaction() {
    let path = test_wal_path("compacted.wal");
    let rope_id = {
        let (engine, store) = ledger(&path);
        let rope = engine.create_material(NewMaterial::rope("Cuerda 60m")).await.unwrap();
        let loan = engine
            .create_loan(LoanRequest::new(rope.id, "pau", 1))
            .await
            .unwrap();
        let loss = Incident::new(IncidentKind::Loss, Severity::Severe, "");
        engine.return_loan(loan.id, Some(loss)).await.unwrap();
        store.compact_wal().await.unwrap();
        // Writes after compaction land in the rewritten log.
        engine
            .create_material(NewMaterial::new("Cascos", MaterialKind::Misc, 4))
            .await
            .unwrap();
        rope.id
    };

    let (engine, store) = ledger(&path);
    assert_eq!(store.materials().await.unwrap().len(), 2);
    let rope = engine.material(rope_id).await.unwrap();
    assert_eq!(rope.state, MaterialState::Lost);
    assert_eq!(engine.available_quantity(rope_id).await.unwrap(), 0);
    let history = engine.loans_for_material(rope_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].incident.as_ref().map(|i| i.kind), Some(IncidentKind::Loss));
}

#[tokio::test]
async fn commits_after_torn_tail_survive_restart() {
    let path = test_wal_path("torn_tail.wal");
    let material = {
        let (engine, _) = ledger(&path);
        engine
            .create_material(NewMaterial::new("Cascos", MaterialKind::Misc, 5))
            .await
            .unwrap()
    };

    // A crash mid-append leaves part of a length word behind.
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7, 0, 0]).unwrap();
    }

    let loan = {
        let (engine, _) = ledger(&path);
        assert_eq!(engine.material(material.id).await.unwrap().total, 5);
        engine
            .create_loan(LoanRequest::new(material.id, "pau", 2))
            .await
            .unwrap()
    };

    let (engine, _) = ledger(&path);
    assert_eq!(engine.loan(loan.id).await.unwrap().quantity, 2);
    assert_eq!(engine.available_quantity(material.id).await.unwrap(), 3);
}

#[tokio::test]
async fn abandoned_loan_request_keeps_memory_and_log_in_step() {
    let path = test_wal_path("abandoned.wal");
    let material_id = {
        let (engine, _) = ledger(&path);
        let m = engine
            .create_material(NewMaterial::new("Anclajes", MaterialKind::Anchor, 5))
            .await
            .unwrap();

        // Polled once, then dropped like a timed-out request.
        let _ = engine
            .create_loan(LoanRequest::new(m.id, "pau", 2))
            .now_or_never();

        let availability = engine.availability(m.id).await.unwrap();
        assert_eq!(availability.outstanding, 2);
        assert_eq!(availability.available, 3);
        assert_eq!(engine.material(m.id).await.unwrap().available, 3);
        assert_eq!(engine.loans_for_material(m.id).await.unwrap().len(), 1);
        m.id
    };

    let (engine, _) = ledger(&path);
    assert_eq!(engine.loans_for_material(material_id).await.unwrap().len(), 1);
    assert_eq!(engine.material(material_id).await.unwrap().available, 3);
    assert_eq!(engine.available_quantity(material_id).await.unwrap(), 3);
}
