use std::sync::Arc;

use tokio::sync::broadcast::error::TryRecvError;
use ulid::Ulid;

use loanledger::audit::{AuditHub, LedgerEvent};
use loanledger::clock::ManualClock;
use loanledger::config::EngineConfig;
use loanledger::engine::{Engine, ErrorKind};
use loanledger::model::*;
use loanledger::reaper;
use loanledger::store::{DocumentStore, MemStore};

const NOW: Ms = 1_760_000_000_000;

fn ledger() -> (Engine<MemStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(NOW));
    let engine = Engine::new(
        Arc::new(MemStore::new()),
        clock.clone(),
        Arc::new(AuditHub::new()),
        EngineConfig::default(),
    );
    (engine, clock)
}

/// A weekend outing: lend for the activity, let it end, scan, return.
#[tokio::test]
async fn outing_lifecycle() {
    let (engine, clock) = ledger();
    let mut feed = engine.audit().subscribe();

    let rope = engine.create_material(NewMaterial::rope("Cuerda 70m")).await.unwrap();
    let quickdraws = engine
        .create_material(NewMaterial::new("Cintas exprés", MaterialKind::Misc, 12))
        .await
        .unwrap();
    let outing = Activity {
        id: Ulid::new(),
        name: "Escalada en Montserrat".into(),
        ends_at: NOW + 2 * DAY_MS,
        state: ActivityState::Planned,
    };
    engine.store().put_activity(outing.clone()).await.unwrap();

    let rope_loan = engine
        .create_loan(LoanRequest::new(rope.id, "marta", 1).for_activity(outing.id))
        .await
        .unwrap();
    let qd_loan = engine
        .create_loan(LoanRequest::new(quickdraws.id, "marta", 10).for_activity(outing.id))
        .await
        .unwrap();
    assert_eq!(engine.available_quantity(rope.id).await.unwrap(), 0);
    assert_eq!(engine.available_quantity(quickdraws.id).await.unwrap(), 2);

    // Nothing is overdue while the outing is on.
    let mut cursor = None;
    let report = reaper::scan_once(&engine, &mut cursor).await.unwrap();
    assert_eq!(report.succeeded, 0);
    assert!(engine.list_overdue_loans(OverdueFilter::all()).await.unwrap().is_empty());

    clock.advance(3 * DAY_MS);
    let report = reaper::scan_once(&engine, &mut cursor).await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert!(report.complete);

    let overdue = engine
        .list_overdue_loans(OverdueFilter::user("marta"))
        .await
        .unwrap();
    assert_eq!(overdue.len(), 2);
    assert!(overdue.iter().all(|l| l.auto_marked && l.state == LoanState::PendingReturn));

    engine.return_loan(rope_loan.id, None).await.unwrap();
    let wear = Incident::new(IncidentKind::Wear, Severity::Minor, "gatillos duros");
    engine.return_loan(qd_loan.id, Some(wear)).await.unwrap();

    assert!(engine.list_overdue_loans(OverdueFilter::all()).await.unwrap().is_empty());
    assert_eq!(engine.available_quantity(rope.id).await.unwrap(), 1);
    let qd = engine.availability(quickdraws.id).await.unwrap();
    assert_eq!(qd.state, MaterialState::Maintenance);
    assert_eq!(qd.available, 0);

    engine
        .set_material_state(quickdraws.id, MaterialState::Available)
        .await
        .unwrap();
    assert_eq!(engine.available_quantity(quickdraws.id).await.unwrap(), 12);

    let mut events = Vec::new();
    loop {
        match feed.try_recv() {
            Ok(e) => events.push(e),
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("feed broken: {e}"),
        }
    }
    let automatic = events
        .iter()
        .filter(|e| matches!(e, LedgerEvent::LoanMarkedPending { automatic: true, .. }))
        .count();
    assert_eq!(automatic, 2);
    assert!(events.iter().any(|e| matches!(
        e,
        LedgerEvent::LoanReturned { incident: Some(IncidentKind::Wear), .. }
    )));
}

/// Random lend/return traffic never breaks 0 <= available <= total.
#[tokio::test]
async fn availability_stays_in_bounds() {
    let (engine, _) = ledger();
    let m = engine
        .create_material(NewMaterial::new("Anclajes", MaterialKind::Anchor, 7))
        .await
        .unwrap();

    // xorshift; deterministic without a rand dependency
    let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    let mut open: Vec<Ulid> = Vec::new();
    for _ in 0..500 {
        let r = next();
        if r % 3 == 0 && !open.is_empty() {
            let idx = (r as usize / 3) % open.len();
            let id = open.swap_remove(idx);
            engine.return_loan(id, None).await.unwrap();
        } else {
            let qty = (r % 4) as u32 + 1;
            match engine.create_loan(LoanRequest::new(m.id, "socio", qty)).await {
                Ok(loan) => open.push(loan.id),
                Err(e) => assert_eq!(e.kind(), ErrorKind::InsufficientAvailability),
            }
        }

        let a = engine.availability(m.id).await.unwrap();
        assert!(a.available <= a.total);
        assert!(a.outstanding <= u64::from(a.total));
        assert_eq!(u64::from(a.available) + a.outstanding, u64::from(a.total));
        assert_eq!(engine.material(m.id).await.unwrap().available, a.available);
    }
}

#[tokio::test]
async fn per_material_feed_is_scoped() {
    let (engine, _) = ledger();
    let a = engine
        .create_material(NewMaterial::new("Pies de gato", MaterialKind::Misc, 3))
        .await
        .unwrap();
    let b = engine
        .create_material(NewMaterial::new("Arneses", MaterialKind::Misc, 3))
        .await
        .unwrap();
    let mut feed_a = engine.audit().subscribe_material(a.id);

    engine.create_loan(LoanRequest::new(b.id, "socio", 1)).await.unwrap();
    assert!(matches!(feed_a.try_recv(), Err(TryRecvError::Empty)));

    let loan = engine.create_loan(LoanRequest::new(a.id, "socio", 1)).await.unwrap();
    assert_eq!(feed_a.try_recv().unwrap(), LedgerEvent::LoanOpened { loan });
}
