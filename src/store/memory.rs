use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::COMPACT_COMMIT_RECORDS;
use crate::model::*;
use crate::wal::Wal;

use super::{DocumentStore, MaterialTxn, StoreError, StoreResult, TxnScope};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty: flush batch
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!(path = %wal.path().display(), "WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Commit, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch. Callers were told this batch failed.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let mut batch = vec![(commit, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

fn wal_closed<T>(_: T) -> StoreError {
    StoreError::Unavailable("WAL writer shut down".into())
}

// ── Store ────────────────────────────────────────────────

/// Record maps and their secondary indexes.
#[derive(Default)]
struct Tables {
    materials: DashMap<Ulid, Material>,
    loans: DashMap<Ulid, Loan>,
    activities: DashMap<Ulid, Activity>,
    /// Secondary index: material id → loan ids (full history).
    by_material: DashMap<Ulid, Vec<Ulid>>,
    /// Secondary index: activity id → loan ids.
    by_activity: DashMap<Ulid, Vec<Ulid>>,
}

impl Tables {
    fn apply(&self, records: Vec<Record>) {
        for record in records {
            match record {
                Record::Material(m) => {
                    self.materials.insert(m.id, m);
                }
                Record::Loan(l) => {
                    if !self.loans.contains_key(&l.id) {
                        self.by_material.entry(l.material_id).or_default().push(l.id);
                        if let Some(aid) = l.activity_id {
                            self.by_activity.entry(aid).or_default().push(l.id);
                        }
                    }
                    self.loans.insert(l.id, l);
                }
                Record::Activity(a) => {
                    self.activities.insert(a.id, a);
                }
            }
        }
    }

    fn collect_loans(&self, ids: &[Ulid], keep: impl Fn(&Loan) -> bool) -> Vec<Loan> {
        ids.iter()
            .filter_map(|id| self.loans.get(id).map(|l| l.value().clone()))
            .filter(|l| keep(l))
            .collect()
    }
}

/// In-process document store. Records live in concurrent maps; with a WAL
/// attached, every commit is durable before it becomes visible.
pub struct MemStore {
    tables: Arc<Tables>,
    /// One transaction at a time per material.
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Commits hold it shared; compaction holds it exclusively so no commit
    /// lands between the snapshot and the file swap.
    commit_gate: Arc<RwLock<()>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Volatile store with no WAL.
    pub fn new() -> Self {
        Self {
            tables: Arc::default(),
            locks: DashMap::new(),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx: None,
        }
    }

    /// Durable store: replays `wal_path`, cuts off a torn tail, then appends
    /// every commit to it. Must be called inside a tokio runtime (spawns the
    /// WAL writer).
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, commits) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut store = Self::new();
        let replayed = commits.len();
        for commit in commits {
            store.tables.apply(commit.records);
        }
        store.wal_tx = Some(wal_tx);
        tracing::info!(
            path = %wal_path.display(),
            commits = replayed,
            materials = store.tables.materials.len(),
            loans = store.tables.loans.len(),
            "store recovered from WAL"
        );
        Ok(store)
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    async fn lock_material(&self, material_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(material_id).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Write to the WAL (if any), then make the records visible. `held` is
    /// the caller's material lock, released once the records are visible.
    ///
    /// A queued append becomes durable whether or not the caller is still
    /// waiting, so the append and the apply run in their own task, which owns
    /// the commit gate and `held` until both are done.
    async fn commit(
        &self,
        records: Vec<Record>,
        held: Option<OwnedMutexGuard<()>>,
    ) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let gate = self.commit_gate.clone().read_owned().await;
        let Some(wal_tx) = self.wal_tx.clone() else {
            self.tables.apply(records);
            return Ok(());
        };

        let tables = self.tables.clone();
        let task = tokio::spawn(async move {
            let _held = (gate, held);
            let commit = Commit { records };
            let (tx, rx) = oneshot::channel();
            wal_tx
                .send(WalCommand::Append {
                    commit: commit.clone(),
                    response: tx,
                })
                .await
                .map_err(wal_closed)?;
            rx.await
                .map_err(wal_closed)?
                .map_err(|e| StoreError::Unavailable(format!("WAL error: {e}")))?;
            tables.apply(commit.records);
            Ok::<_, StoreError>(())
        });
        task.await
            .map_err(|e| StoreError::Unavailable(format!("commit task failed: {e}")))?
    }

    /// Number of commits appended since the last compaction (0 without a WAL).
    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else { return 0 };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL with one snapshot of every current record.
    pub async fn compact_wal(&self) -> StoreResult<()> {
        let Some(wal_tx) = &self.wal_tx else { return Ok(()) };
        let _gate = self.commit_gate.write().await;

        // Materials before loans so replay always sees a loan's material first.
        let mut records: Vec<Record> = Vec::new();
        records.extend(self.tables.materials.iter().map(|e| Record::Material(e.value().clone())));
        records.extend(self.tables.activities.iter().map(|e| Record::Activity(e.value().clone())));
        records.extend(self.tables.loans.iter().map(|e| Record::Loan(e.value().clone())));
        let commits: Vec<Commit> = records
            .chunks(COMPACT_COMMIT_RECORDS)
            .map(|chunk| Commit {
                records: chunk.to_vec(),
            })
            .collect();

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(wal_closed)?;
        rx.await
            .map_err(wal_closed)?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction failed: {e}")))
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn material(&self, id: Ulid) -> StoreResult<Option<Material>> {
        Ok(self.tables.materials.get(&id).map(|m| m.value().clone()))
    }

    async fn materials(&self) -> StoreResult<Vec<Material>> {
        let mut all: Vec<Material> = self.tables.materials.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|m| m.id);
        Ok(all)
    }

    async fn insert_material(&self, material: Material) -> StoreResult<()> {
        let guard = self.lock_material(material.id).await;
        if self.tables.materials.contains_key(&material.id) {
            return Err(StoreError::Duplicate(material.id));
        }
        self.commit(vec![Record::Material(material)], Some(guard)).await
    }

    async fn loan(&self, id: Ulid) -> StoreResult<Option<Loan>> {
        Ok(self.tables.loans.get(&id).map(|l| l.value().clone()))
    }

    async fn loans_by_material(&self, material_id: Ulid) -> StoreResult<Vec<Loan>> {
        let ids = self
            .tables.by_material
            .get(&material_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(self.tables.collect_loans(&ids, |_| true))
    }

    async fn loans_by_activity(
        &self,
        activity_id: Ulid,
        state: Option<LoanState>,
    ) -> StoreResult<Vec<Loan>> {
        let ids = self
            .tables.by_activity
            .get(&activity_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(self.tables.collect_loans(&ids, |l| state.is_none_or(|s| l.state == s)))
    }

    async fn loans_by_state(&self, state: LoanState) -> StoreResult<Vec<Loan>> {
        Ok(self
            .tables.loans
            .iter()
            .filter(|e| e.value().state == state)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn activity(&self, id: Ulid) -> StoreResult<Option<Activity>> {
        Ok(self.tables.activities.get(&id).map(|a| a.value().clone()))
    }

    async fn put_activity(&self, activity: Activity) -> StoreResult<()> {
        self.commit(vec![Record::Activity(activity)], None).await
    }

    async fn activities_ended(
        &self,
        until: Ms,
        after: Option<Ulid>,
        limit: usize,
    ) -> StoreResult<Vec<Activity>> {
        let mut ended: Vec<Activity> = self
            .tables.activities
            .iter()
            .filter(|e| e.value().ends_at <= until && after.is_none_or(|a| *e.key() > a))
            .map(|e| e.value().clone())
            .collect();
        ended.sort_by_key(|a| a.id);
        ended.truncate(limit);
        Ok(ended)
    }

    async fn transact<T, E, F>(&self, scope: TxnScope, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut MaterialTxn) -> Result<T, E> + Send + 'static,
    {
        let guard = self.lock_material(scope.material_id).await;

        let material = self
            .tables.materials
            .get(&scope.material_id)
            .map(|m| m.value().clone())
            .ok_or(StoreError::NotFound(scope.material_id))?;

        let ids = self
            .tables.by_material
            .get(&scope.material_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut loans = self.tables.collect_loans(&ids, |l| l.is_active());
        if let Some(focus) = scope.loan_id
            && !loans.iter().any(|l| l.id == focus)
            && let Some(l) = self.tables.loans.get(&focus)
            && l.material_id == scope.material_id
        {
            loans.push(l.value().clone());
        }

        let mut txn = MaterialTxn::new(material, loans);
        let value = f(&mut txn)?;
        if txn.is_dirty() {
            self.commit(txn.into_records(), Some(guard)).await?;
        }
        Ok(value)
    }
}
