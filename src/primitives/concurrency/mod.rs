#![forbid(unsafe_code)]

//! Transaction coordination.
//!
//! [`TxManager`] hands out timestamps, records commits, answers visibility
//! questions and routes undo, unlock and garbage-collection work to the data
//! structures registered with it. Each transaction is driven through an explicit
//! [`TxContext`] owned by the calling worker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::primitives::wal::{FrameKind, WalLog};
use crate::types::{
    commit_ts_of, CommandId, CommitTs, DtId, PageId, Result, TxId, VitreeError, WorkerId,
    MAX_WORKERS,
};

mod gc;
mod recovery;

pub use gc::{GcStats, GcWorker};
pub use recovery::RecoveryReport;

use gc::GcQueue;

/// Isolation level of a transaction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Reads see the snapshot taken at start; write conflicts abort.
    #[default]
    Snapshot,
    /// Snapshot reads plus read tracking that aborts on anti-dependencies.
    Serializable,
}

/// Workload class; analytical readers are tracked separately for tombstone reclamation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TxKind {
    /// Short transactional work.
    #[default]
    Oltp,
    /// Long-running analytical reads.
    Olap,
}

/// How serializable reads are protected against concurrent writers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Readers set per-worker lock bits; writers abort on foreign bits.
    TwoPhaseLocking,
    /// Readers raise a read timestamp; older writers abort.
    #[default]
    Timestamp,
}

/// Configuration for a [`TxManager`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TxManagerOptions {
    /// Number of worker threads; bounds worker ids.
    pub worker_threads: usize,
    /// Read protection strategy for serializable transactions.
    pub concurrency_mode: ConcurrencyMode,
}

impl Default for TxManagerOptions {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            concurrency_mode: ConcurrencyMode::Timestamp,
        }
    }
}

impl TxManagerOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker count.
    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Sets the concurrency mode.
    pub fn concurrency_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.concurrency_mode = mode;
        self
    }

    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| VitreeError::Config(e.to_string()))
    }
}

/// Per-transaction settings.
#[derive(Copy, Clone, Debug, Default)]
pub struct TxOptions {
    /// Isolation level.
    pub isolation: Isolation,
    /// Workload class.
    pub kind: TxKind,
    /// Whether the snapshot is known to be serializable without read tracking.
    pub safe_snapshot: bool,
}

impl TxOptions {
    /// Snapshot-isolated OLTP transaction.
    pub fn snapshot() -> Self {
        Self::default()
    }

    /// Serializable OLTP transaction.
    pub fn serializable() -> Self {
        Self {
            isolation: Isolation::Serializable,
            ..Self::default()
        }
    }

    /// Marks the transaction as analytical.
    pub fn olap(mut self) -> Self {
        self.kind = TxKind::Olap;
        self
    }

    /// Declares the snapshot safe.
    pub fn safe_snapshot(mut self, safe: bool) -> Self {
        self.safe_snapshot = safe;
        self
    }
}

/// Lifecycle state of a transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxState {
    /// Running.
    Active,
    /// Committed at the given timestamp.
    Committed(CommitTs),
    /// Rolled back.
    Aborted,
}

/// Bytes staged for a data structure hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedEntry {
    /// Target data structure.
    pub dt_id: DtId,
    /// Encoded entry.
    pub bytes: Vec<u8>,
}

/// State of one transaction, owned by the worker running it.
#[derive(Debug)]
pub struct TxContext {
    worker_id: WorkerId,
    tx_id: TxId,
    options: TxOptions,
    state: TxState,
    next_command: CommandId,
    undo_log: Vec<StagedEntry>,
    todos: Vec<StagedEntry>,
    unlocks: Vec<StagedEntry>,
}

impl TxContext {
    /// Worker running the transaction.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Transaction id, equal to its start timestamp.
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Isolation level.
    pub fn isolation(&self) -> Isolation {
        self.options.isolation
    }

    /// Workload class.
    pub fn kind(&self) -> TxKind {
        self.options.kind
    }

    /// Whether the transaction is serializable.
    pub fn is_serializable(&self) -> bool {
        self.options.isolation == Isolation::Serializable
    }

    /// Whether reads must be tracked (serializable with an unsafe snapshot).
    pub fn needs_read_marks(&self) -> bool {
        self.is_serializable() && !self.options.safe_snapshot
    }

    /// Lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Errors unless the transaction is still running.
    pub fn ensure_active(&self) -> Result<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(VitreeError::TxState("transaction is no longer active"))
        }
    }

    /// Allocates the next command id.
    pub fn next_command_id(&mut self) -> CommandId {
        let id = self.next_command;
        self.next_command += 1;
        id
    }

    /// Number of logical records the transaction would undo on abort.
    pub fn undo_len(&self) -> usize {
        self.undo_log.len()
    }

    /// Schedules garbage-collection work to run after commit.
    pub fn stage_todo(&mut self, dt_id: DtId, bytes: Vec<u8>) {
        self.todos.push(StagedEntry { dt_id, bytes });
    }

    /// Schedules a read-lock release at commit or abort.
    pub fn stage_unlock(&mut self, dt_id: DtId, bytes: Vec<u8>) {
        self.unlocks.push(StagedEntry { dt_id, bytes });
    }
}

/// Hooks a data structure exposes to the transaction coordinator.
///
/// The worker id is passed explicitly rather than read from thread-local state.
pub trait DataStructureHooks: Send + Sync {
    /// Identifier the structure registered under.
    fn dt_id(&self) -> DtId;

    /// Reverts one logical record of transaction `tx_id`. Must be idempotent.
    fn undo(&self, entry: &[u8], worker_id: WorkerId, tx_id: TxId) -> Result<()>;

    /// Re-applies one record during crash recovery.
    fn redo(&self, entry: &[u8], worker_id: WorkerId, tx_id: TxId) -> Result<()>;

    /// Reclaims history left by a committed mutation.
    fn todo(
        &self,
        entry: &[u8],
        version_worker_id: WorkerId,
        version_tx_id: TxId,
        called_before: bool,
    ) -> Result<TodoOutcome>;

    /// Releases a 2PL read lock held by `worker_id`.
    fn unlock(&self, entry: &[u8], worker_id: WorkerId) -> Result<()>;

    /// Compacts a page on behalf of the buffer manager.
    fn check_space_utilization(&self, page_id: PageId) -> Result<SpaceCheckResult>;

    /// Metadata persisted alongside the catalog.
    fn serialize(&self) -> BTreeMap<String, String>;

    /// Restores metadata written by [`DataStructureHooks::serialize`].
    fn deserialize(&self, meta: &BTreeMap<String, String>) -> Result<()>;
}

/// Result of a garbage-collection todo.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TodoOutcome {
    /// Nothing left to do for this entry.
    Done,
    /// Call again with `called_before = true` once all readers moved on.
    Reschedule,
}

/// Answer to the buffer manager's space check.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpaceCheckResult {
    /// The page did not change.
    Nothing,
    /// The page is not ours or cannot be compacted; try another frame.
    PickAnotherBf,
    /// Space was reclaimed; re-evaluate the same frame.
    RestartSameBf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committed(CommitTs),
    Aborted,
}

/// Coordinates transactions across workers.
pub struct TxManager {
    options: TxManagerOptions,
    clock: AtomicU64,
    next_dt: AtomicU64,
    status: RwLock<FxHashMap<TxId, TxStatus>>,
    active: Mutex<BTreeMap<TxId, TxKind>>,
    busy_workers: Mutex<Vec<bool>>,
    wal: Arc<WalLog>,
    registry: RwLock<FxHashMap<DtId, Weak<dyn DataStructureHooks>>>,
    gc: GcQueue,
}

impl TxManager {
    /// Creates a manager with an empty WAL.
    pub fn new(options: TxManagerOptions) -> Result<Self> {
        Self::with_wal(options, Arc::new(WalLog::new()))
    }

    /// Creates a manager on top of an existing WAL, e.g. one reopened for recovery.
    pub fn with_wal(options: TxManagerOptions, wal: Arc<WalLog>) -> Result<Self> {
        if options.worker_threads == 0 || options.worker_threads > MAX_WORKERS {
            return Err(VitreeError::Invalid("worker_threads must be in 1..=128"));
        }
        let workers = options.worker_threads;
        Ok(Self {
            options,
            clock: AtomicU64::new(1),
            next_dt: AtomicU64::new(1),
            status: RwLock::new(FxHashMap::default()),
            active: Mutex::new(BTreeMap::new()),
            busy_workers: Mutex::new(vec![false; workers]),
            wal,
            registry: RwLock::new(FxHashMap::default()),
            gc: GcQueue::new(workers),
        })
    }

    /// Configuration.
    pub fn options(&self) -> &TxManagerOptions {
        &self.options
    }

    /// Number of workers.
    pub fn worker_threads(&self) -> usize {
        self.options.worker_threads
    }

    /// Read protection strategy.
    pub fn concurrency_mode(&self) -> ConcurrencyMode {
        self.options.concurrency_mode
    }

    /// The write-ahead log.
    pub fn wal(&self) -> &Arc<WalLog> {
        &self.wal
    }

    /// Allocates an id for a new data structure.
    pub fn allocate_dt_id(&self) -> DtId {
        DtId(self.next_dt.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a data structure's hooks.
    pub fn register(&self, hooks: Weak<dyn DataStructureHooks>, dt_id: DtId) {
        self.next_dt.fetch_max(dt_id.0 + 1, Ordering::Relaxed);
        self.registry.write().insert(dt_id, hooks);
    }

    /// Hooks of a registered data structure.
    pub fn hooks(&self, dt_id: DtId) -> Result<Arc<dyn DataStructureHooks>> {
        self.registry
            .read()
            .get(&dt_id)
            .and_then(Weak::upgrade)
            .ok_or(VitreeError::UnknownDataStructure(dt_id))
    }

    /// Starts a transaction on `worker_id`.
    pub fn begin(&self, worker_id: WorkerId, options: TxOptions) -> Result<TxContext> {
        {
            let mut busy = self.busy_workers.lock();
            let slot = busy
                .get_mut(worker_id as usize)
                .ok_or(VitreeError::Invalid("worker id out of range"))?;
            if *slot {
                return Err(VitreeError::TxState("worker already runs a transaction"));
            }
            *slot = true;
        }
        let mut active = self.active.lock();
        let tx_id = self.clock.fetch_add(1, Ordering::AcqRel);
        self.status.write().insert(tx_id, TxStatus::Active);
        active.insert(tx_id, options.kind);
        trace!(worker = worker_id, tx = tx_id, ?options, "tx.begin");
        Ok(TxContext {
            worker_id,
            tx_id,
            options,
            state: TxState::Active,
            next_command: 0,
            undo_log: Vec::new(),
            todos: Vec::new(),
            unlocks: Vec::new(),
        })
    }

    /// Appends a record for `ctx`; logical records are also kept for abort.
    pub fn log(
        &self,
        ctx: &mut TxContext,
        dt_id: DtId,
        record: Vec<u8>,
        to_wal: bool,
        logical: bool,
    ) -> Result<()> {
        ctx.ensure_active()?;
        if to_wal {
            self.wal
                .append(FrameKind::Data, ctx.tx_id, ctx.worker_id, dt_id, &record)?;
        }
        if logical {
            ctx.undo_log.push(StagedEntry {
                dt_id,
                bytes: record,
            });
        }
        Ok(())
    }

    /// Commits `ctx`, releasing its read locks and queueing its todos.
    pub fn commit(&self, ctx: &mut TxContext) -> Result<CommitTs> {
        ctx.ensure_active()?;
        let commit_ts = {
            let mut active = self.active.lock();
            let commit_ts = self.clock.fetch_add(1, Ordering::AcqRel);
            self.wal
                .append(FrameKind::Commit, ctx.tx_id, ctx.worker_id, DtId(0), &[])?;
            self.status
                .write()
                .insert(ctx.tx_id, TxStatus::Committed(commit_ts));
            active.remove(&ctx.tx_id);
            commit_ts
        };
        ctx.state = TxState::Committed(commit_ts);
        self.finish(ctx)?;
        let todos = std::mem::take(&mut ctx.todos);
        self.gc.push(ctx.worker_id, ctx.tx_id, commit_ts, todos);
        debug!(worker = ctx.worker_id, tx = ctx.tx_id, commit_ts, "tx.commit");
        Ok(commit_ts)
    }

    /// Rolls back `ctx` by undoing its logical records newest first.
    pub fn abort(&self, ctx: &mut TxContext) -> Result<()> {
        ctx.ensure_active()?;
        let undo_log = std::mem::take(&mut ctx.undo_log);
        for entry in undo_log.iter().rev() {
            self.hooks(entry.dt_id)?
                .undo(&entry.bytes, ctx.worker_id, ctx.tx_id)?;
        }
        {
            let mut active = self.active.lock();
            self.wal
                .append(FrameKind::Abort, ctx.tx_id, ctx.worker_id, DtId(0), &[])?;
            self.status.write().insert(ctx.tx_id, TxStatus::Aborted);
            active.remove(&ctx.tx_id);
        }
        ctx.state = TxState::Aborted;
        ctx.todos.clear();
        self.finish(ctx)?;
        debug!(worker = ctx.worker_id, tx = ctx.tx_id, undone = undo_log.len(), "tx.abort");
        Ok(())
    }

    fn finish(&self, ctx: &mut TxContext) -> Result<()> {
        let unlocks = std::mem::take(&mut ctx.unlocks);
        if let Some(slot) = self.busy_workers.lock().get_mut(ctx.worker_id as usize) {
            *slot = false;
        }
        for entry in &unlocks {
            self.hooks(entry.dt_id)?.unlock(&entry.bytes, ctx.worker_id)?;
        }
        Ok(())
    }

    /// Commit timestamp of `ts`: `None` while active or if aborted.
    ///
    /// Timestamps the manager no longer tracks belong to transactions that
    /// committed before every running snapshot and resolve to 0.
    pub fn commit_ts(&self, ts: TxId) -> Option<CommitTs> {
        if let Some(commit) = commit_ts_of(ts) {
            return Some(commit);
        }
        match self.status.read().get(&ts) {
            Some(TxStatus::Committed(commit)) => Some(*commit),
            Some(TxStatus::Active) | Some(TxStatus::Aborted) => None,
            None => Some(0),
        }
    }

    /// Whether the version written by (`worker_id`, `tx_ts`) is visible to `ctx`.
    ///
    /// Reads compare against the snapshot. Writes do too in timestamp mode; in
    /// two-phase-locking mode a write sees the latest committed state and read
    /// locks arbitrate conflicts.
    pub fn is_visible_for_me(
        &self,
        ctx: &TxContext,
        worker_id: WorkerId,
        tx_ts: TxId,
        for_write: bool,
    ) -> bool {
        if worker_id == ctx.worker_id && tx_ts == ctx.tx_id {
            return true;
        }
        let horizon = if for_write && self.options.concurrency_mode == ConcurrencyMode::TwoPhaseLocking
        {
            CommitTs::MAX
        } else {
            ctx.tx_id
        };
        self.commit_ts(tx_ts).is_some_and(|commit| commit < horizon)
    }

    /// Whether every running transaction sees the version written at `tx_ts`.
    pub fn is_visible_for_all(&self, tx_ts: TxId) -> bool {
        let (_, all) = self.watermarks();
        self.commit_ts(tx_ts).is_some_and(|commit| commit < all)
    }

    /// Whether every running OLTP transaction sees the version written at `tx_ts`.
    pub fn is_visible_for_all_oltp(&self, tx_ts: TxId) -> bool {
        let (oltp, _) = self.watermarks();
        self.commit_ts(tx_ts).is_some_and(|commit| commit < oltp)
    }

    /// Oldest running snapshot among OLTP transactions and among all transactions.
    pub fn watermarks(&self) -> (TxId, TxId) {
        let active = self.active.lock();
        let now = self.clock.load(Ordering::Acquire);
        let all = active.keys().next().copied().unwrap_or(now);
        let oltp = active
            .iter()
            .find(|(_, kind)| **kind == TxKind::Oltp)
            .map(|(tx, _)| *tx)
            .unwrap_or(now);
        (oltp, all)
    }

    /// Number of running transactions.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Runs every queued todo whose transaction is old enough.
    pub fn collect_garbage(&self) -> Result<GcStats> {
        let (oltp, all) = self.watermarks();
        let mut stats = self.gc.drain(oltp, all, |task, worker, tx| {
            match self.hooks(task.dt_id) {
                Ok(hooks) => hooks.todo(&task.bytes, worker, tx, task.called_before).map(Some),
                Err(VitreeError::UnknownDataStructure(dt)) => {
                    debug!(dt = %dt, "gc.todo.dropped");
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        })?;
        stats.pruned = self.prune_status(all);
        Ok(stats)
    }

    /// Number of todos waiting in the queue.
    pub fn pending_todos(&self) -> usize {
        self.gc.pending()
    }

    fn prune_status(&self, all: TxId) -> usize {
        let mut status = self.status.write();
        let before = status.len();
        status.retain(|tx, state| match state {
            TxStatus::Active => true,
            TxStatus::Committed(commit) => *commit >= all,
            TxStatus::Aborted => *tx >= all,
        });
        before - status.len()
    }

    fn resume_after_recovery(&self, max_tx: TxId, losers: &BTreeSet<TxId>) {
        self.clock.fetch_max(max_tx + 1, Ordering::AcqRel);
        let mut status = self.status.write();
        for tx in losers {
            status.insert(*tx, TxStatus::Aborted);
        }
    }
}
