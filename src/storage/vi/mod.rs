#![forbid(unsafe_code)]

//! Multi-version B-tree.
//!
//! [`VersionedBTree`] keeps the newest state of every key in a primary tree and
//! older states either inline (fat tuples) or in the [`VersionStore`]. Removed
//! keys whose tombstones only analytical readers still need are relocated to a
//! graveyard tree that [`VersionedBTree::scan_olap`] merges back in.
//!
//! Writers hold the leaf latch exclusively for the whole mutation and set the
//! tuple write-lock bit while they work on a slot. Readers either copy a slot
//! optimistically and validate the page version afterwards, or read under a
//! shared latch.

use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::primitives::concurrency::{ConcurrencyMode, DataStructureHooks, TxContext, TxManager};
use crate::storage::btree::{BTree, LeafWriteGuard, PageAllocator};
use crate::storage::metrics::{default_metrics, MvccMetrics};
use crate::storage::options::TreeOptions;
use crate::storage::tuple::{is_write_locked, set_write_locked, TupleHeader, VersionMeta};
use crate::storage::version_store::{DanglingPointer, VersionKey, VersionStore};
use crate::storage::wal_records::{TodoEntry, WalRecord};
use crate::types::{DtId, Result, TxId};

mod fat;
mod hooks;
mod mutate;
mod reconstruct;
mod scan;

pub use reconstruct::Reconstructed;

/// A B-tree whose keys carry version history.
pub struct VersionedBTree {
    dt_id: DtId,
    primary: BTree,
    graveyard: BTree,
    versions: VersionStore,
    txm: Arc<TxManager>,
    options: TreeOptions,
    metrics: Arc<dyn MvccMetrics>,
}

impl std::fmt::Debug for VersionedBTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedBTree")
            .field("dt_id", &self.dt_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl VersionedBTree {
    /// Creates a tree under a fresh data structure id and registers its hooks.
    pub fn create(txm: Arc<TxManager>, options: TreeOptions) -> Result<Arc<Self>> {
        let dt_id = txm.allocate_dt_id();
        Self::open(txm, dt_id, options)
    }

    /// Creates an empty tree under `dt_id`, e.g. before running recovery.
    pub fn open(txm: Arc<TxManager>, dt_id: DtId, options: TreeOptions) -> Result<Arc<Self>> {
        options.validate()?;
        let allocator = Arc::new(PageAllocator::new());
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        let tree = Arc::new(Self {
            dt_id,
            primary: BTree::new(dt_id, options.page_size, Arc::clone(&allocator)),
            graveyard: BTree::new(dt_id, options.page_size, allocator),
            versions: VersionStore::new(txm.worker_threads()),
            txm: Arc::clone(&txm),
            options,
            metrics,
        });
        let hooks: Arc<dyn DataStructureHooks> = tree.clone();
        let weak: Weak<dyn DataStructureHooks> = Arc::downgrade(&hooks);
        txm.register(weak, dt_id);
        debug!(dt = %dt_id, options = ?tree.options, "vi.open");
        Ok(tree)
    }

    /// Data structure id.
    pub fn dt_id(&self) -> DtId {
        self.dt_id
    }

    /// Configuration.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// The tree holding the newest state of every key.
    pub fn primary(&self) -> &BTree {
        &self.primary
    }

    /// The tree holding relocated tombstones.
    pub fn graveyard(&self) -> &BTree {
        &self.graveyard
    }

    /// Out-of-line history.
    pub fn version_store(&self) -> &VersionStore {
        &self.versions
    }

    /// The coordinating transaction manager.
    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.txm
    }

    fn visible(&self, ctx: &TxContext, meta: &VersionMeta, for_write: bool) -> bool {
        self.txm
            .is_visible_for_me(ctx, meta.worker_id, meta.tx_ts, for_write)
    }

    fn visible_for_all(&self, tx_ts: TxId) -> bool {
        self.txm.is_visible_for_all(tx_ts)
    }

    /// Whether a serializable reader protects the tuple against `ctx`'s write.
    fn read_conflict(&self, ctx: &TxContext, header: &TupleHeader) -> bool {
        match self.txm.concurrency_mode() {
            ConcurrencyMode::TwoPhaseLocking => {
                header.read_stamp & !(1u128 << ctx.worker_id()) != 0
            }
            ConcurrencyMode::Timestamp => header.read_stamp > u128::from(ctx.tx_id()),
        }
    }

    /// Appends `record` for `ctx`; logical records are always kept for abort.
    fn log(&self, ctx: &mut TxContext, record: &WalRecord) -> Result<()> {
        let logical = record.is_logical();
        if !self.options.enable_wal && !logical {
            return Ok(());
        }
        self.txm
            .log(ctx, self.dt_id, record.encode()?, self.options.enable_wal, logical)
    }

    fn stage_todo(&self, ctx: &mut TxContext, entry: TodoEntry) -> Result<()> {
        ctx.stage_todo(self.dt_id, entry.encode()?);
        Ok(())
    }

    /// Latches the primary slot of `key`, preferring the pointer hint.
    fn locate(&self, tree: &BTree, pointer: &DanglingPointer, key: &[u8]) -> Option<(LeafWriteGuard, usize)> {
        if let Some((guard, slot)) = tree.resolve(pointer) {
            if guard.node.key(slot) == key {
                return Some((guard, slot));
            }
        }
        let guard = tree.exclusive(key)?;
        let slot = guard.node.search(key).ok()?;
        Some((guard, slot))
    }

    /// Removes `start` and every older record reachable from it.
    fn purge_chain(&self, start: VersionKey) -> Result<usize> {
        let mut key = start;
        let mut purged = 0;
        loop {
            let Some(record) = self.versions.get(key)? else {
                break;
            };
            self.versions.remove(key)?;
            self.metrics.version_purged();
            purged += 1;
            let before = record.before();
            if before.is_final() {
                break;
            }
            key = before.into();
        }
        trace!(dt = %self.dt_id, worker = start.worker_id, tx = start.tx_id, purged, "vi.purge_chain");
        Ok(purged)
    }

    /// Takes the write-lock bit of `key`'s slot, retrying while another writer holds it.
    fn lock_tuple(&self, key: &[u8]) -> Result<Locked> {
        for _ in 0..=self.options.write_lock_spin_limit {
            let Some(mut guard) = self.primary.exclusive(key) else {
                return Ok(Locked::Missing);
            };
            let Ok(slot) = guard.node.search(key) else {
                return Ok(Locked::Missing);
            };
            if is_write_locked(guard.node.payload(slot))? {
                self.metrics.write_lock_contended();
                drop(guard);
                std::hint::spin_loop();
                continue;
            }
            set_write_locked(guard.node.payload_mut(slot), true)?;
            return Ok(Locked::Held(TupleLock { guard, slot }));
        }
        Ok(Locked::Busy)
    }
}

enum Locked {
    Held(TupleLock),
    Missing,
    Busy,
}

/// Exclusive latch plus the tuple write-lock bit; the bit is cleared on drop.
struct TupleLock {
    guard: LeafWriteGuard,
    slot: usize,
}

impl TupleLock {
    fn payload(&self) -> &[u8] {
        self.guard.node.payload(self.slot)
    }

    /// Replaces the slot payload and flags the page as holding history.
    fn replace(&mut self, payload: Vec<u8>) {
        self.guard.node.replace_payload(self.slot, payload);
        self.guard.node.set_has_garbage(true);
    }

    fn dangling_pointer(&self) -> DanglingPointer {
        self.guard.dangling_pointer(self.slot)
    }
}

impl Drop for TupleLock {
    fn drop(&mut self) {
        if self.slot < self.guard.node.len() {
            let _ = set_write_locked(self.guard.node.payload_mut(self.slot), false);
        }
    }
}
