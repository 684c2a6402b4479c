use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sink for MVCC counters.
///
/// Implementations receive events from readers, writers and garbage collection.
/// They are called on hot paths and must not block.
pub trait MvccMetrics: Send + Sync {
    /// A tuple was reconstructed after inspecting `versions_visited` versions.
    fn chain_read(&self, versions_visited: u16, found: bool);

    /// A chained tuple was folded into a fat tuple.
    fn fat_tuple_converted(&self);

    /// A conversion attempt was rejected and the key stays chained.
    fn fat_tuple_conversion_rejected(&self);

    /// Fat-tuple compaction dropped `deltas` deltas.
    fn fat_tuple_compacted(&self, deltas: usize);

    /// A tombstone moved from the primary tree to the graveyard.
    fn graveyard_moved(&self);

    /// A tombstone or version record was reclaimed.
    fn version_purged(&self);

    /// A writer found the tuple write lock held.
    fn write_lock_contended(&self);

    /// A scan started. `kind` is "asc", "desc" or "olap".
    fn scan(&self, kind: &'static str);
}

/// Discards every event.
#[derive(Default)]
pub struct NoopMetrics;

impl MvccMetrics for NoopMetrics {
    fn chain_read(&self, _versions_visited: u16, _found: bool) {}
    fn fat_tuple_converted(&self) {}
    fn fat_tuple_conversion_rejected(&self) {}
    fn fat_tuple_compacted(&self, _deltas: usize) {}
    fn graveyard_moved(&self) {}
    fn version_purged(&self) {}
    fn write_lock_contended(&self) {}
    fn scan(&self, _kind: &'static str) {}
}

/// Atomic counters for every event.
#[derive(Default)]
pub struct CounterMetrics {
    /// Reconstructions performed.
    pub chains_read: AtomicU64,
    /// Versions inspected across all reconstructions.
    pub versions_visited: AtomicU64,
    /// Reconstructions that found no visible version.
    pub chains_not_found: AtomicU64,
    /// Chained tuples converted to fat tuples.
    pub fat_conversions: AtomicU64,
    /// Rejected conversion attempts.
    pub fat_conversions_rejected: AtomicU64,
    /// Deltas dropped by fat-tuple compaction.
    pub fat_deltas_compacted: AtomicU64,
    /// Tombstones moved to the graveyard.
    pub graveyard_moves: AtomicU64,
    /// Tombstones and version records reclaimed.
    pub versions_purged: AtomicU64,
    /// Write-lock contention events.
    pub write_lock_contention: AtomicU64,
    /// Ascending scans.
    pub scans_asc: AtomicU64,
    /// Descending scans.
    pub scans_desc: AtomicU64,
    /// Analytical merge scans.
    pub scans_olap: AtomicU64,
}

impl MvccMetrics for CounterMetrics {
    fn chain_read(&self, versions_visited: u16, found: bool) {
        self.chains_read.fetch_add(1, Ordering::Relaxed);
        self.versions_visited
            .fetch_add(u64::from(versions_visited), Ordering::Relaxed);
        if !found {
            self.chains_not_found.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fat_tuple_converted(&self) {
        self.fat_conversions.fetch_add(1, Ordering::Relaxed);
    }

    fn fat_tuple_conversion_rejected(&self) {
        self.fat_conversions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn fat_tuple_compacted(&self, deltas: usize) {
        self.fat_deltas_compacted
            .fetch_add(deltas as u64, Ordering::Relaxed);
    }

    fn graveyard_moved(&self) {
        self.graveyard_moves.fetch_add(1, Ordering::Relaxed);
    }

    fn version_purged(&self) {
        self.versions_purged.fetch_add(1, Ordering::Relaxed);
    }

    fn write_lock_contended(&self) {
        self.write_lock_contention.fetch_add(1, Ordering::Relaxed);
    }

    fn scan(&self, kind: &'static str) {
        match kind {
            "asc" => {
                self.scans_asc.fetch_add(1, Ordering::Relaxed);
            }
            "desc" => {
                self.scans_desc.fetch_add(1, Ordering::Relaxed);
            }
            "olap" => {
                self.scans_olap.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn MvccMetrics> {
    Arc::new(NoopMetrics)
}
