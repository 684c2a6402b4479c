//! Versioned storage: tuple layouts, history and the multi-version tree.
//!
//! The primary and graveyard trees are plain leaf-level B-trees. Version
//! bookkeeping lives in the tuples themselves and in the version store.

/// Leaf-level B-tree with hybrid-latched pages and cursors.
pub mod btree;

/// On-page tuple formats: chained, fat and visible-for-all.
///
/// Also hosts update descriptors, which name the byte ranges an in-place
/// update touches.
pub mod tuple;

/// Out-of-line version records keyed by the newer version's identity.
pub mod version_store;

/// WAL record layouts plus staged todo and unlock entries.
pub mod wal_records;

/// The multi-version tree.
pub mod vi;

mod metrics;
mod options;

pub use metrics::{default_metrics, CounterMetrics, MvccMetrics, NoopMetrics};
pub use options::TreeOptions;
pub use vi::{Reconstructed, VersionedBTree};
