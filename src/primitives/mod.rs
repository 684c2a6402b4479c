//! Low-level primitives the versioned tree is built on.
//!
//! Includes page latches, the write-ahead log, and the transaction coordinator
//! that owns visibility, commit bookkeeping and garbage collection scheduling.

/// Transaction coordination, visibility and deferred work.
///
/// Tracks active transactions and commit timestamps, answers visibility
/// questions, and drives undo, unlock and garbage-collection hooks.
pub mod concurrency;

/// Hybrid page latches with optimistic, shared and exclusive modes.
pub mod latch;

/// Write-ahead logging for abort and crash recovery.
///
/// Frames logical records with checksums in an append-only byte image.
pub mod wal;
