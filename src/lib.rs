//! Multi-version concurrency control for a B-tree storage engine.
//!
//! `vitree` decides, for every key, which bytes a transaction may see. Updates are
//! kept either as a chain of before-images in a version store or folded inline into
//! a "fat tuple"; removed keys leave tombstones that garbage collection relocates to
//! a graveyard tree so long-running analytical readers keep a consistent snapshot.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;
