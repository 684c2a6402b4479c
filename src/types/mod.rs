//! Shared identifiers, status codes and the crate error type.

use std::fmt;

/// Checksum helpers used by the write-ahead log.
pub mod checksum;

pub use checksum::{frame_crc32, Checksum, Crc32Fast};

/// Identifier of a worker thread; also the bit index of its 2PL read lock.
pub type WorkerId = u8;

/// Transaction start timestamp, doubling as the transaction id.
pub type TxId = u64;

/// Per-transaction sequence number of a mutation.
pub type CommandId = u64;

/// Commit timestamp assigned when a transaction commits.
pub type CommitTs = u64;

/// Sentinel command id meaning "no older version exists".
pub const INVALID_COMMAND_ID: CommandId = u64::MAX;

/// High bit of a tuple timestamp marking it as a commit timestamp.
pub const COMMIT_MARK: u64 = 1 << 63;

/// Largest worker count representable in the 128-bit read-lock bitmask.
pub const MAX_WORKERS: usize = 128;

/// Returns `ts` tagged as a commit timestamp.
#[inline]
pub fn mark_committed(ts: CommitTs) -> u64 {
    ts | COMMIT_MARK
}

/// Returns the commit timestamp if `ts` carries the commit mark.
#[inline]
pub fn commit_ts_of(ts: u64) -> Option<CommitTs> {
    if ts & COMMIT_MARK != 0 {
        Some(ts & !COMMIT_MARK)
    } else {
        None
    }
}

/// Identifier of a registered data structure (one versioned tree).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DtId(pub u64);

impl fmt::Display for DtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dt#{}", self.0)
    }
}

/// Identifier of a leaf page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    /// Placeholder used where a record has no page (e.g. a split without parent).
    pub const NONE: PageId = PageId(u64::MAX);
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// Log sequence number of a WAL frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lsn(pub u64);

/// Outcome of a user-facing operation that did not fail fatally.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpResult {
    /// The operation completed.
    Ok,
    /// No version of the key is visible to the caller.
    NotFound,
    /// A live, visible version of the key already exists.
    DuplicateKey,
    /// The caller's transaction must abort (conflict or unsafe snapshot).
    AbortTx,
    /// Unspecified failure reported by a collaborator.
    Other,
}

impl OpResult {
    /// Returns `true` for [`OpResult::Ok`].
    pub fn is_ok(self) -> bool {
        matches!(self, OpResult::Ok)
    }
}

/// Fatal errors. Conflicts and missing keys are reported through [`OpResult`].
#[derive(thiserror::Error, Debug)]
pub enum VitreeError {
    /// Bytes failed to decode or violated a layout invariant.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller supplied an argument the engine cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A fat tuple could not fit a new delta even after compaction.
    #[error("fat tuple overflow: {needed} bytes needed, {available} available")]
    FatTupleOverflow {
        /// Bytes required by the pending delta.
        needed: usize,
        /// Free bytes left after compaction.
        available: usize,
    },
    /// A hook referenced a data structure that is no longer registered.
    #[error("unknown data structure {0}")]
    UnknownDataStructure(DtId),
    /// A transaction was used after commit or abort.
    #[error("transaction state: {0}")]
    TxState(&'static str),
    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// I/O failure while reading configuration.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VitreeError>;

/// Reads a big-endian `u16` at `offset`, failing with `what` when truncated.
pub(crate) fn read_u16(buf: &[u8], offset: usize, what: &'static str) -> Result<u16> {
    let bytes = buf
        .get(offset..offset + 2)
        .ok_or(VitreeError::Corruption(what))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads a big-endian `u32` at `offset`.
pub(crate) fn read_u32(buf: &[u8], offset: usize, what: &'static str) -> Result<u32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or(VitreeError::Corruption(what))?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_be_bytes(raw))
}

/// Reads a big-endian `u64` at `offset`.
pub(crate) fn read_u64(buf: &[u8], offset: usize, what: &'static str) -> Result<u64> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or(VitreeError::Corruption(what))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(raw))
}

/// Reads a big-endian `u128` at `offset`.
pub(crate) fn read_u128(buf: &[u8], offset: usize, what: &'static str) -> Result<u128> {
    let bytes = buf
        .get(offset..offset + 16)
        .ok_or(VitreeError::Corruption(what))?;
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Ok(u128::from_be_bytes(raw))
}

/// Reads one byte at `offset`.
pub(crate) fn read_u8(buf: &[u8], offset: usize, what: &'static str) -> Result<u8> {
    buf.get(offset).copied().ok_or(VitreeError::Corruption(what))
}

/// Borrows `len` bytes at `offset`.
pub(crate) fn read_slice<'a>(
    buf: &'a [u8],
    offset: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8]> {
    let end = offset.checked_add(len).ok_or(VitreeError::Corruption(what))?;
    buf.get(offset..end).ok_or(VitreeError::Corruption(what))
}
