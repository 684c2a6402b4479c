//! Out-of-line history for chained tuples.
//!
//! Each record is keyed by the identity of the version that replaced the recorded
//! state and carries the identity of that older state, forming a chain that
//! readers follow newest to oldest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::storage::tuple::{UpdateDescriptor, VersionMeta};
use crate::types::{
    read_slice, read_u16, read_u32, read_u64, read_u8, CommandId, PageId, Result, TxId,
    VitreeError, WorkerId,
};

const RECORD_UPDATE: u8 = 0;
const RECORD_REMOVE: u8 = 1;
const UPDATE_IS_DELTA: u8 = 0b01;
const UPDATE_ABSENT: u8 = 0b10;

/// Key of a version record: the identity of the newer version.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VersionKey {
    /// Worker of the newer version; selects the store partition.
    pub worker_id: WorkerId,
    /// Transaction of the newer version.
    pub tx_id: TxId,
    /// Command of the newer version.
    pub command_id: CommandId,
}

impl From<VersionMeta> for VersionKey {
    fn from(meta: VersionMeta) -> Self {
        Self {
            worker_id: meta.worker_id,
            tx_id: meta.tx_ts,
            command_id: meta.command_id,
        }
    }
}

/// Weak reference to a slot: valid only while the page latch version matches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DanglingPointer {
    /// Leaf page holding the slot.
    pub page_id: PageId,
    /// Latch version the page must still have.
    pub latch_version_should_be: u64,
    /// Slot index, or -1 when unknown.
    pub head_slot: i32,
}

impl DanglingPointer {
    /// Encoded size.
    pub const LEN: usize = 20;

    /// A pointer that never resolves.
    pub const STALE: DanglingPointer = DanglingPointer {
        page_id: PageId::NONE,
        latch_version_should_be: 0,
        head_slot: -1,
    };

    /// Appends `page_id u64, latch_version_should_be u64, head_slot i32`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.page_id.0.to_be_bytes());
        out.extend_from_slice(&self.latch_version_should_be.to_be_bytes());
        out.extend_from_slice(&self.head_slot.to_be_bytes());
    }

    /// Decodes a pointer at `offset`.
    pub fn decode_at(src: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            page_id: PageId(read_u64(src, offset, "dangling pointer truncated")?),
            latch_version_should_be: read_u64(src, offset + 8, "dangling pointer truncated")?,
            head_slot: read_u32(src, offset + 16, "dangling pointer truncated")? as i32,
        })
    }
}

/// What an update record holds about the older state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdatePayload {
    /// Before-image of the ranges touched by the update.
    Delta {
        /// Touched ranges.
        descriptor: UpdateDescriptor,
        /// Before-image bytes.
        diff: Vec<u8>,
    },
    /// Full before-image of the value.
    Image(Vec<u8>),
    /// The older state was a tombstone (the key was re-inserted).
    Absent,
}

/// History entry written by an update or an insert over a tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateVersion {
    /// Identity of the replaced state.
    pub before: VersionMeta,
    /// How to rebuild the replaced state.
    pub payload: UpdatePayload,
}

impl UpdateVersion {
    /// `true` when the replaced state has no older version.
    pub fn is_final(&self) -> bool {
        self.before.is_final()
    }
}

/// History entry written by a remove; holds the removed value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveVersion {
    /// Identity of the removed state.
    pub before: VersionMeta,
    /// Removed key.
    pub key: Vec<u8>,
    /// Removed value.
    pub value: Vec<u8>,
    /// Where the tombstone was left.
    pub dangling_pointer: DanglingPointer,
    /// Set once garbage collection moved the tombstone to the graveyard.
    pub moved_to_graveyard: bool,
}

/// A decoded version record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionRecord {
    /// Update history.
    Update(UpdateVersion),
    /// Remove history.
    Remove(RemoveVersion),
}

impl VersionRecord {
    /// Identity of the older state this record rebuilds.
    pub fn before(&self) -> VersionMeta {
        match self {
            VersionRecord::Update(u) => u.before,
            VersionRecord::Remove(r) => r.before,
        }
    }

    /// Encodes the record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            VersionRecord::Update(update) => {
                out.push(RECORD_UPDATE);
                update.before.encode_into(&mut out);
                match &update.payload {
                    UpdatePayload::Delta { descriptor, diff } => {
                        out.push(UPDATE_IS_DELTA);
                        descriptor.encode_into(&mut out);
                        out.extend_from_slice(diff);
                    }
                    UpdatePayload::Image(image) => {
                        out.push(0);
                        out.extend_from_slice(image);
                    }
                    UpdatePayload::Absent => out.push(UPDATE_ABSENT),
                }
            }
            VersionRecord::Remove(remove) => {
                out.push(RECORD_REMOVE);
                remove.before.encode_into(&mut out);
                let key_len = u16::try_from(remove.key.len())
                    .map_err(|_| VitreeError::Invalid("key exceeds u16"))?;
                let value_len = u16::try_from(remove.value.len())
                    .map_err(|_| VitreeError::Invalid("value exceeds u16"))?;
                out.extend_from_slice(&key_len.to_be_bytes());
                out.extend_from_slice(&value_len.to_be_bytes());
                remove.dangling_pointer.encode_into(&mut out);
                out.push(u8::from(remove.moved_to_graveyard));
                out.extend_from_slice(&remove.key);
                out.extend_from_slice(&remove.value);
            }
        }
        Ok(out)
    }

    /// Decodes a record.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let kind = read_u8(src, 0, "version record truncated")?;
        let before = VersionMeta::decode_at(src, 1)?;
        let body = 1 + VersionMeta::LEN;
        match kind {
            RECORD_UPDATE => {
                let flags = read_u8(src, body, "update version truncated")?;
                let rest = &src[body + 1..];
                let payload = if flags & UPDATE_ABSENT != 0 {
                    UpdatePayload::Absent
                } else if flags & UPDATE_IS_DELTA != 0 {
                    let (descriptor, used) = UpdateDescriptor::decode(rest)?;
                    let diff = read_slice(rest, used, descriptor.diff_length(), "update diff truncated")?
                        .to_vec();
                    UpdatePayload::Delta { descriptor, diff }
                } else {
                    UpdatePayload::Image(rest.to_vec())
                };
                Ok(VersionRecord::Update(UpdateVersion { before, payload }))
            }
            RECORD_REMOVE => {
                let key_len = read_u16(src, body, "remove version truncated")? as usize;
                let value_len = read_u16(src, body + 2, "remove version truncated")? as usize;
                let dangling_pointer = DanglingPointer::decode_at(src, body + 4)?;
                let moved = read_u8(src, body + 4 + DanglingPointer::LEN, "remove version truncated")?;
                let data = body + 5 + DanglingPointer::LEN;
                let key = read_slice(src, data, key_len, "remove version key truncated")?.to_vec();
                let value = read_slice(src, data + key_len, value_len, "remove version value truncated")?
                    .to_vec();
                Ok(VersionRecord::Remove(RemoveVersion {
                    before,
                    key,
                    value,
                    dangling_pointer,
                    moved_to_graveyard: moved != 0,
                }))
            }
            _ => Err(VitreeError::Corruption("unknown version record type")),
        }
    }
}

type Partition = RwLock<FxHashMap<(TxId, CommandId), Arc<[u8]>>>;

/// Counters for the version store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionStoreStats {
    /// Records currently stored.
    pub live: u64,
    /// Records inserted since creation.
    pub inserted: u64,
    /// Records removed since creation.
    pub purged: u64,
}

/// Version records partitioned by creating worker.
pub struct VersionStore {
    partitions: Vec<Partition>,
    inserted: AtomicU64,
    purged: AtomicU64,
}

impl VersionStore {
    /// Creates a store with one partition per worker.
    pub fn new(workers: usize) -> Self {
        Self {
            partitions: (0..workers.max(1))
                .map(|_| RwLock::new(FxHashMap::default()))
                .collect(),
            inserted: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        }
    }

    fn partition(&self, worker_id: WorkerId) -> Result<&Partition> {
        self.partitions
            .get(worker_id as usize)
            .ok_or(VitreeError::Invalid("worker id outside version store"))
    }

    /// Stores `record` under `key`. Keys are unique per transaction command.
    pub fn insert(&self, key: VersionKey, record: &VersionRecord) -> Result<()> {
        let bytes: Arc<[u8]> = record.encode()?.into();
        let mut partition = self.partition(key.worker_id)?.write();
        if partition.contains_key(&(key.tx_id, key.command_id)) {
            return Err(VitreeError::Corruption("duplicate version record"));
        }
        partition.insert((key.tx_id, key.command_id), bytes);
        self.inserted.fetch_add(1, Ordering::Relaxed);
        trace!(worker = key.worker_id, tx = key.tx_id, cmd = key.command_id, "version_store.insert");
        Ok(())
    }

    /// Looks up and decodes the record stored under `key`.
    pub fn get(&self, key: VersionKey) -> Result<Option<VersionRecord>> {
        let bytes = {
            let partition = self.partition(key.worker_id)?.read();
            partition.get(&(key.tx_id, key.command_id)).cloned()
        };
        bytes.map(|b| VersionRecord::decode(&b)).transpose()
    }

    /// Removes the record under `key`, returning whether one existed.
    pub fn remove(&self, key: VersionKey) -> Result<bool> {
        let removed = self
            .partition(key.worker_id)?
            .write()
            .remove(&(key.tx_id, key.command_id))
            .is_some();
        if removed {
            self.purged.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Flags a remove record as relocated to the graveyard.
    pub fn mark_moved_to_graveyard(&self, key: VersionKey) -> Result<bool> {
        let mut partition = self.partition(key.worker_id)?.write();
        let Some(bytes) = partition.get(&(key.tx_id, key.command_id)) else {
            return Ok(false);
        };
        let mut record = VersionRecord::decode(bytes)?;
        let VersionRecord::Remove(remove) = &mut record else {
            return Err(VitreeError::Corruption("graveyard move on update record"));
        };
        remove.moved_to_graveyard = true;
        partition.insert((key.tx_id, key.command_id), record.encode()?.into());
        Ok(true)
    }

    /// Returns store counters.
    pub fn stats(&self) -> VersionStoreStats {
        let live = self.partitions.iter().map(|p| p.read().len() as u64).sum();
        VersionStoreStats {
            live,
            inserted: self.inserted.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}
