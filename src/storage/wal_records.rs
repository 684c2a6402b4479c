//! Byte layouts of the records a versioned tree writes to the WAL, plus the
//! entries it stages for deferred unlock and garbage-collection work.

use crate::storage::tuple::{UpdateDescriptor, VersionMeta};
use crate::storage::version_store::DanglingPointer;
use crate::types::{
    read_slice, read_u16, read_u32, read_u64, read_u8, CommandId, DtId, PageId, Result,
    VitreeError,
};

const KIND_BEFORE_AFTER_IMAGE: u8 = 1;
const KIND_INIT_PAGE: u8 = 2;
const KIND_AFTER_IMAGE: u8 = 3;
const KIND_LOGICAL_SPLIT: u8 = 4;
const KIND_INSERT: u8 = 5;
const KIND_UPDATE_SSIP: u8 = 6;
const KIND_REMOVE: u8 = 7;

/// A WAL record owned by a versioned tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalRecord {
    /// Page image before and after a physical change.
    BeforeAfterImage {
        /// Image before the change.
        before: Vec<u8>,
        /// Image after the change.
        after: Vec<u8>,
    },
    /// A page was allocated for a data structure.
    InitPage {
        /// Owner.
        dt_id: DtId,
        /// New page.
        page_id: PageId,
    },
    /// Page image after a physical change.
    AfterImage {
        /// The image.
        image: Vec<u8>,
    },
    /// A leaf split.
    LogicalSplit {
        /// Parent page, [`PageId::NONE`] when the tree has a flat directory.
        parent_pid: PageId,
        /// Left half (the page that split).
        left_pid: PageId,
        /// Right half (the new page).
        right_pid: PageId,
        /// Position of the right child in the parent, -1 when unknown.
        right_pos: i32,
    },
    /// Insert of a key.
    Insert {
        /// Command of the insert.
        command_id: CommandId,
        /// Inserted key.
        key: Vec<u8>,
        /// Inserted value.
        value: Vec<u8>,
    },
    /// Same-size in-place update.
    UpdateSameSizeInPlace {
        /// Command of the update.
        command_id: CommandId,
        /// Updated key.
        key: Vec<u8>,
        /// Identity of the state the update replaced.
        before: VersionMeta,
        /// Touched ranges.
        descriptor: UpdateDescriptor,
        /// Before XOR after over the touched ranges.
        xor_diff: Vec<u8>,
    },
    /// Remove of a key.
    Remove {
        /// Command of the remove.
        command_id: CommandId,
        /// Removed key.
        key: Vec<u8>,
        /// Removed value.
        value: Vec<u8>,
        /// Identity of the removed state.
        before: VersionMeta,
    },
}

fn len_u16(len: usize, what: &'static str) -> Result<u16> {
    u16::try_from(len).map_err(|_| VitreeError::Invalid(what))
}

impl WalRecord {
    /// Whether replay must apply this record to rebuild logical state.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            WalRecord::Insert { .. }
                | WalRecord::UpdateSameSizeInPlace { .. }
                | WalRecord::Remove { .. }
        )
    }

    /// Encodes the record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            WalRecord::BeforeAfterImage { before, after } => {
                let size = before.len().max(after.len());
                out.push(KIND_BEFORE_AFTER_IMAGE);
                out.extend_from_slice(&len_u16(size, "page image exceeds u16")?.to_be_bytes());
                out.extend_from_slice(before);
                out.resize(3 + size, 0);
                out.extend_from_slice(after);
                out.resize(3 + 2 * size, 0);
            }
            WalRecord::InitPage { dt_id, page_id } => {
                out.push(KIND_INIT_PAGE);
                out.extend_from_slice(&dt_id.0.to_be_bytes());
                out.extend_from_slice(&page_id.0.to_be_bytes());
            }
            WalRecord::AfterImage { image } => {
                out.push(KIND_AFTER_IMAGE);
                out.extend_from_slice(
                    &len_u16(image.len(), "page image exceeds u16")?.to_be_bytes(),
                );
                out.extend_from_slice(image);
            }
            WalRecord::LogicalSplit {
                parent_pid,
                left_pid,
                right_pid,
                right_pos,
            } => {
                out.push(KIND_LOGICAL_SPLIT);
                out.extend_from_slice(&parent_pid.0.to_be_bytes());
                out.extend_from_slice(&left_pid.0.to_be_bytes());
                out.extend_from_slice(&right_pid.0.to_be_bytes());
                out.extend_from_slice(&right_pos.to_be_bytes());
            }
            WalRecord::Insert {
                command_id,
                key,
                value,
            } => {
                out.push(KIND_INSERT);
                out.extend_from_slice(&command_id.to_be_bytes());
                out.extend_from_slice(&len_u16(key.len(), "key exceeds u16")?.to_be_bytes());
                out.extend_from_slice(&len_u16(value.len(), "value exceeds u16")?.to_be_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(value);
            }
            WalRecord::UpdateSameSizeInPlace {
                command_id,
                key,
                before,
                descriptor,
                xor_diff,
            } => {
                out.push(KIND_UPDATE_SSIP);
                out.extend_from_slice(&command_id.to_be_bytes());
                out.extend_from_slice(&len_u16(key.len(), "key exceeds u16")?.to_be_bytes());
                let delta_length = (descriptor.encoded_len() + xor_diff.len()) as u64;
                out.extend_from_slice(&delta_length.to_be_bytes());
                before.encode_into(&mut out);
                out.extend_from_slice(key);
                descriptor.encode_into(&mut out);
                out.extend_from_slice(xor_diff);
            }
            WalRecord::Remove {
                command_id,
                key,
                value,
                before,
            } => {
                out.push(KIND_REMOVE);
                out.extend_from_slice(&command_id.to_be_bytes());
                out.extend_from_slice(&len_u16(key.len(), "key exceeds u16")?.to_be_bytes());
                out.extend_from_slice(&len_u16(value.len(), "value exceeds u16")?.to_be_bytes());
                before.encode_into(&mut out);
                out.extend_from_slice(key);
                out.extend_from_slice(value);
            }
        }
        Ok(out)
    }

    /// Decodes a record.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let kind = read_u8(src, 0, "wal record truncated")?;
        match kind {
            KIND_BEFORE_AFTER_IMAGE => {
                let size = read_u16(src, 1, "wal image truncated")? as usize;
                Ok(WalRecord::BeforeAfterImage {
                    before: read_slice(src, 3, size, "wal image truncated")?.to_vec(),
                    after: read_slice(src, 3 + size, size, "wal image truncated")?.to_vec(),
                })
            }
            KIND_INIT_PAGE => Ok(WalRecord::InitPage {
                dt_id: DtId(read_u64(src, 1, "wal init page truncated")?),
                page_id: PageId(read_u64(src, 9, "wal init page truncated")?),
            }),
            KIND_AFTER_IMAGE => {
                let size = read_u16(src, 1, "wal image truncated")? as usize;
                Ok(WalRecord::AfterImage {
                    image: read_slice(src, 3, size, "wal image truncated")?.to_vec(),
                })
            }
            KIND_LOGICAL_SPLIT => Ok(WalRecord::LogicalSplit {
                parent_pid: PageId(read_u64(src, 1, "wal split truncated")?),
                left_pid: PageId(read_u64(src, 9, "wal split truncated")?),
                right_pid: PageId(read_u64(src, 17, "wal split truncated")?),
                right_pos: read_u32(src, 25, "wal split truncated")? as i32,
            }),
            KIND_INSERT => {
                let command_id = read_u64(src, 1, "wal insert truncated")?;
                let key_len = read_u16(src, 9, "wal insert truncated")? as usize;
                let value_len = read_u16(src, 11, "wal insert truncated")? as usize;
                Ok(WalRecord::Insert {
                    command_id,
                    key: read_slice(src, 13, key_len, "wal insert truncated")?.to_vec(),
                    value: read_slice(src, 13 + key_len, value_len, "wal insert truncated")?
                        .to_vec(),
                })
            }
            KIND_UPDATE_SSIP => {
                let command_id = read_u64(src, 1, "wal update truncated")?;
                let key_len = read_u16(src, 9, "wal update truncated")? as usize;
                let delta_length = read_u64(src, 11, "wal update truncated")? as usize;
                let before = VersionMeta::decode_at(src, 19)?;
                let key_at = 19 + VersionMeta::LEN;
                let key = read_slice(src, key_at, key_len, "wal update truncated")?.to_vec();
                let delta = read_slice(src, key_at + key_len, delta_length, "wal update truncated")?;
                let (descriptor, used) = UpdateDescriptor::decode(delta)?;
                let xor_diff = delta[used..].to_vec();
                if xor_diff.len() != descriptor.diff_length() {
                    return Err(VitreeError::Corruption("wal update diff length mismatch"));
                }
                Ok(WalRecord::UpdateSameSizeInPlace {
                    command_id,
                    key,
                    before,
                    descriptor,
                    xor_diff,
                })
            }
            KIND_REMOVE => {
                let command_id = read_u64(src, 1, "wal remove truncated")?;
                let key_len = read_u16(src, 9, "wal remove truncated")? as usize;
                let value_len = read_u16(src, 11, "wal remove truncated")? as usize;
                let before = VersionMeta::decode_at(src, 13)?;
                let key_at = 13 + VersionMeta::LEN;
                Ok(WalRecord::Remove {
                    command_id,
                    key: read_slice(src, key_at, key_len, "wal remove truncated")?.to_vec(),
                    value: read_slice(src, key_at + key_len, value_len, "wal remove truncated")?
                        .to_vec(),
                    before,
                })
            }
            _ => Err(VitreeError::Corruption("unknown wal record kind")),
        }
    }
}

/// Deferred release of a 2PL read lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnlockEntry {
    /// Hint to the slot holding the lock bit.
    pub dangling_pointer: DanglingPointer,
    /// Key, used when the hint is stale.
    pub key: Vec<u8>,
}

impl UnlockEntry {
    /// Encodes `key_length u16, dangling pointer, key`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(2 + DanglingPointer::LEN + self.key.len());
        out.extend_from_slice(&len_u16(self.key.len(), "key exceeds u16")?.to_be_bytes());
        self.dangling_pointer.encode_into(&mut out);
        out.extend_from_slice(&self.key);
        Ok(out)
    }

    /// Decodes an unlock entry.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let key_len = read_u16(src, 0, "unlock entry truncated")? as usize;
        Ok(Self {
            dangling_pointer: DanglingPointer::decode_at(src, 2)?,
            key: read_slice(src, 2 + DanglingPointer::LEN, key_len, "unlock entry truncated")?
                .to_vec(),
        })
    }
}

/// Deferred garbage-collection work for one mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TodoEntry {
    /// Command of the mutation that left history behind.
    pub command_id: CommandId,
    /// Hint to the slot.
    pub dangling_pointer: DanglingPointer,
    /// Key, used when the hint is stale.
    pub key: Vec<u8>,
}

impl TodoEntry {
    /// Encodes `command_id u64, key_length u16, dangling pointer, key`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(10 + DanglingPointer::LEN + self.key.len());
        out.extend_from_slice(&self.command_id.to_be_bytes());
        out.extend_from_slice(&len_u16(self.key.len(), "key exceeds u16")?.to_be_bytes());
        self.dangling_pointer.encode_into(&mut out);
        out.extend_from_slice(&self.key);
        Ok(out)
    }

    /// Decodes a todo entry.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let command_id = read_u64(src, 0, "todo entry truncated")?;
        let key_len = read_u16(src, 8, "todo entry truncated")? as usize;
        Ok(Self {
            command_id,
            dangling_pointer: DanglingPointer::decode_at(src, 10)?,
            key: read_slice(src, 10 + DanglingPointer::LEN, key_len, "todo entry truncated")?
                .to_vec(),
        })
    }
}
