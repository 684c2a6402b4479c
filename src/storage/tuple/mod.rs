//! On-page tuple layouts.
//!
//! Every primary slot starts with a [`TupleHeader`] followed by a format specific
//! body. All integers are big-endian.

use crate::types::{
    read_u128, read_u64, read_u8, CommandId, Result, TxId, VitreeError, WorkerId,
    INVALID_COMMAND_ID,
};

pub mod descriptor;
pub mod fat;

pub use descriptor::{UpdateDescriptor, UpdateSlot};
pub use fat::{Delta, FatTuple};

/// Encoded size of [`TupleHeader`].
pub const TUPLE_HEADER_LEN: usize = 35;

/// Encoded size of a chained tuple without its value.
pub const CHAINED_TUPLE_LEN: usize = TUPLE_HEADER_LEN + 1;

const FLAG_WRITE_LOCKED: u8 = 0b1;
const CHAINED_CAN_CONVERT: u8 = 0b01;
const CHAINED_REMOVED: u8 = 0b10;

/// Identity of one version of a key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VersionMeta {
    /// Worker that wrote the version.
    pub worker_id: WorkerId,
    /// Writer start timestamp, or a commit-marked timestamp.
    pub tx_ts: TxId,
    /// Command within the writer transaction; [`INVALID_COMMAND_ID`] ends a chain.
    pub command_id: CommandId,
}

impl VersionMeta {
    /// Encoded size.
    pub const LEN: usize = 17;

    /// Creates an identity.
    pub fn new(worker_id: WorkerId, tx_ts: TxId, command_id: CommandId) -> Self {
        Self {
            worker_id,
            tx_ts,
            command_id,
        }
    }

    /// `true` when no older version exists.
    pub fn is_final(&self) -> bool {
        self.command_id == INVALID_COMMAND_ID
    }

    /// Appends `worker u8, tx_ts u64, command_id u64`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.worker_id);
        out.extend_from_slice(&self.tx_ts.to_be_bytes());
        out.extend_from_slice(&self.command_id.to_be_bytes());
    }

    /// Decodes an identity at `offset`.
    pub fn decode_at(src: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            worker_id: read_u8(src, offset, "version meta truncated")?,
            tx_ts: read_u64(src, offset + 1, "version meta truncated")?,
            command_id: read_u64(src, offset + 9, "version meta truncated")?,
        })
    }
}

/// Physical representation of a key's versions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TupleFormat {
    /// Latest value inline, older versions in the version store.
    Chained,
    /// Value plus deltas that each carry their own descriptor.
    FatDifferentAttributes,
    /// Value plus deltas sharing one descriptor.
    FatSameAttributes,
    /// Value without history, visible to everyone.
    VisibleForAll,
}

impl TupleFormat {
    fn to_u8(self) -> u8 {
        match self {
            TupleFormat::Chained => 0,
            TupleFormat::FatDifferentAttributes => 1,
            TupleFormat::FatSameAttributes => 2,
            TupleFormat::VisibleForAll => 3,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(TupleFormat::Chained),
            1 => Some(TupleFormat::FatDifferentAttributes),
            2 => Some(TupleFormat::FatSameAttributes),
            3 => Some(TupleFormat::VisibleForAll),
            _ => None,
        }
    }

    /// `true` for both fat formats.
    pub fn is_fat(self) -> bool {
        matches!(
            self,
            TupleFormat::FatDifferentAttributes | TupleFormat::FatSameAttributes
        )
    }
}

/// Fields shared by every tuple format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TupleHeader {
    /// SSI read timestamp or 2PL read-lock bitmask, depending on concurrency mode.
    pub read_stamp: u128,
    /// Body layout.
    pub format: TupleFormat,
    /// Identity of the newest version.
    pub meta: VersionMeta,
    /// Held by a writer for the duration of a mutation.
    pub write_locked: bool,
}

impl TupleHeader {
    /// Header for a freshly written version.
    pub fn new(format: TupleFormat, meta: VersionMeta) -> Self {
        Self {
            read_stamp: 0,
            format,
            meta,
            write_locked: false,
        }
    }

    /// Appends the 35-byte header.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.read_stamp.to_be_bytes());
        out.push(self.format.to_u8());
        out.push(self.meta.worker_id);
        out.extend_from_slice(&self.meta.tx_ts.to_be_bytes());
        out.extend_from_slice(&self.meta.command_id.to_be_bytes());
        out.push(if self.write_locked {
            FLAG_WRITE_LOCKED
        } else {
            0
        });
    }

    /// Decodes the header at the front of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < TUPLE_HEADER_LEN {
            return Err(VitreeError::Corruption("tuple header truncated"));
        }
        Ok(Self {
            read_stamp: read_u128(src, 0, "tuple header truncated")?,
            format: peek_format(src)?,
            meta: VersionMeta::decode_at(src, 17)?,
            write_locked: src[34] & FLAG_WRITE_LOCKED != 0,
        })
    }
}

/// Reads only the format byte of an encoded tuple.
pub fn peek_format(src: &[u8]) -> Result<TupleFormat> {
    let raw = read_u8(src, 16, "tuple header truncated")?;
    TupleFormat::from_u8(raw).ok_or(VitreeError::Corruption("unknown tuple format"))
}

/// Whether an encoded tuple is write-locked.
pub fn is_write_locked(src: &[u8]) -> Result<bool> {
    Ok(read_u8(src, 34, "tuple header truncated")? & FLAG_WRITE_LOCKED != 0)
}

/// Sets or clears the write-lock flag of an encoded tuple in place.
pub fn set_write_locked(dst: &mut [u8], locked: bool) -> Result<()> {
    let flags = dst
        .get_mut(34)
        .ok_or(VitreeError::Corruption("tuple header truncated"))?;
    if locked {
        *flags |= FLAG_WRITE_LOCKED;
    } else {
        *flags &= !FLAG_WRITE_LOCKED;
    }
    Ok(())
}

/// Overwrites the read stamp of an encoded tuple in place.
pub fn set_read_stamp(dst: &mut [u8], stamp: u128) -> Result<()> {
    let target = dst
        .get_mut(0..16)
        .ok_or(VitreeError::Corruption("tuple header truncated"))?;
    target.copy_from_slice(&stamp.to_be_bytes());
    Ok(())
}

/// Latest value inline; older versions reachable through the version store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainedTuple {
    /// Common header; `format` is always [`TupleFormat::Chained`].
    pub header: TupleHeader,
    /// Gate for fat-tuple conversion, cleared after a failed attempt.
    pub can_convert_to_fat_tuple: bool,
    /// Tombstone flag; the removed value lives in the version store.
    pub is_removed: bool,
    /// Latest value (empty for tombstones).
    pub value: Vec<u8>,
}

impl ChainedTuple {
    /// A live tuple written by `meta`.
    pub fn new(meta: VersionMeta, value: Vec<u8>) -> Self {
        Self {
            header: TupleHeader::new(TupleFormat::Chained, meta),
            can_convert_to_fat_tuple: true,
            is_removed: false,
            value,
        }
    }

    /// Identity of the newest version.
    pub fn meta(&self) -> VersionMeta {
        self.header.meta
    }

    /// `true` when no older version is recorded.
    pub fn is_final(&self) -> bool {
        self.header.meta.is_final()
    }

    /// Encodes header, flag byte and value.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHAINED_TUPLE_LEN + self.value.len());
        let mut header = self.header.clone();
        header.format = TupleFormat::Chained;
        header.encode_into(&mut out);
        let mut flags = 0u8;
        if self.can_convert_to_fat_tuple {
            flags |= CHAINED_CAN_CONVERT;
        }
        if self.is_removed {
            flags |= CHAINED_REMOVED;
        }
        out.push(flags);
        out.extend_from_slice(&self.value);
        out
    }

    /// Decodes a chained tuple.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let header = TupleHeader::decode(src)?;
        if header.format != TupleFormat::Chained {
            return Err(VitreeError::Corruption("expected chained tuple"));
        }
        let flags = read_u8(src, TUPLE_HEADER_LEN, "chained tuple truncated")?;
        Ok(Self {
            header,
            can_convert_to_fat_tuple: flags & CHAINED_CAN_CONVERT != 0,
            is_removed: flags & CHAINED_REMOVED != 0,
            value: src[CHAINED_TUPLE_LEN..].to_vec(),
        })
    }
}

/// A value every transaction may read; carries no history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisibleTuple {
    /// Common header; `format` is always [`TupleFormat::VisibleForAll`].
    pub header: TupleHeader,
    /// The value.
    pub value: Vec<u8>,
}

impl VisibleTuple {
    /// Wraps a bulk-loaded value.
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            header: TupleHeader::new(
                TupleFormat::VisibleForAll,
                VersionMeta::new(0, crate::types::mark_committed(0), INVALID_COMMAND_ID),
            ),
            value,
        }
    }

    /// Encodes header and value.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TUPLE_HEADER_LEN + self.value.len());
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.value);
        out
    }

    /// Decodes a visible-for-all tuple.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let header = TupleHeader::decode(src)?;
        if header.format != TupleFormat::VisibleForAll {
            return Err(VitreeError::Corruption("expected visible-for-all tuple"));
        }
        Ok(Self {
            header,
            value: src[TUPLE_HEADER_LEN..].to_vec(),
        })
    }

    /// Re-heads the tuple as a final chained tuple so it can be mutated.
    pub fn into_chained(self) -> ChainedTuple {
        let mut chained = ChainedTuple::new(self.header.meta, self.value);
        chained.header.read_stamp = self.header.read_stamp;
        chained
    }
}

/// Any decoded primary slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tuple {
    /// Chained format.
    Chained(ChainedTuple),
    /// Either fat format.
    Fat(FatTuple),
    /// Visible-for-all format.
    VisibleForAll(VisibleTuple),
}

impl Tuple {
    /// Dispatches on the format byte.
    pub fn decode(src: &[u8]) -> Result<Self> {
        Ok(match peek_format(src)? {
            TupleFormat::Chained => Tuple::Chained(ChainedTuple::decode(src)?),
            TupleFormat::FatDifferentAttributes | TupleFormat::FatSameAttributes => {
                Tuple::Fat(FatTuple::decode(src)?)
            }
            TupleFormat::VisibleForAll => Tuple::VisibleForAll(VisibleTuple::decode(src)?),
        })
    }

    /// Encodes the tuple in its own format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Tuple::Chained(t) => Ok(t.encode()),
            Tuple::Fat(t) => t.encode(),
            Tuple::VisibleForAll(t) => Ok(t.encode()),
        }
    }

    /// Header of the newest version.
    pub fn header(&self) -> &TupleHeader {
        match self {
            Tuple::Chained(t) => &t.header,
            Tuple::Fat(t) => &t.header,
            Tuple::VisibleForAll(t) => &t.header,
        }
    }
}
