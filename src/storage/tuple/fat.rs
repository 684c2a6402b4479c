use crate::types::{read_u16, read_u32, Result, VitreeError};

use super::descriptor::UpdateDescriptor;
use super::{TupleFormat, TupleHeader, VersionMeta, TUPLE_HEADER_LEN};

/// Size of the fixed part of a fat tuple (header plus counters).
pub const FAT_TUPLE_LEN: usize = TUPLE_HEADER_LEN + 2 + 4 + 4 + 2;

/// One step back in a fat tuple's history.
///
/// Applying `diff` at `descriptor` to the next newer state yields the version
/// identified by `meta`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta {
    /// Identity of the version this delta reconstructs.
    pub meta: VersionMeta,
    /// Ranges covered by `diff`.
    pub descriptor: UpdateDescriptor,
    /// Before-image bytes.
    pub diff: Vec<u8>,
}

/// A value with its recent history stored inline, oldest delta first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FatTuple {
    /// Header; `format` selects the shared or per-delta descriptor encoding.
    pub header: TupleHeader,
    /// Byte budget for value plus deltas.
    pub total_space: u32,
    /// Latest value.
    pub value: Vec<u8>,
    /// History, oldest first.
    pub deltas: Vec<Delta>,
}

impl FatTuple {
    /// Builds a fat tuple in the shared-descriptor format.
    pub fn new(header: TupleHeader, total_space: u32, value: Vec<u8>, deltas: Vec<Delta>) -> Self {
        let mut header = header;
        header.format = TupleFormat::FatSameAttributes;
        let mut tuple = Self {
            header,
            total_space,
            value,
            deltas,
        };
        if !tuple.shares_descriptor() {
            tuple.header.format = TupleFormat::FatDifferentAttributes;
        }
        tuple
    }

    fn shares_descriptor(&self) -> bool {
        match self.deltas.split_first() {
            Some((first, rest)) => rest.iter().all(|d| d.descriptor == first.descriptor),
            None => true,
        }
    }

    fn same_attributes(&self) -> bool {
        self.header.format == TupleFormat::FatSameAttributes
    }

    /// Encoded size of `delta` under the current format.
    pub fn delta_len(&self, delta: &Delta) -> usize {
        let descriptor = if self.same_attributes() {
            0
        } else {
            delta.descriptor.encoded_len()
        };
        VersionMeta::LEN + descriptor + delta.diff.len()
    }

    /// Bytes used by value, shared descriptor and deltas.
    pub fn used_space(&self) -> usize {
        let shared = match (self.same_attributes(), self.deltas.first()) {
            (true, Some(first)) => first.descriptor.encoded_len(),
            _ => 0,
        };
        self.value.len() + shared + self.deltas.iter().map(|d| self.delta_len(d)).sum::<usize>()
    }

    /// Bytes still available inside `total_space`.
    pub fn free_space(&self) -> usize {
        (self.total_space as usize).saturating_sub(self.used_space())
    }

    /// Whether a delta covering `descriptor` fits without compaction.
    pub fn has_space_for(&self, descriptor: &UpdateDescriptor) -> bool {
        self.needed_for(descriptor) <= self.free_space()
    }

    fn needed_for(&self, descriptor: &UpdateDescriptor) -> usize {
        let switches_format = self.same_attributes()
            && self
                .deltas
                .first()
                .is_some_and(|first| first.descriptor != *descriptor);
        let mut needed = VersionMeta::LEN + descriptor.diff_length();
        if switches_format {
            // every existing delta gains its own descriptor
            let shared = self.deltas[0].descriptor.encoded_len();
            needed += descriptor.encoded_len() + shared * self.deltas.len() - shared;
        } else if !self.same_attributes() {
            needed += descriptor.encoded_len();
        } else if self.deltas.is_empty() {
            needed += descriptor.encoded_len();
        }
        needed
    }

    /// Appends the newest delta, switching to per-delta descriptors when it differs.
    pub fn push_delta(&mut self, delta: Delta) -> Result<()> {
        let needed = self.needed_for(&delta.descriptor);
        let available = self.free_space();
        if needed > available {
            return Err(VitreeError::FatTupleOverflow { needed, available });
        }
        if self.same_attributes()
            && self
                .deltas
                .first()
                .is_some_and(|first| first.descriptor != delta.descriptor)
        {
            self.header.format = TupleFormat::FatDifferentAttributes;
        }
        self.deltas.push(delta);
        Ok(())
    }

    /// Drops deltas no reader can reach. Returns how many were removed.
    ///
    /// A delta is unreachable once the version directly newer than it is visible
    /// to every active transaction.
    pub fn garbage_collect(&mut self, visible_for_all: impl Fn(&VersionMeta) -> bool) -> usize {
        let n = self.deltas.len();
        for i in (0..n).rev() {
            let newer = if i + 1 == n {
                self.header.meta
            } else {
                self.deltas[i + 1].meta
            };
            if visible_for_all(&newer) {
                self.deltas.drain(..=i);
                if self.deltas.is_empty() && self.header.format == TupleFormat::FatDifferentAttributes
                {
                    self.header.format = TupleFormat::FatSameAttributes;
                }
                return i + 1;
            }
        }
        0
    }

    /// Rolls back the newest update, restoring the previous identity.
    pub fn undo_last_update(&mut self) -> Result<Delta> {
        let delta = self
            .deltas
            .pop()
            .ok_or(VitreeError::Corruption("fat tuple has no delta to undo"))?;
        delta.descriptor.apply(&mut self.value, &delta.diff)?;
        self.header.meta = delta.meta;
        Ok(delta)
    }

    /// Finds the newest version accepted by `is_visible`.
    ///
    /// Returns the value, if any, and the number of versions inspected.
    pub fn reconstruct(
        &self,
        mut is_visible: impl FnMut(&VersionMeta) -> bool,
    ) -> Result<(Option<Vec<u8>>, u16)> {
        let mut visited = 1u16;
        if is_visible(&self.header.meta) {
            return Ok((Some(self.value.clone()), visited));
        }
        let mut value = self.value.clone();
        for delta in self.deltas.iter().rev() {
            visited = visited.saturating_add(1);
            delta.descriptor.apply(&mut value, &delta.diff)?;
            if is_visible(&delta.meta) {
                return Ok((Some(value), visited));
            }
        }
        Ok((None, visited))
    }

    /// Encodes the tuple.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let used = self.used_space();
        if used > self.total_space as usize {
            return Err(VitreeError::FatTupleOverflow {
                needed: used,
                available: self.total_space as usize,
            });
        }
        let value_len = u16::try_from(self.value.len())
            .map_err(|_| VitreeError::Invalid("fat tuple value exceeds u16"))?;
        let count = u16::try_from(self.deltas.len())
            .map_err(|_| VitreeError::Invalid("fat tuple has too many deltas"))?;
        let same = self.same_attributes();
        if same && !self.shares_descriptor() {
            return Err(VitreeError::Invalid("shared-descriptor tuple with mixed deltas"));
        }
        let mut out = Vec::with_capacity(FAT_TUPLE_LEN + used);
        self.header.encode_into(&mut out);
        out.extend_from_slice(&value_len.to_be_bytes());
        out.extend_from_slice(&self.total_space.to_be_bytes());
        out.extend_from_slice(&(used as u32).to_be_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        if same {
            if let Some(first) = self.deltas.first() {
                first.descriptor.encode_into(&mut out);
            }
        }
        out.extend_from_slice(&self.value);
        for delta in &self.deltas {
            delta.meta.encode_into(&mut out);
            if !same {
                delta.descriptor.encode_into(&mut out);
            }
            out.extend_from_slice(&delta.diff);
        }
        Ok(out)
    }

    /// Decodes and validates a fat tuple.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let header = TupleHeader::decode(src)?;
        if !header.format.is_fat() {
            return Err(VitreeError::Corruption("expected fat tuple"));
        }
        let value_len = read_u16(src, TUPLE_HEADER_LEN, "fat tuple truncated")? as usize;
        let total_space = read_u32(src, TUPLE_HEADER_LEN + 2, "fat tuple truncated")?;
        let used_space = read_u32(src, TUPLE_HEADER_LEN + 6, "fat tuple truncated")? as usize;
        let count = read_u16(src, TUPLE_HEADER_LEN + 10, "fat tuple truncated")? as usize;
        if used_space > total_space as usize {
            return Err(VitreeError::Corruption("fat tuple used space exceeds total"));
        }
        let mut offset = FAT_TUPLE_LEN;
        let shared = if header.format == TupleFormat::FatSameAttributes && count > 0 {
            let (descriptor, used) = UpdateDescriptor::decode(&src[offset..])?;
            offset += used;
            Some(descriptor)
        } else {
            None
        };
        let value = crate::types::read_slice(src, offset, value_len, "fat tuple value truncated")?
            .to_vec();
        offset += value_len;
        let mut deltas = Vec::with_capacity(count);
        for _ in 0..count {
            let meta = VersionMeta::decode_at(src, offset)?;
            offset += VersionMeta::LEN;
            let descriptor = match &shared {
                Some(descriptor) => descriptor.clone(),
                None => {
                    let (descriptor, used) = UpdateDescriptor::decode(
                        src.get(offset..)
                            .ok_or(VitreeError::Corruption("fat tuple delta truncated"))?,
                    )?;
                    offset += used;
                    descriptor
                }
            };
            let len = descriptor.diff_length();
            let diff =
                crate::types::read_slice(src, offset, len, "fat tuple delta truncated")?.to_vec();
            offset += len;
            deltas.push(Delta {
                meta,
                descriptor,
                diff,
            });
        }
        let tuple = Self {
            header,
            total_space,
            value,
            deltas,
        };
        if tuple.used_space() != used_space || offset != src.len() {
            return Err(VitreeError::Corruption("fat tuple used space mismatch"));
        }
        Ok(tuple)
    }
}
