use smallvec::SmallVec;

use crate::types::{read_u16, read_u8, Result, VitreeError};

/// A contiguous byte range touched by an update.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpdateSlot {
    /// Offset inside the value.
    pub offset: u16,
    /// Number of bytes.
    pub length: u16,
}

/// The set of byte ranges an in-place update modifies.
///
/// Encoded as `count u8` followed by `count` pairs of `(offset u16, length u16)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateDescriptor {
    slots: SmallVec<[UpdateSlot; 4]>,
}

impl UpdateDescriptor {
    /// Builds a descriptor from `(offset, length)` pairs.
    pub fn new(ranges: &[(u16, u16)]) -> Self {
        Self {
            slots: ranges
                .iter()
                .map(|&(offset, length)| UpdateSlot { offset, length })
                .collect(),
        }
    }

    /// Descriptor covering a whole value of `len` bytes.
    pub fn whole(len: u16) -> Self {
        Self::new(&[(0, len)])
    }

    /// The touched ranges.
    pub fn slots(&self) -> &[UpdateSlot] {
        &self.slots
    }

    /// Total number of bytes covered; the size of a diff.
    pub fn diff_length(&self) -> usize {
        self.slots.iter().map(|s| s.length as usize).sum()
    }

    /// Size of the encoded descriptor.
    pub fn encoded_len(&self) -> usize {
        1 + self.slots.len() * 4
    }

    /// Checks every range lies inside a value of `value_len` bytes.
    pub fn validate(&self, value_len: usize) -> Result<()> {
        if self.slots.is_empty() {
            return Err(VitreeError::Invalid("update descriptor has no slots"));
        }
        if self.slots.len() > u8::MAX as usize {
            return Err(VitreeError::Invalid("update descriptor has too many slots"));
        }
        for slot in &self.slots {
            if slot.offset as usize + slot.length as usize > value_len {
                return Err(VitreeError::Invalid("update descriptor exceeds value"));
            }
        }
        Ok(())
    }

    /// Copies the covered bytes of `value` (a before-image when taken pre-update).
    pub fn extract(&self, value: &[u8]) -> Vec<u8> {
        let mut diff = Vec::with_capacity(self.diff_length());
        for slot in &self.slots {
            let start = slot.offset as usize;
            diff.extend_from_slice(&value[start..start + slot.length as usize]);
        }
        diff
    }

    /// Writes `diff` back into the covered ranges of `value`.
    pub fn apply(&self, value: &mut [u8], diff: &[u8]) -> Result<()> {
        if diff.len() != self.diff_length() {
            return Err(VitreeError::Corruption("diff length does not match descriptor"));
        }
        let mut cursor = 0usize;
        for slot in &self.slots {
            let start = slot.offset as usize;
            let len = slot.length as usize;
            let target = value
                .get_mut(start..start + len)
                .ok_or(VitreeError::Corruption("descriptor exceeds value"))?;
            target.copy_from_slice(&diff[cursor..cursor + len]);
            cursor += len;
        }
        Ok(())
    }

    /// XOR of the covered ranges of `before` and `after`.
    pub fn xor_diff(&self, before: &[u8], after: &[u8]) -> Vec<u8> {
        let mut diff = self.extract(before);
        let mut cursor = 0usize;
        for slot in &self.slots {
            let start = slot.offset as usize;
            for (i, byte) in after[start..start + slot.length as usize].iter().enumerate() {
                diff[cursor + i] ^= byte;
            }
            cursor += slot.length as usize;
        }
        diff
    }

    /// XORs `diff` into the covered ranges, turning before into after or back.
    pub fn apply_xor(&self, value: &mut [u8], diff: &[u8]) -> Result<()> {
        if diff.len() != self.diff_length() {
            return Err(VitreeError::Corruption("xor diff length does not match descriptor"));
        }
        let mut cursor = 0usize;
        for slot in &self.slots {
            let start = slot.offset as usize;
            let len = slot.length as usize;
            let target = value
                .get_mut(start..start + len)
                .ok_or(VitreeError::Corruption("descriptor exceeds value"))?;
            for (byte, d) in target.iter_mut().zip(&diff[cursor..cursor + len]) {
                *byte ^= d;
            }
            cursor += len;
        }
        Ok(())
    }

    /// Appends the encoded descriptor to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.slots.len() as u8);
        for slot in &self.slots {
            out.extend_from_slice(&slot.offset.to_be_bytes());
            out.extend_from_slice(&slot.length.to_be_bytes());
        }
    }

    /// Decodes a descriptor from the front of `src`, returning it and the bytes consumed.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        let count = read_u8(src, 0, "update descriptor truncated")? as usize;
        let mut slots = SmallVec::with_capacity(count);
        for i in 0..count {
            let base = 1 + i * 4;
            slots.push(UpdateSlot {
                offset: read_u16(src, base, "update descriptor truncated")?,
                length: read_u16(src, base + 2, "update descriptor truncated")?,
            });
        }
        Ok((Self { slots }, 1 + count * 4))
    }
}
