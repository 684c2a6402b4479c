use tracing::trace;

use crate::primitives::concurrency::{ConcurrencyMode, TxContext};
use crate::storage::btree::LeafWriteGuard;
use crate::storage::tuple::{set_read_stamp, ChainedTuple, FatTuple, Tuple, TupleHeader, VersionMeta};
use crate::storage::version_store::{UpdatePayload, VersionKey, VersionRecord};
use crate::storage::wal_records::UnlockEntry;
use crate::types::{OpResult, Result, VitreeError};

use super::VersionedBTree;

/// Outcome of rebuilding the state a transaction sees for one key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reconstructed {
    /// `Ok` when a value was passed to the callback.
    pub result: OpResult,
    /// Versions inspected, the primary slot included.
    pub versions_visited: u16,
    /// The head version was read by a transaction that must protect it.
    pub needs_read_mark: bool,
}

impl Reconstructed {
    fn new(result: OpResult, versions_visited: u16) -> Self {
        Self {
            result,
            versions_visited,
            needs_read_mark: false,
        }
    }
}

impl VersionedBTree {
    /// Materializes the state of `key` that `ctx` may see from a primary slot payload.
    ///
    /// `on_value` runs at most once, only when the result is `Ok`.
    pub fn reconstruct_tuple(
        &self,
        ctx: &TxContext,
        key: &[u8],
        payload: &[u8],
        on_value: &mut dyn FnMut(&[u8]),
    ) -> Result<Reconstructed> {
        let out = match Tuple::decode(payload)? {
            Tuple::VisibleForAll(tuple) => {
                on_value(&tuple.value);
                Reconstructed {
                    needs_read_mark: ctx.needs_read_marks(),
                    ..Reconstructed::new(OpResult::Ok, 1)
                }
            }
            Tuple::Fat(tuple) => self.reconstruct_fat(ctx, &tuple, on_value)?,
            Tuple::Chained(tuple) => self.reconstruct_chained(ctx, &tuple, on_value)?,
        };
        self.metrics
            .chain_read(out.versions_visited, out.result == OpResult::Ok);
        if out.versions_visited > 1 {
            trace!(
                dt = %self.dt_id,
                key = %hex::encode(key),
                visited = out.versions_visited,
                result = ?out.result,
                "vi.reconstruct.chain"
            );
        }
        Ok(out)
    }

    fn reconstruct_fat(
        &self,
        ctx: &TxContext,
        tuple: &FatTuple,
        on_value: &mut dyn FnMut(&[u8]),
    ) -> Result<Reconstructed> {
        if self.visible(ctx, &tuple.header.meta, false) {
            on_value(&tuple.value);
            return Ok(Reconstructed {
                needs_read_mark: ctx.needs_read_marks(),
                ..Reconstructed::new(OpResult::Ok, 1)
            });
        }
        if ctx.needs_read_marks() {
            return Ok(Reconstructed::new(OpResult::AbortTx, 1));
        }
        let (value, visited) = tuple.reconstruct(|meta| self.visible(ctx, meta, false))?;
        Ok(match value {
            Some(value) => {
                on_value(&value);
                Reconstructed::new(OpResult::Ok, visited)
            }
            None => Reconstructed::new(OpResult::NotFound, visited),
        })
    }

    fn reconstruct_chained(
        &self,
        ctx: &TxContext,
        head: &ChainedTuple,
        on_value: &mut dyn FnMut(&[u8]),
    ) -> Result<Reconstructed> {
        if self.visible(ctx, &head.header.meta, false) {
            let result = if head.is_removed {
                OpResult::NotFound
            } else {
                on_value(&head.value);
                OpResult::Ok
            };
            return Ok(Reconstructed {
                needs_read_mark: ctx.needs_read_marks(),
                ..Reconstructed::new(result, 1)
            });
        }
        if ctx.needs_read_marks() {
            return Ok(Reconstructed::new(OpResult::AbortTx, 1));
        }
        if head.is_final() {
            return Ok(Reconstructed::new(OpResult::NotFound, 1));
        }

        let mut value = head.value.clone();
        let mut removed = head.is_removed;
        let mut newer: VersionMeta = head.meta();
        let mut visited = 1u16;
        loop {
            visited = visited.saturating_add(1);
            // purged history is only unreachable for readers that see a newer version
            let Some(record) = self.versions.get(VersionKey::from(newer))? else {
                return Ok(Reconstructed::new(OpResult::NotFound, visited));
            };
            let before = record.before();
            match record {
                VersionRecord::Update(update) => match update.payload {
                    UpdatePayload::Delta { descriptor, diff } => {
                        if removed {
                            return Err(VitreeError::Corruption("delta applied to a tombstone"));
                        }
                        descriptor.apply(&mut value, &diff)?;
                    }
                    UpdatePayload::Image(image) => {
                        value = image;
                        removed = false;
                    }
                    UpdatePayload::Absent => {
                        value.clear();
                        removed = true;
                    }
                },
                VersionRecord::Remove(remove) => {
                    value = remove.value;
                    removed = false;
                }
            }
            if self.visible(ctx, &before, false) {
                let result = if removed {
                    OpResult::NotFound
                } else {
                    on_value(&value);
                    OpResult::Ok
                };
                return Ok(Reconstructed::new(result, visited));
            }
            if before.is_final() {
                return Ok(Reconstructed::new(OpResult::NotFound, visited));
            }
            newer = before;
        }
    }

    /// Records that `ctx` read the head of `slot`.
    pub(super) fn stamp_read(
        &self,
        ctx: &mut TxContext,
        guard: &mut LeafWriteGuard,
        slot: usize,
    ) -> Result<()> {
        let header = TupleHeader::decode(guard.node.payload(slot))?;
        match self.txm.concurrency_mode() {
            ConcurrencyMode::TwoPhaseLocking => {
                let bit = 1u128 << ctx.worker_id();
                if header.read_stamp & bit != 0 {
                    return Ok(());
                }
                set_read_stamp(guard.node.payload_mut(slot), header.read_stamp | bit)?;
                let entry = UnlockEntry {
                    dangling_pointer: guard.dangling_pointer(slot),
                    key: guard.node.key(slot).to_vec(),
                };
                ctx.stage_unlock(self.dt_id, entry.encode()?);
            }
            ConcurrencyMode::Timestamp => {
                let stamp = u128::from(ctx.tx_id());
                if header.read_stamp < stamp {
                    set_read_stamp(guard.node.payload_mut(slot), stamp)?;
                }
            }
        }
        Ok(())
    }
}
