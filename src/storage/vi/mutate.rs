use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::concurrency::TxContext;
use crate::storage::btree::SplitInfo;
use crate::storage::tuple::{
    ChainedTuple, Delta, FatTuple, Tuple, UpdateDescriptor, VersionMeta, VisibleTuple,
};
use crate::storage::version_store::{
    RemoveVersion, UpdatePayload, UpdateVersion, VersionKey, VersionRecord,
};
use crate::storage::wal_records::{TodoEntry, WalRecord};
use crate::types::{OpResult, PageId, Result, INVALID_COMMAND_ID};

use super::{Locked, TupleLock, VersionedBTree};

impl VersionedBTree {
    /// Passes the value of `key` visible to `ctx` to `on_value`.
    ///
    /// Returns `NotFound` when no version is visible and `AbortTx` when a
    /// serializable transaction with an unsafe snapshot meets a newer version.
    pub fn lookup(
        &self,
        ctx: &mut TxContext,
        key: &[u8],
        mut on_value: impl FnMut(&[u8]),
    ) -> Result<OpResult> {
        ctx.ensure_active()?;
        if ctx.needs_read_marks() {
            return self.lookup_marking(ctx, key, &mut on_value);
        }
        for attempt in 0..self.options.optimistic_retries {
            let Ok((frame, node)) = self.primary.optimistic(key) else {
                trace!(attempt, "vi.lookup.restart");
                continue;
            };
            let payload = node.search(key).ok().map(|slot| node.payload(slot).to_vec());
            let token = node.release();
            let Some(payload) = payload else {
                return Ok(OpResult::NotFound);
            };
            let mut found = None;
            let out =
                self.reconstruct_tuple(ctx, key, &payload, &mut |v: &[u8]| found = Some(v.to_vec()))?;
            // history may be folded or purged under a changed page
            if frame.latch().validate(token).is_err() {
                trace!(attempt, "vi.lookup.restart");
                continue;
            }
            if let Some(value) = found {
                on_value(&value);
            }
            return Ok(out.result);
        }
        let Some((_frame, node)) = self.primary.shared(key) else {
            return Ok(OpResult::NotFound);
        };
        let Ok(slot) = node.search(key) else {
            return Ok(OpResult::NotFound);
        };
        Ok(self
            .reconstruct_tuple(ctx, key, node.payload(slot), &mut on_value)?
            .result)
    }

    fn lookup_marking(
        &self,
        ctx: &mut TxContext,
        key: &[u8],
        on_value: &mut dyn FnMut(&[u8]),
    ) -> Result<OpResult> {
        let Some(mut guard) = self.primary.exclusive(key) else {
            return Ok(OpResult::NotFound);
        };
        let Ok(slot) = guard.node.search(key) else {
            return Ok(OpResult::NotFound);
        };
        let out = self.reconstruct_tuple(ctx, key, guard.node.payload(slot), on_value)?;
        if out.needs_read_mark {
            self.stamp_read(ctx, &mut guard, slot)?;
        }
        Ok(out.result)
    }

    /// Inserts `key`. A visible tombstone is overwritten; older readers still see it.
    pub fn insert(&self, ctx: &mut TxContext, key: &[u8], value: &[u8]) -> Result<OpResult> {
        ctx.ensure_active()?;
        let Some(mut guard) = self.primary.exclusive(key) else {
            return Ok(OpResult::Other);
        };
        let me = (ctx.worker_id(), ctx.tx_id());
        match guard.node.search(key) {
            Err(slot) => {
                let command_id = ctx.next_command_id();
                let tuple = ChainedTuple::new(
                    VersionMeta::new(me.0, me.1, INVALID_COMMAND_ID),
                    value.to_vec(),
                );
                self.log(
                    ctx,
                    &WalRecord::Insert {
                        command_id,
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                )?;
                guard.node.insert_at(slot, key.to_vec(), tuple.encode());
                let frame = Arc::clone(&guard.frame);
                drop(guard);
                if let Some(split) = self.primary.split_if_needed(&frame) {
                    self.log_split(ctx, split)?;
                }
                trace!(dt = %self.dt_id, key = %hex::encode(key), "vi.insert");
                Ok(OpResult::Ok)
            }
            Ok(slot) => {
                let head = match Tuple::decode(guard.node.payload(slot))? {
                    Tuple::Chained(head) => head,
                    other => {
                        let meta = other.header().meta;
                        return Ok(if self.visible(ctx, &meta, true) {
                            OpResult::DuplicateKey
                        } else {
                            OpResult::AbortTx
                        });
                    }
                };
                if !self.visible(ctx, &head.header.meta, true) {
                    debug!(dt = %self.dt_id, key = %hex::encode(key), "vi.insert.abort");
                    return Ok(OpResult::AbortTx);
                }
                if !head.is_removed {
                    return Ok(OpResult::DuplicateKey);
                }
                if self.read_conflict(ctx, &head.header) {
                    debug!(dt = %self.dt_id, key = %hex::encode(key), "vi.insert.read_conflict");
                    return Ok(OpResult::AbortTx);
                }
                let command_id = ctx.next_command_id();
                let meta = VersionMeta::new(me.0, me.1, command_id);
                self.versions.insert(
                    VersionKey::from(meta),
                    &VersionRecord::Update(UpdateVersion {
                        before: head.meta(),
                        payload: UpdatePayload::Absent,
                    }),
                )?;
                self.log(
                    ctx,
                    &WalRecord::Insert {
                        command_id,
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                )?;
                let mut tuple = ChainedTuple::new(meta, value.to_vec());
                tuple.header.read_stamp = head.header.read_stamp;
                guard.node.replace_payload(slot, tuple.encode());
                guard.node.set_has_garbage(true);
                let todo = TodoEntry {
                    command_id,
                    dangling_pointer: guard.dangling_pointer(slot),
                    key: key.to_vec(),
                };
                let frame = Arc::clone(&guard.frame);
                drop(guard);
                self.stage_todo(ctx, todo)?;
                if let Some(split) = self.primary.split_if_needed(&frame) {
                    self.log_split(ctx, split)?;
                }
                trace!(dt = %self.dt_id, key = %hex::encode(key), "vi.insert.over_tombstone");
                Ok(OpResult::Ok)
            }
        }
    }

    fn log_split(&self, ctx: &mut TxContext, split: SplitInfo) -> Result<()> {
        if !self.options.enable_wal {
            return Ok(());
        }
        self.log(
            ctx,
            &WalRecord::InitPage {
                dt_id: self.dt_id,
                page_id: split.right,
            },
        )?;
        self.log(
            ctx,
            &WalRecord::LogicalSplit {
                parent_pid: PageId::NONE,
                left_pid: split.left,
                right_pid: split.right,
                right_pos: split.right_pos,
            },
        )?;
        if let Some(frame) = self.primary.frame(split.right) {
            let image = frame.latch().shared().encode_image();
            self.log(ctx, &WalRecord::AfterImage { image })?;
        }
        Ok(())
    }

    /// Updates the bytes of `key` named by `descriptor` in place.
    ///
    /// `mutate` receives the whole value and must only touch the described ranges.
    pub fn update_same_size_in_place(
        &self,
        ctx: &mut TxContext,
        key: &[u8],
        mutate: impl FnOnce(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> Result<OpResult> {
        ctx.ensure_active()?;
        let mut lock = match self.lock_tuple(key)? {
            Locked::Held(lock) => lock,
            Locked::Missing => return Ok(OpResult::NotFound),
            Locked::Busy => {
                debug!(dt = %self.dt_id, key = %hex::encode(key), reason = "write_locked", "vi.update.abort");
                return Ok(OpResult::AbortTx);
            }
        };
        let tuple = Tuple::decode(lock.payload())?;
        let header = tuple.header().clone();
        if !self.visible(ctx, &header.meta, true) {
            debug!(dt = %self.dt_id, key = %hex::encode(key), reason = "invisible", "vi.update.abort");
            return Ok(OpResult::AbortTx);
        }
        if matches!(&tuple, Tuple::Chained(t) if t.is_removed) {
            return Ok(OpResult::NotFound);
        }
        if self.read_conflict(ctx, &header) {
            debug!(dt = %self.dt_id, key = %hex::encode(key), reason = "read_conflict", "vi.update.abort");
            return Ok(OpResult::AbortTx);
        }
        let current = match &tuple {
            Tuple::Chained(t) => &t.value,
            Tuple::Fat(t) => &t.value,
            Tuple::VisibleForAll(t) => &t.value,
        };
        descriptor.validate(current.len())?;
        let mut after = current.clone();
        mutate(&mut after);

        let command_id = ctx.next_command_id();
        self.log(
            ctx,
            &WalRecord::UpdateSameSizeInPlace {
                command_id,
                key: key.to_vec(),
                before: header.meta,
                descriptor: descriptor.clone(),
                xor_diff: descriptor.xor_diff(current, &after),
            },
        )?;
        let meta = VersionMeta::new(ctx.worker_id(), ctx.tx_id(), command_id);
        let mut chained = match tuple {
            Tuple::Fat(fat) => {
                self.update_fat(&mut lock, fat, meta, after, descriptor)?;
                return Ok(OpResult::Ok);
            }
            Tuple::Chained(chained) => chained,
            // first write re-heads the loaded value as a final chained version
            Tuple::VisibleForAll(tuple) => tuple.into_chained(),
        };
        if self.conversion_gate_open(&chained) {
            if let Some(fat) = self.convert_to_fat(ctx, &mut lock, &mut chained, descriptor)? {
                self.update_fat(&mut lock, fat, meta, after, descriptor)?;
                return Ok(OpResult::Ok);
            }
        }
        self.update_chained(ctx, &mut lock, chained, meta, after, descriptor)?;
        Ok(OpResult::Ok)
    }

    fn update_chained(
        &self,
        ctx: &mut TxContext,
        lock: &mut TupleLock,
        mut chained: ChainedTuple,
        meta: VersionMeta,
        after: Vec<u8>,
        descriptor: &UpdateDescriptor,
    ) -> Result<()> {
        self.versions.insert(
            VersionKey::from(meta),
            &VersionRecord::Update(UpdateVersion {
                before: chained.meta(),
                payload: UpdatePayload::Delta {
                    descriptor: descriptor.clone(),
                    diff: descriptor.extract(&chained.value),
                },
            }),
        )?;
        chained.header.meta = meta;
        chained.value = after;
        lock.replace(chained.encode());
        self.stage_todo(
            ctx,
            TodoEntry {
                command_id: meta.command_id,
                dangling_pointer: lock.dangling_pointer(),
                key: lock.guard.node.key(lock.slot).to_vec(),
            },
        )
    }

    pub(super) fn update_fat(
        &self,
        lock: &mut TupleLock,
        mut fat: FatTuple,
        meta: VersionMeta,
        after: Vec<u8>,
        descriptor: &UpdateDescriptor,
    ) -> Result<()> {
        self.compact_fat(&mut fat);
        fat.push_delta(Delta {
            meta: fat.header.meta,
            descriptor: descriptor.clone(),
            diff: descriptor.extract(&fat.value),
        })?;
        fat.header.meta = meta;
        fat.value = after;
        lock.replace(fat.encode()?);
        Ok(())
    }

    /// Removes `key`, leaving a tombstone for older readers.
    pub fn remove(&self, ctx: &mut TxContext, key: &[u8]) -> Result<OpResult> {
        ctx.ensure_active()?;
        let mut lock = match self.lock_tuple(key)? {
            Locked::Held(lock) => lock,
            Locked::Missing => return Ok(OpResult::NotFound),
            Locked::Busy => {
                debug!(dt = %self.dt_id, key = %hex::encode(key), reason = "write_locked", "vi.remove.abort");
                return Ok(OpResult::AbortTx);
            }
        };
        let tuple = Tuple::decode(lock.payload())?;
        let header = tuple.header().clone();
        if !self.visible(ctx, &header.meta, true) {
            debug!(dt = %self.dt_id, key = %hex::encode(key), reason = "invisible", "vi.remove.abort");
            return Ok(OpResult::AbortTx);
        }
        if matches!(&tuple, Tuple::Chained(t) if t.is_removed) {
            return Ok(OpResult::NotFound);
        }
        if self.read_conflict(ctx, &header) {
            debug!(dt = %self.dt_id, key = %hex::encode(key), reason = "read_conflict", "vi.remove.abort");
            return Ok(OpResult::AbortTx);
        }
        let value = match tuple {
            Tuple::Fat(fat) => {
                self.spill_fat(&fat)?;
                fat.value
            }
            Tuple::Chained(chained) => chained.value,
            Tuple::VisibleForAll(tuple) => tuple.value,
        };

        let command_id = ctx.next_command_id();
        let meta = VersionMeta::new(ctx.worker_id(), ctx.tx_id(), command_id);
        self.log(
            ctx,
            &WalRecord::Remove {
                command_id,
                key: key.to_vec(),
                value: value.clone(),
                before: header.meta,
            },
        )?;
        self.versions.insert(
            VersionKey::from(meta),
            &VersionRecord::Remove(RemoveVersion {
                before: header.meta,
                key: key.to_vec(),
                value,
                dangling_pointer: lock.dangling_pointer(),
                moved_to_graveyard: false,
            }),
        )?;
        let mut tombstone = ChainedTuple::new(meta, Vec::new());
        tombstone.header.read_stamp = header.read_stamp;
        tombstone.is_removed = true;
        tombstone.can_convert_to_fat_tuple = false;
        lock.replace(tombstone.encode());
        self.stage_todo(
            ctx,
            TodoEntry {
                command_id,
                dangling_pointer: lock.dangling_pointer(),
                key: key.to_vec(),
            },
        )?;
        trace!(dt = %self.dt_id, key = %hex::encode(key), "vi.remove");
        Ok(OpResult::Ok)
    }

    /// Writes a fat tuple's deltas to the version store as a chain behind its head.
    fn spill_fat(&self, fat: &FatTuple) -> Result<()> {
        let mut newer = fat.header.meta;
        for delta in fat.deltas.iter().rev() {
            // nothing reads past a final version
            if newer.is_final() {
                break;
            }
            self.versions.insert(
                VersionKey::from(newer),
                &VersionRecord::Update(UpdateVersion {
                    before: delta.meta,
                    payload: UpdatePayload::Delta {
                        descriptor: delta.descriptor.clone(),
                        diff: delta.diff.clone(),
                    },
                }),
            )?;
            newer = delta.meta;
        }
        Ok(())
    }

    /// Loads `key` as visible to every transaction, outside of any transaction.
    ///
    /// Not logged; meant for populating a tree before it is shared.
    pub fn bulk_load(&self, key: &[u8], value: &[u8]) -> Result<OpResult> {
        let (inserted, _) = self
            .primary
            .insert(key, VisibleTuple::new(value.to_vec()).encode());
        Ok(if inserted {
            OpResult::Ok
        } else {
            OpResult::DuplicateKey
        })
    }
}
