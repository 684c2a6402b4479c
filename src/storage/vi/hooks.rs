use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::concurrency::{DataStructureHooks, SpaceCheckResult, TodoOutcome};
use crate::storage::tuple::{
    is_write_locked, peek_format, set_read_stamp, ChainedTuple, FatTuple, Tuple, TupleHeader,
    VersionMeta,
};
use crate::storage::version_store::{UpdatePayload, UpdateVersion, VersionKey, VersionRecord};
use crate::storage::wal_records::{TodoEntry, UnlockEntry, WalRecord};
use crate::types::{mark_committed, DtId, PageId, Result, TxId, VitreeError, WorkerId, INVALID_COMMAND_ID};

use super::VersionedBTree;

const META_DT_ID: &str = "dt_id";
const META_GRAVEYARD: &str = "graveyard";
const GRAVEYARD_VOLATILE: &str = "volatile";

impl VersionedBTree {
    fn todo_update(&self, todo: &TodoEntry, version: VersionMeta) -> Result<TodoOutcome> {
        let Some((mut guard, slot)) = self.locate(&self.primary, &todo.dangling_pointer, &todo.key)
        else {
            self.purge_chain(version.into())?;
            return Ok(TodoOutcome::Done);
        };
        if !self.visible_for_all(version.tx_ts) {
            return Ok(TodoOutcome::Reschedule);
        }
        if let Tuple::Chained(mut head) = Tuple::decode(guard.node.payload(slot))? {
            if head.meta() == version && !head.is_removed {
                if let Some(commit) = self.txm.commit_ts(version.tx_ts) {
                    head.header.meta =
                        VersionMeta::new(version.worker_id, mark_committed(commit), INVALID_COMMAND_ID);
                    head.can_convert_to_fat_tuple = true;
                    guard.node.replace_payload(slot, head.encode());
                }
            }
        }
        drop(guard);
        self.purge_chain(version.into())?;
        Ok(TodoOutcome::Done)
    }

    fn todo_remove(
        &self,
        todo: &TodoEntry,
        version: VersionMeta,
        called_before: bool,
        moved: Option<bool>,
    ) -> Result<TodoOutcome> {
        if called_before {
            return self.reclaim_tombstone(todo, version, moved);
        }
        let Some((mut guard, slot)) = self.locate(&self.primary, &todo.dangling_pointer, &todo.key)
        else {
            self.purge_chain(version.into())?;
            return Ok(TodoOutcome::Done);
        };
        let same_tombstone = matches!(
            Tuple::decode(guard.node.payload(slot))?,
            Tuple::Chained(head) if head.is_removed && head.meta() == version
        );
        if !same_tombstone {
            drop(guard);
            if self.visible_for_all(version.tx_ts) {
                self.purge_chain(version.into())?;
                return Ok(TodoOutcome::Done);
            }
            return Ok(TodoOutcome::Reschedule);
        }
        if self.visible_for_all(version.tx_ts) {
            guard.node.remove_at(slot);
            drop(guard);
            self.metrics.version_purged();
            self.purge_chain(version.into())?;
            trace!(dt = %self.dt_id, key = %hex::encode(&todo.key), "vi.todo.tombstone_reclaimed");
            return Ok(TodoOutcome::Done);
        }
        // only analytical readers may still need the tombstone
        if !self.options.enable_graveyard
            || !self.txm.is_visible_for_all_oltp(version.tx_ts)
            || self.graveyard.get(&todo.key).is_some()
        {
            return Ok(TodoOutcome::Reschedule);
        }

        let copy = guard.node.payload(slot).to_vec();
        drop(guard);
        let (inserted, _) = self.graveyard.insert(&todo.key, copy.clone());
        if !inserted {
            return Ok(TodoOutcome::Reschedule);
        }
        let unchanged = match self.locate(&self.primary, &todo.dangling_pointer, &todo.key) {
            Some((mut guard, slot)) if guard.node.payload(slot) == copy.as_slice() => {
                guard.node.remove_at(slot);
                true
            }
            _ => false,
        };
        if !unchanged {
            // the key was re-inserted while the primary latch was released
            self.graveyard.remove(&todo.key);
            return Ok(TodoOutcome::Reschedule);
        }
        self.versions.mark_moved_to_graveyard(version.into())?;
        self.metrics.graveyard_moved();
        debug!(dt = %self.dt_id, key = %hex::encode(&todo.key), "vi.todo.graveyard_move");
        Ok(TodoOutcome::Reschedule)
    }

    /// Second pass of a remove todo, once no reader can reach the tombstone.
    ///
    /// `moved` comes from the remove record; without one both trees are checked.
    fn reclaim_tombstone(
        &self,
        todo: &TodoEntry,
        version: VersionMeta,
        moved: Option<bool>,
    ) -> Result<TodoOutcome> {
        let primary = if moved == Some(true) {
            None
        } else {
            self.locate(&self.primary, &todo.dangling_pointer, &todo.key)
        };
        if let Some((mut guard, slot)) = primary {
            if matches!(
                Tuple::decode(guard.node.payload(slot))?,
                Tuple::Chained(head) if head.is_removed && head.meta() == version
            ) {
                guard.node.remove_at(slot);
                self.metrics.version_purged();
            }
        }
        let graveyard = if moved == Some(false) {
            None
        } else {
            self.graveyard.get(&todo.key)
        };
        if let Some(payload) = graveyard {
            if ChainedTuple::decode(&payload)?.meta() == version {
                self.graveyard.remove(&todo.key);
                self.metrics.version_purged();
            }
        }
        self.purge_chain(version.into())?;
        Ok(TodoOutcome::Done)
    }

    fn undo_insert(&self, key: &[u8], version: VersionMeta) -> Result<()> {
        let Some(mut guard) = self.primary.exclusive(key) else {
            return Ok(());
        };
        let Ok(slot) = guard.node.search(key) else {
            return Ok(());
        };
        let Tuple::Chained(head) = Tuple::decode(guard.node.payload(slot))? else {
            return Ok(());
        };
        let meta = head.meta();
        let ours = meta.worker_id == version.worker_id
            && meta.tx_ts == version.tx_ts
            && (meta.command_id == INVALID_COMMAND_ID || meta.command_id == version.command_id);
        if !ours || head.is_removed {
            return Ok(());
        }
        if meta.command_id == version.command_id {
            if let Some(VersionRecord::Update(UpdateVersion {
                before,
                payload: UpdatePayload::Absent,
            })) = self.versions.get(version.into())?
            {
                let mut tombstone = ChainedTuple::new(before, Vec::new());
                tombstone.header.read_stamp = head.header.read_stamp;
                tombstone.is_removed = true;
                tombstone.can_convert_to_fat_tuple = false;
                guard.node.replace_payload(slot, tombstone.encode());
                self.versions.remove(version.into())?;
                return Ok(());
            }
        }
        guard.node.remove_at(slot);
        Ok(())
    }

    fn undo_update(
        &self,
        key: &[u8],
        version: VersionMeta,
        before: VersionMeta,
        apply: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        let Some(mut guard) = self.primary.exclusive(key) else {
            return Ok(());
        };
        let Ok(slot) = guard.node.search(key) else {
            return Ok(());
        };
        match Tuple::decode(guard.node.payload(slot))? {
            Tuple::Chained(mut head) if head.meta() == version && !head.is_removed => {
                apply(&mut head.value)?;
                head.header.meta = before;
                guard.node.replace_payload(slot, head.encode());
                self.versions.remove(version.into())?;
            }
            Tuple::Fat(mut fat) if fat.header.meta == version => {
                let delta = fat.undo_last_update()?;
                if delta.meta != before {
                    return Err(VitreeError::Corruption("fat tuple delta does not match undo record"));
                }
                guard.node.replace_payload(slot, fat.encode()?);
            }
            _ => {}
        }
        Ok(())
    }

    fn undo_remove(&self, key: &[u8], version: VersionMeta, before: VersionMeta, value: Vec<u8>) -> Result<()> {
        let Some(mut guard) = self.primary.exclusive(key) else {
            return Ok(());
        };
        let Ok(slot) = guard.node.search(key) else {
            return Ok(());
        };
        let Tuple::Chained(head) = Tuple::decode(guard.node.payload(slot))? else {
            return Ok(());
        };
        if !head.is_removed || head.meta() != version {
            return Ok(());
        }
        let mut restored = ChainedTuple::new(before, value);
        restored.header.read_stamp = head.header.read_stamp;
        guard.node.replace_payload(slot, restored.encode());
        self.versions.remove(version.into())?;
        Ok(())
    }

    /// Writes `payload` under `key`, inserting the slot when it is missing.
    fn redo_put(&self, key: &[u8], payload: Vec<u8>) -> Result<()> {
        let Some(mut guard) = self.primary.exclusive(key) else {
            return Err(VitreeError::Corruption("primary tree has no leaf"));
        };
        match guard.node.search(key) {
            Ok(slot) => guard.node.replace_payload(slot, payload),
            Err(slot) => {
                guard.node.insert_at(slot, key.to_vec(), payload);
                let frame = Arc::clone(&guard.frame);
                drop(guard);
                self.primary.split_if_needed(&frame);
            }
        }
        Ok(())
    }

    fn redo_update(
        &self,
        key: &[u8],
        meta: VersionMeta,
        apply: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        let Some(mut guard) = self.primary.exclusive(key) else {
            return Ok(());
        };
        let Ok(slot) = guard.node.search(key) else {
            debug!(dt = %self.dt_id, key = %hex::encode(key), "vi.redo.update_missing");
            return Ok(());
        };
        let mut head = match Tuple::decode(guard.node.payload(slot))? {
            Tuple::Chained(head) => head,
            Tuple::VisibleForAll(tuple) => tuple.into_chained(),
            Tuple::Fat(mut fat) => {
                apply(&mut fat.value)?;
                fat.header.meta = meta;
                guard.node.replace_payload(slot, fat.encode()?);
                return Ok(());
            }
        };
        apply(&mut head.value)?;
        head.header.meta = meta;
        guard.node.replace_payload(slot, head.encode());
        Ok(())
    }
}

impl DataStructureHooks for VersionedBTree {
    fn dt_id(&self) -> DtId {
        self.dt_id
    }

    fn undo(&self, entry: &[u8], worker_id: WorkerId, tx_id: TxId) -> Result<()> {
        let record = WalRecord::decode(entry)?;
        match record {
            WalRecord::Insert { command_id, key, .. } => {
                self.undo_insert(&key, VersionMeta::new(worker_id, tx_id, command_id))
            }
            WalRecord::UpdateSameSizeInPlace {
                command_id,
                key,
                before,
                descriptor,
                xor_diff,
            } => self.undo_update(
                &key,
                VersionMeta::new(worker_id, tx_id, command_id),
                before,
                |value| descriptor.apply_xor(value, &xor_diff),
            ),
            WalRecord::Remove {
                command_id,
                key,
                value,
                before,
            } => self.undo_remove(
                &key,
                VersionMeta::new(worker_id, tx_id, command_id),
                before,
                value,
            ),
            _ => Ok(()),
        }
    }

    fn redo(&self, entry: &[u8], worker_id: WorkerId, tx_id: TxId) -> Result<()> {
        match WalRecord::decode(entry)? {
            WalRecord::Insert { key, value, .. } => {
                let tuple = ChainedTuple::new(
                    VersionMeta::new(worker_id, tx_id, INVALID_COMMAND_ID),
                    value,
                );
                self.redo_put(&key, tuple.encode())
            }
            WalRecord::UpdateSameSizeInPlace {
                command_id,
                key,
                descriptor,
                xor_diff,
                ..
            } => self.redo_update(
                &key,
                VersionMeta::new(worker_id, tx_id, command_id),
                |value| descriptor.apply_xor(value, &xor_diff),
            ),
            WalRecord::Remove { command_id, key, .. } => {
                let mut tombstone =
                    ChainedTuple::new(VersionMeta::new(worker_id, tx_id, command_id), Vec::new());
                tombstone.is_removed = true;
                tombstone.can_convert_to_fat_tuple = false;
                self.redo_put(&key, tombstone.encode())
            }
            // pages are rebuilt from logical records
            _ => Ok(()),
        }
    }

    fn todo(
        &self,
        entry: &[u8],
        version_worker_id: WorkerId,
        version_tx_id: TxId,
        called_before: bool,
    ) -> Result<TodoOutcome> {
        let todo = TodoEntry::decode(entry)?;
        let version = VersionMeta::new(version_worker_id, version_tx_id, todo.command_id);
        let outcome = match self.versions.get(VersionKey::from(version))? {
            None if !called_before => return Ok(TodoOutcome::Done),
            Some(VersionRecord::Update(_)) => self.todo_update(&todo, version)?,
            Some(VersionRecord::Remove(remove)) => {
                self.todo_remove(&todo, version, called_before, Some(remove.moved_to_graveyard))?
            }
            // a remove todo called again may find its record already purged
            None => self.todo_remove(&todo, version, called_before, None)?,
        };
        trace!(
            dt = %self.dt_id,
            key = %hex::encode(&todo.key),
            called_before,
            outcome = ?outcome,
            "vi.todo"
        );
        Ok(outcome)
    }

    fn unlock(&self, entry: &[u8], worker_id: WorkerId) -> Result<()> {
        let entry = UnlockEntry::decode(entry)?;
        let Some((mut guard, slot)) = self.locate(&self.primary, &entry.dangling_pointer, &entry.key)
        else {
            return Ok(());
        };
        let header = TupleHeader::decode(guard.node.payload(slot))?;
        let bit = 1u128 << worker_id;
        if header.read_stamp & bit != 0 {
            set_read_stamp(guard.node.payload_mut(slot), header.read_stamp & !bit)?;
        }
        Ok(())
    }

    fn check_space_utilization(&self, page_id: PageId) -> Result<SpaceCheckResult> {
        let Some(frame) = self.primary.frame(page_id) else {
            return Ok(SpaceCheckResult::PickAnotherBf);
        };
        let mut node = frame.latch().exclusive();
        if !node.has_garbage() {
            return Ok(SpaceCheckResult::Nothing);
        }
        let mut dropped = 0;
        for slot in 0..node.len() {
            let payload = node.payload(slot);
            if !peek_format(payload)?.is_fat() || is_write_locked(payload)? {
                continue;
            }
            let mut fat = FatTuple::decode(payload)?;
            let n = self.compact_fat(&mut fat);
            if n > 0 {
                node.replace_payload(slot, fat.encode()?);
                dropped += n;
            }
        }
        node.set_has_garbage(false);
        debug!(dt = %self.dt_id, page = %page_id, dropped, "vi.space_check");
        Ok(if dropped > 0 {
            SpaceCheckResult::RestartSameBf
        } else {
            SpaceCheckResult::Nothing
        })
    }

    fn serialize(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (META_DT_ID.to_string(), self.dt_id.0.to_string()),
            (META_GRAVEYARD.to_string(), GRAVEYARD_VOLATILE.to_string()),
        ])
    }

    fn deserialize(&self, meta: &BTreeMap<String, String>) -> Result<()> {
        let dt_id = meta
            .get(META_DT_ID)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(VitreeError::Invalid("catalog entry has no dt_id"))?;
        if dt_id != self.dt_id.0 {
            return Err(VitreeError::Invalid("catalog entry belongs to another tree"));
        }
        match meta.get(META_GRAVEYARD).map(String::as_str) {
            Some(GRAVEYARD_VOLATILE) => Ok(()),
            _ => Err(VitreeError::Invalid("unsupported graveyard kind")),
        }
    }
}
