use tracing::{debug, trace};

use crate::primitives::concurrency::TxContext;
use crate::storage::tuple::fat::FAT_TUPLE_LEN;
use crate::storage::tuple::{ChainedTuple, Delta, FatTuple, UpdateDescriptor};
use crate::storage::version_store::{UpdatePayload, UpdateVersion, VersionKey, VersionRecord};
use crate::storage::wal_records::WalRecord;
use crate::types::Result;

use super::{TupleLock, VersionedBTree};

impl VersionedBTree {
    pub(super) fn conversion_gate_open(&self, chained: &ChainedTuple) -> bool {
        self.options.enable_fat_tuple
            && chained.can_convert_to_fat_tuple
            && !chained.is_removed
            && !chained.is_final()
    }

    /// Folds the history behind `chained` into a fat tuple written to the locked slot.
    ///
    /// Returns `None` while the chain is shorter than the conversion threshold. A
    /// chain that cannot be folded closes the conversion gate of `chained`.
    pub(super) fn convert_to_fat(
        &self,
        ctx: &mut TxContext,
        lock: &mut TupleLock,
        chained: &mut ChainedTuple,
        pending: &UpdateDescriptor,
    ) -> Result<Option<FatTuple>> {
        let threshold = self.options.conversion_threshold(self.txm.worker_threads());
        let mut deltas = Vec::new();
        let mut folded = Vec::new();
        let mut newer = chained.meta();
        while !newer.is_final() {
            let key = VersionKey::from(newer);
            match self.versions.get(key)? {
                None => break,
                Some(VersionRecord::Update(UpdateVersion {
                    before,
                    payload: UpdatePayload::Delta { descriptor, diff },
                })) => {
                    if deltas
                        .first()
                        .is_some_and(|first: &Delta| first.descriptor != descriptor)
                    {
                        return Ok(self.reject_conversion(chained, "mixed_descriptors"));
                    }
                    deltas.push(Delta {
                        meta: before,
                        descriptor,
                        diff,
                    });
                    folded.push(key);
                    newer = before;
                }
                Some(_) => return Ok(self.reject_conversion(chained, "not_a_delta")),
            }
        }
        if deltas.len() < threshold {
            return Ok(None);
        }
        deltas.reverse();

        let total_space = self
            .options
            .max_fat_tuple_length()
            .saturating_sub(FAT_TUPLE_LEN) as u32;
        let mut fat = FatTuple::new(chained.header.clone(), total_space, chained.value.clone(), deltas);
        self.compact_fat(&mut fat);
        if fat.used_space() > total_space as usize || !fat.has_space_for(pending) {
            return Ok(self.reject_conversion(chained, "too_large"));
        }

        let before = lock.guard.node.encode_image();
        lock.replace(fat.encode()?);
        let after = lock.guard.node.encode_image();
        self.log(ctx, &WalRecord::BeforeAfterImage { before, after })?;
        for key in &folded {
            self.versions.remove(*key)?;
        }
        self.metrics.fat_tuple_converted();
        debug!(
            dt = %self.dt_id,
            key = %hex::encode(lock.guard.node.key(lock.slot)),
            deltas = fat.deltas.len(),
            folded = folded.len(),
            "vi.fat.convert"
        );
        Ok(Some(fat))
    }

    fn reject_conversion(&self, chained: &mut ChainedTuple, reason: &'static str) -> Option<FatTuple> {
        chained.can_convert_to_fat_tuple = false;
        self.metrics.fat_tuple_conversion_rejected();
        debug!(dt = %self.dt_id, reason, "vi.fat.convert.rejected");
        None
    }

    /// Drops deltas no running transaction can reach. Returns how many were dropped.
    pub(super) fn compact_fat(&self, fat: &mut FatTuple) -> usize {
        let dropped = fat.garbage_collect(|meta| self.visible_for_all(meta.tx_ts));
        if dropped > 0 {
            self.metrics.fat_tuple_compacted(dropped);
            trace!(dt = %self.dt_id, dropped, left = fat.deltas.len(), "vi.fat.compact");
        }
        dropped
    }
}
