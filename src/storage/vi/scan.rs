use std::ops::Bound;

use crate::primitives::concurrency::TxContext;
use crate::storage::btree::{BTree, Cursor, Entry};
use crate::types::{OpResult, Result};

use super::VersionedBTree;

#[derive(Copy, Clone, PartialEq, Eq)]
enum Side {
    Primary,
    Graveyard,
    Both,
}

impl VersionedBTree {
    /// Visits visible keys `>= start` in ascending order until `callback` returns `false`.
    pub fn scan_asc(
        &self,
        ctx: &mut TxContext,
        start: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<OpResult> {
        ctx.ensure_active()?;
        self.metrics.scan("asc");
        let mut cursor = self.primary.cursor();
        let mut entry = cursor.seek(start).cloned();
        while let Some(current) = entry {
            match self.read_entry(ctx, &self.primary, &current, true)? {
                (OpResult::Ok, Some(value)) => {
                    if !callback(&current.key, &value) {
                        return Ok(OpResult::Ok);
                    }
                }
                (OpResult::AbortTx, _) => return Ok(OpResult::AbortTx),
                _ => {}
            }
            entry = cursor.next().cloned();
        }
        Ok(OpResult::Ok)
    }

    /// Visits visible keys `<= start` in descending order until `callback` returns `false`.
    pub fn scan_desc(
        &self,
        ctx: &mut TxContext,
        start: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<OpResult> {
        ctx.ensure_active()?;
        self.metrics.scan("desc");
        let mut cursor = self.primary.cursor();
        let mut entry = cursor.seek_for_prev(start).cloned();
        while let Some(current) = entry {
            match self.read_entry(ctx, &self.primary, &current, true)? {
                (OpResult::Ok, Some(value)) => {
                    if !callback(&current.key, &value) {
                        return Ok(OpResult::Ok);
                    }
                }
                (OpResult::AbortTx, _) => return Ok(OpResult::AbortTx),
                _ => {}
            }
            entry = cursor.prev().cloned();
        }
        Ok(OpResult::Ok)
    }

    /// Ascending scan that merges relocated tombstones back in.
    ///
    /// Keys present in both trees are reported once: the primary version wins
    /// when it is visible, otherwise the graveyard copy is consulted. A primary
    /// key that vanished between the cursor copy and the read is looked up in
    /// the graveyard again.
    pub fn scan_olap(
        &self,
        ctx: &mut TxContext,
        start: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<OpResult> {
        ctx.ensure_active()?;
        self.metrics.scan("olap");
        let mut primary = self.primary.cursor();
        let mut graveyard = self.graveyard.cursor();
        let mut p = primary.seek(start).cloned();
        let mut limit = p.as_ref().and_then(|e| e.upper_fence.clone());
        let mut g = self.seed_graveyard(&mut graveyard, Bound::Included(start), limit.as_deref());

        loop {
            let side = match (&p, &g) {
                (None, None) => return Ok(OpResult::Ok),
                (Some(_), None) => Side::Primary,
                (None, Some(_)) => Side::Graveyard,
                (Some(pe), Some(ge)) => match pe.key.cmp(&ge.key) {
                    std::cmp::Ordering::Less => Side::Primary,
                    std::cmp::Ordering::Greater => Side::Graveyard,
                    std::cmp::Ordering::Equal => Side::Both,
                },
            };

            let mut emitted = None;
            if matches!(side, Side::Primary | Side::Both) {
                if let Some(entry) = &p {
                    match self.read_entry(ctx, &self.primary, entry, true)? {
                        (OpResult::Ok, Some(value)) => emitted = Some((entry.key.clone(), value)),
                        (OpResult::AbortTx, _) => return Ok(OpResult::AbortTx),
                        _ => {}
                    }
                }
            }
            if emitted.is_none() && matches!(side, Side::Graveyard | Side::Both) {
                if let Some(entry) = &g {
                    match self.read_entry(ctx, &self.graveyard, entry, false)? {
                        (OpResult::Ok, Some(value)) => emitted = Some((entry.key.clone(), value)),
                        (OpResult::AbortTx, _) => return Ok(OpResult::AbortTx),
                        _ => {}
                    }
                }
            }
            if let Some((key, value)) = &emitted {
                if !callback(key, value) {
                    return Ok(OpResult::Ok);
                }
            }

            // garbage collection may relocate keys the primary cursor already passed
            let resume = match (&side, &p) {
                (Side::Graveyard, _) | (_, None) => None,
                (Side::Primary, Some(entry)) if emitted.is_none() => {
                    Some(Bound::Included(entry.key.clone()))
                }
                (_, Some(entry)) => Some(Bound::Excluded(entry.key.clone())),
            };
            match resume {
                Some(lower) => {
                    p = primary.next().cloned();
                    limit = p.as_ref().and_then(|e| e.upper_fence.clone());
                    g = self.seed_graveyard(&mut graveyard, borrowed(&lower), limit.as_deref());
                }
                None => {
                    g = graveyard
                        .next()
                        .cloned()
                        .filter(|e| below(&e.key, limit.as_deref()));
                }
            }
        }
    }

    /// Positions the graveyard cursor on the first key inside the bounds.
    fn seed_graveyard(
        &self,
        cursor: &mut Cursor<'_>,
        lower: Bound<&[u8]>,
        limit: Option<&[u8]>,
    ) -> Option<Entry> {
        let upper = limit.map_or(Bound::Unbounded, Bound::Excluded);
        if self.graveyard.is_range_surely_empty(lower, upper) {
            return None;
        }
        let first = match lower {
            Bound::Included(key) => cursor.seek(key).cloned(),
            Bound::Excluded(key) => match cursor.seek(key).cloned() {
                Some(entry) if entry.key == key => cursor.next().cloned(),
                other => other,
            },
            Bound::Unbounded => cursor.seek(&[]).cloned(),
        };
        first.filter(|e| below(&e.key, limit))
    }

    /// Reconstructs the value of a cursor entry for `ctx`.
    ///
    /// The copy is used when its page did not change since it was taken;
    /// otherwise the slot is re-read under a latch. Serializable readers latch
    /// exclusively to protect the range, marking what they read unless their
    /// snapshot is safe.
    fn read_entry(
        &self,
        ctx: &mut TxContext,
        tree: &BTree,
        entry: &Entry,
        allow_marks: bool,
    ) -> Result<(OpResult, Option<Vec<u8>>)> {
        let mut found = None;
        if allow_marks && ctx.is_serializable() {
            let Some(mut guard) = tree.exclusive(&entry.key) else {
                return Ok((OpResult::NotFound, None));
            };
            let Ok(slot) = guard.node.search(&entry.key) else {
                return Ok((OpResult::NotFound, None));
            };
            let out = self.reconstruct_tuple(ctx, &entry.key, guard.node.payload(slot), &mut |v: &[u8]| {
                found = Some(v.to_vec())
            })?;
            if out.needs_read_mark {
                self.stamp_read(ctx, &mut guard, slot)?;
            }
            return Ok((out.result, found));
        }

        let out = self.reconstruct_tuple(ctx, &entry.key, &entry.payload, &mut |v: &[u8]| {
            found = Some(v.to_vec())
        })?;
        let unchanged = tree
            .frame(entry.page_id)
            .is_some_and(|frame| frame.latch().validate(entry.version).is_ok());
        if unchanged {
            return Ok((out.result, found));
        }
        found = None;
        let Some((_frame, node)) = tree.shared(&entry.key) else {
            return Ok((OpResult::NotFound, None));
        };
        let Ok(slot) = node.search(&entry.key) else {
            return Ok((OpResult::NotFound, None));
        };
        let out = self.reconstruct_tuple(ctx, &entry.key, node.payload(slot), &mut |v: &[u8]| {
            found = Some(v.to_vec())
        })?;
        Ok((out.result, found))
    }
}

fn borrowed(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn below(key: &[u8], limit: Option<&[u8]>) -> bool {
    limit.map_or(true, |limit| key < limit)
}
