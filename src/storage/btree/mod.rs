#![forbid(unsafe_code)]

//! Ordered leaf pages with fence keys.
//!
//! Leaves are indexed by their lower fence in a directory map. A leaf covers
//! `[lower_fence, upper_fence)`; the first leaf's lower fence is the empty key and
//! the last leaf has no upper fence. Leaves split when their payload exceeds the
//! page capacity and are never merged.
//!
//! Lock order: the directory and page table are never acquired while a leaf
//! latch is held.

use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::latch::{ExclusiveGuard, HybridLatch, OptimisticGuard, Restart, SharedGuard};
use crate::storage::version_store::DanglingPointer;
use crate::types::{DtId, PageId};

mod cursor;

pub use cursor::{Cursor, Entry};

/// Per-slot bookkeeping bytes counted against the page capacity.
const SLOT_OVERHEAD: usize = 4;

/// Hands out page ids shared by the trees of one data structure.
#[derive(Debug, Default)]
pub struct PageAllocator {
    next: AtomicU64,
}

impl PageAllocator {
    /// Creates an allocator starting at page 0.
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> PageId {
        PageId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Contents of one leaf page.
#[derive(Debug)]
pub struct LeafNode {
    page_id: PageId,
    lower_fence: Vec<u8>,
    upper_fence: Option<Vec<u8>>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    used_bytes: usize,
    has_garbage: bool,
}

impl LeafNode {
    fn new(page_id: PageId, lower_fence: Vec<u8>, upper_fence: Option<Vec<u8>>) -> Self {
        Self {
            page_id,
            lower_fence,
            upper_fence,
            entries: Vec::new(),
            used_bytes: 0,
            has_garbage: false,
        }
    }

    /// Page holding this leaf.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Inclusive lower bound of the keys this leaf may hold.
    pub fn lower_fence(&self) -> &[u8] {
        &self.lower_fence
    }

    /// Exclusive upper bound, `None` for the last leaf.
    pub fn upper_fence(&self) -> Option<&[u8]> {
        self.upper_fence.as_deref()
    }

    /// Whether `key` falls inside the fences.
    pub fn covers(&self, key: &[u8]) -> bool {
        key >= self.lower_fence.as_slice()
            && self.upper_fence.as_deref().map_or(true, |upper| key < upper)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when the leaf has no slots.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of keys, payloads and slot overhead.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Binary search for `key`.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key))
    }

    /// Key at `slot`.
    pub fn key(&self, slot: usize) -> &[u8] {
        &self.entries[slot].0
    }

    /// Payload at `slot`.
    pub fn payload(&self, slot: usize) -> &[u8] {
        &self.entries[slot].1
    }

    /// Mutable payload at `slot`; its length must not change.
    pub fn payload_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.entries[slot].1
    }

    /// Replaces the payload at `slot`, possibly changing its size.
    pub fn replace_payload(&mut self, slot: usize, payload: Vec<u8>) {
        let old = std::mem::replace(&mut self.entries[slot].1, payload);
        self.used_bytes = self.used_bytes - old.len() + self.entries[slot].1.len();
    }

    /// Inserts at `slot`, which must keep the keys sorted.
    pub fn insert_at(&mut self, slot: usize, key: Vec<u8>, payload: Vec<u8>) {
        self.used_bytes += key.len() + payload.len() + SLOT_OVERHEAD;
        self.entries.insert(slot, (key, payload));
    }

    /// Removes the slot and returns its key and payload.
    pub fn remove_at(&mut self, slot: usize) -> (Vec<u8>, Vec<u8>) {
        let (key, payload) = self.entries.remove(slot);
        self.used_bytes -= key.len() + payload.len() + SLOT_OVERHEAD;
        (key, payload)
    }

    /// Hint that the page holds reclaimable history.
    pub fn has_garbage(&self) -> bool {
        self.has_garbage
    }

    /// Sets or clears the garbage hint.
    pub fn set_has_garbage(&mut self, value: bool) {
        self.has_garbage = value;
    }

    /// Serializes the leaf for page-image WAL records.
    pub fn encode_image(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.used_bytes + self.lower_fence.len() + 16);
        out.extend_from_slice(&self.page_id.0.to_be_bytes());
        out.extend_from_slice(&(self.lower_fence.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.lower_fence);
        match &self.upper_fence {
            Some(upper) => {
                out.push(1);
                out.extend_from_slice(&(upper.len() as u16).to_be_bytes());
                out.extend_from_slice(upper);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for (key, payload) in &self.entries {
            out.extend_from_slice(&(key.len() as u16).to_be_bytes());
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(payload);
        }
        out
    }
}

/// A latched leaf page.
pub struct BufferFrame {
    page_id: PageId,
    latch: HybridLatch<LeafNode>,
}

impl BufferFrame {
    fn new(node: LeafNode) -> Self {
        Self {
            page_id: node.page_id,
            latch: HybridLatch::new(node),
        }
    }

    /// Page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The page latch.
    pub fn latch(&self) -> &HybridLatch<LeafNode> {
        &self.latch
    }
}

/// Result of splitting a leaf.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SplitInfo {
    /// Page that split.
    pub left: PageId,
    /// Newly allocated page holding the upper half.
    pub right: PageId,
    /// Position of the right page in the directory.
    pub right_pos: i32,
}

/// Exclusive access to the leaf covering a key.
pub struct LeafWriteGuard {
    /// Frame of the latched leaf.
    pub frame: Arc<BufferFrame>,
    /// The latch guard.
    pub node: ExclusiveGuard<LeafNode>,
}

impl LeafWriteGuard {
    /// Pointer to `slot` that stays valid until this page is modified again.
    pub fn dangling_pointer(&self, slot: usize) -> DanglingPointer {
        DanglingPointer {
            page_id: self.frame.page_id,
            latch_version_should_be: self.node.version_after_release(),
            head_slot: slot as i32,
        }
    }
}

/// A B-tree of raw byte keys and payloads.
pub struct BTree {
    dt_id: DtId,
    page_capacity: usize,
    allocator: Arc<PageAllocator>,
    directory: RwLock<BTreeMap<Vec<u8>, Arc<BufferFrame>>>,
    pages: RwLock<FxHashMap<PageId, Arc<BufferFrame>>>,
}

impl BTree {
    /// Creates a tree with a single empty leaf.
    pub fn new(dt_id: DtId, page_capacity: usize, allocator: Arc<PageAllocator>) -> Self {
        let root = Arc::new(BufferFrame::new(LeafNode::new(
            allocator.allocate(),
            Vec::new(),
            None,
        )));
        let mut directory = BTreeMap::new();
        directory.insert(Vec::new(), Arc::clone(&root));
        let mut pages = FxHashMap::default();
        pages.insert(root.page_id, root);
        Self {
            dt_id,
            page_capacity,
            allocator,
            directory: RwLock::new(directory),
            pages: RwLock::new(pages),
        }
    }

    /// Owning data structure.
    pub fn dt_id(&self) -> DtId {
        self.dt_id
    }

    pub(crate) fn find_leaf(&self, key: &[u8]) -> Option<Arc<BufferFrame>> {
        let directory = self.directory.read();
        directory
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, frame)| Arc::clone(frame))
    }

    /// Leaf immediately before the one starting at `lower_fence`.
    pub(crate) fn leaf_before(&self, lower_fence: &[u8]) -> Option<Arc<BufferFrame>> {
        let directory = self.directory.read();
        directory
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(lower_fence)))
            .next_back()
            .map(|(_, frame)| Arc::clone(frame))
    }

    /// Latches the leaf covering `key` exclusively.
    pub fn exclusive(&self, key: &[u8]) -> Option<LeafWriteGuard> {
        loop {
            let frame = self.find_leaf(key)?;
            let node = frame.latch.exclusive();
            if node.covers(key) {
                return Some(LeafWriteGuard { frame, node });
            }
        }
    }

    /// Latches the leaf covering `key` in shared mode.
    pub fn shared(&self, key: &[u8]) -> Option<(Arc<BufferFrame>, SharedGuard<LeafNode>)> {
        loop {
            let frame = self.find_leaf(key)?;
            let node = frame.latch.shared();
            if node.covers(key) {
                return Some((frame, node));
            }
        }
    }

    /// Attempts a non-blocking read of the leaf covering `key`.
    pub fn optimistic(
        &self,
        key: &[u8],
    ) -> Result<(Arc<BufferFrame>, OptimisticGuard<LeafNode>), Restart> {
        let frame = self.find_leaf(key).ok_or(Restart)?;
        let node = frame.latch.optimistic()?;
        if !node.covers(key) {
            return Err(Restart);
        }
        Ok((frame, node))
    }

    /// Frame of `page_id`, if it belongs to this tree.
    pub fn frame(&self, page_id: PageId) -> Option<Arc<BufferFrame>> {
        self.pages.read().get(&page_id).cloned()
    }

    /// Latches the page a dangling pointer names, if it was not modified since.
    pub fn resolve(&self, pointer: &DanglingPointer) -> Option<(LeafWriteGuard, usize)> {
        let frame = self.frame(pointer.page_id)?;
        let node = frame.latch.exclusive();
        // the guard is held, so the current version accounts for every release
        if frame.latch.version() != pointer.latch_version_should_be {
            return None;
        }
        let slot = usize::try_from(pointer.head_slot).ok()?;
        if slot >= node.len() {
            return None;
        }
        Some((LeafWriteGuard { frame, node }, slot))
    }

    /// Splits `frame` when it exceeds the page capacity.
    pub fn split_if_needed(&self, frame: &Arc<BufferFrame>) -> Option<SplitInfo> {
        let mut directory = self.directory.write();
        let mut node = frame.latch.exclusive();
        if node.used_bytes <= self.page_capacity || node.entries.len() < 2 {
            return None;
        }
        let mid = node.entries.len() / 2;
        let right_entries = node.entries.split_off(mid);
        let right_lower = right_entries[0].0.clone();
        let right_upper = node.upper_fence.replace(right_lower.clone());
        let right_used: usize = right_entries
            .iter()
            .map(|(k, p)| k.len() + p.len() + SLOT_OVERHEAD)
            .sum();
        node.used_bytes -= right_used;
        let mut right = LeafNode::new(self.allocator.allocate(), right_lower.clone(), right_upper);
        right.entries = right_entries;
        right.used_bytes = right_used;
        right.has_garbage = node.has_garbage;
        let right = Arc::new(BufferFrame::new(right));
        let right_pid = right.page_id;
        directory.insert(right_lower.clone(), Arc::clone(&right));
        self.pages.write().insert(right_pid, right);
        let right_pos = directory
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(right_lower.as_slice())))
            .count() as i32;
        debug!(dt = %self.dt_id, left = %frame.page_id, right = %right_pid, "btree.split");
        Some(SplitInfo {
            left: frame.page_id,
            right: right_pid,
            right_pos,
        })
    }

    /// Inserts a key; returns `false` when it already exists.
    pub fn insert(&self, key: &[u8], payload: Vec<u8>) -> (bool, Option<SplitInfo>) {
        let Some(mut guard) = self.exclusive(key) else {
            return (false, None);
        };
        match guard.node.search(key) {
            Ok(_) => (false, None),
            Err(slot) => {
                guard.node.insert_at(slot, key.to_vec(), payload);
                let frame = Arc::clone(&guard.frame);
                drop(guard);
                (true, self.split_if_needed(&frame))
            }
        }
    }

    /// Removes a key, returning its payload.
    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut guard = self.exclusive(key)?;
        let slot = guard.node.search(key).ok()?;
        Some(guard.node.remove_at(slot).1)
    }

    /// Copy of the payload stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let (_, node) = self.shared(key)?;
        let slot = node.search(key).ok()?;
        Some(node.payload(slot).to_vec())
    }

    /// Whether no key lies inside the bounds.
    pub fn is_range_surely_empty(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
        let start: &[u8] = match lower {
            Bound::Included(k) | Bound::Excluded(k) => k,
            Bound::Unbounded => &[],
        };
        let frames: Vec<Arc<BufferFrame>> = {
            let directory = self.directory.read();
            let first = directory
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(start)))
                .next_back()
                .map(|(k, _)| k.clone())
                .unwrap_or_default();
            directory
                .range::<[u8], _>((Bound::Included(first.as_slice()), Bound::Unbounded))
                .take_while(|(fence, _)| match upper {
                    Bound::Included(u) => fence.as_slice() <= u,
                    Bound::Excluded(u) => fence.as_slice() < u,
                    Bound::Unbounded => true,
                })
                .map(|(_, f)| Arc::clone(f))
                .collect()
        };
        for frame in frames {
            let node = frame.latch.shared();
            let in_range = node
                .entries
                .iter()
                .any(|(k, _)| RangeBounds::<[u8]>::contains(&(lower, upper), k.as_slice()));
            if in_range {
                return false;
            }
        }
        true
    }

    /// Ids of all leaves in key order.
    pub fn page_ids(&self) -> Vec<PageId> {
        self.directory.read().values().map(|f| f.page_id).collect()
    }

    /// Number of keys in the tree.
    pub fn len(&self) -> usize {
        let frames: Vec<_> = self.directory.read().values().cloned().collect();
        frames.iter().map(|f| f.latch.shared().len()).sum()
    }

    /// `true` when the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A cursor over this tree.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }
}

#[cfg(test)]
mod tests;
