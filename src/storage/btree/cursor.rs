use std::sync::Arc;

use crate::primitives::latch::VersionToken;
use crate::types::PageId;

use super::{BTree, BufferFrame, LeafNode};

/// Copy of one slot taken under a shared page latch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Slot key.
    pub key: Vec<u8>,
    /// Slot payload.
    pub payload: Vec<u8>,
    /// Page the slot was read from.
    pub page_id: PageId,
    /// Slot index at read time.
    pub slot: usize,
    /// Page latch version at read time.
    pub version: VersionToken,
    /// Lower fence of the leaf.
    pub lower_fence: Vec<u8>,
    /// Upper fence of the leaf.
    pub upper_fence: Option<Vec<u8>>,
}

impl Entry {
    fn read(frame: &BufferFrame, node: &LeafNode, slot: usize) -> Self {
        Self {
            key: node.key(slot).to_vec(),
            payload: node.payload(slot).to_vec(),
            page_id: frame.page_id(),
            slot,
            version: VersionToken(frame.latch().version()),
            lower_fence: node.lower_fence().to_vec(),
            upper_fence: node.upper_fence().map(<[u8]>::to_vec),
        }
    }
}

/// Bidirectional cursor that re-seeks from its last key on every step.
///
/// No latch is held between calls, so concurrent splits and writers never block
/// on an idle cursor; each step observes the tree as of that step.
pub struct Cursor<'a> {
    tree: &'a BTree,
    current: Option<Entry>,
}

impl<'a> Cursor<'a> {
    pub(super) fn new(tree: &'a BTree) -> Self {
        Self {
            tree,
            current: None,
        }
    }

    /// Entry the cursor is positioned on.
    pub fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    /// Positions on the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Option<&Entry> {
        self.current = self.first_from(key, true);
        self.current.as_ref()
    }

    /// Positions on the last key `<= key`.
    pub fn seek_for_prev(&mut self, key: &[u8]) -> Option<&Entry> {
        self.current = self.last_from(key, true);
        self.current.as_ref()
    }

    /// Moves to the next key.
    pub fn next(&mut self) -> Option<&Entry> {
        let key = self.current.take()?.key;
        self.current = self.first_from(&key, false);
        self.current.as_ref()
    }

    /// Moves to the previous key.
    pub fn prev(&mut self) -> Option<&Entry> {
        let key = self.current.take()?.key;
        self.current = self.last_from(&key, false);
        self.current.as_ref()
    }

    fn latch_covering(&self, key: &[u8]) -> Option<Arc<BufferFrame>> {
        loop {
            let frame = self.tree.find_leaf(key)?;
            if frame.latch().shared().covers(key) {
                return Some(frame);
            }
        }
    }

    fn first_from(&self, key: &[u8], inclusive: bool) -> Option<Entry> {
        let mut frame = self.latch_covering(key)?;
        let mut bound = key.to_vec();
        let mut inclusive = inclusive;
        loop {
            let node = frame.latch().shared();
            if !node.covers(&bound) && bound.as_slice() >= node.lower_fence() {
                drop(node);
                frame = self.latch_covering(&bound)?;
                continue;
            }
            let pos = match node.search(&bound) {
                Ok(i) if inclusive => i,
                Ok(i) => i + 1,
                Err(i) => i,
            };
            if pos < node.len() {
                return Some(Entry::read(&frame, &node, pos));
            }
            let upper = node.upper_fence()?.to_vec();
            drop(node);
            frame = self.latch_covering(&upper)?;
            bound = upper;
            inclusive = true;
        }
    }

    fn last_from(&self, key: &[u8], inclusive: bool) -> Option<Entry> {
        let mut lower = loop {
            let frame = self.latch_covering(key)?;
            let node = frame.latch().shared();
            if !node.covers(key) {
                continue;
            }
            let pos = match node.search(key) {
                Ok(i) if inclusive => Some(i),
                Ok(i) | Err(i) => i.checked_sub(1),
            };
            if let Some(pos) = pos {
                return Some(Entry::read(&frame, &node, pos));
            }
            if node.lower_fence().is_empty() {
                return None;
            }
            break node.lower_fence().to_vec();
        };
        loop {
            let frame = self.tree.leaf_before(&lower)?;
            let node = frame.latch().shared();
            if node.upper_fence() != Some(lower.as_slice()) {
                // split since the directory lookup
                continue;
            }
            if let Some(last) = node.len().checked_sub(1) {
                return Some(Entry::read(&frame, &node, last));
            }
            if node.lower_fence().is_empty() {
                return None;
            }
            lower = node.lower_fence().to_vec();
        }
    }
}
