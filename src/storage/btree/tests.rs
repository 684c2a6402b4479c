use std::ops::Bound;
use std::sync::Arc;

use super::*;

fn tree(capacity: usize) -> BTree {
    BTree::new(DtId(1), capacity, Arc::new(PageAllocator::new()))
}

fn key(i: u32) -> Vec<u8> {
    format!("key{i:04}").into_bytes()
}

#[test]
fn splits_keep_keys_ordered_and_reachable() {
    let tree = tree(256);
    let mut splits = 0;
    for i in (0..200).rev() {
        let (inserted, split) = tree.insert(&key(i), vec![i as u8; 16]);
        assert!(inserted);
        splits += usize::from(split.is_some());
    }
    assert!(splits > 0);
    assert_eq!(tree.len(), 200);
    assert!(tree.page_ids().len() > 1);
    for i in 0..200 {
        assert_eq!(tree.get(&key(i)), Some(vec![i as u8; 16]));
    }
    let mut cursor = tree.cursor();
    let mut seen = Vec::new();
    let mut entry = cursor.seek(b"").cloned();
    while let Some(e) = entry {
        seen.push(e.key.clone());
        entry = cursor.next().cloned();
    }
    let expected: Vec<_> = (0..200).map(key).collect();
    assert_eq!(seen, expected);
}

#[test]
fn split_reports_position_of_the_new_leaf() {
    let tree = tree(256);
    let mut seen = 0;
    for i in 0..120 {
        let (_, split) = tree.insert(&key(i), vec![0; 16]);
        if let Some(split) = split {
            let pages = tree.page_ids();
            assert_eq!(pages[split.right_pos as usize], split.right);
            assert_eq!(pages[split.right_pos as usize - 1], split.left);
            seen += 1;
        }
    }
    assert!(seen > 1);
}

#[test]
fn reverse_cursor_crosses_leaves() {
    let tree = tree(128);
    for i in 0..64 {
        tree.insert(&key(i * 2), vec![0; 8]);
    }
    let mut cursor = tree.cursor();
    let first = cursor.seek_for_prev(&key(51)).cloned().expect("entry");
    assert_eq!(first.key, key(50));
    let mut count = 1;
    while cursor.prev().is_some() {
        count += 1;
    }
    assert_eq!(count, 26);
    assert!(tree.cursor().seek_for_prev(b"a").is_none());
}

#[test]
fn entries_report_their_leaf_and_fences() {
    let tree = tree(128);
    for i in 0..40 {
        tree.insert(&key(i), vec![1; 8]);
    }
    let mut cursor = tree.cursor();
    let mut entry = cursor.seek(b"").cloned();
    let mut pages = Vec::new();
    while let Some(e) = entry {
        if let Some(upper) = &e.upper_fence {
            assert!(e.key < *upper);
        }
        assert!(e.key >= e.lower_fence);
        if pages.last() != Some(&e.page_id) {
            pages.push(e.page_id);
        }
        entry = cursor.next().cloned();
    }
    assert_eq!(pages, tree.page_ids());
}

#[test]
fn range_emptiness_checks_bounds() {
    let tree = tree(4096);
    tree.insert(b"b", vec![]);
    tree.insert(b"d", vec![]);
    assert!(tree.is_range_surely_empty(Bound::Excluded(&b"b"[..]), Bound::Excluded(&b"d"[..])));
    assert!(!tree.is_range_surely_empty(Bound::Included(&b"b"[..]), Bound::Excluded(&b"d"[..])));
    assert!(!tree.is_range_surely_empty(Bound::Excluded(&b"b"[..]), Bound::Unbounded));
    assert!(tree.is_range_surely_empty(Bound::Excluded(&b"d"[..]), Bound::Unbounded));
    assert_eq!(tree.remove(b"d"), Some(vec![]));
    assert!(tree.is_range_surely_empty(Bound::Excluded(&b"b"[..]), Bound::Unbounded));
}

#[test]
fn dangling_pointer_goes_stale_after_modification() {
    let tree = tree(4096);
    tree.insert(b"k1", b"v1".to_vec());
    let pointer = {
        let guard = tree.exclusive(b"k1").expect("leaf");
        let slot = guard.node.search(b"k1").expect("present");
        guard.dangling_pointer(slot)
    };
    {
        let (guard, slot) = tree.resolve(&pointer).expect("still valid");
        assert_eq!(guard.node.key(slot), b"k1");
    }
    // the resolve above released an exclusive latch, so the hint is now stale
    assert!(tree.resolve(&pointer).is_none());
}

#[test]
fn page_image_lists_slots() {
    let tree = tree(4096);
    tree.insert(b"a", b"1".to_vec());
    let guard = tree.exclusive(b"a").expect("leaf");
    let image = guard.node.encode_image();
    assert_eq!(&image[0..8], &guard.frame.page_id().0.to_be_bytes());
    assert!(image.ends_with(b"a1"));
}
