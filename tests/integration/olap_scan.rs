//! Long-running analytical readers and the graveyard.

#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use vitree::primitives::concurrency::{TxContext, TxManager, TxManagerOptions, TxOptions};
use vitree::storage::{CounterMetrics, TreeOptions, VersionedBTree};
use vitree::types::{OpResult, Result};

const KEYS: usize = 20;

fn key(i: usize) -> Vec<u8> {
    format!("k{i:02}").into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("v{i:02}").into_bytes()
}

struct Fixture {
    txm: Arc<TxManager>,
    tree: Arc<VersionedBTree>,
    metrics: Arc<CounterMetrics>,
}

fn fixture(graveyard: bool) -> Result<Fixture> {
    let txm = Arc::new(TxManager::new(TxManagerOptions::new().worker_threads(4))?);
    let metrics = Arc::new(CounterMetrics::default());
    let options = TreeOptions::new()
        .page_size(256)
        .fat_tuple_headroom(64)
        .enable_graveyard(graveyard)
        .metrics(metrics.clone());
    let tree = VersionedBTree::create(Arc::clone(&txm), options)?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    for i in 0..KEYS {
        assert_eq!(tree.insert(&mut tx, &key(i), &value(i))?, OpResult::Ok);
    }
    txm.commit(&mut tx)?;
    Ok(Fixture { txm, tree, metrics })
}

fn remove_even(f: &Fixture) -> Result<()> {
    let mut tx = f.txm.begin(0, TxOptions::snapshot())?;
    for i in (0..KEYS).step_by(2) {
        assert_eq!(f.tree.remove(&mut tx, &key(i))?, OpResult::Ok);
    }
    f.txm.commit(&mut tx)?;
    Ok(())
}

fn collect_asc(tree: &VersionedBTree, ctx: &mut TxContext) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut rows = Vec::new();
    let result = tree.scan_asc(ctx, b"", |k, v| {
        rows.push((k.to_vec(), v.to_vec()));
        true
    })?;
    assert_eq!(result, OpResult::Ok);
    Ok(rows)
}

fn collect_olap(tree: &VersionedBTree, ctx: &mut TxContext) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut rows = Vec::new();
    let result = tree.scan_olap(ctx, b"", |k, v| {
        rows.push((k.to_vec(), v.to_vec()));
        true
    })?;
    assert_eq!(result, OpResult::Ok);
    Ok(rows)
}

fn everything() -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..KEYS).map(|i| (key(i), value(i))).collect()
}

#[test]
fn relocated_tombstones_stay_visible_to_olap_readers() -> Result<()> {
    let f = fixture(true)?;
    assert!(f.tree.primary().page_ids().len() > 1, "fixture should span several leaves");
    let mut olap = f.txm.begin(1, TxOptions::snapshot().olap())?;

    remove_even(&f)?;
    f.txm.collect_garbage()?;
    assert_eq!(f.tree.graveyard().len(), KEYS / 2);
    assert_eq!(f.tree.primary().len(), KEYS / 2);
    assert_eq!(f.metrics.graveyard_moves.load(Ordering::Relaxed), (KEYS / 2) as u64);

    let mut oltp = f.txm.begin(2, TxOptions::snapshot())?;
    let odd: Vec<_> = (1..KEYS).step_by(2).map(|i| (key(i), value(i))).collect();
    assert_eq!(collect_asc(&f.tree, &mut oltp)?, odd);
    f.txm.commit(&mut oltp)?;

    assert_eq!(collect_olap(&f.tree, &mut olap)?, everything());

    // an OLAP point read does not consult the graveyard
    let mut seen = None;
    assert_eq!(
        f.tree.lookup(&mut olap, &key(0), |v| seen = Some(v.to_vec()))?,
        OpResult::NotFound
    );
    assert!(seen.is_none());
    f.txm.commit(&mut olap)?;
    Ok(())
}

#[test]
fn tombstones_moved_during_a_scan_are_still_reported() -> Result<()> {
    let f = fixture(true)?;
    let mut olap = f.txm.begin(1, TxOptions::snapshot().olap())?;
    let mut tx = f.txm.begin(0, TxOptions::snapshot())?;
    assert_eq!(f.tree.remove(&mut tx, &key(1))?, OpResult::Ok);
    f.txm.commit(&mut tx)?;
    assert!(f.tree.graveyard().is_empty());

    let mut rows = Vec::new();
    f.tree.scan_olap(&mut olap, b"", |k, v| {
        if rows.is_empty() {
            f.txm.collect_garbage().expect("gc pass");
        }
        rows.push((k.to_vec(), v.to_vec()));
        true
    })?;
    assert_eq!(f.tree.graveyard().len(), 1);
    assert_eq!(rows, everything());

    // the same holds when the move happens further into the scan
    let mut tx = f.txm.begin(0, TxOptions::snapshot())?;
    assert_eq!(f.tree.remove(&mut tx, &key(KEYS - 2))?, OpResult::Ok);
    f.txm.commit(&mut tx)?;
    let mut rows = Vec::new();
    f.tree.scan_olap(&mut olap, b"", |k, v| {
        if k == key(KEYS - 4).as_slice() {
            f.txm.collect_garbage().expect("gc pass");
        }
        rows.push((k.to_vec(), v.to_vec()));
        true
    })?;
    assert_eq!(f.tree.graveyard().len(), 2);
    assert_eq!(rows, everything());
    f.txm.commit(&mut olap)?;
    Ok(())
}

#[test]
fn reinserted_keys_are_reported_once() -> Result<()> {
    let f = fixture(true)?;
    let mut olap = f.txm.begin(1, TxOptions::snapshot().olap())?;
    remove_even(&f)?;
    f.txm.collect_garbage()?;

    let mut tx = f.txm.begin(0, TxOptions::snapshot())?;
    assert_eq!(f.tree.insert(&mut tx, &key(0), b"new")?, OpResult::Ok);
    f.txm.commit(&mut tx)?;

    assert_eq!(collect_olap(&f.tree, &mut olap)?, everything());
    f.txm.commit(&mut olap)?;

    let mut later = f.txm.begin(1, TxOptions::snapshot().olap())?;
    let rows = collect_olap(&f.tree, &mut later)?;
    assert_eq!(rows.first(), Some(&(key(0), b"new".to_vec())));
    assert_eq!(rows.len(), KEYS / 2 + 1);
    Ok(())
}

#[test]
fn scans_stop_when_the_callback_declines() -> Result<()> {
    let f = fixture(true)?;
    let mut olap = f.txm.begin(1, TxOptions::snapshot().olap())?;
    remove_even(&f)?;
    f.txm.collect_garbage()?;

    let mut seen = Vec::new();
    f.tree.scan_olap(&mut olap, &key(5), |k, _| {
        seen.push(k.to_vec());
        seen.len() < 3
    })?;
    assert_eq!(seen, vec![key(5), key(6), key(7)]);

    let mut tx = f.txm.begin(2, TxOptions::snapshot())?;
    let mut asc = Vec::new();
    f.tree.scan_asc(&mut tx, &key(4), |k, _| {
        asc.push(k.to_vec());
        asc.len() < 2
    })?;
    assert_eq!(asc, vec![key(5), key(7)]);
    Ok(())
}

#[test]
fn descending_scans_walk_back_across_leaves() -> Result<()> {
    let f = fixture(true)?;
    remove_even(&f)?;
    let mut tx = f.txm.begin(2, TxOptions::snapshot())?;
    let mut keys = Vec::new();
    f.tree.scan_desc(&mut tx, b"\xff", |k, v| {
        assert_eq!(&k[1..], &v[1..]);
        keys.push(k.to_vec());
        true
    })?;
    let expected: Vec<_> = (1..KEYS).step_by(2).rev().map(key).collect();
    assert_eq!(keys, expected);

    let mut from_middle = Vec::new();
    f.tree.scan_desc(&mut tx, &key(10), |k, _| {
        from_middle.push(k.to_vec());
        true
    })?;
    assert_eq!(from_middle, vec![key(9), key(7), key(5), key(3), key(1)]);
    Ok(())
}

#[test]
fn disabled_graveyard_keeps_tombstones_in_place() -> Result<()> {
    let f = fixture(false)?;
    let mut olap = f.txm.begin(1, TxOptions::snapshot().olap())?;
    remove_even(&f)?;
    f.txm.collect_garbage()?;
    assert!(f.tree.graveyard().is_empty());
    assert_eq!(f.tree.primary().len(), KEYS);
    assert_eq!(f.txm.pending_todos(), KEYS / 2);

    assert_eq!(collect_olap(&f.tree, &mut olap)?, everything());
    f.txm.commit(&mut olap)?;
    f.txm.collect_garbage()?;
    assert_eq!(f.tree.primary().len(), KEYS / 2);
    assert_eq!(f.txm.pending_todos(), 0);
    Ok(())
}

#[test]
fn graveyard_drains_once_the_last_reader_leaves() -> Result<()> {
    let f = fixture(true)?;
    let mut olap = f.txm.begin(1, TxOptions::snapshot().olap())?;
    remove_even(&f)?;
    f.txm.collect_garbage()?;
    assert_eq!(f.tree.version_store().stats().live, (KEYS / 2) as u64);

    // still pinned: a second pass changes nothing
    f.txm.collect_garbage()?;
    assert_eq!(f.tree.graveyard().len(), KEYS / 2);

    f.txm.commit(&mut olap)?;
    f.txm.collect_garbage()?;
    assert!(f.tree.graveyard().is_empty());
    assert_eq!(f.tree.primary().len(), KEYS / 2);
    assert_eq!(f.tree.version_store().stats().live, 0);
    assert_eq!(f.txm.pending_todos(), 0);
    Ok(())
}
