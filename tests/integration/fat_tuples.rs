//! Fat-tuple conversion, compaction and overflow.

#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use proptest::prelude::*;
use vitree::primitives::concurrency::{
    DataStructureHooks, SpaceCheckResult, TxContext, TxManager, TxManagerOptions, TxOptions,
};
use vitree::storage::tuple::{peek_format, Tuple, UpdateDescriptor};
use vitree::storage::{CounterMetrics, TreeOptions, VersionedBTree};
use vitree::types::{OpResult, Result, VitreeError};

fn setup(options: TreeOptions) -> Result<(Arc<TxManager>, Arc<VersionedBTree>)> {
    let txm = Arc::new(TxManager::new(TxManagerOptions::new().worker_threads(8))?);
    let tree = VersionedBTree::create(Arc::clone(&txm), options)?;
    Ok((txm, tree))
}

fn read(tree: &VersionedBTree, ctx: &mut TxContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut out = None;
    let result = tree.lookup(ctx, key, |v| out = Some(v.to_vec()))?;
    assert!(matches!(result, OpResult::Ok | OpResult::NotFound));
    Ok(out)
}

fn overwrite(
    txm: &TxManager,
    tree: &VersionedBTree,
    key: &[u8],
    value: &[u8],
) -> Result<OpResult> {
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    let descriptor = UpdateDescriptor::whole(value.len() as u16);
    match tree.update_same_size_in_place(&mut tx, key, |v| v.copy_from_slice(value), &descriptor) {
        Ok(OpResult::Ok) => {
            txm.commit(&mut tx)?;
            Ok(OpResult::Ok)
        }
        Ok(other) => {
            txm.abort(&mut tx)?;
            Ok(other)
        }
        Err(err) => {
            txm.abort(&mut tx)?;
            Err(err)
        }
    }
}

fn is_fat(tree: &VersionedBTree, key: &[u8]) -> Result<bool> {
    Ok(peek_format(&tree.primary().get(key).unwrap())?.is_fat())
}

#[test]
fn pinned_snapshots_read_through_fat_deltas() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let options = TreeOptions::new()
        .fat_tuple_threshold(2)
        .metrics(metrics.clone());
    let (txm, tree) = setup(options)?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"hot", &[0; 8])?;
    txm.commit(&mut tx)?;

    let mut snapshots = Vec::new();
    for round in 1..=5u8 {
        snapshots.push((txm.begin(round, TxOptions::snapshot())?, [round - 1; 8]));
        assert_eq!(overwrite(&txm, &tree, b"hot", &[round; 8])?, OpResult::Ok);
    }
    assert!(is_fat(&tree, b"hot")?);
    assert_eq!(metrics.fat_conversions.load(Ordering::Relaxed), 1);

    for (ctx, expected) in snapshots.iter_mut() {
        assert_eq!(read(&tree, ctx, b"hot")?, Some(expected.to_vec()));
    }
    let mut fresh = txm.begin(6, TxOptions::snapshot())?;
    assert_eq!(read(&tree, &mut fresh, b"hot")?, Some(vec![5; 8]));
    Ok(())
}

#[test]
fn mixed_descriptors_keep_the_chain() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let options = TreeOptions::new()
        .fat_tuple_threshold(2)
        .metrics(metrics.clone());
    let (txm, tree) = setup(options)?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"k", &[0; 4])?;
    txm.commit(&mut tx)?;
    let _pinned = txm.begin(7, TxOptions::snapshot())?;

    for at in 0..4u16 {
        let mut tx = txm.begin(0, TxOptions::snapshot())?;
        let d = UpdateDescriptor::new(&[(at, 1)]);
        assert_eq!(
            tree.update_same_size_in_place(&mut tx, b"k", |v| v[at as usize] = 1, &d)?,
            OpResult::Ok
        );
        txm.commit(&mut tx)?;
    }
    assert!(!is_fat(&tree, b"k")?);
    assert_eq!(metrics.fat_conversions_rejected.load(Ordering::Relaxed), 1);
    let Tuple::Chained(head) = Tuple::decode(&tree.primary().get(b"k").unwrap())? else {
        panic!("expected a chained tuple");
    };
    assert!(!head.can_convert_to_fat_tuple);
    Ok(())
}

#[test]
fn full_fat_tuple_reports_overflow_until_readers_leave() -> Result<()> {
    let options = TreeOptions::new()
        .page_size(256)
        .fat_tuple_headroom(64)
        .fat_tuple_threshold(1);
    let (txm, tree) = setup(options)?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"k", &[0; 16])?;
    txm.commit(&mut tx)?;
    let mut pinned = txm.begin(7, TxOptions::snapshot())?;

    let mut overflowed = None;
    for round in 1..=10u8 {
        match overwrite(&txm, &tree, b"k", &[round; 16]) {
            Ok(result) => assert_eq!(result, OpResult::Ok),
            Err(VitreeError::FatTupleOverflow { .. }) => {
                overflowed = Some(round);
                break;
            }
            Err(err) => return Err(err),
        }
    }
    let round = overflowed.expect("fat tuple never filled up");
    assert!(is_fat(&tree, b"k")?);
    assert_eq!(read(&tree, &mut pinned, b"k")?, Some(vec![0; 16]));
    let mut latest = txm.begin(1, TxOptions::snapshot())?;
    assert_eq!(read(&tree, &mut latest, b"k")?, Some(vec![round - 1; 16]));
    txm.commit(&mut latest)?;

    txm.commit(&mut pinned)?;
    assert_eq!(overwrite(&txm, &tree, b"k", &[99; 16])?, OpResult::Ok);
    Ok(())
}

#[test]
fn space_check_only_touches_its_own_pages() -> Result<()> {
    let options = TreeOptions::new().fat_tuple_threshold(1);
    let (txm, tree) = setup(options)?;
    let (_, other) = setup(TreeOptions::new())?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"k", &[0; 4])?;
    txm.commit(&mut tx)?;

    let mut pinned = txm.begin(7, TxOptions::snapshot())?;
    for round in 1..=3u8 {
        overwrite(&txm, &tree, b"k", &[round; 4])?;
    }
    let page = tree.primary().page_ids()[0];
    txm.commit(&mut pinned)?;
    assert_eq!(
        other.check_space_utilization(other.primary().page_ids()[0])?,
        SpaceCheckResult::Nothing
    );
    assert_eq!(tree.check_space_utilization(page)?, SpaceCheckResult::RestartSameBf);
    let Tuple::Fat(fat) = Tuple::decode(&tree.primary().get(b"k").unwrap())? else {
        panic!("expected a fat tuple");
    };
    assert!(fat.deltas.is_empty());
    assert_eq!(fat.value, vec![3; 4]);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn every_pinned_version_stays_readable(
        values in prop::collection::vec(any::<[u8; 6]>(), 1..24),
        threshold in 1usize..5,
    ) {
        let (txm, tree) = setup(TreeOptions::new().fat_tuple_threshold(threshold)).unwrap();
        let mut tx = txm.begin(0, TxOptions::snapshot()).unwrap();
        tree.insert(&mut tx, b"p", &[0; 6]).unwrap();
        txm.commit(&mut tx).unwrap();

        // one long reader pins the original, another follows the updates
        let mut first = txm.begin(1, TxOptions::snapshot()).unwrap();
        let mut previous = vec![0u8; 6];
        for value in &values {
            let mut follower = txm.begin(2, TxOptions::snapshot()).unwrap();
            prop_assert_eq!(overwrite(&txm, &tree, b"p", value).unwrap(), OpResult::Ok);
            prop_assert_eq!(read(&tree, &mut follower, b"p").unwrap(), Some(previous.clone()));
            txm.commit(&mut follower).unwrap();
            previous = value.to_vec();
        }
        prop_assert_eq!(read(&tree, &mut first, b"p").unwrap(), Some(vec![0u8; 6]));
        txm.commit(&mut first).unwrap();
        txm.collect_garbage().unwrap();
        let mut last = txm.begin(3, TxOptions::snapshot()).unwrap();
        prop_assert_eq!(read(&tree, &mut last, b"p").unwrap(), Some(previous));
    }
}
