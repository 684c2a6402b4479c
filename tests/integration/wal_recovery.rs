//! Rebuilding trees from a WAL image after a simulated crash.

#![allow(missing_docs)]

use std::sync::Arc;

use vitree::primitives::concurrency::{TxManager, TxManagerOptions, TxOptions};
use vitree::primitives::wal::{FrameKind, WalLog};
use vitree::storage::tuple::UpdateDescriptor;
use vitree::storage::wal_records::WalRecord;
use vitree::storage::{TreeOptions, VersionedBTree};
use vitree::types::{DtId, OpResult, Result};

fn manager() -> Result<Arc<TxManager>> {
    Ok(Arc::new(TxManager::new(TxManagerOptions::new().worker_threads(4))?))
}

fn reopen(image: &[u8]) -> Result<Arc<TxManager>> {
    Ok(Arc::new(TxManager::with_wal(
        TxManagerOptions::new().worker_threads(4),
        Arc::new(WalLog::from_bytes(image)),
    )?))
}

fn read(txm: &TxManager, tree: &VersionedBTree, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut tx = txm.begin(3, TxOptions::snapshot())?;
    let mut out = None;
    tree.lookup(&mut tx, key, |v| out = Some(v.to_vec()))?;
    txm.commit(&mut tx)?;
    Ok(out)
}

fn put(txm: &TxManager, tree: &VersionedBTree, key: &[u8], value: &[u8]) -> Result<()> {
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    let descriptor = UpdateDescriptor::whole(value.len() as u16);
    assert_eq!(
        tree.update_same_size_in_place(&mut tx, key, |v| v.copy_from_slice(value), &descriptor)?,
        OpResult::Ok
    );
    txm.commit(&mut tx)?;
    Ok(())
}

/// Committed insert and update, one transaction still running, one rolled back.
fn crashed_image() -> Result<(Vec<u8>, DtId)> {
    let txm = manager()?;
    let tree = VersionedBTree::create(Arc::clone(&txm), TreeOptions::new())?;

    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"k1", b"v1")?;
    txm.commit(&mut tx)?;
    put(&txm, &tree, b"k1", b"v2")?;

    let mut loser = txm.begin(1, TxOptions::snapshot())?;
    assert_eq!(tree.insert(&mut loser, b"k2", b"l2")?, OpResult::Ok);
    let whole = UpdateDescriptor::whole(2);
    assert_eq!(
        tree.update_same_size_in_place(&mut loser, b"k1", |v| v.copy_from_slice(b"v3"), &whole)?,
        OpResult::Ok
    );

    let mut rolled_back = txm.begin(2, TxOptions::snapshot())?;
    tree.insert(&mut rolled_back, b"k3", b"a3")?;
    txm.abort(&mut rolled_back)?;

    Ok((txm.wal().to_bytes(), tree.dt_id()))
}

#[test]
fn committed_work_survives_and_losers_roll_back() -> Result<()> {
    let (image, dt_id) = crashed_image()?;
    let txm = reopen(&image)?;
    let tree = VersionedBTree::open(Arc::clone(&txm), dt_id, TreeOptions::new())?;
    let report = txm.recover()?;

    assert_eq!(report.committed, 2);
    assert_eq!(report.losers, 1);
    assert_eq!(report.redone, 4);
    assert_eq!(report.undone, 2);
    assert_eq!(txm.wal().stats().aborts, 1);

    assert_eq!(read(&txm, &tree, b"k1")?, Some(b"v2".to_vec()));
    assert_eq!(read(&txm, &tree, b"k2")?, None);
    assert_eq!(read(&txm, &tree, b"k3")?, None);
    assert_eq!(tree.primary().len(), 1);

    put(&txm, &tree, b"k1", b"v4")?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    assert_eq!(tree.insert(&mut tx, b"k2", b"n2")?, OpResult::Ok);
    txm.commit(&mut tx)?;
    assert_eq!(read(&txm, &tree, b"k1")?, Some(b"v4".to_vec()));
    assert_eq!(read(&txm, &tree, b"k2")?, Some(b"n2".to_vec()));
    Ok(())
}

#[test]
fn replayed_update_keeps_its_before_image_in_the_log() -> Result<()> {
    let txm = manager()?;
    let tree = VersionedBTree::create(Arc::clone(&txm), TreeOptions::new())?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"k1", b"v1")?;
    txm.commit(&mut tx)?;

    let mut before = txm.begin(1, TxOptions::snapshot())?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    let descriptor = UpdateDescriptor::new(&[(0, 2)]);
    tree.update_same_size_in_place(&mut tx, b"k1", |v| v.copy_from_slice(b"v2"), &descriptor)?;
    txm.commit(&mut tx)?;
    let mut seen = None;
    tree.lookup(&mut before, b"k1", |v| seen = Some(v.to_vec()))?;
    assert_eq!(seen.as_deref(), Some(&b"v1"[..]));
    assert_eq!(read(&txm, &tree, b"k1")?, Some(b"v2".to_vec()));
    txm.commit(&mut before)?;

    let image = txm.wal().to_bytes();
    let reopened = reopen(&image)?;
    let recovered = VersionedBTree::open(Arc::clone(&reopened), tree.dt_id(), TreeOptions::new())?;
    reopened.recover()?;
    let mut value = read(&reopened, &recovered, b"k1")?.unwrap();
    assert_eq!(value, b"v2");

    let update = reopened
        .wal()
        .frames()
        .into_iter()
        .filter(|f| f.kind == FrameKind::Data)
        .map(|f| WalRecord::decode(&f.payload))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .find_map(|record| match record {
            WalRecord::UpdateSameSizeInPlace {
                descriptor, xor_diff, ..
            } => Some((descriptor, xor_diff)),
            _ => None,
        })
        .expect("update record in the log");
    update.0.apply_xor(&mut value, &update.1)?;
    assert_eq!(value, b"v1");
    Ok(())
}

#[test]
fn recovered_losers_stay_rolled_back_on_the_next_restart() -> Result<()> {
    let (image, dt_id) = crashed_image()?;
    let first = reopen(&image)?;
    let _tree = VersionedBTree::open(Arc::clone(&first), dt_id, TreeOptions::new())?;
    first.recover()?;

    let second = reopen(&first.wal().to_bytes())?;
    let tree = VersionedBTree::open(Arc::clone(&second), dt_id, TreeOptions::new())?;
    let report = second.recover()?;
    assert_eq!(report.losers, 0);
    assert_eq!(report.undone, 0);
    assert_eq!(read(&second, &tree, b"k1")?, Some(b"v2".to_vec()));
    assert_eq!(read(&second, &tree, b"k2")?, None);
    Ok(())
}

#[test]
fn torn_commit_frame_turns_the_transaction_into_a_loser() -> Result<()> {
    let txm = manager()?;
    let tree = VersionedBTree::create(Arc::clone(&txm), TreeOptions::new())?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"k", b"v1")?;
    txm.commit(&mut tx)?;
    put(&txm, &tree, b"k", b"v2")?;

    let image = txm.wal().to_bytes();
    let torn = &image[..image.len() - 3];
    let reopened = reopen(torn)?;
    assert!(reopened.wal().len_bytes() < torn.len());
    let recovered = VersionedBTree::open(Arc::clone(&reopened), tree.dt_id(), TreeOptions::new())?;
    let report = reopened.recover()?;
    assert_eq!(report.committed, 1);
    assert_eq!(report.losers, 1);
    assert_eq!(read(&reopened, &recovered, b"k")?, Some(b"v1".to_vec()));
    Ok(())
}

#[test]
fn fat_tuple_history_is_rebuilt_from_logical_records() -> Result<()> {
    let txm = manager()?;
    let options = TreeOptions::new().fat_tuple_threshold(1);
    let tree = VersionedBTree::create(Arc::clone(&txm), options.clone())?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"hot", &[0; 8])?;
    tree.insert(&mut tx, b"cold", &[9; 8])?;
    txm.commit(&mut tx)?;

    let mut pinned = txm.begin(2, TxOptions::snapshot())?;
    for round in 1..=4u8 {
        put(&txm, &tree, b"hot", &[round; 8])?;
    }
    let mut remover = txm.begin(0, TxOptions::snapshot())?;
    assert_eq!(tree.remove(&mut remover, b"cold")?, OpResult::Ok);
    txm.commit(&mut remover)?;
    txm.commit(&mut pinned)?;

    let reopened = reopen(&txm.wal().to_bytes())?;
    let recovered = VersionedBTree::open(Arc::clone(&reopened), tree.dt_id(), options)?;
    let report = reopened.recover()?;
    assert_eq!(report.losers, 0);
    assert_eq!(read(&reopened, &recovered, b"hot")?, Some(vec![4; 8]));
    assert_eq!(read(&reopened, &recovered, b"cold")?, None);

    put(&reopened, &recovered, b"hot", &[5; 8])?;
    assert_eq!(read(&reopened, &recovered, b"hot")?, Some(vec![5; 8]));
    Ok(())
}

#[test]
fn unknown_data_structures_fail_recovery() -> Result<()> {
    let (image, _) = crashed_image()?;
    let txm = reopen(&image)?;
    assert!(txm.recover().is_err());
    Ok(())
}
