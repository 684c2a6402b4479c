#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use vitree::primitives::concurrency::{GcWorker, TxManager, TxManagerOptions, TxOptions};
use vitree::storage::tuple::{Tuple, UpdateDescriptor};
use vitree::storage::{TreeOptions, VersionedBTree};
use vitree::types::{OpResult, Result};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("vitree=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn setup() -> Result<(Arc<TxManager>, Arc<VersionedBTree>)> {
    init_tracing();
    let txm = Arc::new(TxManager::new(TxManagerOptions::new().worker_threads(4))?);
    let tree = VersionedBTree::create(Arc::clone(&txm), TreeOptions::new())?;
    Ok((txm, tree))
}

#[test]
fn background_worker_reclaims_versions() -> Result<()> {
    let (txm, tree) = setup()?;
    let worker = GcWorker::spawn(Arc::clone(&txm), Duration::from_millis(5));

    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    for i in 0..16u8 {
        tree.insert(&mut tx, &[b'r', i], &[0; 4])?;
    }
    txm.commit(&mut tx)?;
    let whole = UpdateDescriptor::whole(4);
    for round in 1..=3u8 {
        let mut tx = txm.begin(0, TxOptions::snapshot())?;
        for i in 0..16u8 {
            tree.update_same_size_in_place(&mut tx, &[b'r', i], |v| v.fill(round), &whole)?;
        }
        txm.commit(&mut tx)?;
    }
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    for i in (0..16u8).step_by(2) {
        assert_eq!(tree.remove(&mut tx, &[b'r', i])?, OpResult::Ok);
    }
    txm.commit(&mut tx)?;
    worker.wake();

    wait_for("version store to drain", || {
        tree.version_store().stats().live == 0 && txm.pending_todos() == 0
    });
    worker.shutdown();

    assert_eq!(tree.primary().len(), 8);
    let payload = tree.primary().get(&[b'r', 1]).unwrap();
    let Tuple::Chained(head) = Tuple::decode(&payload)? else {
        panic!("expected a chained tuple");
    };
    assert!(head.is_final());
    assert!(head.can_convert_to_fat_tuple);
    Ok(())
}

#[test]
fn worker_waits_for_the_olap_reader() -> Result<()> {
    let (txm, tree) = setup()?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"gone", b"old")?;
    txm.commit(&mut tx)?;

    let mut olap = txm.begin(1, TxOptions::snapshot().olap())?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.remove(&mut tx, b"gone")?;
    txm.commit(&mut tx)?;

    let worker = GcWorker::spawn(Arc::clone(&txm), Duration::from_millis(5));
    wait_for("tombstone to reach the graveyard", || tree.graveyard().len() == 1);
    assert!(tree.primary().is_empty());

    let mut seen = Vec::new();
    tree.scan_olap(&mut olap, b"", |k, v| {
        seen.push((k.to_vec(), v.to_vec()));
        true
    })?;
    assert_eq!(seen, vec![(b"gone".to_vec(), b"old".to_vec())]);
    txm.commit(&mut olap)?;

    wait_for("graveyard to drain", || tree.graveyard().is_empty());
    wait_for("queue to drain", || txm.pending_todos() == 0);
    assert_eq!(tree.version_store().stats().live, 0);
    drop(worker);
    Ok(())
}

#[test]
fn dropped_trees_do_not_stall_the_queue() -> Result<()> {
    let (txm, tree) = setup()?;
    let mut tx = txm.begin(0, TxOptions::snapshot())?;
    tree.insert(&mut tx, b"k", b"v")?;
    tree.remove(&mut tx, b"k")?;
    txm.commit(&mut tx)?;
    assert!(txm.pending_todos() > 0);
    drop(tree);

    let stats = txm.collect_garbage()?;
    assert!(stats.dropped > 0);
    assert_eq!(txm.pending_todos(), 0);
    Ok(())
}
