//! Snapshot visibility under mixed workloads.
//!
//! A model-based property checks that every reader observes exactly the state
//! committed before it started, whatever mix of inserts, updates, removes,
//! fat-tuple conversions and garbage collection happened since. A threaded
//! transfer workload checks that snapshot scans never see a torn total.

#![allow(missing_docs)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use vitree::primitives::concurrency::{
    ConcurrencyMode, TxContext, TxManager, TxManagerOptions, TxOptions,
};
use vitree::storage::tuple::UpdateDescriptor;
use vitree::storage::{TreeOptions, VersionedBTree};
use vitree::types::{OpResult, Result};

const KEYS: u8 = 6;
const READERS: u8 = 6;

#[derive(Clone, Debug)]
enum Op {
    Put(u8, [u8; 4]),
    Remove(u8),
    StartReader,
    FinishReader,
    Collect,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..KEYS, any::<[u8; 4]>()).prop_map(|(k, v)| Op::Put(k, v)),
        2 => (0..KEYS).prop_map(Op::Remove),
        2 => Just(Op::StartReader),
        1 => Just(Op::FinishReader),
        1 => Just(Op::Collect),
    ]
}

fn key(k: u8) -> Vec<u8> {
    format!("key-{k}").into_bytes()
}

fn read_all(tree: &VersionedBTree, ctx: &mut TxContext) -> Result<BTreeMap<u8, Vec<u8>>> {
    let mut seen = BTreeMap::new();
    for k in 0..KEYS {
        let mut value = None;
        let result = tree.lookup(ctx, &key(k), |v| value = Some(v.to_vec()))?;
        match result {
            OpResult::Ok => {
                seen.insert(k, value.unwrap());
            }
            OpResult::NotFound => {}
            other => panic!("unexpected lookup result {other:?}"),
        }
    }
    Ok(seen)
}

struct Reader {
    ctx: TxContext,
    expected: BTreeMap<u8, Vec<u8>>,
}

fn run_model(ops: Vec<Op>, fat: bool, threshold: usize) -> Result<()> {
    let txm = Arc::new(TxManager::new(
        TxManagerOptions::new().worker_threads(usize::from(READERS) + 1),
    )?);
    let options = TreeOptions::new()
        .enable_fat_tuple(fat)
        .fat_tuple_threshold(threshold);
    let tree = VersionedBTree::create(Arc::clone(&txm), options)?;
    let whole = UpdateDescriptor::whole(4);

    let mut model: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    let mut readers: VecDeque<Reader> = VecDeque::new();
    let mut free: Vec<u8> = (1..=READERS).collect();

    for op in ops {
        match op {
            Op::Put(k, v) => {
                let mut tx = txm.begin(0, TxOptions::snapshot())?;
                let result = if model.contains_key(&k) {
                    tree.update_same_size_in_place(&mut tx, &key(k), |d| d.copy_from_slice(&v), &whole)?
                } else {
                    tree.insert(&mut tx, &key(k), &v)?
                };
                assert_eq!(result, OpResult::Ok);
                txm.commit(&mut tx)?;
                model.insert(k, v.to_vec());
            }
            Op::Remove(k) => {
                let mut tx = txm.begin(0, TxOptions::snapshot())?;
                let expected = if model.remove(&k).is_some() {
                    OpResult::Ok
                } else {
                    OpResult::NotFound
                };
                assert_eq!(tree.remove(&mut tx, &key(k))?, expected);
                txm.commit(&mut tx)?;
            }
            Op::StartReader => {
                if let Some(worker) = free.pop() {
                    let ctx = txm.begin(worker, TxOptions::snapshot())?;
                    readers.push_back(Reader {
                        ctx,
                        expected: model.clone(),
                    });
                }
            }
            Op::FinishReader => {
                if let Some(mut reader) = readers.pop_front() {
                    assert_eq!(read_all(&tree, &mut reader.ctx)?, reader.expected);
                    txm.commit(&mut reader.ctx)?;
                    free.push(reader.ctx.worker_id());
                }
            }
            Op::Collect => {
                txm.collect_garbage()?;
            }
        }
    }

    for reader in readers.iter_mut() {
        assert_eq!(read_all(&tree, &mut reader.ctx)?, reader.expected);
    }
    for mut reader in readers {
        txm.commit(&mut reader.ctx)?;
    }
    txm.collect_garbage()?;
    let mut last = txm.begin(0, TxOptions::snapshot())?;
    assert_eq!(read_all(&tree, &mut last)?, model);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn readers_see_their_snapshot(
        ops in prop::collection::vec(arb_op(), 1..120),
        fat in any::<bool>(),
        threshold in 1usize..4,
    ) {
        run_model(ops, fat, threshold).unwrap();
    }
}

#[test]
fn transfers_keep_the_total_for_every_snapshot() -> Result<()> {
    const ACCOUNTS: u8 = 8;
    const WRITERS: u8 = 4;
    const START: u64 = 1_000;

    let txm = Arc::new(TxManager::new(
        TxManagerOptions::new()
            .worker_threads(usize::from(WRITERS) + 2)
            .concurrency_mode(ConcurrencyMode::Timestamp),
    )?);
    let tree = VersionedBTree::create(Arc::clone(&txm), TreeOptions::new().fat_tuple_threshold(3))?;
    for a in 0..ACCOUNTS {
        tree.bulk_load(&[b'a', a], &START.to_be_bytes())?;
    }
    let total = START * u64::from(ACCOUNTS);
    let stop = AtomicBool::new(false);
    let committed = AtomicU64::new(0);
    let whole = UpdateDescriptor::whole(8);

    std::thread::scope(|scope| {
        let mut writers = Vec::new();
        for worker in 0..WRITERS {
            let (txm, tree, stop, committed, whole) = (&txm, &tree, &stop, &committed, &whole);
            writers.push(scope.spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(0x5eed + u64::from(worker));
                while !stop.load(Ordering::Relaxed) {
                    let from = [b'a', rng.gen_range(0..ACCOUNTS)];
                    let to = [b'a', rng.gen_range(0..ACCOUNTS)];
                    if from == to {
                        continue;
                    }
                    let amount = rng.gen_range(1..20u64);
                    let mut tx = txm.begin(worker, TxOptions::snapshot())?;
                    let mut balance = 0;
                    tree.lookup(&mut tx, &from, |v| {
                        balance = u64::from_be_bytes(v.try_into().unwrap())
                    })?;
                    let debit = tree.update_same_size_in_place(
                        &mut tx,
                        &from,
                        |v| {
                            let new = balance.saturating_sub(amount);
                            v.copy_from_slice(&new.to_be_bytes())
                        },
                        whole,
                    )?;
                    let moved = balance.min(amount);
                    let credit = if debit == OpResult::Ok {
                        tree.update_same_size_in_place(
                            &mut tx,
                            &to,
                            |v| {
                                let old = u64::from_be_bytes((&*v).try_into().unwrap());
                                v.copy_from_slice(&(old + moved).to_be_bytes())
                            },
                            whole,
                        )?
                    } else {
                        debit
                    };
                    if credit == OpResult::Ok {
                        txm.commit(&mut tx)?;
                        committed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        txm.abort(&mut tx)?;
                    }
                }
                Ok(())
            }));
        }

        let reader = scope.spawn(|| -> Result<()> {
            for _ in 0..200 {
                let mut tx = txm.begin(WRITERS, TxOptions::snapshot())?;
                let mut sum = 0u64;
                let mut rows = 0;
                tree.scan_asc(&mut tx, b"", |_, v| {
                    sum += u64::from_be_bytes(v.try_into().unwrap());
                    rows += 1;
                    true
                })?;
                txm.commit(&mut tx)?;
                assert_eq!(rows, ACCOUNTS);
                assert_eq!(sum, total);
            }
            Ok(())
        });
        let collector = scope.spawn(|| -> Result<()> {
            while !stop.load(Ordering::Relaxed) {
                txm.collect_garbage()?;
                std::thread::yield_now();
            }
            Ok(())
        });

        let outcome = reader.join();
        stop.store(true, Ordering::Relaxed);
        outcome.unwrap().unwrap();
        for writer in writers {
            writer.join().unwrap().unwrap();
        }
        collector.join().unwrap().unwrap();
    });

    assert!(committed.load(Ordering::Relaxed) > 0);
    let mut check = txm.begin(WRITERS + 1, TxOptions::snapshot())?;
    let mut sum = 0u64;
    tree.scan_asc(&mut check, b"", |_, v| {
        sum += u64::from_be_bytes(v.try_into().unwrap());
        true
    })?;
    assert_eq!(sum, total);
    Ok(())
}

#[test]
fn manager_options_load_from_toml() -> Result<()> {
    let options = TxManagerOptions::from_toml_str(
        r#"
            worker_threads = 16
            concurrency_mode = "two_phase_locking"
        "#,
    )?;
    assert_eq!(options.worker_threads, 16);
    assert_eq!(options.concurrency_mode, ConcurrencyMode::TwoPhaseLocking);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tree.toml");
    std::fs::write(&path, "page_size = 8192\nenable_graveyard = false\n")?;
    let tree = TreeOptions::from_toml_file(&path)?;
    assert_eq!(tree.page_size, 8192);
    assert!(!tree.enable_graveyard);
    assert!(tree.enable_fat_tuple);

    assert!(TreeOptions::from_toml_str("page_size = 0").is_err());
    Ok(())
}
