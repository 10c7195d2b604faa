// 1. Run many concurrent increment transactions against one counter.
// 2. Check the committed on-disk value and the dedup behaviour under
//    thread contention.

pub mod common;

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use vcache::{atomically, Durability, PVar, VCache};

const THREADS: usize = 8;
const INCREMENTS_PER_THREAD: usize = 125;

fn run_increments(store: &VCache, counter: &PVar<u64>) {
    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..INCREMENTS_PER_THREAD {
                    atomically(Durability::Relaxed, |tx| {
                        let n = tx.read(counter)?;
                        tx.write(counter, *n + 1);
                        Ok(())
                    })
                    .unwrap();
                }
            });
        }
    });
    // Quiesce: everything queued before this barrier is on disk after it.
    store.flush().unwrap();
}

#[test]
fn concurrent_increments_commit_exactly_once_each() {
    let (dir, store) = common::open_store();
    let counter = store.pvar("counter", || 0u64).unwrap();

    let now = Instant::now();
    run_increments(&store, &counter);
    println!("increments: {:.6?}", now.elapsed());

    let total = atomically(Durability::Relaxed, |tx| tx.read(&counter)).unwrap();
    assert_eq!(*total, (THREADS * INCREMENTS_PER_THREAD) as u64);

    // The committed value survives a cold reopen.
    drop((counter, store));
    let store = common::reopen(&dir);
    let counter = store.pvar("counter", || 0u64).unwrap();
    let total = atomically(Durability::Relaxed, |tx| tx.read(&counter)).unwrap();
    assert_eq!(*total, (THREADS * INCREMENTS_PER_THREAD) as u64);
}

#[test]
fn durable_commit_is_visible_after_reopen() {
    let (dir, store) = common::open_store();
    let greeting = store.pvar("greeting", String::new).unwrap();
    atomically(Durability::Durable, |tx| {
        tx.write(&greeting, "persisted".to_string());
        Ok(())
    })
    .unwrap();
    drop((greeting, store));

    let store = common::reopen(&dir);
    let greeting = store.pvar("greeting", String::new).unwrap();
    let value = atomically(Durability::Relaxed, |tx| tx.read(&greeting)).unwrap();
    assert_eq!(*value, "persisted");
}

#[test]
fn racing_stores_of_one_value_agree_on_an_address() {
    let (_dir, store) = common::open_store();
    let store = Arc::new(store);
    let payload: Vec<u64> = (0..256).collect();

    let now = Instant::now();
    let addresses: Vec<u64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let store = Arc::clone(&store);
                let payload = payload.clone();
                scope.spawn(move || store.vref(&payload).unwrap().address())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    println!("racing vrefs: {:.6?}", now.elapsed());

    // Concurrent misses may allocate distinct addresses before the index
    // catches up, but everything stored here parses back identically, and
    // a later store reuses an existing address.
    let later = store.vref(&payload).unwrap();
    assert!(addresses.contains(&later.address()));
    assert_eq!(*later.read().unwrap(), payload);
}

#[test]
fn cross_space_transaction_updates_both_stores() {
    let (_dir_a, store_a) = common::open_store();
    let (_dir_b, store_b) = common::open_store();
    let left = store_a.pvar("left", || 0u64).unwrap();
    let right = store_b.pvar("right", || 0u64).unwrap();

    atomically(Durability::Durable, |tx| {
        tx.write(&left, 10);
        tx.write(&right, 20);
        Ok(())
    })
    .unwrap();

    let (l, r) = atomically(Durability::Relaxed, |tx| {
        Ok((*tx.read(&left)?, *tx.read(&right)?))
    })
    .unwrap();
    assert_eq!((l, r), (10, 20));
}

#[test]
fn non_persistent_cells_mix_into_transactions() {
    let (_dir, store) = common::open_store();
    let persisted = store.pvar("mixed", || 0u64).unwrap();
    let scratch = vcache::TVar::new(0u64);

    atomically(Durability::Relaxed, |tx| {
        let n = tx.read(&persisted)?;
        tx.write_tvar(&scratch, *n + 5);
        let s = tx.read_tvar(&scratch)?;
        tx.write(&persisted, *s);
        Ok(())
    })
    .unwrap();

    let n = atomically(Durability::Relaxed, |tx| tx.read(&persisted)).unwrap();
    assert_eq!(*n, 5);
}
