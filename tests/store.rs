// Store-level behaviour: dedup and structure sharing, persistence across
// reopen, named roots, reclamation, and the open lock.

pub mod common;

use vcache::{
    atomically, CachePolicy, Durability, Error, Get, ParseError, Put, Storable, VRef,
};

#[derive(Clone, Debug, PartialEq)]
struct Blob(Vec<u8>);

impl Storable for Blob {
    fn put(&self, p: &mut Put) {
        p.put_varint(self.0.len() as u64);
        p.put_bytes(&self.0);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        let len = g.get_varint()? as usize;
        Ok(Blob(g.get_bytes(len)?.to_vec()))
    }
}

#[test]
fn list_survives_reopen_through_a_root() {
    let (dir, store) = common::open_store();
    let list = store.vref(&vec![1i64, 2, 3]).unwrap();
    let root = store
        .pvar("the-list", || Vec::<VRef<Vec<i64>>>::new())
        .unwrap();
    atomically(Durability::Durable, |tx| {
        tx.write(&root, vec![list.clone()]);
        Ok(())
    })
    .unwrap();
    drop((list, root, store));

    let store = common::reopen(&dir);
    let root = store
        .pvar("the-list", || Vec::<VRef<Vec<i64>>>::new())
        .unwrap();
    let refs = atomically(Durability::Relaxed, |tx| tx.read(&root)).unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(*refs[0].read().unwrap(), vec![1i64, 2, 3]);
}

#[test]
fn dedup_shares_address_and_cache_slot() {
    let (_dir, store) = common::open_store();
    let a = store.vref(&"hello".to_string()).unwrap();
    let b = store.vref(&"hello".to_string()).unwrap();
    assert_eq!(a.address(), b.address());
    assert!(a == b);

    // One slot behind both handles: a read through one is cached for the
    // other.
    assert!(!b.is_cached());
    assert_eq!(*a.read().unwrap(), "hello");
    assert!(b.is_cached());

    let c = store.vref(&"world".to_string()).unwrap();
    assert_ne!(a.address(), c.address());
}

#[test]
fn named_roots_are_scoped_by_prefix() {
    let (_dir, store) = common::open_store();
    let app_a = store.subdir("app-a");
    let app_b = store.subdir("app-b");

    let counter_a = app_a.pvar("counter", || 1u64).unwrap();
    let counter_b = app_b.pvar("counter", || 2u64).unwrap();
    assert_ne!(counter_a.address(), counter_b.address());

    let a = atomically(Durability::Relaxed, |tx| tx.read(&counter_a)).unwrap();
    let b = atomically(Durability::Relaxed, |tx| tx.read(&counter_b)).unwrap();
    assert_eq!((*a, *b), (1, 2));

    // Same prefix and name resolve to the same cell.
    let again = store.subdir("app-a").pvar("counter", || 99u64).unwrap();
    assert!(again == counter_a);
}

#[test]
fn root_type_conflict_is_reported() {
    let (_dir, store) = common::open_store();
    let _counter = store.pvar("thing", || 7u64).unwrap();
    match store.pvar::<String>("thing", String::new) {
        Err(Error::TypeMismatch { .. }) => {}
        other => panic!("expected type mismatch, got {other:?}"),
    }
}

#[test]
fn overwritten_blob_is_reclaimed() {
    let (_dir, store) = common::open_store();
    let blob_b = Blob(b"large payload bbbbbbbbbbbbbbbb".to_vec());
    let blob_c = Blob(b"large payload cccccccccccccccc".to_vec());

    let b = store.vref(&blob_b).unwrap();
    let b_addr = b.address();
    let root = store.pvar("blob", || b.clone()).unwrap();
    store.flush().unwrap();

    atomically(Durability::Durable, |tx| {
        tx.write(&root, store.vref(&blob_c)?);
        Ok(())
    })
    .unwrap();
    drop(b);

    // Each flush closes a batch, which runs a collection step; a few are
    // enough for the release and the reclamation to go through.
    for _ in 0..4 {
        store.flush().unwrap();
    }

    // The content index no longer knows the old bytes: storing them again
    // allocates a fresh address.
    let b_again = store.vref(&blob_b).unwrap();
    assert_ne!(b_again.address(), b_addr);

    // The new blob is still rooted and intact.
    let current = atomically(Durability::Relaxed, |tx| tx.read(&root)).unwrap();
    assert_eq!(*current.read().unwrap(), blob_c);
}

#[test]
fn rooted_values_survive_collection() {
    let (dir, store) = common::open_store();
    let payload = Blob(b"keep me".to_vec());
    let kept = store.vref(&payload).unwrap();
    let addr = kept.address();
    let root = store.pvar("keep", || kept.clone()).unwrap();
    drop((kept, root));
    for _ in 0..4 {
        store.flush().unwrap();
    }
    drop(store);

    let store = common::reopen(&dir);
    let root = store.pvar("keep", || panic!("root must exist")).unwrap();
    let kept: std::sync::Arc<VRef<Blob>> =
        atomically(Durability::Relaxed, |tx| tx.read(&root)).unwrap();
    assert_eq!(kept.address(), addr);
    assert_eq!(*kept.read().unwrap(), payload);
}

#[test]
fn second_open_fails_with_lock_contention() {
    let (dir, store) = common::open_store();
    match vcache::VCache::open(dir.path()) {
        Err(Error::LockContention(_)) => {}
        other => panic!("expected lock contention, got {other:?}"),
    }
    drop(store);
    // Released with the first handle.
    vcache::VCache::open(dir.path()).unwrap();
}

#[test]
fn dropped_root_makes_the_value_collectable() {
    let (_dir, store) = common::open_store();
    let blob = Blob(b"ephemeral root payload".to_vec());
    let r = store.vref(&blob).unwrap();
    let addr = r.address();
    let _root = store.pvar("temp", || r.clone()).unwrap();
    store.flush().unwrap();

    store.drop_root("temp").unwrap();
    drop((r, _root));
    for _ in 0..4 {
        store.flush().unwrap();
    }

    let again = store.vref(&blob).unwrap();
    assert_ne!(again.address(), addr);
}

#[test]
fn cache_policy_and_locks_are_per_handle() {
    let (_dir, store) = common::open_store();
    let r = store.vref(&Blob(vec![7; 64])).unwrap();
    assert!(!r.is_cached());
    r.read().unwrap();
    assert!(r.is_cached());
    r.set_cache_policy(CachePolicy::LongTimeout);
    r.cache_lock();
    r.cache_unlock();
    // Still readable after any mode churn.
    assert_eq!(*r.read().unwrap(), Blob(vec![7; 64]));
}

// Two variables pointing at each other: cycles are legal at the variable
// layer because cells are mutable and load lazily.
#[derive(Debug)]
struct Link {
    other: Option<vcache::PVar<Link>>,
}

impl Storable for Link {
    fn put(&self, p: &mut Put) {
        self.other.is_some().put(p);
        if let Some(pv) = &self.other {
            p.put_pvar(pv);
        }
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        let has = bool::get(g)?;
        Ok(Link {
            other: if has { Some(g.get_pvar()?) } else { None },
        })
    }
}

#[test]
fn variable_cycles_load_lazily() {
    let (dir, store) = common::open_store();
    let a = store.pvar("cycle-a", || Link { other: None }).unwrap();
    let b = store.new_pvar(Link {
        other: Some(a.clone()),
    })
    .unwrap();
    atomically(Durability::Durable, |tx| {
        tx.write(&a, Link {
            other: Some(b.clone()),
        });
        Ok(())
    })
    .unwrap();
    drop((a, b, store));

    let store = common::reopen(&dir);
    let a = store.pvar("cycle-a", || Link { other: None }).unwrap();
    let link = atomically(Durability::Relaxed, |tx| {
        let first = tx.read(&a)?;
        let b = first.other.clone().expect("a points at b");
        let second = tx.read(&b)?;
        Ok(second.other.clone().expect("b points back at a"))
    })
    .unwrap();
    assert!(link == a);
}
