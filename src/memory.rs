//! In-memory side of a space.
//!
//! Readers consult these tables before falling back to a backing-engine
//! snapshot: the ephemeron tables index every live handle so equal handles
//! share one cell, the pending map holds bytes the writer has not committed
//! yet, and the hash overlay extends the on-disk content index with
//! in-flight allocations. Everything here is shared between caller threads
//! and the writer, hence the sharded maps.

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use dashmap::DashMap;

use crate::cache::SweepSlot;
use crate::{Address, StoredValue, VHash};

// NOTE: Easy win over a naive `RwLock<HashMap>` under reader concurrency.
type Map<K, V> = DashMap<K, V, ahash::RandomState>;

// One live typed handle at an address. Two handles of different declared
// types at the same address get separate entries, separate cells, separate
// cache slots.
pub(crate) struct RefEntry {
    pub(crate) type_id: TypeId,
    pub(crate) handle: Weak<dyn Any + Send + Sync>,
    pub(crate) slot: Weak<dyn SweepSlot>,
}

pub(crate) struct PvEntry {
    pub(crate) type_id: TypeId,
    pub(crate) handle: Weak<dyn Any + Send + Sync>,
}

pub(crate) struct Memory {
    // Live immutable-reference handles, bucketed per address.
    refs: Map<Address, Vec<RefEntry>>,
    // Live persistent-variable handles. Named lookup resolves the name to
    // an address first (pending roots below, then the engine), so a PVar
    // reached by name and the same PVar reached as a child share one cell.
    pvars: Map<Address, PvEntry>,
    // Root bindings enqueued but not yet committed.
    pending_roots: Map<Box<[u8]>, Address>,
    // Serialized values enqueued but not yet committed. Dereferences hit
    // this before opening an engine snapshot.
    pending: Map<Address, Arc<StoredValue>>,
    // In-flight extension of the on-disk content index.
    hash_overlay: Map<VHash, Vec<Address>>,
    // Transient dedup pins: an address found through the content index is
    // pinned until its handle is registered, so the collector cannot take
    // it in between.
    pins: Map<Address, u32>,
    // Serializes dedup registration against physical reclamation. Dedup
    // holds it shared across candidate-scan -> pin -> register; the writer
    // holds it exclusive from the first deletion through the commit, so a
    // pin or a fresh ephemeron entry is never set while a deletion of the
    // same address is in flight.
    gc_fence: RwLock<()>,
    // Root creation is resolve-then-create; exclusive so one name can
    // never bind two cells.
    root_create: Mutex<()>,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("refs", &self.refs.len())
            .field("pvars", &self.pvars.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Memory {
    pub(crate) fn new() -> Self {
        Self {
            refs: Map::default(),
            pvars: Map::default(),
            pending_roots: Map::default(),
            pending: Map::default(),
            hash_overlay: Map::default(),
            pins: Map::default(),
            gc_fence: RwLock::new(()),
            root_create: Mutex::new(()),
        }
    }

    pub(crate) fn root_creation_lock(&self) -> MutexGuard<'_, ()> {
        self.root_create.lock().unwrap()
    }

    pub(crate) fn registration_fence(&self) -> RwLockReadGuard<'_, ()> {
        self.gc_fence.read().unwrap()
    }

    pub(crate) fn reclaim_fence(&self) -> RwLockWriteGuard<'_, ()> {
        self.gc_fence.write().unwrap()
    }

    // ---- ref ephemerons --------------------------------------------------

    /// Look up a live handle of the given type, or install one built by
    /// `make` while holding the bucket lock (so two racing callers agree on
    /// one cell).
    pub(crate) fn ref_handle(
        &self,
        addr: Address,
        type_id: TypeId,
        make: impl FnOnce() -> (Arc<dyn Any + Send + Sync>, Weak<dyn SweepSlot>),
    ) -> Arc<dyn Any + Send + Sync> {
        let mut bucket = self.refs.entry(addr).or_default();
        bucket.retain(|entry| entry.handle.strong_count() > 0);
        for entry in bucket.iter() {
            if entry.type_id == type_id {
                if let Some(live) = entry.handle.upgrade() {
                    return live;
                }
            }
        }
        let (strong, slot) = make();
        bucket.push(RefEntry {
            type_id,
            handle: Arc::downgrade(&strong),
            slot,
        });
        strong
    }

    /// Finalizer half of the ephemeron: called from the handle's destructor.
    /// Pruning is by liveness, not type: the dying entry's strong count is
    /// already zero, while a racing re-registration of the same type is not.
    pub(crate) fn drop_ref(&self, addr: Address) {
        if let Some(mut bucket) = self.refs.get_mut(&addr) {
            bucket.retain(|entry| entry.handle.strong_count() > 0);
            if bucket.is_empty() {
                drop(bucket);
                self.refs.remove_if(&addr, |_, bucket| bucket.is_empty());
            }
        }
    }

    // ---- pvar ephemerons -------------------------------------------------

    pub(crate) fn pvar_handle(
        &self,
        addr: Address,
        type_id: TypeId,
        make: impl FnOnce() -> Arc<dyn Any + Send + Sync>,
    ) -> Result<Arc<dyn Any + Send + Sync>, ()> {
        let mut entry = self.pvars.entry(addr).or_insert_with(|| PvEntry {
            type_id,
            handle: Weak::<()>::new() as Weak<dyn Any + Send + Sync>,
        });
        if let Some(live) = entry.handle.upgrade() {
            if entry.type_id != type_id {
                return Err(());
            }
            return Ok(live);
        }
        let strong = make();
        entry.type_id = type_id;
        entry.handle = Arc::downgrade(&strong);
        Ok(strong)
    }

    pub(crate) fn drop_pvar(&self, addr: Address) {
        self.pvars
            .remove_if(&addr, |_, entry| entry.handle.strong_count() == 0);
    }

    // ---- liveness, pins --------------------------------------------------

    /// Whether any in-process handle still points at `addr`. The collector
    /// must not reclaim such an address.
    pub(crate) fn is_live(&self, addr: Address) -> bool {
        if let Some(bucket) = self.refs.get(&addr) {
            if bucket.iter().any(|entry| entry.handle.strong_count() > 0) {
                return true;
            }
        }
        self.pvars
            .get(&addr)
            .is_some_and(|entry| entry.handle.strong_count() > 0)
    }

    pub(crate) fn pin(&self, addr: Address) {
        *self.pins.entry(addr).or_insert(0) += 1;
    }

    pub(crate) fn unpin(&self, addr: Address) {
        if let Some(mut count) = self.pins.get_mut(&addr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.pins.remove_if(&addr, |_, count| *count == 0);
            }
        }
    }

    pub(crate) fn is_pinned(&self, addr: Address) -> bool {
        self.pins.get(&addr).is_some_and(|count| *count > 0)
    }

    // ---- pending writes --------------------------------------------------

    pub(crate) fn stage(&self, addr: Address, hash: VHash, value: Arc<StoredValue>) {
        self.pending.insert(addr, value);
        self.hash_overlay.entry(hash).or_default().push(addr);
    }

    pub(crate) fn pending_value(&self, addr: Address) -> Option<Arc<StoredValue>> {
        self.pending.get(&addr).map(|v| Arc::clone(&v))
    }

    /// Drop staged state once the batch holding it has committed.
    pub(crate) fn commit_staged(&self, addr: Address, hash: VHash) {
        self.pending.remove(&addr);
        if let Some(mut bucket) = self.hash_overlay.get_mut(&hash) {
            bucket.retain(|a| *a != addr);
            if bucket.is_empty() {
                drop(bucket);
                self.hash_overlay.remove_if(&hash, |_, bucket| bucket.is_empty());
            }
        }
    }

    pub(crate) fn overlay_candidates(&self, hash: &VHash) -> Vec<Address> {
        self.hash_overlay
            .get(hash)
            .map(|bucket| bucket.clone())
            .unwrap_or_default()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ---- pending roots ---------------------------------------------------

    pub(crate) fn stage_root(&self, name: Box<[u8]>, addr: Address) {
        self.pending_roots.insert(name, addr);
    }

    pub(crate) fn commit_root(&self, name: &[u8]) {
        self.pending_roots.remove(name);
    }

    pub(crate) fn pending_root(&self, name: &[u8]) -> Option<Address> {
        self.pending_roots.get(name).map(|addr| *addr)
    }

    // ---- sweep -----------------------------------------------------------

    /// One cache-aging pass over every live slot. Returns the total weight
    /// still cached afterwards.
    ///
    /// Destructors are deferred past the iteration: dropping an evicted
    /// value (or the last strong handle this pass upgraded) can release
    /// child handles, whose finalizers come right back into these maps.
    pub(crate) fn sweep(&self, pressure: bool) -> u64 {
        let mut retained = 0u64;
        let mut graveyard: Vec<Arc<dyn Any + Send + Sync>> = Vec::new();
        let mut upgraded: Vec<Arc<dyn SweepSlot>> = Vec::new();
        for mut bucket in self.refs.iter_mut() {
            bucket.retain(|entry| entry.handle.strong_count() > 0);
            for entry in bucket.iter() {
                if let Some(slot) = entry.slot.upgrade() {
                    match slot.sweep(pressure) {
                        crate::cache::SweepOutcome::Empty => {}
                        crate::cache::SweepOutcome::Retained(weight) => retained += weight,
                        crate::cache::SweepOutcome::Evicted(value) => graveyard.push(value),
                    }
                    upgraded.push(slot);
                }
            }
        }
        drop(upgraded);
        drop(graveyard);
        retained
    }

    pub(crate) fn live_counts(&self) -> (usize, usize) {
        let refs: usize = self
            .refs
            .iter()
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|entry| entry.handle.strong_count() > 0)
                    .count()
            })
            .sum();
        let pvars = self
            .pvars
            .iter()
            .filter(|entry| entry.handle.strong_count() > 0)
            .count();
        (refs, pvars)
    }
}
