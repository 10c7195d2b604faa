//! The address space: opening a store, content-addressed allocation, and
//! the dereference read path.
//!
//! Reads consult the in-memory side first — the handle's own cache slot,
//! then the staged bytes of writes the worker has not committed — and only
//! then fall back to a backing-engine snapshot. Writes go the other way:
//! serialize, dedup through the content index, stage, and enqueue for the
//! single writer.

use std::any::{Any, TypeId};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Sender};

use crate::cache::{CacheMode, CachePolicy, Slot, SweepOutcome, SweepSlot, Swept};
use crate::codec::{Get, Put, Storable};
use crate::engine::Engine;
use crate::memory::Memory;
use crate::writer::{Command, PendingPut, Writer};
use crate::{content_hash, Address, Error, StoredValue};

/// Tuning knobs for one open store.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on how long the writer keeps a batch open.
    pub tick: Duration,
    /// Extra wait for more work once a batch holds a durability waiter.
    pub durable_grace: Duration,
    /// Reclamation-queue entries processed per batch.
    pub gc_step: usize,
    /// Soft cap on the total weight of cached values; `None` disables
    /// pressure eviction.
    pub weight_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            durable_grace: Duration::from_millis(1),
            gc_step: 64,
            weight_limit: None,
        }
    }
}

// State shared by caller threads and the writer worker. The worker holds
// its own `Arc`, so user handles dropping never yanks the engine out from
// under an in-flight batch.
pub(crate) struct SpaceCore {
    pub(crate) engine: Engine,
    pub(crate) mem: Memory,
    pub(crate) next_addr: AtomicU64,
    pub(crate) halted: OnceLock<String>,
    pub(crate) cfg: Config,
}

// Cheap cloneable capability to operate on a space: shared state plus the
// writer's queue. Embedded in every reference and variable handle.
pub(crate) struct SpaceHandle {
    pub(crate) core: Arc<SpaceCore>,
    pub(crate) tx: Sender<Command>,
}

impl Clone for SpaceHandle {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            tx: self.tx.clone(),
        }
    }
}

impl fmt::Debug for SpaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpaceHandle")
    }
}

impl SpaceHandle {
    pub(crate) fn check_halted(&self) -> Result<(), Error> {
        match self.core.halted.get() {
            Some(msg) => Err(Error::WriterHalted(msg.clone())),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> Error {
        Error::WriterHalted(
            self.core
                .halted
                .get()
                .cloned()
                .unwrap_or_else(|| "space is closed".to_string()),
        )
    }

    pub(crate) fn send(&self, cmd: Command) -> Result<(), Error> {
        self.check_halted()?;
        self.tx.send(cmd).map_err(|_| self.closed_error())
    }

    pub(crate) fn alloc_addr(&self) -> Address {
        // Address 0 stays the null sentinel forever; the counter starts at
        // 1 and only grows.
        self.core.next_addr.fetch_add(1, Ordering::AcqRel)
    }

    /// Serialized bytes for `addr`: staged copy first, then an engine
    /// snapshot.
    pub(crate) fn read_stored(&self, addr: Address) -> Result<Arc<StoredValue>, Error> {
        if let Some(staged) = self.core.mem.pending_value(addr) {
            return Ok(staged);
        }
        match self.core.engine.read_value(addr)? {
            Some(value) => Ok(Arc::new(value)),
            None => Err(Error::Internal(format!("no value stored at address {addr}"))),
        }
    }

    /// The shared typed handle for `addr`, creating an empty one if no live
    /// handle of this type exists.
    pub(crate) fn handle_at<T: Storable>(&self, addr: Address) -> VRef<T> {
        let any = self.core.mem.ref_handle(addr, TypeId::of::<T>(), || {
            let cell = Arc::new(VRefCell::<T> {
                addr,
                space: self.clone(),
                slot: Slot::default(),
            });
            let sweep_cell: Arc<dyn SweepSlot> = cell.clone();
            let slot: Weak<dyn SweepSlot> = Arc::downgrade(&sweep_cell);
            (cell as Arc<dyn Any + Send + Sync>, slot)
        });
        VRef {
            cell: any
                .downcast::<VRefCell<T>>()
                .ok()
                .expect("ephemeron entry carries its declared type"),
        }
    }

    /// Content-addressed allocation: serialize, dedup, stage, enqueue.
    pub(crate) fn vref_value<T: Storable>(&self, value: &T) -> Result<VRef<T>, Error> {
        self.check_halted()?;

        let mut p = Put::new();
        value.put(&mut p);
        let (payload, children) = p.finish();
        let child_addrs: Vec<Address> = children.iter().map(|c| c.addr).collect();
        let hash = content_hash(&payload, &child_addrs);
        let stored = StoredValue {
            payload,
            children: child_addrs,
        };

        // Shared side of the fence: between here and handle registration
        // the collector cannot delete anything.
        let _fence = self.core.mem.registration_fence();

        let mut candidates = self.core.mem.overlay_candidates(&hash);
        candidates.extend(self.core.engine.read_hash_bucket(&hash)?);
        for cand in candidates {
            self.core.mem.pin(cand);
            let matched = self.stored_matches(cand, &stored)?;
            if matched {
                let handle = self.handle_at::<T>(cand);
                self.core.mem.unpin(cand);
                return Ok(handle);
            }
            self.core.mem.unpin(cand);
        }

        let addr = self.alloc_addr();
        let stored = Arc::new(stored);
        self.core.mem.stage(addr, hash, Arc::clone(&stored));
        let handle = self.handle_at::<T>(addr);
        let keep: Vec<Arc<dyn Any + Send + Sync>> =
            children.into_iter().map(|c| c.keep).collect();
        self.send(Command::Put(PendingPut {
            addr,
            hash,
            value: stored,
            keep,
        }))?;
        Ok(handle)
    }

    // Hash buckets are a superset; only byte equality of payload and child
    // list claims a dedup hit.
    fn stored_matches(&self, addr: Address, stored: &StoredValue) -> Result<bool, Error> {
        if let Some(staged) = self.core.mem.pending_value(addr) {
            return Ok(staged.payload == stored.payload && staged.children == stored.children);
        }
        match self.core.engine.read_value(addr)? {
            Some(existing) => {
                Ok(existing.payload == stored.payload && existing.children == stored.children)
            }
            // Raced a reclamation; the bucket entry goes with it.
            None => Ok(false),
        }
    }
}

// The shared cell behind every equal handle: the address, the owning
// space, and the embedded cache slot. Equality of handles is identity of
// this cell.
pub(crate) struct VRefCell<T> {
    pub(crate) addr: Address,
    pub(crate) space: SpaceHandle,
    slot: Slot<T>,
}

impl<T: Storable> SweepSlot for VRefCell<T> {
    fn sweep(&self, pressure: bool) -> SweepOutcome {
        match self.slot.sweep(pressure) {
            Swept::Empty => SweepOutcome::Empty,
            Swept::Retained(weight) => SweepOutcome::Retained(weight),
            Swept::Evicted(value) => SweepOutcome::Evicted(value as Arc<dyn Any + Send + Sync>),
        }
    }
}

impl<T> Drop for VRefCell<T> {
    fn drop(&mut self) {
        // Finalizer half of the ephemeron: deregister, then let the writer
        // decide whether the address is now reclaimable.
        self.space.core.mem.drop_ref(self.addr);
        let _ = self.space.tx.send(Command::Release { addr: self.addr });
    }
}

/// An immutable reference to a content-addressed value.
///
/// Clones share one cell and one cache slot; two references obtained for
/// equal values compare equal. Dereferencing may read and parse from the
/// backing store when the cache slot is empty.
pub struct VRef<T: Storable> {
    pub(crate) cell: Arc<VRefCell<T>>,
}

impl<T: Storable> Clone for VRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Storable> PartialEq for VRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: Storable> Eq for VRef<T> {}

impl<T: Storable> fmt::Debug for VRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VRef({})", self.cell.addr)
    }
}

impl<T: Storable> VRef<T> {
    /// The stable address of the referenced value.
    pub fn address(&self) -> Address {
        self.cell.addr
    }

    /// Dereference: from the cache slot when filled, otherwise read,
    /// parse, and fill.
    pub fn read(&self) -> Result<Arc<T>, Error> {
        if let Some(value) = self.cell.slot.cached() {
            return Ok(value);
        }
        let space = &self.cell.space;
        let stored = space.read_stored(self.cell.addr)?;
        let mut g = Get::new(space, &stored.payload, &stored.children);
        let value = T::get(&mut g)?;
        g.finish()?;
        let mode = CacheMode::fresh(
            CachePolicy::ShortTimeout,
            stored.payload.len(),
            stored.children.len(),
        );
        Ok(self.cell.slot.fill(Arc::new(value), mode))
    }

    /// Whether the cache slot currently holds a parsed value.
    pub fn is_cached(&self) -> bool {
        self.cell.slot.is_cached()
    }

    /// Change the eviction policy of the cached value, if any.
    pub fn set_cache_policy(&self, policy: CachePolicy) {
        self.cell.slot.update_mode(|mode| mode.set_policy(policy));
    }

    /// Pin the cached value against eviction. Lock counts saturate.
    pub fn cache_lock(&self) {
        self.cell.slot.update_mode(|mode| mode.lock());
    }

    /// Drop one cache lock; at zero the slot becomes evictable again.
    pub fn cache_unlock(&self) {
        self.cell.slot.update_mode(|mode| mode.unlock());
    }

    pub(crate) fn keep_alive(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.cell) as Arc<dyn Any + Send + Sync>
    }
}

// Owns the writer thread. Separate from the handles so the last user
// handle going away is what shuts the worker down, while queued work keeps
// the shared state alive independently.
pub(crate) struct SpaceGuard {
    tx: Sender<Command>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SpaceGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(join) = self.writer.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

/// Snapshot of a store's in-memory bookkeeping.
#[derive(Clone, Debug)]
pub struct Stats {
    /// Live immutable-reference handles.
    pub live_refs: usize,
    /// Live persistent-variable handles.
    pub live_pvars: usize,
    /// Writes staged but not yet committed.
    pub pending_writes: usize,
    /// Next address the allocator will hand out.
    pub next_addr: Address,
}

/// A persistent content-addressed value store.
///
/// One directory on disk, one writer worker, shared caches. Clones are
/// handles onto the same store; [`VCache::subdir`] derives a handle whose
/// named roots live under a longer prefix.
pub struct VCache {
    pub(crate) space: SpaceHandle,
    guard: Arc<SpaceGuard>,
    pub(crate) prefix: Vec<u8>,
}

impl Clone for VCache {
    fn clone(&self) -> Self {
        Self {
            space: self.space.clone(),
            guard: Arc::clone(&self.guard),
            prefix: self.prefix.clone(),
        }
    }
}

impl fmt::Debug for VCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VCache")
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .finish()
    }
}

impl VCache {
    /// Open (or create) the store in `dir` with default tuning.
    ///
    /// Fails with [`Error::LockContention`] when another process, or
    /// another open in this one, holds the store.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(dir, Config::default())
    }

    /// As [`VCache::open`], with explicit tuning.
    pub fn open_with(dir: impl AsRef<Path>, cfg: Config) -> Result<Self, Error> {
        let dir = dir.as_ref();
        let engine = Engine::open(dir)?;
        let next = engine.load_next_addr()?;
        let core = Arc::new(SpaceCore {
            engine,
            mem: Memory::new(),
            next_addr: AtomicU64::new(next),
            halted: OnceLock::new(),
            cfg,
        });
        let (tx, rx) = unbounded();
        let writer = Writer::new(Arc::clone(&core), rx);
        let join = std::thread::Builder::new()
            .name("vcache-writer".to_string())
            .spawn(move || writer.run())
            .map_err(|err| Error::Engine(err.to_string()))?;
        tracing::debug!(path = %dir.display(), next_addr = next, "store opened");
        Ok(Self {
            space: SpaceHandle {
                core,
                tx: tx.clone(),
            },
            guard: Arc::new(SpaceGuard {
                tx,
                writer: Mutex::new(Some(join)),
            }),
            prefix: Vec::new(),
        })
    }

    /// A handle whose named roots are scoped under `name`, so independent
    /// sub-applications can share one file without name collisions.
    pub fn subdir(&self, name: &str) -> VCache {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(name.as_bytes());
        prefix.push(b'/');
        VCache {
            space: self.space.clone(),
            guard: Arc::clone(&self.guard),
            prefix,
        }
    }

    /// Store a value, returning a reference to it. Equal serialized forms
    /// dedup to one address and one shared handle.
    pub fn vref<T: Storable>(&self, value: &T) -> Result<VRef<T>, Error> {
        self.space.vref_value(value)
    }

    /// Block until everything accepted so far is on disk.
    pub fn flush(&self) -> Result<(), Error> {
        let (done_tx, done_rx) = bounded(1);
        self.space.send(Command::Flush { done: done_tx })?;
        match done_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(Error::WriterHalted(msg)),
            Err(_) => Err(self.space.closed_error()),
        }
    }

    /// Current in-memory bookkeeping counters.
    pub fn stats(&self) -> Stats {
        let (live_refs, live_pvars) = self.space.core.mem.live_counts();
        Stats {
            live_refs,
            live_pvars,
            pending_writes: self.space.core.mem.pending_len(),
            next_addr: self.space.core.next_addr.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
pub(crate) fn scratch_space() -> SpaceHandle {
    let dir = tempfile::tempdir().unwrap();
    let store = VCache::open(dir.path()).unwrap();
    let handle = store.space.clone();
    // Keep the files and the writer alive for the rest of the test run.
    std::mem::forget(dir);
    std::mem::forget(store);
    handle
}
