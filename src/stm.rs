//! Minimal optimistic transactional memory.
//!
//! A trimmed-down TL2: a global version clock, per-cell versioned values
//! under their own locks, and transactions that validate a read set at
//! commit after locking the write set in id order. Only the operations the
//! persistent-variable layer needs are provided; conflicts surface as
//! [`Retry`] and the driver loop re-runs the closure from scratch.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static CLOCK: AtomicU64 = AtomicU64::new(0);
static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(0);

// A transaction conflict; the enclosing `atomically` loop restarts.
#[derive(Debug)]
pub(crate) struct Retry;

struct Versioned {
    version: u64,
    value: Arc<dyn Any + Send + Sync>,
}

struct Cell {
    id: u64,
    state: Mutex<Versioned>,
}

/// A transactional variable.
///
/// Cloning shares the cell; equality of clones is cell identity.
pub struct TVar<T> {
    cell: Arc<Cell>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TVar#{}", self.cell.id)
    }
}

impl<T: Send + Sync + 'static> TVar<T> {
    /// A fresh independent cell.
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(Cell {
                id: NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(Versioned {
                    version: 0,
                    value: Arc::new(value),
                }),
            }),
            _value: PhantomData,
        }
    }

    /// Identity check against another handle.
    pub fn same_cell(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

pub(crate) struct Tx {
    start: u64,
    reads: HashMap<u64, (Arc<Cell>, u64, Arc<dyn Any + Send + Sync>)>,
    writes: BTreeMap<u64, (Arc<Cell>, Arc<dyn Any + Send + Sync>)>,
}

impl Tx {
    pub(crate) fn new() -> Self {
        Self {
            start: CLOCK.load(Ordering::Acquire),
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    pub(crate) fn read<T: Send + Sync + 'static>(
        &mut self,
        var: &TVar<T>,
    ) -> Result<Arc<T>, Retry> {
        let id = var.cell.id;
        if let Some((_, value)) = self.writes.get(&id) {
            return downcast(value);
        }
        if let Some((_, _, value)) = self.reads.get(&id) {
            return downcast(value);
        }
        let (version, value) = {
            let state = var.cell.state.lock().unwrap();
            (state.version, Arc::clone(&state.value))
        };
        // A version past our snapshot means a commit raced us: the values
        // observed so far may be mutually inconsistent, so start over.
        if version > self.start {
            return Err(Retry);
        }
        self.reads
            .insert(id, (Arc::clone(&var.cell), version, Arc::clone(&value)));
        downcast(&value)
    }

    pub(crate) fn write<T: Send + Sync + 'static>(&mut self, var: &TVar<T>, value: Arc<T>) {
        self.writes
            .insert(var.cell.id, (Arc::clone(&var.cell), value));
    }

    /// Validate and publish. `on_commit` runs while the write locks are
    /// still held, so whatever it enqueues is ordered consistently with the
    /// commit order of the cells it touched.
    pub(crate) fn commit(self, on_commit: impl FnOnce()) -> bool {
        // Lock the write set in id order; two committers can never hold
        // pieces of each other's sets.
        let mut guards = Vec::with_capacity(self.writes.len());
        for (id, (cell, value)) in &self.writes {
            let guard = cell.state.lock().unwrap();
            if let Some((_, seen, _)) = self.reads.get(id) {
                if guard.version != *seen {
                    return false;
                }
            }
            guards.push((guard, value));
        }
        // Read-only cells: still at the version we saw, and not mid-commit
        // elsewhere (a held lock is a commit in flight).
        for (id, (cell, seen, _)) in &self.reads {
            if self.writes.contains_key(id) {
                continue;
            }
            match cell.state.try_lock() {
                Ok(guard) => {
                    if guard.version != *seen {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        if guards.is_empty() {
            on_commit();
            return true;
        }
        let version = CLOCK.fetch_add(1, Ordering::AcqRel) + 1;
        for (guard, value) in &mut guards {
            guard.version = version;
            guard.value = Arc::clone(value);
        }
        on_commit();
        true
    }
}

fn downcast<T: Send + Sync + 'static>(value: &Arc<dyn Any + Send + Sync>) -> Result<Arc<T>, Retry> {
    // The typed TVar wrapper is the only writer, so this cannot fail.
    Ok(Arc::clone(value)
        .downcast::<T>()
        .ok()
        .expect("cell value type is pinned by its TVar"))
}

/// Run `f` transactionally until it commits.
pub(crate) fn atomically<R>(mut f: impl FnMut(&mut Tx) -> Result<R, Retry>) -> R {
    loop {
        let mut tx = Tx::new();
        match f(&mut tx) {
            Err(Retry) => continue,
            Ok(out) => {
                if tx.commit(|| {}) {
                    return out;
                }
            }
        }
    }
}
