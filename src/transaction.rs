//! Persistent variables and the transactions that update them.
//!
//! A [`VTx`] is a software transaction plus an ordered log of persistent
//! writes. The log is handed to the writer inside the commit critical
//! section, so the queue order of commits touching one variable matches
//! their serialization order. Serialization itself is lazy: the writer
//! invokes each write's thunk, and a variable overwritten later in the
//! same batch is never encoded at all.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver};

use crate::codec::{Get, Put, Storable};
use crate::space::{SpaceHandle, VCache};
use crate::stm::{self, TVar};
use crate::writer::{Command, DoneSignal, PvWrite};
use crate::{Address, Error, StoredValue};

/// Whether a committed transaction waits for the disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// Return as soon as the software transaction commits. The write
    /// reaches disk with a later batch.
    Relaxed,
    /// Block until the batch holding this commit is fsync'd.
    Durable,
}

// Cell contents start unloaded so that resolving a variable never parses
// eagerly; mutually referential variables would otherwise chase each other
// forever during construction.
enum PvState<T> {
    Unloaded,
    Loaded(Arc<T>),
}

pub(crate) struct PVarCell<T> {
    addr: Address,
    name: Option<Box<[u8]>>,
    space: SpaceHandle,
    cell: TVar<PvState<T>>,
}

impl<T> Drop for PVarCell<T> {
    fn drop(&mut self) {
        self.space.core.mem.drop_pvar(self.addr);
        let _ = self.space.tx.send(Command::Release { addr: self.addr });
    }
}

/// A named, mutable cell committed through the store's writer.
///
/// Clones share one transactional cell; there is at most one cell per name
/// in a space. Reads and writes go through a [`VTx`].
pub struct PVar<T: Storable> {
    cell: Arc<PVarCell<T>>,
}

impl<T: Storable> Clone for PVar<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Storable> PartialEq for PVar<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: Storable> Eq for PVar<T> {}

impl<T: Storable> fmt::Debug for PVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cell.name {
            Some(name) => write!(f, "PVar({}@{})", String::from_utf8_lossy(name), self.cell.addr),
            None => write!(f, "PVar(@{})", self.cell.addr),
        }
    }
}

impl<T: Storable> PVar<T> {
    /// The variable's stable address.
    pub fn address(&self) -> Address {
        self.cell.addr
    }

    /// The full root name, for variables resolved by name.
    pub fn name(&self) -> Option<&[u8]> {
        self.cell.name.as_deref()
    }

    pub(crate) fn keep_alive(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.cell) as Arc<dyn Any + Send + Sync>
    }
}

impl SpaceHandle {
    /// Shared typed cell for the variable at `addr`; fails when a live cell
    /// of a different declared type already exists there.
    pub(crate) fn pvar_at<T: Storable>(&self, addr: Address) -> Result<PVar<T>, ()> {
        self.pvar_register(addr, None, || PvState::<T>::Unloaded)
    }

    fn pvar_register<T: Storable>(
        &self,
        addr: Address,
        name: Option<Box<[u8]>>,
        init: impl FnOnce() -> PvState<T>,
    ) -> Result<PVar<T>, ()> {
        let any = self.core.mem.pvar_handle(addr, TypeId::of::<T>(), || {
            Arc::new(PVarCell {
                addr,
                name,
                space: self.clone(),
                cell: TVar::new(init()),
            }) as Arc<dyn Any + Send + Sync>
        })?;
        Ok(PVar {
            cell: any
                .downcast::<PVarCell<T>>()
                .ok()
                .expect("pvar entry carries its declared type"),
        })
    }
}

impl VCache {
    /// Resolve the named root under this handle's prefix, creating it with
    /// `init` when absent. The init value is committed (non-durably)
    /// through the writer like any other write.
    pub fn pvar<T: Storable>(
        &self,
        name: &str,
        init: impl FnOnce() -> T,
    ) -> Result<PVar<T>, Error> {
        self.space.check_halted()?;
        let mut full = self.prefix.clone();
        full.extend_from_slice(name.as_bytes());
        let full: Box<[u8]> = full.into();

        // Creation must be exclusive per space: two racing creators of one
        // name would otherwise bind two cells.
        let _guard = self.space.core.mem.root_creation_lock();

        let existing = match self.space.core.mem.pending_root(&full) {
            Some(addr) => Some(addr),
            None => self.space.core.engine.read_root(&full)?,
        };
        if let Some(addr) = existing {
            return self
                .space
                .pvar_at::<T>(addr)
                .map_err(|_| Error::TypeMismatch { addr });
        }

        let addr = self.space.alloc_addr();
        let value = Arc::new(init());
        let pv = self
            .space
            .pvar_register(addr, Some(full.clone()), || {
                PvState::Loaded(Arc::clone(&value))
            })
            .map_err(|_| Error::TypeMismatch { addr })?;
        self.space.send(Command::Commit {
            writes: vec![initial_write(&pv, value)],
            done: None,
        })?;
        self.space.core.mem.stage_root(full.clone(), addr);
        self.space.send(Command::BindRoot { name: full, addr })?;
        Ok(pv)
    }

    /// An anonymous variable: reachable only through handles and through
    /// values that reference it, and collected once neither does.
    pub fn new_pvar<T: Storable>(&self, value: T) -> Result<PVar<T>, Error> {
        self.space.check_halted()?;
        let addr = self.space.alloc_addr();
        let value = Arc::new(value);
        let pv = self
            .space
            .pvar_register(addr, None, || PvState::Loaded(Arc::clone(&value)))
            .map_err(|_| Error::TypeMismatch { addr })?;
        self.space.send(Command::Commit {
            writes: vec![initial_write(&pv, value)],
            done: None,
        })?;
        Ok(pv)
    }

    /// Remove a named root binding. The variable's storage is reclaimed
    /// once nothing else references it.
    pub fn drop_root(&self, name: &str) -> Result<(), Error> {
        let mut full = self.prefix.clone();
        full.extend_from_slice(name.as_bytes());
        self.space.send(Command::UnbindRoot { name: full.into() })
    }
}

fn initial_write<T: Storable>(pv: &PVar<T>, value: Arc<T>) -> PvWrite {
    PvWrite {
        addr: pv.cell.addr,
        thunk: Box::new(move || encode_value(&*value)),
        keep: pv.keep_alive(),
    }
}

fn encode_value<T: Storable>(value: &T) -> StoredValue {
    let mut p = Put::new();
    value.put(&mut p);
    let (payload, children) = p.finish();
    StoredValue {
        payload,
        // The child handles captured by the thunk's value keep the cells
        // alive until this batch commits.
        children: children.into_iter().map(|c| c.addr).collect(),
    }
}

struct LogEntry {
    addr: Address,
    space: SpaceHandle,
    encode: Box<dyn FnOnce() -> StoredValue + Send>,
    keep: Arc<dyn Any + Send + Sync>,
}

/// A transaction over persistent variables and plain transactional cells.
///
/// Built by [`atomically`]; conflicts abort the closure with
/// [`Error::Conflict`] and the driver re-runs it.
pub struct VTx {
    tx: stm::Tx,
    log: Vec<LogEntry>,
}

impl fmt::Debug for VTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VTx({} writes)", self.log.len())
    }
}

impl VTx {
    /// Current value of a persistent variable, loading and parsing it from
    /// the store on first contact.
    pub fn read<T: Storable>(&mut self, pv: &PVar<T>) -> Result<Arc<T>, Error> {
        let state = self
            .tx
            .read(&pv.cell.cell)
            .map_err(|_| Error::Conflict)?;
        match &*state {
            PvState::Loaded(value) => Ok(Arc::clone(value)),
            PvState::Unloaded => {
                let stored = pv.cell.space.read_stored(pv.cell.addr)?;
                let mut g = Get::new(&pv.cell.space, &stored.payload, &stored.children);
                let value = T::get(&mut g)?;
                g.finish()?;
                let value = Arc::new(value);
                // Cache the fill through the write set so it commits with
                // the transaction; it is not a persistent write and never
                // enters the log.
                self.tx
                    .write(&pv.cell.cell, Arc::new(PvState::Loaded(Arc::clone(&value))));
                Ok(value)
            }
        }
    }

    /// Write a persistent variable. Re-writing the same variable in one
    /// transaction keeps only the last value.
    pub fn write<T: Storable>(&mut self, pv: &PVar<T>, value: T) {
        let value = Arc::new(value);
        self.tx
            .write(&pv.cell.cell, Arc::new(PvState::Loaded(Arc::clone(&value))));
        let encode: Box<dyn FnOnce() -> StoredValue + Send> =
            Box::new(move || encode_value(&*value));
        if let Some(at) = self.log.iter().position(|entry| {
            entry.addr == pv.cell.addr && Arc::ptr_eq(&entry.space.core, &pv.cell.space.core)
        }) {
            self.log[at].encode = encode;
            return;
        }
        self.log.push(LogEntry {
            addr: pv.cell.addr,
            space: pv.cell.space.clone(),
            encode,
            keep: pv.keep_alive(),
        });
    }

    /// Read a non-persistent transactional cell.
    pub fn read_tvar<T: Send + Sync + 'static>(&mut self, var: &TVar<T>) -> Result<Arc<T>, Error> {
        self.tx.read(var).map_err(|_| Error::Conflict)
    }

    /// Write a non-persistent transactional cell.
    pub fn write_tvar<T: Send + Sync + 'static>(&mut self, var: &TVar<T>, value: T) {
        self.tx.write(var, Arc::new(value));
    }
}

/// Run `f` as a transaction until it commits, then hand its persistent
/// writes to the writer of every space involved.
///
/// With [`Durability::Durable`] the call blocks until each space reports
/// its batch on disk; a cross-space transaction commits per space and is
/// only best-effort atomic across them.
pub fn atomically<R>(
    durability: Durability,
    mut f: impl FnMut(&mut VTx) -> Result<R, Error>,
) -> Result<R, Error> {
    loop {
        let mut vtx = VTx {
            tx: stm::Tx::new(),
            log: Vec::new(),
        };
        match f(&mut vtx) {
            Err(Error::Conflict) => continue,
            Err(err) => return Err(err),
            Ok(out) => {
                let VTx { tx, log } = vtx;
                let mut waits: Vec<Receiver<Result<(), String>>> = Vec::new();
                let mut sends: Vec<(SpaceHandle, Command)> = Vec::new();
                for (space, writes) in group_by_space(log) {
                    let done: Option<DoneSignal> = if durability == Durability::Durable {
                        let (done_tx, done_rx) = bounded(1);
                        waits.push(done_rx);
                        Some(done_tx)
                    } else {
                        None
                    };
                    sends.push((space, Command::Commit { writes, done }));
                }
                // Delivered inside the commit critical section: queue order
                // for any one variable equals its commit order.
                let committed = tx.commit(move || {
                    for (space, cmd) in sends {
                        let _ = space.tx.send(cmd);
                    }
                });
                if !committed {
                    continue;
                }
                for rx in waits {
                    match rx.recv() {
                        Ok(Ok(())) => {}
                        Ok(Err(msg)) => return Err(Error::WriterHalted(msg)),
                        Err(_) => {
                            return Err(Error::WriterHalted("space is closed".to_string()))
                        }
                    }
                }
                return Ok(out);
            }
        }
    }
}

fn group_by_space(log: Vec<LogEntry>) -> Vec<(SpaceHandle, Vec<PvWrite>)> {
    let mut groups: Vec<(SpaceHandle, Vec<PvWrite>)> = Vec::new();
    for entry in log {
        let write = PvWrite {
            addr: entry.addr,
            thunk: entry.encode,
            keep: entry.keep,
        };
        match groups
            .iter()
            .position(|(space, _)| Arc::ptr_eq(&space.core, &entry.space.core))
        {
            Some(at) => groups[at].1.push(write),
            None => groups.push((entry.space, vec![write])),
        }
    }
    groups
}
