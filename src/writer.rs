//! The single writer and incremental collector.
//!
//! Exactly one worker per space owns every mutating backing-engine
//! transaction. Callers hand it work over an MPSC channel; it closes
//! batches on a bounded tick so bursts amortize one commit, runs a slice of
//! refcount GC inside the same transaction, and signals durability waiters
//! once the commit (and, for durable batches, the fsync) is through.
//!
//! An invariant violation — refcount underflow, a value missing mid-walk —
//! halts the worker: the error is latched for the space and every pending
//! or future durability waiter is failed with it.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use redb::Durability;

use crate::engine::{self, Tables};
use crate::space::SpaceCore;
use crate::{content_hash, Address, Error, StoredValue, VHash};

pub(crate) type DoneSignal = Sender<Result<(), String>>;
pub(crate) type PutThunk = Box<dyn FnOnce() -> StoredValue + Send>;

pub(crate) struct PendingPut {
    pub(crate) addr: Address,
    pub(crate) hash: VHash,
    pub(crate) value: Arc<StoredValue>,
    // Child handles stay strong until this value is on disk, so a child
    // cannot be released (and possibly collected) out from under it.
    pub(crate) keep: Vec<Arc<dyn Any + Send + Sync>>,
}

pub(crate) struct PvWrite {
    pub(crate) addr: Address,
    // Serialization is lazy: the thunk runs on the writer, off the
    // caller's commit path, and superseded writes to the same variable
    // are never encoded at all.
    pub(crate) thunk: PutThunk,
    pub(crate) keep: Arc<dyn Any + Send + Sync>,
}

pub(crate) enum Command {
    Put(PendingPut),
    Commit {
        writes: Vec<PvWrite>,
        done: Option<DoneSignal>,
    },
    BindRoot {
        name: Box<[u8]>,
        addr: Address,
    },
    UnbindRoot {
        name: Box<[u8]>,
    },
    Release {
        addr: Address,
    },
    Flush {
        done: DoneSignal,
    },
    Shutdown,
}

fn wants_durability(cmd: &Command) -> bool {
    match cmd {
        Command::Commit { done, .. } => done.is_some(),
        Command::Flush { .. } => true,
        _ => false,
    }
}

pub(crate) struct Writer {
    core: Arc<SpaceCore>,
    rx: Receiver<Command>,
    // Cache weight retained by the last sweep; drives the soft budget.
    retained_weight: u64,
}

impl Writer {
    pub(crate) fn new(core: Arc<SpaceCore>, rx: Receiver<Command>) -> Self {
        Self {
            core,
            rx,
            retained_weight: 0,
        }
    }

    pub(crate) fn run(mut self) {
        if let Err(err) = self.requeue_stranded_zeros() {
            tracing::error!(%err, "writer failed to recover the reclamation queue");
            self.halt(err, Vec::new());
            return;
        }
        loop {
            let first = match self.rx.recv() {
                Ok(cmd) => cmd,
                // Every handle is gone; nothing can be queued anymore.
                Err(_) => return,
            };
            let (batch, shutdown) = self.collect(first);
            let signals = collect_signals(&batch);
            match self.apply(batch, shutdown) {
                Ok(()) => {
                    for done in signals {
                        let _ = done.send(Ok(()));
                    }
                }
                Err(err) => {
                    self.halt(err, signals);
                    return;
                }
            }
            if shutdown {
                return;
            }
            let pressure = self
                .core
                .cfg
                .weight_limit
                .is_some_and(|limit| self.retained_weight > limit);
            self.retained_weight = self.core.mem.sweep(pressure);
        }
    }

    // Accumulate one batch: run until the queue drains, the tick fires, or
    // (once a durability waiter is aboard) a short grace window passes
    // without new work.
    fn collect(&self, first: Command) -> (Vec<Command>, bool) {
        let mut durable = wants_durability(&first);
        let mut shutdown = matches!(first, Command::Shutdown);
        let mut batch = vec![first];
        let opened = Instant::now();
        loop {
            if shutdown || opened.elapsed() >= self.core.cfg.tick {
                break;
            }
            match self.rx.try_recv() {
                Ok(cmd) => {
                    durable |= wants_durability(&cmd);
                    shutdown |= matches!(cmd, Command::Shutdown);
                    batch.push(cmd);
                }
                Err(TryRecvError::Disconnected) => {
                    shutdown = true;
                    break;
                }
                Err(TryRecvError::Empty) => {
                    if !durable {
                        break;
                    }
                    match self.rx.recv_timeout(self.core.cfg.durable_grace) {
                        Ok(cmd) => {
                            durable |= wants_durability(&cmd);
                            shutdown |= matches!(cmd, Command::Shutdown);
                            batch.push(cmd);
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        if shutdown {
            // Drain whatever is still queued so pending writes reach disk
            // before the space closes.
            while let Ok(cmd) = self.rx.try_recv() {
                batch.push(cmd);
            }
        }
        (batch, shutdown)
    }

    fn apply(&self, batch: Vec<Command>, shutdown: bool) -> Result<(), Error> {
        let durable = shutdown || batch.iter().any(wants_durability);
        // Taken only when this batch physically deletes something; held
        // through the commit so dedup cannot adopt an address mid-deletion.
        let mut fence: Option<std::sync::RwLockWriteGuard<'_, ()>> = None;

        let mut puts: Vec<PendingPut> = Vec::new();
        let mut pv_writes: Vec<(Address, PutThunk)> = Vec::new();
        let mut pv_index: BTreeMap<Address, usize> = BTreeMap::new();
        let mut roots: Vec<(Box<[u8]>, Option<Address>)> = Vec::new();
        let mut releases: Vec<Address> = Vec::new();
        // Keep-alives ride until after the commit below.
        let mut keep: Vec<Arc<dyn Any + Send + Sync>> = Vec::new();

        for cmd in batch {
            match cmd {
                Command::Put(put) => puts.push(put),
                Command::Commit { writes, done: _ } => {
                    for write in writes {
                        keep.push(write.keep);
                        match pv_index.get(&write.addr) {
                            // Later write to the same variable in the same
                            // batch: only the last encoding runs.
                            Some(&at) => pv_writes[at].1 = write.thunk,
                            None => {
                                pv_index.insert(write.addr, pv_writes.len());
                                pv_writes.push((write.addr, write.thunk));
                            }
                        }
                    }
                }
                Command::BindRoot { name, addr } => roots.push((name, Some(addr))),
                Command::UnbindRoot { name } => roots.push((name, None)),
                Command::Release { addr } => releases.push(addr),
                Command::Flush { done: _ } | Command::Shutdown => {}
            }
        }

        if puts.is_empty() && pv_writes.is_empty() && roots.is_empty() && releases.is_empty() {
            // Nothing to write; a durable no-op still forces earlier
            // non-durable batches onto disk.
            if !durable {
                return Ok(());
            }
        }

        let mut txn = self.core.engine.begin_write()?;
        txn.set_durability(if durable {
            Durability::Immediate
        } else {
            Durability::None
        });

        let mut committed_stage: Vec<(Address, VHash)> = Vec::new();
        let mut committed_roots: Vec<Box<[u8]>> = Vec::new();
        {
            let mut tables = Tables::open(&txn)?;
            let mut deltas: BTreeMap<Address, i64> = BTreeMap::new();

            for put in &puts {
                tables.write_value(put.addr, &put.value)?;
                tables.bucket_push(&put.hash, put.addr)?;
                // Materialize the count even when nothing in this batch
                // references the value yet.
                deltas.entry(put.addr).or_insert(0);
                for &child in &put.value.children {
                    *deltas.entry(child).or_insert(0) += 1;
                }
                committed_stage.push((put.addr, put.hash));
            }

            for (addr, thunk) in pv_writes {
                let value = thunk();
                let prior = tables.value_children(addr)?.unwrap_or_default();
                tables.write_value(addr, &value)?;
                deltas.entry(addr).or_insert(0);
                for child in value.children {
                    *deltas.entry(child).or_insert(0) += 1;
                }
                for child in prior {
                    *deltas.entry(child).or_insert(0) -= 1;
                }
            }

            for (name, bind) in roots {
                match bind {
                    Some(addr) => {
                        let old = tables.root_get(&name)?;
                        tables.root_set(&name, addr)?;
                        if old != Some(addr) {
                            *deltas.entry(addr).or_insert(0) += 1;
                            if let Some(old) = old {
                                *deltas.entry(old).or_insert(0) -= 1;
                            }
                        }
                    }
                    None => {
                        if let Some(old) = tables.root_remove(&name)? {
                            *deltas.entry(old).or_insert(0) -= 1;
                        }
                    }
                }
                committed_roots.push(name);
            }

            let zeros = apply_deltas(&mut tables, &deltas)?;
            for addr in zeros {
                tables.gc_queue_push(addr)?;
            }

            for addr in releases {
                if tables.refcount(addr)? == 0
                    && !self.core.mem.is_live(addr)
                    && !self.core.mem.is_pinned(addr)
                {
                    tables.gc_queue_push(addr)?;
                }
            }

            self.collect_garbage(&mut tables, &mut fence)?;

            tables.persist_next_addr(
                self.core
                    .next_addr
                    .load(std::sync::atomic::Ordering::Acquire),
            )?;
        }

        engine::commit(txn)?;

        // Only now may readers stop seeing the staged copies: the engine
        // snapshot has them.
        for (addr, hash) in committed_stage {
            self.core.mem.commit_staged(addr, hash);
        }
        for name in committed_roots {
            self.core.mem.commit_root(&name);
        }
        drop(keep);
        drop(fence);
        Ok(())
    }

    // Pop a bounded slice of the reclamation queue and collect what is
    // truly dead. Work per batch stays O(gc_step); anything skipped is
    // either consumed (to be re-queued by a later release) or re-surfaces
    // through its own refcount transitions.
    fn collect_garbage<'w>(
        &'w self,
        tables: &mut Tables<'_>,
        fence: &mut Option<std::sync::RwLockWriteGuard<'w, ()>>,
    ) -> Result<(), Error> {
        let popped = tables.gc_queue_pop(self.core.cfg.gc_step)?;
        for addr in popped {
            if tables.refcount(addr)? > 0 {
                continue;
            }
            if fence.is_none() {
                *fence = Some(self.core.mem.reclaim_fence());
            }
            if self.core.mem.is_live(addr) || self.core.mem.is_pinned(addr) {
                // Still reachable in-process; the handle's release will
                // queue it again once it drops.
                continue;
            }
            let Some(value) = tables.value_get(addr)? else {
                // A duplicate queue entry for something already collected.
                continue;
            };
            let mut deltas: BTreeMap<Address, i64> = BTreeMap::new();
            for &child in &value.children {
                *deltas.entry(child).or_insert(0) -= 1;
            }
            let zeros = apply_deltas(tables, &deltas)?;
            for zero in zeros {
                tables.gc_queue_push(zero)?;
            }
            tables.remove_value(addr)?;
            tables.remove_refcount(addr)?;
            tables.bucket_remove(&content_hash(&value.payload, &value.children), addr)?;
            tracing::trace!(addr, "reclaimed");
        }
        Ok(())
    }

    // A crash can leave zero-count entries that never made it into the
    // queue; re-queue them so collection completes across restarts.
    fn requeue_stranded_zeros(&self) -> Result<(), Error> {
        let stranded = {
            let txn = self.core.engine.begin_read()?;
            crate::engine::zero_refcounts(&txn)?
        };
        if stranded.is_empty() {
            return Ok(());
        }
        let txn = self.core.engine.begin_write()?;
        {
            let mut tables = Tables::open(&txn)?;
            for addr in stranded {
                tables.gc_queue_push(addr)?;
            }
        }
        engine::commit(txn)
    }

    fn halt(&self, err: Error, signals: Vec<DoneSignal>) {
        let msg = err.to_string();
        tracing::error!(%msg, "writer halted");
        let _ = self.core.halted.set(msg.clone());
        for done in signals {
            let _ = done.send(Err(msg.clone()));
        }
        // Keep answering so durable callers fail fast instead of hanging.
        while let Ok(cmd) = self.rx.recv() {
            match cmd {
                Command::Commit {
                    done: Some(done), ..
                }
                | Command::Flush { done } => {
                    let _ = done.send(Err(msg.clone()));
                }
                Command::Shutdown => return,
                _ => {}
            }
        }
    }
}

fn collect_signals(batch: &[Command]) -> Vec<DoneSignal> {
    batch
        .iter()
        .filter_map(|cmd| match cmd {
            Command::Commit {
                done: Some(done), ..
            } => Some(done.clone()),
            Command::Flush { done } => Some(done.clone()),
            _ => None,
        })
        .collect()
}

// Fold refcount deltas into the table. Returns addresses that transitioned
// to zero (creation at zero does not count as a transition).
fn apply_deltas(
    tables: &mut Tables<'_>,
    deltas: &BTreeMap<Address, i64>,
) -> Result<Vec<Address>, Error> {
    let mut zeros = Vec::new();
    for (&addr, &delta) in deltas {
        let current = tables.refcount(addr)? as i64;
        let next = current + delta;
        if next < 0 {
            return Err(Error::Internal(format!(
                "refcount underflow at address {addr}"
            )));
        }
        tables.set_refcount(addr, next as u64)?;
        if next == 0 && delta < 0 {
            zeros.push(addr);
        }
    }
    Ok(zeros)
}
