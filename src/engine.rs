//! Backing engine: a memory-mapped ordered map with MVCC.
//!
//! One directory holds the database file and an advisory lock file; the lock
//! is taken exclusively at open so a second opener fails fast instead of
//! corrupting the single-writer protocol. Logical tables:
//!
//! - `values`: address -> `varint(payload_len) || payload || varint(n) ||
//!   n * 8-byte big-endian child addresses`. Child lists are decodable
//!   without the value's parser, which keeps GC walks payload-blind.
//! - `vroots`: full root name -> address.
//! - `caddrs`: 16-byte content hash -> length-prefixed address list.
//! - `refcts`: address -> reference count.
//! - `refct0`: monotone sequence number -> address awaiting reclamation.
//! - `meta`: allocator high-water mark.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};

use crate::{Address, Error, StoredValue};

const VALUES: TableDefinition<'static, u64, &'static [u8]> = TableDefinition::new("values");
const VROOTS: TableDefinition<'static, &'static [u8], u64> = TableDefinition::new("vroots");
const CADDRS: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("caddrs");
const REFCTS: TableDefinition<'static, u64, u64> = TableDefinition::new("refcts");
const REFCT0: TableDefinition<'static, u64, u64> = TableDefinition::new("refct0");
const META: TableDefinition<'static, &'static str, u64> = TableDefinition::new("meta");

const META_NEXT_ADDR: &str = "next_addr";

const DB_FILE: &str = "vcache.redb";
const LOCK_FILE: &str = "vcache.lock";

pub(crate) struct Engine {
    db: Database,
    // Held for the lifetime of the space; releasing the handle releases the
    // OS lock.
    _lock: File,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Engine")
    }
}

fn engine_err(err: impl std::fmt::Display) -> Error {
    Error::Engine(err.to_string())
}

impl Engine {
    pub(crate) fn open(dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(dir).map_err(engine_err)?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(engine_err)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(Error::LockContention(lock_path.display().to_string()));
        }

        let db = Database::create(dir.join(DB_FILE)).map_err(engine_err)?;

        // Pre-create every table so later opens cannot fail on a missing
        // table, and read transactions always see the full layout.
        let txn = db.begin_write().map_err(engine_err)?;
        {
            txn.open_table(VALUES).map_err(engine_err)?;
            txn.open_table(VROOTS).map_err(engine_err)?;
            txn.open_table(CADDRS).map_err(engine_err)?;
            txn.open_table(REFCTS).map_err(engine_err)?;
            txn.open_table(REFCT0).map_err(engine_err)?;
            txn.open_table(META).map_err(engine_err)?;
        }
        txn.commit().map_err(engine_err)?;

        Ok(Self { db, _lock: lock })
    }

    pub(crate) fn begin_write(&self) -> Result<WriteTransaction, Error> {
        self.db.begin_write().map_err(engine_err)
    }

    pub(crate) fn begin_read(&self) -> Result<ReadTransaction, Error> {
        self.db.begin_read().map_err(engine_err)
    }

    /// First address this process may allocate.
    pub(crate) fn load_next_addr(&self) -> Result<Address, Error> {
        let txn = self.begin_read()?;
        let meta = txn.open_table(META).map_err(engine_err)?;
        let next = meta
            .get(META_NEXT_ADDR)
            .map_err(engine_err)?
            .map(|g| g.value())
            // Address 0 is the null sentinel and is never assigned.
            .unwrap_or(1);
        Ok(next)
    }

    pub(crate) fn read_value(&self, addr: Address) -> Result<Option<StoredValue>, Error> {
        let txn = self.begin_read()?;
        let values = txn.open_table(VALUES).map_err(engine_err)?;
        match values.get(addr).map_err(engine_err)? {
            None => Ok(None),
            Some(guard) => decode_stored(guard.value()).map(Some),
        }
    }

    pub(crate) fn read_root(&self, name: &[u8]) -> Result<Option<Address>, Error> {
        let txn = self.begin_read()?;
        let roots = txn.open_table(VROOTS).map_err(engine_err)?;
        Ok(roots.get(name).map_err(engine_err)?.map(|g| g.value()))
    }

    /// Addresses sharing a content hash. A superset: callers re-check byte
    /// equality before claiming a dedup hit.
    pub(crate) fn read_hash_bucket(&self, hash: &[u8; 16]) -> Result<Vec<Address>, Error> {
        let txn = self.begin_read()?;
        let caddrs = txn.open_table(CADDRS).map_err(engine_err)?;
        match caddrs.get(hash.as_slice()).map_err(engine_err)? {
            None => Ok(Vec::new()),
            Some(guard) => decode_bucket(guard.value()),
        }
    }

}

// ---- writer-side table access -------------------------------------------
//
// The writer owns the only WriteTransaction at a time; these helpers keep
// the table plumbing out of the batch logic.

pub(crate) struct Tables<'txn> {
    pub(crate) values: redb::Table<'txn, u64, &'static [u8]>,
    pub(crate) vroots: redb::Table<'txn, &'static [u8], u64>,
    pub(crate) caddrs: redb::Table<'txn, &'static [u8], &'static [u8]>,
    pub(crate) refcts: redb::Table<'txn, u64, u64>,
    pub(crate) refct0: redb::Table<'txn, u64, u64>,
    pub(crate) meta: redb::Table<'txn, &'static str, u64>,
}

impl<'txn> Tables<'txn> {
    pub(crate) fn open(txn: &'txn WriteTransaction) -> Result<Self, Error> {
        Ok(Self {
            values: txn.open_table(VALUES).map_err(engine_err)?,
            vroots: txn.open_table(VROOTS).map_err(engine_err)?,
            caddrs: txn.open_table(CADDRS).map_err(engine_err)?,
            refcts: txn.open_table(REFCTS).map_err(engine_err)?,
            refct0: txn.open_table(REFCT0).map_err(engine_err)?,
            meta: txn.open_table(META).map_err(engine_err)?,
        })
    }

    pub(crate) fn write_value(&mut self, addr: Address, value: &StoredValue) -> Result<(), Error> {
        let encoded = encode_stored(value);
        self.values
            .insert(addr, encoded.as_slice())
            .map_err(engine_err)?;
        Ok(())
    }

    pub(crate) fn value_children(&self, addr: Address) -> Result<Option<Vec<Address>>, Error> {
        Ok(self.value_get(addr)?.map(|v| v.children))
    }

    pub(crate) fn value_get(&self, addr: Address) -> Result<Option<StoredValue>, Error> {
        match self.values.get(addr).map_err(engine_err)? {
            None => Ok(None),
            Some(guard) => decode_stored(guard.value()).map(Some),
        }
    }

    pub(crate) fn remove_value(&mut self, addr: Address) -> Result<bool, Error> {
        Ok(self.values.remove(addr).map_err(engine_err)?.is_some())
    }

    pub(crate) fn bucket_push(&mut self, hash: &[u8; 16], addr: Address) -> Result<(), Error> {
        let mut bucket = match self.caddrs.get(hash.as_slice()).map_err(engine_err)? {
            None => Vec::new(),
            Some(guard) => decode_bucket(guard.value())?,
        };
        bucket.push(addr);
        let encoded = encode_bucket(&bucket);
        self.caddrs
            .insert(hash.as_slice(), encoded.as_slice())
            .map_err(engine_err)?;
        Ok(())
    }

    pub(crate) fn bucket_remove(&mut self, hash: &[u8; 16], addr: Address) -> Result<(), Error> {
        let bucket = match self.caddrs.get(hash.as_slice()).map_err(engine_err)? {
            None => return Ok(()),
            Some(guard) => decode_bucket(guard.value())?,
        };
        let remaining: Vec<Address> = bucket.into_iter().filter(|a| *a != addr).collect();
        if remaining.is_empty() {
            self.caddrs.remove(hash.as_slice()).map_err(engine_err)?;
        } else {
            let encoded = encode_bucket(&remaining);
            self.caddrs
                .insert(hash.as_slice(), encoded.as_slice())
                .map_err(engine_err)?;
        }
        Ok(())
    }

    pub(crate) fn refcount(&self, addr: Address) -> Result<u64, Error> {
        Ok(self
            .refcts
            .get(addr)
            .map_err(engine_err)?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    pub(crate) fn set_refcount(&mut self, addr: Address, count: u64) -> Result<(), Error> {
        self.refcts.insert(addr, count).map_err(engine_err)?;
        Ok(())
    }

    pub(crate) fn remove_refcount(&mut self, addr: Address) -> Result<(), Error> {
        self.refcts.remove(addr).map_err(engine_err)?;
        Ok(())
    }

    pub(crate) fn root_get(&self, name: &[u8]) -> Result<Option<Address>, Error> {
        Ok(self.vroots.get(name).map_err(engine_err)?.map(|g| g.value()))
    }

    pub(crate) fn root_set(&mut self, name: &[u8], addr: Address) -> Result<(), Error> {
        self.vroots.insert(name, addr).map_err(engine_err)?;
        Ok(())
    }

    pub(crate) fn root_remove(&mut self, name: &[u8]) -> Result<Option<Address>, Error> {
        Ok(self
            .vroots
            .remove(name)
            .map_err(engine_err)?
            .map(|g| g.value()))
    }

    pub(crate) fn gc_queue_push(&mut self, addr: Address) -> Result<(), Error> {
        let next_seq = self
            .refct0
            .last()
            .map_err(engine_err)?
            .map(|(k, _)| k.value() + 1)
            .unwrap_or(0);
        self.refct0.insert(next_seq, addr).map_err(engine_err)?;
        Ok(())
    }

    /// Pop up to `limit` entries off the head of the reclamation queue.
    pub(crate) fn gc_queue_pop(&mut self, limit: usize) -> Result<Vec<Address>, Error> {
        let mut head: Vec<(u64, Address)> = Vec::with_capacity(limit);
        for entry in self.refct0.range(0..=u64::MAX).map_err(engine_err)?.take(limit) {
            let (k, v) = entry.map_err(engine_err)?;
            head.push((k.value(), v.value()));
        }
        let mut out = Vec::with_capacity(head.len());
        for (seq, addr) in head {
            self.refct0.remove(seq).map_err(engine_err)?;
            out.push(addr);
        }
        Ok(out)
    }

    pub(crate) fn persist_next_addr(&mut self, next: Address) -> Result<(), Error> {
        self.meta
            .insert(META_NEXT_ADDR, next)
            .map_err(engine_err)?;
        Ok(())
    }
}

/// Zero-count entries visible in a snapshot; used at startup to re-seed the
/// reclamation queue after a crash.
pub(crate) fn zero_refcounts(txn: &ReadTransaction) -> Result<Vec<Address>, Error> {
    let refcts = txn.open_table(REFCTS).map_err(engine_err)?;
    let mut out = Vec::new();
    for entry in refcts.range(0..=u64::MAX).map_err(engine_err)? {
        let (k, v) = entry.map_err(engine_err)?;
        if v.value() == 0 {
            out.push(k.value());
        }
    }
    Ok(out)
}

pub(crate) fn commit(txn: WriteTransaction) -> Result<(), Error> {
    txn.commit().map_err(|err| {
        let msg = err.to_string();
        if msg.contains("full") || msg.contains("space") {
            Error::StoreFull
        } else {
            Error::Engine(msg)
        }
    })
}

// ---- wire format ---------------------------------------------------------

fn push_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn take_varint(data: &[u8], pos: &mut usize) -> Result<u64, Error> {
    let mut out: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| Error::Engine("truncated length prefix".into()))?;
        *pos += 1;
        if shift > 63 || (shift == 63 && byte > 1) {
            return Err(Error::Engine("length prefix overflows u64".into()));
        }
        out |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
    }
}

pub(crate) fn encode_stored(value: &StoredValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.payload.len() + 8 * value.children.len() + 10);
    push_varint(&mut out, value.payload.len() as u64);
    out.extend_from_slice(&value.payload);
    push_varint(&mut out, value.children.len() as u64);
    for child in &value.children {
        out.extend_from_slice(&child.to_be_bytes());
    }
    out
}

pub(crate) fn decode_stored(data: &[u8]) -> Result<StoredValue, Error> {
    let mut pos = 0;
    let payload_len = take_varint(data, &mut pos)? as usize;
    let payload = data
        .get(pos..pos + payload_len)
        .ok_or_else(|| Error::Engine("truncated payload".into()))?
        .to_vec();
    pos += payload_len;
    let n_children = take_varint(data, &mut pos)? as usize;
    let mut children = Vec::with_capacity(n_children.min(data.len() / 8 + 1));
    for _ in 0..n_children {
        let raw = data
            .get(pos..pos + 8)
            .ok_or_else(|| Error::Engine("truncated child list".into()))?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        children.push(u64::from_be_bytes(bytes));
        pos += 8;
    }
    if pos != data.len() {
        return Err(Error::Engine("trailing bytes after child list".into()));
    }
    Ok(StoredValue { payload, children })
}

fn encode_bucket(addrs: &[Address]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 8 * addrs.len());
    push_varint(&mut out, addrs.len() as u64);
    for addr in addrs {
        out.extend_from_slice(&addr.to_be_bytes());
    }
    out
}

fn decode_bucket(data: &[u8]) -> Result<Vec<Address>, Error> {
    let mut pos = 0;
    let n = take_varint(data, &mut pos)? as usize;
    let mut out = Vec::with_capacity(n.min(data.len() / 8 + 1));
    for _ in 0..n {
        let raw = data
            .get(pos..pos + 8)
            .ok_or_else(|| Error::Engine("truncated address list".into()))?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        out.push(u64::from_be_bytes(bytes));
        pos += 8;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_value_wire_round_trip() {
        let value = StoredValue {
            payload: b"seventeen bytes!!".to_vec(),
            children: vec![3, 9],
        };
        let encoded = encode_stored(&value);
        let back = decode_stored(&encoded).unwrap();
        assert_eq!(back.payload, value.payload);
        assert_eq!(back.children, value.children);
    }

    #[test]
    fn decode_rejects_truncation() {
        let value = StoredValue {
            payload: vec![1, 2, 3],
            children: vec![7],
        };
        let encoded = encode_stored(&value);
        for cut in 1..encoded.len() {
            assert!(decode_stored(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn second_open_contends_on_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let first = Engine::open(dir.path()).unwrap();
        match Engine::open(dir.path()) {
            Err(Error::LockContention(_)) => {}
            other => panic!("expected lock contention, got {other:?}"),
        }
        drop(first);
        Engine::open(dir.path()).unwrap();
    }
}
