//! Persistent content-addressed value store with transactional variables.
//!
//! Values larger than RAM page in from a memory-mapped key-value engine on
//! demand; equal values deduplicate to one on-disk address and one shared
//! in-memory cache slot. Two kinds of handle are exposed: [`VRef`], an
//! immutable reference to a content-addressed value, and [`PVar`], a named
//! mutable cell updated through [`atomically`] transactions and committed
//! by a single background writer.

/// Identifier of a stored value; `0` is the reserved null sentinel.
pub type Address = u64;

// 128-bit truncation of a BLAKE3 digest over the serialized form. Stable
// across runs and platforms, which the content index on disk requires.
pub(crate) type VHash = [u8; 16];

pub(crate) fn content_hash(payload: &[u8], children: &[Address]) -> VHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(payload);
    for child in children {
        hasher.update(&child.to_be_bytes());
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    out
}

// One value's serialized form: opaque payload bytes plus the ordered child
// addresses, kept strictly apart so reference walks never parse payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StoredValue {
    pub(crate) payload: Vec<u8>,
    pub(crate) children: Vec<Address>,
}

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A stored value failed to parse back into its declared type.
    #[error("parse error: {0}")]
    Parse(#[from] crate::codec::ParseError),
    /// An address is already bound to a variable of another type.
    #[error("address {addr} is bound to a variable of another type")]
    TypeMismatch {
        /// The contested address.
        addr: Address,
    },
    /// The backing engine refused a write for lack of space.
    #[error("backing store is full")]
    StoreFull,
    /// Another opener holds the store's exclusive lock.
    #[error("store is locked by another process: {0}")]
    LockContention(String),
    /// A backing-engine failure.
    #[error("backing engine: {0}")]
    Engine(String),
    /// A broken internal invariant; the writer halts on these.
    #[error("internal invariant violated: {0}")]
    Internal(String),
    /// The writer halted earlier; the original failure is attached.
    #[error("writer halted: {0}")]
    WriterHalted(String),
    /// Transaction conflict. [`atomically`] retries these itself; user
    /// code only needs to propagate it.
    #[error("transaction conflict")]
    Conflict,
}

mod cache;
pub use cache::CachePolicy;
mod codec;
pub use codec::{Get, ParseError, Put, Storable};
mod engine;
mod memory;
mod space;
pub use space::{Config, Stats, VCache, VRef};
mod stm;
pub use stm::TVar;
mod transaction;
pub use transaction::{atomically, Durability, PVar, VTx};
mod writer;
