//! Serialization protocol for stored values.
//!
//! A value's on-disk form is a pair: an opaque payload byte string and an
//! ordered list of child addresses. The two are strictly disjoint so the
//! garbage collector can walk outgoing references without parsing payloads.
//! [`Put`] builds the pair, [`Get`] parses it back; [`Storable`] ties a type
//! to its deterministic put/get pair.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::space::SpaceHandle;
use crate::transaction::PVar;
use crate::{Address, VRef};

/// Failure while parsing a stored value.
///
/// Recoverable inside [`Get::or_else`]; anywhere else it surfaces through
/// [`crate::Error::Parse`].
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
#[error("{msg}")]
pub struct ParseError {
    msg: String,
}

impl ParseError {
    /// A failure with the given message; used by `Storable`
    /// implementations to signal malformed input.
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

impl fmt::Debug for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseError({})", self.msg)
    }
}

/// A type that declares a deterministic put/get pair and can therefore be
/// stored in a [`crate::VCache`].
///
/// The round-trip law: `get` applied to the output of `put` must yield an
/// equivalent value, consuming exactly the bytes and children `put` produced.
pub trait Storable: Sized + Send + Sync + 'static {
    /// Serialize `self` into the builder.
    fn put(&self, p: &mut Put);
    /// Parse a value back out of the cursor.
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError>;
}

// A child reference recorded during `put`. The strong handle rides along so
// the referenced cell cannot be finalized while the parent's bytes sit in
// the writer queue.
pub(crate) struct ChildRef {
    pub(crate) addr: Address,
    pub(crate) keep: Arc<dyn Any + Send + Sync>,
}

/// Append-only builder for one value's serialized form.
///
/// The byte buffer grows geometrically; [`Put::reserve`] requests at least
/// `n` writable bytes up front. Building is total: it cannot fail.
pub struct Put {
    buf: Vec<u8>,
    children: Vec<ChildRef>,
}

impl fmt::Debug for Put {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Put")
            .field("bytes", &self.buf.len())
            .field("children", &self.children.len())
            .finish()
    }
}

impl Default for Put {
    fn default() -> Self {
        Self::new()
    }
}

impl Put {
    /// Empty builder.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Ensure at least `n` more bytes can be written without reallocating.
    pub fn reserve(&mut self, n: usize) {
        self.buf.reserve(n);
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.children.is_empty()
    }

    /// Append a single byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Append raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append a fixed-width big-endian `u16`.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a fixed-width big-endian `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a fixed-width big-endian `u64`.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a fixed-width big-endian `i64`.
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append an unsigned LEB128 varint.
    pub fn put_varint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Append a reference to another stored value as a child.
    ///
    /// Only the child's position in the child list lands in the serialized
    /// form; its address never appears among the payload bytes.
    pub fn put_ref<T: Storable>(&mut self, r: &VRef<T>) {
        self.children.push(ChildRef {
            addr: r.address(),
            keep: r.keep_alive(),
        });
    }

    /// Append a reference to a persistent variable as a child.
    pub fn put_pvar<T: Storable>(&mut self, pv: &PVar<T>) {
        self.children.push(ChildRef {
            addr: pv.address(),
            keep: pv.keep_alive(),
        });
    }

    pub(crate) fn finish(self) -> (Vec<u8>, Vec<ChildRef>) {
        (self.buf, self.children)
    }
}

/// Recursive-descent parser over one value's serialized form.
///
/// The payload cursor is bounded by a limit and the incoming child addresses
/// by a window; [`Get::isolate`] narrows both for a sub-parse and fails
/// unless it is consumed exactly.
pub struct Get<'a> {
    space: &'a SpaceHandle,
    data: &'a [u8],
    pos: usize,
    limit: usize,
    children: &'a [Address],
    cpos: usize,
    climit: usize,
}

impl fmt::Debug for Get<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Get")
            .field("pos", &self.pos)
            .field("limit", &self.limit)
            .field("cpos", &self.cpos)
            .field("climit", &self.climit)
            .finish()
    }
}

impl<'a> Get<'a> {
    pub(crate) fn new(space: &'a SpaceHandle, data: &'a [u8], children: &'a [Address]) -> Self {
        Self {
            space,
            data,
            pos: 0,
            limit: data.len(),
            children,
            cpos: 0,
            climit: children.len(),
        }
    }

    /// Payload bytes left before the current limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Child addresses left in the current window.
    pub fn remaining_children(&self) -> usize {
        self.climit - self.cpos
    }

    /// Read `n` raw bytes.
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::new(format!(
                "need {n} bytes, {} remain",
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read one byte.
    pub fn get_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.get_bytes(1)?[0])
    }

    /// Read a fixed-width big-endian `u16`.
    pub fn get_u16(&mut self) -> Result<u16, ParseError> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a fixed-width big-endian `u32`.
    pub fn get_u32(&mut self) -> Result<u32, ParseError> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a fixed-width big-endian `u64`.
    pub fn get_u64(&mut self) -> Result<u64, ParseError> {
        let b = self.get_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read a fixed-width big-endian `i64`.
    pub fn get_i64(&mut self) -> Result<i64, ParseError> {
        self.get_u64().map(|v| v as i64)
    }

    /// Read an unsigned LEB128 varint.
    pub fn get_varint(&mut self) -> Result<u64, ParseError> {
        let mut out: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.get_u8()?;
            if shift == 63 && byte > 1 {
                return Err(ParseError::new("varint overflows u64"));
            }
            out |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(out);
            }
            shift += 7;
            if shift > 63 {
                return Err(ParseError::new("varint longer than 10 bytes"));
            }
        }
    }

    /// Consume the next child address as a typed reference.
    pub fn get_ref<T: Storable>(&mut self) -> Result<VRef<T>, ParseError> {
        let addr = self.next_child()?;
        Ok(self.space.handle_at::<T>(addr))
    }

    /// Consume the next child address as a persistent variable.
    pub fn get_pvar<T: Storable>(&mut self) -> Result<PVar<T>, ParseError> {
        let addr = self.next_child()?;
        self.space
            .pvar_at::<T>(addr)
            .map_err(|_| ParseError::new(format!("pvar at {addr} is of another type")))
    }

    fn next_child(&mut self) -> Result<Address, ParseError> {
        if self.cpos >= self.climit {
            return Err(ParseError::new("no child reference left"));
        }
        let addr = self.children[self.cpos];
        self.cpos += 1;
        Ok(addr)
    }

    /// Run `f` against exactly `n` payload bytes and `k` children.
    ///
    /// Fails if fewer are available, or if `f` leaves any of either behind.
    pub fn isolate<T>(
        &mut self,
        n: usize,
        k: usize,
        f: impl FnOnce(&mut Get<'a>) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.remaining() < n {
            return Err(ParseError::new(format!(
                "isolate wants {n} bytes, {} remain",
                self.remaining()
            )));
        }
        if self.remaining_children() < k {
            return Err(ParseError::new(format!(
                "isolate wants {k} children, {} remain",
                self.remaining_children()
            )));
        }
        let (outer_limit, outer_climit) = (self.limit, self.climit);
        self.limit = self.pos + n;
        self.climit = self.cpos + k;
        let out = f(self);
        let fully_consumed = self.pos == self.limit && self.cpos == self.climit;
        // Restore the outer bounds before reporting, also on failure paths,
        // so an enclosing `or_else` can retry from a coherent state.
        self.pos = self.limit;
        self.cpos = self.climit;
        self.limit = outer_limit;
        self.climit = outer_climit;
        let out = out?;
        if !fully_consumed {
            return Err(ParseError::new("isolate left unconsumed input"));
        }
        Ok(out)
    }

    /// Try `first`; on failure restore the cursor and try `second`.
    pub fn or_else<T>(
        &mut self,
        first: impl FnOnce(&mut Get<'a>) -> Result<T, ParseError>,
        second: impl FnOnce(&mut Get<'a>) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        let (pos, cpos) = (self.pos, self.cpos);
        match first(self) {
            Ok(v) => Ok(v),
            Err(_) => {
                self.pos = pos;
                self.cpos = cpos;
                second(self)
            }
        }
    }

    // Leftover input after a top-level parse is a protocol violation, same
    // as inside `isolate`.
    pub(crate) fn finish(&self) -> Result<(), ParseError> {
        if self.pos != self.limit {
            return Err(ParseError::new(format!(
                "{} payload bytes left after parse",
                self.remaining()
            )));
        }
        if self.cpos != self.climit {
            return Err(ParseError::new(format!(
                "{} child references left after parse",
                self.remaining_children()
            )));
        }
        Ok(())
    }
}

impl Storable for () {
    fn put(&self, _p: &mut Put) {}
    fn get(_g: &mut Get<'_>) -> Result<Self, ParseError> {
        Ok(())
    }
}

impl Storable for bool {
    fn put(&self, p: &mut Put) {
        p.put_u8(u8::from(*self));
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        match g.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ParseError::new(format!("bad bool byte {other:#x}"))),
        }
    }
}

impl Storable for u8 {
    fn put(&self, p: &mut Put) {
        p.put_u8(*self);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.get_u8()
    }
}

impl Storable for u16 {
    fn put(&self, p: &mut Put) {
        p.put_u16(*self);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.get_u16()
    }
}

impl Storable for u32 {
    fn put(&self, p: &mut Put) {
        p.put_u32(*self);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.get_u32()
    }
}

impl Storable for u64 {
    fn put(&self, p: &mut Put) {
        p.put_u64(*self);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.get_u64()
    }
}

impl Storable for i64 {
    fn put(&self, p: &mut Put) {
        p.put_i64(*self);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.get_i64()
    }
}

impl Storable for String {
    fn put(&self, p: &mut Put) {
        p.put_varint(self.len() as u64);
        p.put_bytes(self.as_bytes());
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        let len = g.get_varint()? as usize;
        let bytes = g.get_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::new("string is not utf-8"))
    }
}

impl<T: Storable> Storable for Option<T> {
    fn put(&self, p: &mut Put) {
        match self {
            None => p.put_u8(0),
            Some(v) => {
                p.put_u8(1);
                v.put(p);
            }
        }
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        match g.get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::get(g)?)),
            other => Err(ParseError::new(format!("bad option tag {other:#x}"))),
        }
    }
}

impl<T: Storable> Storable for Vec<T> {
    fn put(&self, p: &mut Put) {
        p.put_varint(self.len() as u64);
        for item in self {
            item.put(p);
        }
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        let len = g.get_varint()? as usize;
        // Bounded pre-allocation: a corrupt length must not OOM the reader.
        let mut out = Vec::with_capacity(len.min(g.remaining() + 1));
        for _ in 0..len {
            out.push(T::get(g)?);
        }
        Ok(out)
    }
}

impl<A: Storable, B: Storable> Storable for (A, B) {
    fn put(&self, p: &mut Put) {
        self.0.put(p);
        self.1.put(p);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        Ok((A::get(g)?, B::get(g)?))
    }
}

impl<T: Storable> Storable for VRef<T> {
    fn put(&self, p: &mut Put) {
        p.put_ref(self);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.get_ref()
    }
}

impl<T: Storable> Storable for PVar<T> {
    fn put(&self, p: &mut Put) {
        p.put_pvar(self);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.get_pvar()
    }
}
