// Round-trip law for the serialization protocol: parsing what `put`
// produced yields an equivalent value and consumes every byte and child.

pub mod common;

use proptest::prelude::*;
use vcache::{Error, Get, ParseError, Put, Storable, VRef};

// A small document tree exercising scalars, strings, and recursion
// through the payload (no child references).
#[derive(Clone, Debug, PartialEq)]
enum Doc {
    Int(i64),
    Text(String),
    Flag(bool),
    List(Vec<Doc>),
}

impl Storable for Doc {
    fn put(&self, p: &mut Put) {
        match self {
            Doc::Int(v) => {
                p.put_u8(0);
                p.put_i64(*v);
            }
            Doc::Text(v) => {
                p.put_u8(1);
                v.put(p);
            }
            Doc::Flag(v) => {
                p.put_u8(2);
                v.put(p);
            }
            Doc::List(items) => {
                p.put_u8(3);
                items.put(p);
            }
        }
    }

    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        match g.get_u8()? {
            0 => Ok(Doc::Int(g.get_i64()?)),
            1 => Ok(Doc::Text(String::get(g)?)),
            2 => Ok(Doc::Flag(bool::get(g)?)),
            3 => Ok(Doc::List(Vec::get(g)?)),
            other => Err(ParseError::new(format!("bad doc tag {other}"))),
        }
    }
}

fn doc_strategy() -> impl Strategy<Value = Doc> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(Doc::Int),
        ".{0,24}".prop_map(Doc::Text),
        any::<bool>().prop_map(Doc::Flag),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop::collection::vec(inner, 0..6).prop_map(Doc::List)
    })
}

proptest! {
    #[test]
    fn round_trip(doc in doc_strategy()) {
        let (_dir, store) = common::open_store();
        let r = store.vref(&doc).unwrap();
        prop_assert_eq!(&*r.read().unwrap(), &doc);
    }

    #[test]
    fn equal_values_share_an_address(doc in doc_strategy()) {
        let (_dir, store) = common::open_store();
        let a = store.vref(&doc).unwrap();
        let b = store.vref(&doc.clone()).unwrap();
        prop_assert_eq!(a.address(), b.address());
        prop_assert!(a == b);
    }
}

// A frame of exactly 17 payload bytes and 2 children, parsed under an
// exact-consumption window.
#[derive(Debug)]
struct Frame {
    text: Vec<u8>, // always 17 bytes
    left: VRef<u64>,
    right: VRef<u64>,
}

fn put_frame(p: &mut Put, text: &[u8], left: &VRef<u64>, right: &VRef<u64>) {
    p.put_bytes(text);
    p.put_ref(left);
    p.put_ref(right);
}

impl Storable for Frame {
    fn put(&self, p: &mut Put) {
        put_frame(p, &self.text, &self.left, &self.right);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.isolate(17, 2, |g| {
            Ok(Frame {
                text: g.get_bytes(17)?.to_vec(),
                left: g.get_ref()?,
                right: g.get_ref()?,
            })
        })
    }
}

// Byte-identical serialization, but the parser claims a 16-byte window;
// storing it dedups onto the frame's address and reading must fail.
#[derive(Debug)]
struct ShortFrame {
    text: Vec<u8>,
    left: VRef<u64>,
    right: VRef<u64>,
}

impl Storable for ShortFrame {
    fn put(&self, p: &mut Put) {
        put_frame(p, &self.text, &self.left, &self.right);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.isolate(16, 2, |g| {
            Ok(ShortFrame {
                text: g.get_bytes(16)?.to_vec(),
                left: g.get_ref()?,
                right: g.get_ref()?,
            })
        })
    }
}

// Byte-identical again, one child short.
#[derive(Debug)]
struct OneChildFrame {
    text: Vec<u8>,
    left: VRef<u64>,
    right: VRef<u64>,
}

impl Storable for OneChildFrame {
    fn put(&self, p: &mut Put) {
        put_frame(p, &self.text, &self.left, &self.right);
    }
    fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
        g.isolate(17, 1, |g| {
            let text = g.get_bytes(17)?.to_vec();
            let left = g.get_ref()?;
            let right = g.get_ref()?;
            Ok(OneChildFrame { text, left, right })
        })
    }
}

#[test]
fn isolate_parses_an_exact_frame() {
    let (_dir, store) = common::open_store();
    let left = store.vref(&1u64).unwrap();
    let right = store.vref(&2u64).unwrap();
    let frame = Frame {
        text: b"seventeen bytes!!".to_vec(),
        left,
        right,
    };
    let r = store.vref(&frame).unwrap();
    let back = r.read().unwrap();
    assert_eq!(back.text, frame.text);
    assert_eq!(*back.left.read().unwrap(), 1);
    assert_eq!(*back.right.read().unwrap(), 2);
}

#[test]
fn isolate_rejects_wrong_windows() {
    let (_dir, store) = common::open_store();
    let left = store.vref(&1u64).unwrap();
    let right = store.vref(&2u64).unwrap();
    let text = b"seventeen bytes!!".to_vec();

    let good = store
        .vref(&Frame {
            text: text.clone(),
            left: left.clone(),
            right: right.clone(),
        })
        .unwrap();

    let short = store
        .vref(&ShortFrame {
            text: text.clone(),
            left: left.clone(),
            right: right.clone(),
        })
        .unwrap();
    // Same bytes, same address, distinct typed handle and cache slot.
    assert_eq!(short.address(), good.address());
    let err = short.read();
    assert!(matches!(err, Err(Error::Parse(_))), "got {err:?}");

    let one_child = store
        .vref(&OneChildFrame { text, left, right })
        .unwrap();
    assert_eq!(one_child.address(), good.address());
    let err = one_child.read();
    assert!(matches!(err, Err(Error::Parse(_))), "got {err:?}");

    // The correct window still parses; the failures left no residue.
    assert_eq!(good.read().unwrap().text, b"seventeen bytes!!");
}

#[test]
fn alternative_recovers_across_encodings() {
    // A value written under an older single-byte layout and a newer
    // varint one; the reader tries new-then-old.
    #[derive(Debug, PartialEq)]
    struct Versioned(u64);

    impl Storable for Versioned {
        fn put(&self, p: &mut Put) {
            p.put_u8(1);
            p.put_varint(self.0);
        }
        fn get(g: &mut Get<'_>) -> Result<Self, ParseError> {
            g.or_else(
                |g| match g.get_u8()? {
                    1 => Ok(Versioned(g.get_varint()?)),
                    _ => Err(ParseError::new("not the varint layout")),
                },
                |g| {
                    match g.get_u8()? {
                        0 => Ok(Versioned(u64::from(g.get_u8()?))),
                        other => Err(ParseError::new(format!("unknown layout {other}"))),
                    }
                },
            )
        }
    }

    let (_dir, store) = common::open_store();
    let r = store.vref(&Versioned(300)).unwrap();
    assert_eq!(*r.read().unwrap(), Versioned(300));
}
