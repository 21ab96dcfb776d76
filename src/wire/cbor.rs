//! # Streaming CBOR Item Codec
//!
//! The variable-length message bodies are streams of CBOR items consumed
//! one at a time by state machines that may suspend between any two bytes.
//! A document-oriented decoder cannot serve that model: the receiver must
//! know, after the *first* byte of an item, exactly how many more bytes
//! complete the item header, buffer only those, and decide what to do with
//! the payload before it arrives. This module provides that incremental
//! header scanner, plus the small set of encoders the send path needs.
//!
//! ## Decode Side
//!
//! Decoding is split to match the receiver's states:
//!
//! 1. read one byte, call [`extra_bytes`] to learn the header remainder;
//! 2. read the remainder, call [`decode_item`] to classify;
//! 3. for strings, route the following `payload_len` bytes to whatever
//!    destination the dispatch picked.
//!
//! ## Encode Side
//!
//! The sender mostly copies scanned bytes verbatim; the `emit_*` helpers
//! cover the items it must synthesize (translated references, expanded
//! optimized parameters, file-stream metadata, array framing). Encoding is
//! delegated to `minicbor`, which always produces the canonical shortest
//! form.
//!
//! ## Supported Subset
//!
//! Unsigned and negative integers, definite-length byte/text strings,
//! definite and indefinite arrays, booleans, floats, semantic tags, and the
//! break marker. Maps, indefinite strings, and the remaining simple values
//! classify as [`ItemKind::Invalid`]; the receiver's dispatch turns those
//! into a peer-fatal format error.

use crate::error::ProxyError;
use crate::wire::SemanticTag;
use minicbor::data::Tag;
use minicbor::Encoder;

/// The initial byte of an indefinite-length array.
pub const INDEF_ARRAY_HEADER: u8 = 0x9F;

/// The break marker closing an indefinite-length collection.
pub const BREAK: u8 = 0xFF;

/// Largest possible item header: initial byte plus an 8-byte argument.
pub const MAX_HEADER_SIZE: usize = 9;

/// Classification of a decoded item header, aligned with the receiver's
/// dispatch-table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Major type 0.
    PosInt,
    /// Major type 1; `value` holds the raw argument (encoded as `-1 - n`).
    NegInt,
    /// Major type 2, definite length.
    ByteString,
    /// Major type 3, definite length.
    TextString,
    /// Major type 4, definite or indefinite.
    Array,
    /// Major type 6; `value` holds the tag number.
    Tag,
    /// Simple values true/false.
    Boolean,
    /// Half/single/double-precision floats (copied opaquely).
    Double,
    /// The break marker.
    Break,
    /// Anything the protocol subset does not admit (maps, indefinite
    /// strings, null/undefined, other simple values).
    Invalid,
}

/// A fully decoded item header.
///
/// `header` retains the exact wire bytes so direct-copy handlers can
/// replay them without re-encoding (round-trip identity depends on this).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub kind: ItemKind,
    /// The header argument: integer value, string/array length, or tag
    /// number, depending on `kind`. Zero when the header carries none.
    pub value: u64,
    /// True for an indefinite-length array header.
    pub indefinite: bool,
    header: [u8; MAX_HEADER_SIZE],
    header_len: usize,
}

impl Item {
    /// The exact bytes this header occupied on the wire.
    pub fn header_bytes(&self) -> &[u8] {
        &self.header[..self.header_len]
    }

    /// Payload bytes that follow this header (strings only).
    pub fn payload_len(&self) -> usize {
        match self.kind {
            ItemKind::ByteString | ItemKind::TextString => self.value as usize,
            _ => 0,
        }
    }
}

/// Given the initial byte of an item, return how many further bytes belong
/// to the header (0, 1, 2, 4 or 8). Reserved additional-info values are a
/// format error.
pub fn extra_bytes(initial: u8) -> Result<usize, ProxyError> {
    match initial & 0x1F {
        0..=23 | 31 => Ok(0),
        24 => Ok(1),
        25 => Ok(2),
        26 => Ok(4),
        27 => Ok(8),
        ai => Err(ProxyError::format(format!(
            "reserved CBOR additional-info {ai}"
        ))),
    }
}

/// Decode a complete item header (`1 + extra_bytes(first)` bytes).
pub fn decode_item(raw: &[u8]) -> Result<Item, ProxyError> {
    debug_assert!(!raw.is_empty() && raw.len() <= MAX_HEADER_SIZE);
    let initial = raw[0];
    let major = initial >> 5;
    let ai = initial & 0x1F;

    // The argument value, big-endian over the trailing header bytes.
    let value: u64 = if ai < 24 {
        u64::from(ai)
    } else {
        let mut v: u64 = 0;
        for &b in &raw[1..] {
            v = (v << 8) | u64::from(b);
        }
        v
    };

    let indefinite = ai == 31;
    let kind = match (major, ai) {
        (0, _) => ItemKind::PosInt,
        (1, _) => ItemKind::NegInt,
        (2, 31) | (3, 31) => ItemKind::Invalid, // indefinite strings unsupported
        (2, _) => ItemKind::ByteString,
        (3, _) => ItemKind::TextString,
        (4, _) => ItemKind::Array,
        (5, _) => ItemKind::Invalid, // maps unsupported
        (6, _) => ItemKind::Tag,
        (7, 20) | (7, 21) => ItemKind::Boolean,
        (7, 25) | (7, 26) | (7, 27) => ItemKind::Double,
        (7, 31) => ItemKind::Break,
        (7, _) => ItemKind::Invalid,
        _ => unreachable!("major type is three bits"),
    };

    let mut header = [0u8; MAX_HEADER_SIZE];
    header[..raw.len()].copy_from_slice(raw);
    Ok(Item {
        kind,
        // Booleans carry their truth value in the additional info.
        value: if kind == ItemKind::Boolean {
            u64::from(ai == 21)
        } else {
            value
        },
        indefinite,
        header,
        header_len: raw.len(),
    })
}

/// Internal shorthand: encoding into a `Vec` cannot fail.
macro_rules! enc {
    ($out:expr, $op:ident ( $($arg:expr),* )) => {{
        let mut e = Encoder::new($out);
        e.$op($($arg),*).expect("Vec writer is infallible");
    }};
}

/// Emit a semantic tag header.
pub fn emit_tag(out: &mut Vec<u8>, tag: SemanticTag) {
    enc!(out, tag(Tag::new(tag as u64)));
}

/// Emit an unsigned integer in canonical shortest form.
pub fn emit_uint(out: &mut Vec<u8>, value: u64) {
    enc!(out, u64(value));
}

/// Emit a signed integer (negative values use major type 1).
pub fn emit_int(out: &mut Vec<u8>, value: i64) {
    enc!(out, i64(value));
}

/// Emit a definite-length byte string, header and payload.
pub fn emit_bytes(out: &mut Vec<u8>, data: &[u8]) {
    enc!(out, bytes(data));
}

/// Emit a definite-length text string, header and payload.
pub fn emit_text(out: &mut Vec<u8>, data: &str) {
    enc!(out, str(data));
}

/// Open an indefinite-length array.
pub fn emit_array_begin(out: &mut Vec<u8>) {
    out.push(INDEF_ARRAY_HEADER);
}

/// Close the innermost indefinite-length collection.
pub fn emit_break(out: &mut Vec<u8>) {
    out.push(BREAK);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(bytes: &[u8]) -> Item {
        let extra = extra_bytes(bytes[0]).unwrap();
        decode_item(&bytes[..1 + extra]).unwrap()
    }

    #[test]
    fn scans_small_and_wide_integers() {
        let item = scan(&[0x0A]);
        assert_eq!(item.kind, ItemKind::PosInt);
        assert_eq!(item.value, 10);
        assert_eq!(item.header_bytes(), &[0x0A]);

        let item = scan(&[0x19, 0x01, 0x00]);
        assert_eq!(item.kind, ItemKind::PosInt);
        assert_eq!(item.value, 256);

        let item = scan(&[0x3B, 0, 0, 0, 0, 0, 0, 0, 9]);
        assert_eq!(item.kind, ItemKind::NegInt);
        assert_eq!(item.value, 9);
    }

    #[test]
    fn scans_strings_and_arrays() {
        let item = scan(&[0x45]); // bstr of 5
        assert_eq!(item.kind, ItemKind::ByteString);
        assert_eq!(item.payload_len(), 5);

        let item = scan(&[0x78, 0x20]); // tstr of 32
        assert_eq!(item.kind, ItemKind::TextString);
        assert_eq!(item.payload_len(), 32);

        let item = scan(&[0x83]); // definite array of 3
        assert_eq!(item.kind, ItemKind::Array);
        assert!(!item.indefinite);

        let item = scan(&[INDEF_ARRAY_HEADER]);
        assert_eq!(item.kind, ItemKind::Array);
        assert!(item.indefinite);

        let item = scan(&[BREAK]);
        assert_eq!(item.kind, ItemKind::Break);
    }

    #[test]
    fn rejects_reserved_and_unsupported_shapes() {
        assert!(extra_bytes(0x1C).is_err()); // ai 28 reserved
        assert_eq!(scan(&[0xA1]).kind, ItemKind::Invalid); // map
        assert_eq!(scan(&[0x5F]).kind, ItemKind::Invalid); // indefinite bstr
        assert_eq!(scan(&[0xF6]).kind, ItemKind::Invalid); // null
    }

    #[test]
    fn booleans_carry_truth_in_value() {
        assert_eq!(scan(&[0xF4]).value, 0);
        assert_eq!(scan(&[0xF5]).value, 1);
    }

    #[test]
    fn encoders_produce_scannable_items() {
        let mut out = Vec::new();
        emit_tag(&mut out, SemanticTag::Reference);
        emit_uint(&mut out, 300);
        let item = scan(&out);
        assert_eq!(item.kind, ItemKind::Tag);
        assert_eq!(item.value, SemanticTag::Reference as u64);
        let rest = &out[item.header_bytes().len()..];
        let item = scan(rest);
        assert_eq!(item.kind, ItemKind::PosInt);
        assert_eq!(item.value, 300);
    }

    #[test]
    fn emitted_strings_round_trip_headers() {
        let mut out = Vec::new();
        emit_bytes(&mut out, b"hello");
        let item = scan(&out);
        assert_eq!(item.kind, ItemKind::ByteString);
        assert_eq!(item.payload_len(), 5);
        assert_eq!(&out[item.header_bytes().len()..], b"hello");
    }

    #[test]
    fn canonical_uint_widths() {
        let mut out = Vec::new();
        emit_uint(&mut out, 23);
        assert_eq!(out, vec![0x17]);
        out.clear();
        emit_uint(&mut out, 24);
        assert_eq!(out, vec![0x18, 24]);
        out.clear();
        emit_uint(&mut out, 65536);
        assert_eq!(out, vec![0x1A, 0, 1, 0, 0]);
    }
}
