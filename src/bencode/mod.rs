//! Bencode codec: the wire format shared by metainfo files and tracker
//! responses.
//!
//! Round-tripping must be byte-exact — `encode(decode(x)) == x` for any
//! canonically-encoded `x` — because the info-hash is computed over the
//! raw bytes of the `info` subtree (see [`crate::torrent::metainfo`]).
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, Decoder};
pub use encoder::{encode, encode_to_vec};

/// An arbitrary-precision bencode integer.
///
/// The grammar (`i` `-`? digit+ `e`) places no bound on magnitude, and a
/// conforming decoder must not reject a syntactically valid integer just
/// because it overflows a machine word. The canonical decimal text
/// (sign plus digits, no leading zero, no `-0`) is kept verbatim so
/// encoding is a direct byte copy and round-tripping stays byte-exact
/// regardless of magnitude.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BencodeInt(String);

impl BencodeInt {
    /// Wraps an already-canonical integer's decimal text (as produced by
    /// the decoder, which has already rejected leading zeros and `-0`).
    pub(crate) fn from_canonical(text: String) -> Self {
        BencodeInt(text)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }

    pub fn canonical_text(&self) -> &str {
        &self.0
    }
}

impl From<i64> for BencodeInt {
    fn from(v: i64) -> Self {
        BencodeInt(v.to_string())
    }
}

/// A decoded bencode value.
///
/// Dictionaries are stored in a `BTreeMap` so that iteration order is
/// always ascending by key; the encoder's canonical key-order requirement
/// then falls out of the type rather than something it has to re-derive
/// on every call.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    Bytes(Vec<u8>),
    Int(BencodeInt),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Convenience constructor for an `i64`-ranged integer, mainly used
    /// by tests and callers building requests rather than parsing them.
    pub fn int(v: i64) -> Self {
        BencodeValue::Int(BencodeInt::from(v))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => i.as_i64(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// The kind of malformation encountered while decoding, independent of
/// where it occurred.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BencodeErrorKind {
    UnexpectedEof,
    BadPrefix,
    ExpectedColon,
    ExpectedE,
    LeadingZero,
    NegativeZero,
    BadDictKeyType,
    NonCanonicalKeyOrder,
    TrailingBytes,
}

/// A decode failure, tagged with the byte offset at which it was detected.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("bencode decode error: {kind:?} at offset {offset}")]
pub struct BencodeDecodeError {
    pub kind: BencodeErrorKind,
    pub offset: usize,
}

pub type Result<T> = std::result::Result<T, BencodeDecodeError>;
