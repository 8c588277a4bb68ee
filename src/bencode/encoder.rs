//! Canonical bencode encoder.
//!
//! Dict keys are always emitted in ascending order (guaranteed by
//! `BencodeValue::Dict`'s `BTreeMap` backing), integers never carry a
//! leading zero or a `-0`, and the output is the byte-exact canonical
//! encoding of the value — the inverse of [`crate::bencode::decode`] for
//! any canonically-encoded input.
use super::{BencodeInt, BencodeValue};
use std::collections::BTreeMap;
use std::io::{self, Write};

fn encode_bytes<W: Write>(writer: &mut W, s: &[u8]) -> io::Result<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)
}

fn encode_int<W: Write>(writer: &mut W, i: &BencodeInt) -> io::Result<()> {
    write!(writer, "i{}e", i.canonical_text())
}

fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> io::Result<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")
}

fn encode_dict<W: Write>(writer: &mut W, dict: &BTreeMap<Vec<u8>, BencodeValue>) -> io::Result<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_bytes(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> io::Result<()> {
    match value {
        BencodeValue::Bytes(s) => encode_bytes(writer, s),
        BencodeValue::Int(i) => encode_int(writer, i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes `value` into `writer`.
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> io::Result<()> {
    encode_value(writer, value)
}

/// Encodes `value` into a freshly allocated `Vec<u8>`.
pub fn encode_to_vec(value: &BencodeValue) -> Vec<u8> {
    let mut buf = Vec::new();
    // `Vec<u8>`'s `Write` impl never fails.
    encode(&mut buf, value).expect("encoding into a Vec cannot fail");
    buf
}
