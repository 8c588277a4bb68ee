//! Single-pass recursive-descent bencode reader.
use super::{BencodeDecodeError, BencodeErrorKind, BencodeInt, BencodeValue, Result};
use std::collections::BTreeMap;

/// A cursor over a byte slice, used both for the public [`decode`]
/// entry point and internally by the metainfo loader, which needs to
/// capture the raw byte span of the `info` subtree while it walks the
/// top-level dict (see `torrent::metainfo`).
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn err(&self, kind: BencodeErrorKind) -> BencodeDecodeError {
        BencodeDecodeError {
            kind,
            offset: self.pos,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn advance(&mut self) -> Result<u8> {
        let b = self.peek().ok_or_else(|| self.err(BencodeErrorKind::UnexpectedEof))?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, byte: u8, kind: BencodeErrorKind) -> Result<()> {
        let got = self.advance()?;
        if got != byte {
            self.pos -= 1;
            return Err(self.err(kind));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(self.err(BencodeErrorKind::UnexpectedEof));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Decodes one bencode value starting at the current position.
    pub fn decode_value(&mut self) -> Result<BencodeValue> {
        match self.peek().ok_or_else(|| self.err(BencodeErrorKind::UnexpectedEof))? {
            b'i' => self.decode_integer().map(BencodeValue::Int),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            b'0'..=b'9' => self.decode_bytestring().map(BencodeValue::Bytes),
            _ => Err(self.err(BencodeErrorKind::BadPrefix)),
        }
    }

    /// Like [`Self::decode_value`] but also returns the byte span (start,
    /// end) the value occupied in the source buffer, so callers can hash
    /// the exact bytes a producer emitted rather than a re-serialization.
    pub fn decode_value_spanned(&mut self) -> Result<(BencodeValue, (usize, usize))> {
        let start = self.pos;
        let value = self.decode_value()?;
        Ok((value, (start, self.pos)))
    }

    pub fn source(&self) -> &'a [u8] {
        self.data
    }

    /// Walks a top-level dict looking for `key`, returning the byte span
    /// of its value without decoding the values of unrelated keys.
    ///
    /// Used by the metainfo loader to hash the raw bytes of the `info`
    /// subtree rather than a re-serialization of it. Assumes the buffer
    /// has already been validated by [`decode`] — it does not re-check
    /// canonical key order.
    pub fn dict_value_span(&mut self, key: &[u8]) -> Result<Option<(usize, usize)>> {
        self.expect(b'd', BencodeErrorKind::BadPrefix)?;
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(None);
                }
                Some(b'0'..=b'9') => {
                    let k = self.decode_bytestring()?;
                    if k == key {
                        let (_, span) = self.decode_value_spanned()?;
                        return Ok(Some(span));
                    }
                    self.decode_value()?;
                }
                Some(_) => return Err(self.err(BencodeErrorKind::BadDictKeyType)),
                None => return Err(self.err(BencodeErrorKind::UnexpectedEof)),
            }
        }
    }

    fn decode_bytestring(&mut self) -> Result<Vec<u8>> {
        let len = self.decode_length()?;
        self.expect(b':', BencodeErrorKind::ExpectedColon)?;
        Ok(self.take(len)?.to_vec())
    }

    /// Parses the decimal length prefix of a byte string. A leading `0`
    /// is only valid for the literal length `0`.
    fn decode_length(&mut self) -> Result<usize> {
        let first = self.advance()?;
        if !first.is_ascii_digit() {
            return Err(self.err(BencodeErrorKind::BadPrefix));
        }
        if first == b'0' {
            if matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.err(BencodeErrorKind::LeadingZero));
            }
            return Ok(0);
        }
        let mut value: usize = (first - b'0') as usize;
        while let Some(b) = self.peek() {
            if !b.is_ascii_digit() {
                break;
            }
            self.pos += 1;
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as usize))
                .ok_or_else(|| self.err(BencodeErrorKind::BadPrefix))?;
        }
        Ok(value)
    }

    /// Parses an `i<digits>e` integer into its canonical decimal text,
    /// without bounding its magnitude to any machine word — the grammar
    /// itself places no such bound, and a conforming decoder must accept
    /// arbitrarily large values.
    fn decode_integer(&mut self) -> Result<BencodeInt> {
        self.expect(b'i', BencodeErrorKind::BadPrefix)?;

        let negative = if self.peek() == Some(b'-') {
            self.pos += 1;
            true
        } else {
            false
        };

        let digits_start = self.pos;
        let first = self.advance()?;
        if !first.is_ascii_digit() {
            return Err(self.err(BencodeErrorKind::BadPrefix));
        }
        while let Some(b) = self.peek() {
            if !b.is_ascii_digit() {
                break;
            }
            self.pos += 1;
        }
        let digits = &self.data[digits_start..self.pos];

        if digits == b"0" && negative {
            return Err(self.err(BencodeErrorKind::NegativeZero));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(self.err(BencodeErrorKind::LeadingZero));
        }

        self.expect(b'e', BencodeErrorKind::ExpectedE)?;

        let text = std::str::from_utf8(digits).map_err(|_| self.err(BencodeErrorKind::BadPrefix))?;
        let canonical = if negative { format!("-{text}") } else { text.to_string() };
        Ok(BencodeInt::from_canonical(canonical))
    }

    fn decode_list(&mut self) -> Result<Vec<BencodeValue>> {
        self.expect(b'l', BencodeErrorKind::BadPrefix)?;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => items.push(self.decode_value()?),
                None => return Err(self.err(BencodeErrorKind::UnexpectedEof)),
            }
        }
        Ok(items)
    }

    fn decode_dict(&mut self) -> Result<BTreeMap<Vec<u8>, BencodeValue>> {
        self.expect(b'd', BencodeErrorKind::BadPrefix)?;
        let mut dict = BTreeMap::new();
        let mut prev_key: Option<Vec<u8>> = None;
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(b'0'..=b'9') => {
                    let key = self.decode_bytestring()?;
                    if let Some(prev) = &prev_key {
                        if key <= *prev {
                            return Err(self.err(BencodeErrorKind::NonCanonicalKeyOrder));
                        }
                    }
                    let value = self.decode_value()?;
                    prev_key = Some(key.clone());
                    dict.insert(key, value);
                }
                Some(_) => return Err(self.err(BencodeErrorKind::BadDictKeyType)),
                None => return Err(self.err(BencodeErrorKind::UnexpectedEof)),
            }
        }
        Ok(dict)
    }
}

/// Decodes a whole buffer as a single top-level bencode value, rejecting
/// any trailing bytes after it.
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let mut decoder = Decoder::new(data);
    let value = decoder.decode_value()?;
    if decoder.pos() != data.len() {
        return Err(BencodeDecodeError {
            kind: BencodeErrorKind::TrailingBytes,
            offset: decoder.pos(),
        });
    }
    Ok(value)
}
