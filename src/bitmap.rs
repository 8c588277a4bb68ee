//! A fixed-length bit array with wire-compatible layout.
//!
//! Bit index 0 is the high bit of byte 0 (most-significant-bit first) —
//! this matches the BITFIELD message payload exactly, so a `Bitmap`'s
//! backing buffer can be sent on the wire without any reshuffling.
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bitmap buffer length mismatch: expected {expected} bytes, got {got}")]
pub struct BitmapLoadError {
    pub expected: usize,
    pub got: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    buffer: Vec<u8>,
    length: usize,
    num_set_bits: usize,
}

impl Bitmap {
    /// Creates an all-zero bitmap of `length` bits.
    pub fn new(length: usize) -> Self {
        Self {
            buffer: vec![0u8; length.div_ceil(8)],
            length,
            num_set_bits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn num_set_bits(&self) -> usize {
        self.num_set_bits
    }

    /// The raw backing buffer, suitable for sending as a BITFIELD payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn locate(&self, index: usize) -> Option<(usize, u8)> {
        if index >= self.length {
            return None;
        }
        let byte_idx = index / 8;
        let mask = 1u8 << (7 - (index % 8));
        Some((byte_idx, mask))
    }

    /// Returns `false` for any index `>= len()` instead of panicking, so
    /// scheduler set-intersection queries don't need bounds-checking at
    /// every call site.
    pub fn contains(&self, index: usize) -> bool {
        self.get(index).unwrap_or(false)
    }

    pub fn get(&self, index: usize) -> Option<bool> {
        self.locate(index).map(|(byte_idx, mask)| self.buffer[byte_idx] & mask != 0)
    }

    /// Sets or clears bit `index`, updating the popcount in O(1) by
    /// diffing the old and new bit rather than rescanning the buffer.
    ///
    /// Panics if `index >= len()` — unlike `contains`, mutation out of
    /// range is a programmer error, not a query that should degrade
    /// gracefully.
    pub fn set(&mut self, index: usize, value: bool) {
        let (byte_idx, mask) = self
            .locate(index)
            .unwrap_or_else(|| panic!("bitmap index {index} out of range (len {})", self.length));
        let was_set = self.buffer[byte_idx] & mask != 0;
        if value {
            self.buffer[byte_idx] |= mask;
        } else {
            self.buffer[byte_idx] &= !mask;
        }
        match (was_set, value) {
            (false, true) => self.num_set_bits += 1,
            (true, false) => self.num_set_bits -= 1,
            _ => {}
        }
    }

    /// Bulk-replaces the backing buffer, e.g. from a BITFIELD payload.
    ///
    /// Masks any padding bits (positions `>= len()` in the trailing byte)
    /// to zero and recomputes the popcount with a single pass, rather
    /// than trusting the sender. This is the *only* sanctioned way to
    /// replace the buffer wholesale — assigning the raw payload directly
    /// would silently carry over a stale or malicious popcount.
    pub fn load_from_bytes(&mut self, buf: &[u8]) -> Result<(), BitmapLoadError> {
        let expected = self.length.div_ceil(8);
        if buf.len() != expected {
            return Err(BitmapLoadError {
                expected,
                got: buf.len(),
            });
        }
        self.buffer.clear();
        self.buffer.extend_from_slice(buf);

        let padding_bits = (8 - (self.length % 8)) % 8;
        if padding_bits > 0 {
            if let Some(last) = self.buffer.last_mut() {
                // Zero the low `padding_bits` bits, keep the rest.
                let keep_mask = 0xFFu8.checked_shl(padding_bits as u32).unwrap_or(0);
                *last &= keep_mask;
            }
        }

        self.num_set_bits = self.buffer.iter().map(|b| b.count_ones() as usize).sum();
        Ok(())
    }
}
