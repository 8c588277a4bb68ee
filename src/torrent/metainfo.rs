//! The `Metainfo` type and its parsing logic.
//!
//! Single-file torrents only — the `info` dict is required to carry
//! `name`, `piece length`, `pieces` and `length` directly (multi-file
//! torrents and path sanitisation are out of scope).
use super::{TorrentError, TorrentResult};
use crate::bencode::{self, BencodeValue, Decoder};
use sha1::{Digest, Sha1};
use std::path::Path;

/// The `info` sub-dictionary of a torrent file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: i64,
    pub length: i64,
    pub pieces: Vec<[u8; 20]>,
}

/// A fully parsed, immutable torrent description.
///
/// `info_hash` is computed from the raw bytes of the `info` subtree as it
/// appeared in the source file, never from a re-serialization of the
/// in-memory value — see the module-level note on why this matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
    pub info_hash: [u8; 20],
}

fn require_bytes<'a>(dict: &'a std::collections::BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> TorrentResult<&'a [u8]> {
    dict.get(key.as_bytes())
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| TorrentError::MissingField(key.to_string()))
}

fn require_int(dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> TorrentResult<i64> {
    dict.get(key.as_bytes())
        .and_then(BencodeValue::as_int)
        .ok_or_else(|| TorrentError::MissingField(key.to_string()))
}

fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

impl Info {
    fn from_dict(dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>) -> TorrentResult<Self> {
        let name = String::from_utf8(require_bytes(dict, "name")?.to_vec())
            .map_err(|e| TorrentError::InvalidFormat(format!("name is not UTF-8: {e}")))?;
        let piece_length = require_int(dict, "piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::InvalidFormat("piece length must be positive".into()));
        }
        let length = require_int(dict, "length")?;
        if length < 0 {
            return Err(TorrentError::InvalidFormat("length must be non-negative".into()));
        }
        let pieces = parse_pieces(require_bytes(dict, "pieces")?)?;

        let expected = length.div_ceil(piece_length) as usize;
        if pieces.len() != expected {
            return Err(TorrentError::PieceCountMismatch {
                declared: pieces.len(),
                expected,
            });
        }

        Ok(Info {
            name,
            piece_length,
            length,
            pieces,
        })
    }
}

impl Metainfo {
    pub fn load(path: impl AsRef<Path>) -> TorrentResult<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    #[tracing::instrument(level = "debug", skip(data))]
    pub fn from_bytes(data: &[u8]) -> TorrentResult<Self> {
        let top = bencode::decode(data)?;
        let top_dict = top
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("root is not a dictionary".into()))?;

        let announce = String::from_utf8(require_bytes(top_dict, "announce")?.to_vec())
            .map_err(|e| TorrentError::InvalidFormat(format!("announce is not UTF-8: {e}")))?;

        let info_value = top_dict
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("info is not a dictionary".into()))?;
        let info = Info::from_dict(info_dict)?;

        // Hash the exact bytes the producer wrote for `info`, not a
        // re-serialization of the parsed value.
        let mut span_decoder = Decoder::new(data);
        let (start, end) = span_decoder
            .dict_value_span(b"info")?
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let raw_info_bytes = &data[start..end];
        let info_hash = sha1_digest(raw_info_bytes);

        debug_assert_eq!(
            info_hash,
            sha1_digest(&bencode::encode_to_vec(info_value)),
            "canonical re-encoding of `info` disagreed with the producer's raw bytes"
        );

        Ok(Metainfo {
            announce,
            info,
            info_hash,
        })
    }

    pub fn total_length(&self) -> i64 {
        self.info.length
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len()
    }

    /// The size in bytes of piece `index`: `piece_length` for every piece
    /// but the last, which may be shorter.
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        let remaining = self.info.length - (index as i64) * self.info.piece_length;
        remaining.min(self.info.piece_length)
    }
}

fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_torrent_bytes(piece_length: i64, length: i64, pieces: &[[u8; 20]]) -> Vec<u8> {
        let mut pieces_bytes = Vec::new();
        for p in pieces {
            pieces_bytes.extend_from_slice(p);
        }
        let info = format!(
            "d6:lengthi{}e4:name4:test12:piece lengthi{}e6:pieces{}:",
            length,
            piece_length,
            pieces_bytes.len()
        );
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce15:http://tracker/4:info");
        buf.extend_from_slice(info.as_bytes());
        buf.extend_from_slice(&pieces_bytes);
        buf.extend_from_slice(b"e"); // close info dict
        buf.extend_from_slice(b"e"); // close top dict
        buf
    }

    #[test]
    fn parses_announce_and_info() {
        let bytes = sample_torrent_bytes(16, 40, &[[1u8; 20], [2u8; 20], [3u8; 20]]);
        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(meta.announce, "http://tracker/");
        assert_eq!(meta.info.name, "test");
        assert_eq!(meta.total_length(), 40);
        assert_eq!(meta.num_pieces(), 3);
        assert_eq!(meta.piece_size(0), 16);
        assert_eq!(meta.piece_size(2), 8);
    }

    #[test]
    fn info_hash_is_sha1_of_raw_info_bytes() {
        let bytes = sample_torrent_bytes(16, 40, &[[1u8; 20], [2u8; 20], [3u8; 20]]);
        let meta = Metainfo::from_bytes(&bytes).unwrap();
        let info_start = bytes.windows(5).position(|w| w == b"4:info").unwrap() + 6;
        let raw_info = &bytes[info_start..bytes.len() - 1];
        assert_eq!(meta.info_hash, sha1_digest(raw_info));
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let bytes = sample_torrent_bytes(16, 40, &[[1u8; 20], [2u8; 20]]);
        let err = Metainfo::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, TorrentError::PieceCountMismatch { .. }));
    }

    #[test]
    fn rejects_pieces_not_multiple_of_20() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce15:http://tracker/4:infod");
        buf.extend_from_slice(b"6:lengthi40e4:name4:test12:piece lengthi16e6:pieces19:");
        buf.extend_from_slice(&[0u8; 19]);
        buf.extend_from_slice(b"ee");
        let err = Metainfo::from_bytes(&buf).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidPiecesHashLength));
    }
}
