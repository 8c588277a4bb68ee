//! Torrent metainfo parsing and error handling.
//!
//! Decodes a `.torrent` file, computes its info-hash, and exposes the
//! piece list and layout arithmetic the piece store and scheduler need.
use thiserror::Error;

pub mod metainfo;

pub use metainfo::{Info, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeDecodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("pieces length is not a multiple of 20 bytes")]
    InvalidPiecesHashLength,

    #[error("piece count mismatch: info declares {declared} pieces, length/piece_length implies {expected}")]
    PieceCountMismatch { declared: usize, expected: usize },
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
