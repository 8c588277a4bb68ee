//! The top-level error aggregate returned by [`crate::run`].
//!
//! Per-component errors (bencode, torrent, tracker, peer, piece store)
//! stay in their own `thiserror` enums close to where they occur; only
//! input, tracker, and fatal I/O failures ever propagate this far —
//! peer protocol/transport errors are absorbed at the scheduler's
//! per-iteration boundary.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to load torrent: {0}")]
    Torrent(#[from] crate::torrent::TorrentError),

    #[error("tracker error: {0}")]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error("piece store error: {0}")]
    PieceStore(#[from] crate::piece_store::PieceStoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
