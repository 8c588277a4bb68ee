//! Library root for bt-leech.
//!
//! Re-exports the core subsystems — bencode, torrent, bitmap, piece
//! store, tracker, peer, scheduler — and the public [`run`] entry
//! point that drives a full download lifecycle.
pub mod bencode;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod peer;
pub mod piece_store;
pub mod scheduler;
pub mod stats;
pub mod torrent;
pub mod tracker;

use std::path::Path;
use tokio::sync::oneshot;
use tracing::instrument;

pub use config::Config;
pub use error::ClientError;
pub use scheduler::TorrentSession;
pub use stats::Stats;

/// Loads `torrent_path`, runs the full verify → announce → connect →
/// leech lifecycle, and returns once the download completes or
/// `shutdown` fires.
#[instrument(level = "info", skip(config, shutdown))]
pub async fn run(torrent_path: impl AsRef<Path>, config: Config, shutdown: oneshot::Receiver<()>) -> Result<(), ClientError> {
    let meta = torrent::Metainfo::load(torrent_path)?;
    let session = TorrentSession::start(meta, config).await?;
    session.run(shutdown).await
}
