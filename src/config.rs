//! Tunable runtime parameters, with `clap`-driven overrides at the CLI
//! boundary.
use std::path::PathBuf;
use std::time::Duration;

pub const BLOCK_SIZE: u32 = 1 << 14;

/// Knobs for the leech scheduler and peer sessions. All fields have
/// sane defaults; the CLI may override a subset of them.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of peers to hold concurrent sessions with.
    pub max_peers: usize,
    /// Bound on TCP connect + handshake, per peer.
    pub connect_timeout: Duration,
    /// Bound on a single block REQUEST/PIECE round trip.
    pub request_timeout: Duration,
    /// Local TCP port advertised to the tracker. 0 means "don't listen"
    /// — this client does not accept inbound connections.
    pub listen_port: u16,
    /// Floor on the re-queue sleep when no eligible peer is available
    /// for the head of the work queue, to avoid a busy spin.
    pub idle_sleep: Duration,
    /// Directory the output file is written into.
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: 32,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            listen_port: 6881,
            idle_sleep: Duration::from_millis(100),
            download_dir: PathBuf::from("."),
        }
    }
}
