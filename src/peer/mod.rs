//! Peer wire protocol: handshake, message framing, and the per-peer
//! session state machine.
pub mod handshake;
pub mod message;
pub mod session;

use std::net::IpAddr;

pub use handshake::{connect_and_handshake, Handshake, HandshakeError};
pub use message::{Message, MessageError};
pub use session::{PeerError, PeerSession, SessionState};

/// A peer's address, as reported by the tracker. Equatable and
/// hashable so it can key the scheduler's session registry; the
/// remote's 20-byte peer-id is learned at handshake time and lives on
/// the `PeerSession`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub ip: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl PeerInfo {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}
