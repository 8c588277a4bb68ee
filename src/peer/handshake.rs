//! The BitTorrent peer handshake: the first 68 bytes exchanged between
//! two peers, establishing which torrent they're talking about.
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid protocol string length: {0}")]
    BadProtocolLen(u8),

    #[error("invalid protocol string: {0:?}")]
    BadProtocol([u8; 19]),

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("handshake timed out")]
    Timeout,
}

/// A handshake message: `0x13 || "BitTorrent protocol" || reserved[8] ||
/// info_hash[20] || peer_id[20]`, 68 bytes total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    #[instrument(level = "trace", skip(stream))]
    pub async fn write<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<(), HandshakeError> {
        stream.write_all(&self.serialize()).await?;
        stream.flush().await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(stream))]
    pub async fn read<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self, HandshakeError> {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;

        let protocol_len = buf[0];
        if protocol_len != 19 {
            return Err(HandshakeError::BadProtocolLen(protocol_len));
        }
        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[1..20]);
        if &protocol != PROTOCOL {
            return Err(HandshakeError::BadProtocol(protocol));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn validate(&self, expected_info_hash: [u8; 20]) -> Result<(), HandshakeError> {
        if self.info_hash != expected_info_hash {
            return Err(HandshakeError::InfoHashMismatch);
        }
        Ok(())
    }
}

/// Connects to `addr`, performs the handshake, and validates the
/// remote's info-hash, all under a single bounded timeout.
#[instrument(level = "debug", skip(info_hash, peer_id))]
pub async fn connect_and_handshake(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    connect_timeout: Duration,
) -> Result<(TcpStream, Handshake), HandshakeError> {
    timeout(connect_timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        let ours = Handshake::new(info_hash, peer_id);
        ours.write(&mut stream).await?;
        let theirs = Handshake::read(&mut stream).await?;
        theirs.validate(info_hash)?;
        Ok((stream, theirs))
    })
    .await
    .map_err(|_| HandshakeError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_over_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(128);
        let info_hash = [7u8; 20];
        let peer_id = [9u8; 20];
        let hs = Handshake::new(info_hash, peer_id);
        hs.write(&mut a).await.unwrap();
        let received = Handshake::read(&mut b).await.unwrap();
        assert_eq!(received, hs);
    }

    #[tokio::test]
    async fn rejects_mismatched_info_hash() {
        let (mut a, mut b) = tokio::io::duplex(128);
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        hs.write(&mut a).await.unwrap();
        let received = Handshake::read(&mut b).await.unwrap();
        let err = received.validate([9u8; 20]).unwrap_err();
        assert!(matches!(err, HandshakeError::InfoHashMismatch));
    }

    #[tokio::test]
    async fn rejects_bad_protocol_string() {
        let (mut a, mut b) = tokio::io::duplex(128);
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[1] = b'X';
        a.write_all(&bytes).await.unwrap();
        let err = Handshake::read(&mut b).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BadProtocol(_)));
    }
}
