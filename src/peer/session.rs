//! The per-peer connection: handshake already done, now driving the
//! framed message stream, choke/interest flags, and request/response
//! correlation.
use super::message::{Message, MessageError};
use super::PeerInfo;
use crate::bitmap::Bitmap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("request for ({0}, {1}, {2}) is already inflight")]
    DuplicateRequest(u32, u32, u32),

    #[error("request timed out")]
    RequestTimeout,

    #[error("peer session is gone")]
    PeerGone,

    #[error("cannot send a request while the peer is choking us")]
    Choked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

type RequestKey = (u32, u32, u32);

struct Shared {
    state: SessionState,
    flags: Flags,
    peer_pieces: Bitmap,
    inflight: HashMap<RequestKey, oneshot::Sender<Vec<u8>>>,
    bitfield_seen: bool,
    any_message_seen: bool,
    downloaded: u64,
    uploaded: u64,
}

/// A live connection to one peer, past the handshake.
///
/// Cloning shares the same underlying connection and state — the recv
/// loop runs once, in a background task, and every clone sees the same
/// `Shared` through the `Arc<Mutex<_>>`.
#[derive(Clone)]
pub struct PeerSession {
    pub info: PeerInfo,
    pub remote_peer_id: [u8; 20],
    shared: Arc<Mutex<Shared>>,
    writer: Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>,
    recv_task: Arc<JoinHandle<()>>,
}

impl PeerSession {
    /// Spawns the receive loop over `stream` and returns a session in
    /// the `Ready` state, having also sent our own BITFIELD.
    pub fn spawn<S>(info: PeerInfo, remote_peer_id: [u8; 20], stream: S, piece_count: usize, our_bitfield: Bitmap) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = split(stream);
        let shared = Arc::new(Mutex::new(Shared {
            state: SessionState::Ready,
            flags: Flags {
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
            },
            peer_pieces: Bitmap::new(piece_count),
            inflight: HashMap::new(),
            bitfield_seen: false,
            any_message_seen: false,
            downloaded: 0,
            uploaded: 0,
        }));

        let writer: Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>> = Arc::new(Mutex::new(Box::new(write_half) as Box<dyn AsyncWrite + Unpin + Send>));

        let recv_shared = shared.clone();
        let recv_task = tokio::spawn(recv_loop(read_half, recv_shared));

        let session = PeerSession {
            info,
            remote_peer_id,
            shared,
            writer,
            recv_task: Arc::new(recv_task),
        };

        let writer_for_bitfield = session.clone();
        tokio::spawn(async move {
            let _ = writer_for_bitfield
                .send(Message::Bitfield {
                    bitfield: our_bitfield.as_bytes().to_vec(),
                })
                .await;
        });

        session
    }

    pub async fn state(&self) -> SessionState {
        self.shared.lock().await.state
    }

    pub async fn peer_choking(&self) -> bool {
        self.shared.lock().await.flags.peer_choking
    }

    pub async fn has_piece(&self, index: usize) -> bool {
        self.shared.lock().await.peer_pieces.contains(index)
    }

    pub async fn downloaded(&self) -> u64 {
        self.shared.lock().await.downloaded
    }

    pub async fn uploaded(&self) -> u64 {
        self.shared.lock().await.uploaded
    }

    async fn send(&self, msg: Message) -> Result<(), PeerError> {
        let mut w = self.writer.lock().await;
        msg.write(&mut *w).await.map_err(PeerError::Io)
    }

    pub async fn send_interested(&self) -> Result<(), PeerError> {
        {
            let mut shared = self.shared.lock().await;
            shared.flags.am_interested = true;
        }
        self.send(Message::Interested).await
    }

    /// Issues a REQUEST and awaits its matching PIECE, subject to
    /// `timeout`. Fails immediately with `Choked` if the peer is
    /// currently choking us, and with `DuplicateRequest` if the same
    /// tuple is already inflight.
    #[instrument(level = "debug", skip(self))]
    pub async fn request(&self, index: u32, begin: u32, length: u32, timeout: Duration) -> Result<Vec<u8>, PeerError> {
        let key = (index, begin, length);
        let rx = {
            let mut shared = self.shared.lock().await;
            if shared.state != SessionState::Ready {
                return Err(PeerError::PeerGone);
            }
            if shared.flags.peer_choking {
                return Err(PeerError::Choked);
            }
            if shared.inflight.contains_key(&key) {
                return Err(PeerError::DuplicateRequest(index, begin, length));
            }
            let (tx, rx) = oneshot::channel();
            shared.inflight.insert(key, tx);
            rx
        };

        self.send(Message::Request { index, begin, length }).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(_)) => Err(PeerError::PeerGone),
            Err(_) => {
                self.shared.lock().await.inflight.remove(&key);
                Err(PeerError::RequestTimeout)
            }
        }
    }

    pub async fn close(&self) {
        self.recv_task.abort();
        let mut shared = self.shared.lock().await;
        shared.state = SessionState::Closed;
        shared.inflight.clear();
    }
}

async fn recv_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<Mutex<Shared>>) {
    loop {
        let msg = match Message::read(&mut reader).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "peer recv loop ending");
                let mut s = shared.lock().await;
                s.state = SessionState::Closed;
                s.inflight.clear();
                return;
            }
        };

        let mut s = shared.lock().await;
        if let Err(e) = apply_message(&mut s, msg) {
            warn!(error = %e, "protocol violation, closing session");
            s.state = SessionState::Closed;
            s.inflight.clear();
            return;
        }
    }
}

fn apply_message(s: &mut Shared, msg: Message) -> Result<(), PeerError> {
    let is_bitfield = matches!(msg, Message::Bitfield { .. });
    if is_bitfield && (s.any_message_seen || s.bitfield_seen) {
        return Err(PeerError::ProtocolViolation("BITFIELD received after the first message".into()));
    }

    match msg {
        Message::KeepAlive => {}
        Message::Choke => s.flags.peer_choking = true,
        Message::Unchoke => s.flags.peer_choking = false,
        Message::Interested => s.flags.peer_interested = true,
        Message::NotInterested => s.flags.peer_interested = false,
        Message::Have { index } => {
            if index as usize >= s.peer_pieces.len() {
                return Err(PeerError::ProtocolViolation(format!(
                    "HAVE index {index} out of range (piece count {})",
                    s.peer_pieces.len()
                )));
            }
            s.peer_pieces.set(index as usize, true);
        }
        Message::Bitfield { bitfield } => {
            s.peer_pieces
                .load_from_bytes(&bitfield)
                .map_err(|e| PeerError::ProtocolViolation(e.to_string()))?;
            s.bitfield_seen = true;
        }
        Message::Request { .. } | Message::Cancel { .. } => {
            // Serving requests is out of scope; recognized and discarded.
        }
        Message::Piece { index, begin, block } => {
            let key = (index, begin, block.len() as u32);
            if let Some(tx) = s.inflight.remove(&key) {
                s.downloaded += block.len() as u64;
                let _ = tx.send(block);
            }
            // Otherwise: a cancellation race, drop silently.
        }
    }

    if !is_bitfield {
        s.any_message_seen = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn info() -> PeerInfo {
        PeerInfo {
            ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
            port: 6881,
        }
    }

    #[tokio::test]
    async fn bitfield_then_have_updates_peer_pieces() {
        let (mut a, b) = tokio::io::duplex(4096);
        let session = PeerSession::spawn(info(), [1u8; 20], b, 4, Bitmap::new(4));

        Message::Bitfield { bitfield: vec![0xA0] }.write(&mut a).await.unwrap();
        Message::Have { index: 3 }.write(&mut a).await.unwrap();

        // give the recv task a chance to process.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.has_piece(0).await);
        assert!(!session.has_piece(1).await);
        assert!(session.has_piece(2).await);
        assert!(session.has_piece(3).await);
    }

    #[tokio::test]
    async fn out_of_range_have_closes_the_session_instead_of_panicking() {
        let (mut a, b) = tokio::io::duplex(4096);
        let session = PeerSession::spawn(info(), [1u8; 20], b, 4, Bitmap::new(4));

        Message::Have { index: 99 }.write(&mut a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn second_bitfield_closes_the_session() {
        let (mut a, b) = tokio::io::duplex(4096);
        let session = PeerSession::spawn(info(), [1u8; 20], b, 4, Bitmap::new(4));

        Message::Unchoke.write(&mut a).await.unwrap();
        Message::Bitfield { bitfield: vec![0xF0] }.write(&mut a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn two_bitfields_back_to_back_with_nothing_between_them_closes_the_session() {
        let (mut a, b) = tokio::io::duplex(4096);
        let session = PeerSession::spawn(info(), [1u8; 20], b, 4, Bitmap::new(4));

        Message::Bitfield { bitfield: vec![0xF0] }.write(&mut a).await.unwrap();
        Message::Bitfield { bitfield: vec![0x0F] }.write(&mut a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn request_completes_on_matching_piece() {
        let (mut a, b) = tokio::io::duplex(4096);
        let session = PeerSession::spawn(info(), [1u8; 20], b, 1, Bitmap::new(1));
        Message::Unchoke.write(&mut a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let session2 = session.clone();
        let responder = tokio::spawn(async move {
            // Drain the session's own bitfield frame before replying.
            let _ = Message::read(&mut a).await;
            Message::Piece {
                index: 0,
                begin: 0,
                block: vec![9, 9, 9],
            }
            .write(&mut a)
            .await
            .unwrap();
            a
        });

        let block = session2.request(0, 0, 3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(block, vec![9, 9, 9]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_inflight_request_is_rejected() {
        let (mut a, b) = tokio::io::duplex(4096);
        let session = PeerSession::spawn(info(), [1u8; 20], b, 1, Bitmap::new(1));
        Message::Unchoke.write(&mut a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = Message::read(&mut a).await; // drain our bitfield

        let session2 = session.clone();
        let first = tokio::spawn(async move { session2.request(0, 0, 3, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = session.request(0, 0, 3, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PeerError::DuplicateRequest(0, 0, 3)));
        drop(first);
    }
}
