//! The leech scheduler: connects peers, picks piece+peer, assembles
//! blocks, verifies, persists, and drives the whole session's lifecycle.
use crate::bitmap::Bitmap;
use crate::config::{Config, BLOCK_SIZE};
use crate::peer::{connect_and_handshake, PeerInfo, PeerSession, SessionState};
use crate::piece_store::PieceStore;
use crate::stats::Stats;
use crate::torrent::Metainfo;
use crate::tracker;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Owns everything a single torrent download needs for its lifetime:
/// metainfo, piece store, peer registry, and the work queue driving the
/// leech loop. Constructed via [`TorrentSession::start`], which performs
/// the full verify → announce → connect sequence up front.
pub struct TorrentSession {
    meta: Metainfo,
    config: Config,
    piece_store: Mutex<PieceStore>,
    saved_pieces: Arc<Mutex<Bitmap>>,
    peers: Arc<Mutex<HashMap<PeerInfo, PeerSession>>>,
    local_peer_id: [u8; 20],
    start_time: Instant,
}

impl TorrentSession {
    /// Verifies the local file, announces to the tracker, and connects
    /// to at most `config.max_peers` peers concurrently.
    pub async fn start(meta: Metainfo, config: Config) -> Result<Self, crate::error::ClientError> {
        let mut store = PieceStore::open(&meta, &config.download_dir)?;
        let saved = store.verify_all()?;
        info!(saved = saved.num_set_bits(), total = saved.len(), "verified local pieces");

        let tracker_client = tracker::Client::new(config.listen_port);
        let local_peer_id = tracker_client.peer_id();
        let announce = tracker_client.announce(&meta).await?;
        info!(peers_offered = announce.peers.len(), interval = announce.interval, "tracker announce complete");

        let session = TorrentSession {
            meta,
            config,
            piece_store: Mutex::new(store),
            saved_pieces: Arc::new(Mutex::new(saved)),
            peers: Arc::new(Mutex::new(HashMap::new())),
            local_peer_id,
            start_time: Instant::now(),
        };

        session.connect_peers(announce.peers).await;
        Ok(session)
    }

    async fn connect_peers(&self, offered: Vec<tracker::Peer>) {
        let info_hash = self.meta.info_hash;
        let peer_id = self.local_peer_id;
        let piece_count = self.meta.num_pieces();
        let connect_timeout = self.config.connect_timeout;
        let our_bitfield = self.saved_pieces.lock().await.clone();

        let mut attempts = JoinSet::new();
        for p in offered.into_iter().take(self.config.max_peers) {
            let peer_info = PeerInfo { ip: p.ip, port: p.port };
            let bitfield = our_bitfield.clone();
            attempts.spawn(async move {
                let addr = peer_info.socket_addr();
                match connect_and_handshake(addr, info_hash, peer_id, connect_timeout).await {
                    Ok((stream, handshake)) => {
                        let session = PeerSession::spawn(peer_info, handshake.peer_id, stream, piece_count, bitfield);
                        Some((peer_info, session))
                    }
                    Err(e) => {
                        warn!(peer = %peer_info, error = %e, "peer connect/handshake failed");
                        None
                    }
                }
            });
        }

        while let Some(res) = attempts.join_next().await {
            if let Ok(Some((peer_info, session))) = res {
                if session.send_interested().await.is_ok() {
                    self.peers.lock().await.insert(peer_info, session);
                } else {
                    warn!(peer = %peer_info, "failed to send INTERESTED, dropping");
                }
            }
        }

        info!(connected = self.peers.lock().await.len(), "peer connect fan-out complete");
    }

    pub async fn stats(&self) -> Stats {
        let saved = self.saved_pieces.lock().await;
        let peers = self.peers.lock().await;
        let mut uploaded = 0u64;
        let mut downloaded = 0u64;
        for session in peers.values() {
            uploaded += session.uploaded().await;
            downloaded += session.downloaded().await;
        }
        Stats {
            total_pieces: saved.len(),
            pieces_done: saved.num_set_bits(),
            peers_connected: peers.len(),
            bytes_downloaded: downloaded,
            bytes_uploaded: uploaded,
            started_at: self.start_time,
        }
    }

    /// Runs the leech work-loop until every piece is saved or
    /// `shutdown` fires, then tears down peer sessions in order.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) -> Result<(), crate::error::ClientError> {
        let mut queue: Vec<usize> = (0..self.meta.num_pieces()).collect();
        queue.shuffle(&mut rand::rng());

        loop {
            if shutdown.try_recv().is_ok() {
                break;
            }
            if queue.is_empty() {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                }
            }

            let index = queue.remove(0);
            if self.saved_pieces.lock().await.contains(index) {
                continue;
            }

            tokio::select! {
                _ = &mut shutdown => break,
                outcome = self.try_download_piece(index) => {
                    match outcome {
                        Ok(PieceOutcome::Saved) => {}
                        Ok(PieceOutcome::Requeue) => queue.push(index),
                        Ok(PieceOutcome::NoEligiblePeer) => {
                            queue.push(index);
                            tokio::time::sleep(self.config.idle_sleep).await;
                        }
                        Err(e) => {
                            self.shutdown_peers().await;
                            return Err(e);
                        }
                    }
                }
            }
        }

        self.shutdown_peers().await;
        Ok(())
    }

    /// Downloads one piece from an eligible peer. A piece-store write
    /// failure means the download can no longer make progress and is
    /// bubbled up to abort [`Self::run`] rather than requeued forever.
    async fn try_download_piece(&self, index: usize) -> Result<PieceOutcome, crate::error::ClientError> {
        let Some((peer_info, session)) = self.choose_peer_for(index).await else {
            return Ok(PieceOutcome::NoEligiblePeer);
        };

        info!(piece = index, peer = %peer_info, "requesting piece");
        let expected_len = self.meta.piece_size(index);
        let mut offsets = Vec::new();
        let mut offset = 0i64;
        while offset < expected_len {
            let len = BLOCK_SIZE.min((expected_len - offset) as u32);
            offsets.push((offset as u32, len));
            offset += len as i64;
        }

        let mut requests = JoinSet::new();
        for (begin, len) in offsets {
            let session = session.clone();
            let timeout = self.config.request_timeout;
            requests.spawn(async move {
                session
                    .request(index as u32, begin, len, timeout)
                    .await
                    .map(|block| (begin, block))
            });
        }

        let mut blocks: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut failed = false;
        while let Some(res) = requests.join_next().await {
            match res {
                Ok(Ok(pair)) => blocks.push(pair),
                Ok(Err(e)) => {
                    warn!(piece = index, peer = %peer_info, error = %e, "block request failed");
                    failed = true;
                }
                Err(_) => failed = true,
            }
        }

        if failed {
            if session.state().await == SessionState::Closed {
                self.peers.lock().await.remove(&peer_info);
            }
            return Ok(PieceOutcome::Requeue);
        }

        blocks.sort_by_key(|(begin, _)| *begin);
        let mut assembled = Vec::with_capacity(expected_len as usize);
        for (_, block) in blocks {
            assembled.extend_from_slice(&block);
        }
        if assembled.len() as i64 != expected_len {
            warn!(piece = index, "assembled piece has wrong length, requeueing");
            return Ok(PieceOutcome::Requeue);
        }

        let digest = sha1_digest(&assembled);
        if digest != self.meta.info.pieces[index] {
            warn!(piece = index, "hash mismatch on assembled piece, requeueing");
            return Ok(PieceOutcome::Requeue);
        }

        let mut store = self.piece_store.lock().await;
        let write_result = store.write_piece(index, &assembled);
        drop(store);
        if let Err(e) = write_result {
            warn!(piece = index, error = %e, "piece store write failed, aborting");
            return Err(crate::error::ClientError::PieceStore(e));
        }

        self.saved_pieces.lock().await.set(index, true);
        Ok(PieceOutcome::Saved)
    }

    async fn choose_peer_for(&self, index: usize) -> Option<(PeerInfo, PeerSession)> {
        let peers = self.peers.lock().await;
        let mut candidates: Vec<(PeerInfo, PeerSession)> = peers.iter().map(|(k, v)| (*k, v.clone())).collect();
        drop(peers);
        candidates.shuffle(&mut rand::rng());

        for (info, session) in candidates {
            if session.state().await != SessionState::Ready {
                continue;
            }
            if session.peer_choking().await {
                continue;
            }
            if session.has_piece(index).await {
                return Some((info, session));
            }
        }
        None
    }

    async fn shutdown_peers(&self) {
        let mut peers = self.peers.lock().await;
        for (_, session) in peers.drain() {
            session.close().await;
        }
    }
}

enum PieceOutcome {
    Saved,
    Requeue,
    NoEligiblePeer,
}

fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
impl TorrentSession {
    /// Test-only constructor that skips the tracker announce and TCP
    /// connect fan-out, starting instead from an already-verified piece
    /// store and a fixed peer registry. Mirrors `start`'s end state
    /// without the network I/O, so the leech loop itself can be
    /// exercised against emulated peers.
    fn new_for_test(meta: Metainfo, config: Config, store: PieceStore, saved: Bitmap, peers: HashMap<PeerInfo, PeerSession>) -> Self {
        TorrentSession {
            meta,
            config,
            piece_store: Mutex::new(store),
            saved_pieces: Arc::new(Mutex::new(saved)),
            peers: Arc::new(Mutex::new(peers)),
            local_peer_id: [0u8; 20],
            start_time: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Message;
    use crate::torrent::metainfo::Info;
    use std::net::IpAddr;
    use std::time::Duration;

    fn piece_hash(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn meta_for(pieces: &[Vec<u8>], piece_length: i64) -> Metainfo {
        let total: i64 = pieces.iter().map(|p| p.len() as i64).sum();
        Metainfo {
            announce: "http://tracker.example/announce".into(),
            info: Info {
                name: "out.bin".into(),
                piece_length,
                length: total,
                pieces: pieces.iter().map(|p| piece_hash(p)).collect(),
            },
            info_hash: [0u8; 20],
        }
    }

    fn peer_info(port: u16) -> PeerInfo {
        PeerInfo {
            ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
            port,
        }
    }

    /// Spawns a fake peer over a duplex socket that holds every piece in
    /// `pieces`, answers REQUEST with the matching block, and otherwise
    /// behaves like an unchoked, interested remote.
    fn spawn_full_peer(port: u16, piece_count: usize, pieces: Vec<Vec<u8>>) -> (PeerInfo, PeerSession) {
        let (a, mut b) = tokio::io::duplex(1 << 16);
        let info = peer_info(port);
        let session = PeerSession::spawn(info, [1u8; 20], a, piece_count, Bitmap::new(piece_count));

        tokio::spawn(async move {
            // drain the session's outbound BITFIELD, then advertise our own.
            let _ = Message::read(&mut b).await;
            let mut full = Bitmap::new(piece_count);
            for i in 0..piece_count {
                full.set(i, true);
            }
            Message::Bitfield {
                bitfield: full.as_bytes().to_vec(),
            }
            .write(&mut b)
            .await
            .unwrap();
            Message::Unchoke.write(&mut b).await.unwrap();

            loop {
                match Message::read(&mut b).await {
                    Ok(Message::Request { index, begin, length }) => {
                        let piece = &pieces[index as usize];
                        let block = piece[begin as usize..(begin + length) as usize].to_vec();
                        Message::Piece { index, begin, block }.write(&mut b).await.unwrap();
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });

        (info, session)
    }

    #[tokio::test]
    async fn fresh_download_completes_against_one_full_peer() {
        let pieces = vec![vec![1u8; 16], vec![2u8; 16], vec![3u8; 8]];
        let meta = meta_for(&pieces, 16);
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.download_dir = dir.path().to_path_buf();
        config.request_timeout = Duration::from_secs(2);

        let store = PieceStore::open(&meta, dir.path()).unwrap();
        let saved = Bitmap::new(meta.num_pieces());

        let mut peers = HashMap::new();
        let (info, session) = spawn_full_peer(7001, meta.num_pieces(), pieces.clone());
        // give the fake peer's bitfield/unchoke a moment to land.
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.send_interested().await.unwrap();
        peers.insert(info, session);

        let torrent = TorrentSession::new_for_test(meta.clone(), config, store, saved, peers);
        let (_tx, rx) = oneshot::channel();
        // Run the loop for a bounded number of iterations by racing it
        // against a deadline; it would otherwise idle forever once done.
        let run = torrent.run(rx);
        let _ = tokio::time::timeout(Duration::from_secs(5), run).await;

        let stats = torrent.stats().await;
        assert_eq!(stats.pieces_done, 3);
        assert!(stats.is_complete());
    }

    #[tokio::test]
    async fn hash_mismatch_requeues_and_eventually_succeeds_with_a_clean_peer() {
        // A corrupt peer whose REQUEST replies never match the expected
        // hash; try_download_piece must requeue rather than save.
        let pieces = vec![vec![7u8; 8]];
        let meta = meta_for(&pieces, 8);
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.download_dir = dir.path().to_path_buf();
        config.request_timeout = Duration::from_secs(1);

        let store = PieceStore::open(&meta, dir.path()).unwrap();
        let saved = Bitmap::new(meta.num_pieces());

        let mut peers = HashMap::new();
        let corrupt_pieces = vec![vec![0xFFu8; 8]];
        let (info, session) = spawn_full_peer(7002, meta.num_pieces(), corrupt_pieces);
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.send_interested().await.unwrap();
        peers.insert(info, session);

        let torrent = TorrentSession::new_for_test(meta, config, store, saved, peers);
        let outcome = torrent.try_download_piece(0).await.unwrap();
        assert!(matches!(outcome, PieceOutcome::Requeue));
        assert_eq!(torrent.saved_pieces.lock().await.num_set_bits(), 0);
    }

    #[tokio::test]
    async fn no_eligible_peer_reports_requeue_without_blocking() {
        let pieces = vec![vec![1u8; 4]];
        let meta = meta_for(&pieces, 4);
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.download_dir = dir.path().to_path_buf();

        let store = PieceStore::open(&meta, dir.path()).unwrap();
        let saved = Bitmap::new(meta.num_pieces());
        let torrent = TorrentSession::new_for_test(meta, config, store, saved, HashMap::new());

        let outcome = torrent.try_download_piece(0).await.unwrap();
        assert!(matches!(outcome, PieceOutcome::NoEligiblePeer));
    }
}
