//! Tracker client: announce requests and peer-list parsing.
//!
//! The query string is built by hand and appended to the announce URL
//! as a raw string rather than handed to `url::Url::query_pairs_mut`,
//! whose `extend_pairs` would percent-encode our already-percent-encoded
//! `info_hash`/`peer_id` bytes a second time and corrupt them.
use crate::torrent::Metainfo;
use rand::Rng;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::debug;

use crate::bencode::{self, BencodeValue};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("tracker returned HTTP status {0}")]
    BadStatus(reqwest::StatusCode),

    #[error("malformed tracker response: {0}")]
    Bencode(#[from] crate::bencode::BencodeDecodeError),

    #[error("tracker response is not a dict")]
    NotADict,

    #[error("tracker response missing or malformed `peers` field")]
    MalformedPeers,

    #[error("compact peers field length is not a multiple of {0}")]
    BadCompactLength(usize),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("tracker returned a failure reason: {0}")]
    Failure(String),
}

/// One peer as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

pub struct Client {
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::Client,
}

impl Client {
    pub fn new(port: u16) -> Self {
        Self {
            peer_id: generate_peer_id(),
            port,
            http: reqwest::Client::new(),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends the initial announce (`event=started`) and parses the
    /// peer list. This client never re-announces on the tracker's
    /// `interval` — see the design notes on tracker re-announce.
    #[tracing::instrument(skip(self, meta), level = "debug")]
    pub async fn announce(&self, meta: &Metainfo) -> Result<AnnounceResponse, TrackerError> {
        let url = build_announce_url(
            &meta.announce,
            &meta.info_hash,
            &self.peer_id,
            self.port,
            0,
            0,
            meta.total_length(),
        )?;
        debug!(%url, "announcing to tracker");

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(TrackerError::BadStatus(response.status()));
        }
        let bytes = response.bytes().await?;
        parse_announce_response(&bytes)
    }
}

fn build_announce_url(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    uploaded: i64,
    downloaded: i64,
    left: i64,
) -> Result<url::Url, url::ParseError> {
    let base = url::Url::parse(announce)?;
    let separator = if base.query().is_some() { "&" } else { "?" };

    let query = format!(
        "{sep}info_hash={ih}&peer_id={pid}&port={port}&uploaded={uploaded}&downloaded={downloaded}&left={left}&compact=1&event=started",
        sep = separator,
        ih = percent_encode_bytes(info_hash),
        pid = percent_encode_bytes(peer_id),
    );

    let mut full = announce.to_string();
    full.push_str(&query);
    url::Url::parse(&full)
}

/// Percent-encodes raw bytes per RFC 3986's unreserved set, leaving
/// `a-z A-Z 0-9 - . _ ~` untouched. Built by hand so the caller controls
/// exactly what goes on the wire instead of handing pre-encoded bytes
/// to a library that would encode them again.
fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-BL0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

fn parse_announce_response(bytes: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = bencode::decode(bytes)?;
    let dict = value.as_dict().ok_or(TrackerError::NotADict)?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()).and_then(BencodeValue::as_bytes) {
        return Err(TrackerError::Failure(String::from_utf8_lossy(reason).into_owned()));
    }

    let interval = dict.get(b"interval".as_slice()).and_then(BencodeValue::as_int).unwrap_or(0);

    let mut peers = Vec::new();
    if let Some(peers_value) = dict.get(b"peers".as_slice()) {
        peers.extend(parse_peers_field(peers_value)?);
    }
    if let Some(peers6_value) = dict.get(b"peers6".as_slice()) {
        let bytes = peers6_value.as_bytes().ok_or(TrackerError::MalformedPeers)?;
        peers.extend(parse_compact_ipv6(bytes)?);
    }

    Ok(AnnounceResponse { interval, peers })
}

fn parse_peers_field(value: &BencodeValue) -> Result<Vec<Peer>, TrackerError> {
    match value {
        BencodeValue::Bytes(bytes) => parse_compact_ipv4(bytes),
        BencodeValue::List(items) => items.iter().map(parse_peer_dict).collect(),
        _ => Err(TrackerError::MalformedPeers),
    }
}

fn parse_compact_ipv4(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::BadCompactLength(6));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer {
                ip: IpAddr::V4(ip),
                port,
            }
        })
        .collect())
}

fn parse_compact_ipv6(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % 18 != 0 {
        return Err(TrackerError::BadCompactLength(18));
    }
    Ok(bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            Peer {
                ip: IpAddr::V6(ip),
                port,
            }
        })
        .collect())
}

fn parse_peer_dict(value: &BencodeValue) -> Result<Peer, TrackerError> {
    let dict: &BTreeMap<Vec<u8>, BencodeValue> = value.as_dict().ok_or(TrackerError::MalformedPeers)?;
    let ip_bytes = dict.get(b"ip".as_slice()).and_then(BencodeValue::as_bytes).ok_or(TrackerError::MalformedPeers)?;
    let ip_str = std::str::from_utf8(ip_bytes).map_err(|_| TrackerError::MalformedPeers)?;
    let ip: IpAddr = ip_str.parse().map_err(|_| TrackerError::MalformedPeers)?;
    let port = dict
        .get(b"port".as_slice())
        .and_then(BencodeValue::as_int)
        .ok_or(TrackerError::MalformedPeers)? as u16;
    Ok(Peer { ip, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encoding_escapes_every_non_unreserved_byte() {
        let bytes: [u8; 4] = [0x00, 0xFF, b'a', b'%'];
        assert_eq!(percent_encode_bytes(&bytes), "%00%FFa%25");
    }

    #[test]
    fn build_announce_url_does_not_double_encode_percent_signs() {
        // An info_hash byte of 0x25 ('%') must appear as a single %25 in
        // the final URL, not %2525.
        let info_hash = [0x25u8; 20];
        let peer_id = [0x41u8; 20];
        let url = build_announce_url("http://tracker.example/announce", &info_hash, &peer_id, 6881, 0, 0, 100).unwrap();
        let s = url.as_str();
        assert!(s.contains("info_hash=%25%25%25"));
        assert!(!s.contains("%2525"));
    }

    #[test]
    fn appends_to_existing_query_string_with_ampersand() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let url = build_announce_url("http://tracker.example/announce?x=1", &info_hash, &peer_id, 6881, 0, 0, 100).unwrap();
        assert!(url.as_str().contains("?x=1&info_hash="));
    }

    #[test]
    fn parses_compact_ipv4_peer_list() {
        let bytes = [0x7Fu8, 0x00, 0x00, 0x01, 0x1A, 0xE1, 0x7F, 0x00, 0x00, 0x01, 0x1A, 0xE2];
        let peers = parse_compact_ipv4(&bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].port, 0x1AE1);
        assert_eq!(peers[1].port, 0x1AE2);
        assert_eq!(peers[0].ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parses_bencoded_announce_response_with_compact_peers() {
        let bytes = b"d8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x7f\x00\x00\x01\x1a\xe2e";
        let resp = parse_announce_response(bytes).unwrap();
        assert_eq!(resp.interval, 1800);
        assert_eq!(resp.peers.len(), 2);
    }

    #[test]
    fn surfaces_failure_reason() {
        let bytes = b"d14:failure reason12:torrent deade";
        let err = parse_announce_response(bytes).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(_)));
    }
}
