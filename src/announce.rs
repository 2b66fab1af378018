use std::fmt::Write;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Duration;

use reqwest::blocking::Client;

use crate::bencode::{self, Bencode};
use crate::to_hex;
use crate::torrent::Torrent;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// A tracker's answer to an announce.
#[derive(Debug, Clone)]
pub struct TrackerResponse {
    /// Seconds until the client should reannounce.
    pub interval: Option<u32>,
    /// Number of seeders.
    pub complete: Option<u32>,
    /// Number of leechers.
    pub incomplete: Option<u32>,
    /// Peer endpoints to dial.
    pub peers: Vec<SocketAddr>,
}

impl TrackerResponse {
    fn from_bencode(b: &Bencode) -> Result<Self> {
        let dict = b.dict()?;
        if let Some(reason) = dict.get(b"failure reason".as_slice()) {
            return Err(format!(
                "tracker failure: {}",
                String::from_utf8_lossy(reason.bytes()?)
            )
            .into());
        }
        let interval = match dict.get(b"interval".as_slice()) {
            Some(value) => Some(value.int()? as u32),
            None => None,
        };
        let complete = match dict.get(b"complete".as_slice()) {
            Some(value) => Some(value.int()? as u32),
            None => None,
        };
        let incomplete = match dict.get(b"incomplete".as_slice()) {
            Some(value) => Some(value.int()? as u32),
            None => None,
        };
        let peers = match dict.get(b"peers".as_slice()) {
            Some(Bencode::Bytes(bytes)) => parse_compact_peers(bytes)?,
            Some(Bencode::List(list)) => parse_dict_peers(list)?,
            other => return Err(format!("invalid 'peers' bencode type {:?}", other).into()),
        };
        Ok(TrackerResponse {
            interval,
            complete,
            incomplete,
            peers,
        })
    }
}

/// The compact format packs each peer into 6 bytes: an IPv4 address
/// followed by a big-endian port.
fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err("invalid compact peers length".into());
    }

    let mut peers = Vec::with_capacity(bytes.len() / 6);
    for chunk in bytes.chunks_exact(6) {
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        peers.push(SocketAddr::V4(SocketAddrV4::new(ip, port)));
    }
    Ok(peers)
}

fn parse_dict_peers(list: &[Bencode]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::new();
    for item in list {
        let Some(map) = item.as_dict() else { continue };
        let (Some(ip), Some(port)) = (
            map.get(b"ip".as_slice()),
            map.get(b"port".as_slice()),
        ) else {
            continue;
        };
        let host = String::from_utf8_lossy(ip.bytes()?);
        let port = port.int()? as u16;
        for addr in format!("{}:{}", host, port).to_socket_addrs()? {
            if addr.is_ipv4() {
                peers.push(addr);
            }
        }
    }
    Ok(peers)
}

/// Announces to an HTTP(S) tracker and parses its bencoded response.
///
/// The infohash and peer id are raw 20-byte strings and must be
/// percent-encoded byte-by-byte; a regular query builder would mangle them.
pub fn announce(
    tracker_url: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<TrackerResponse> {
    if !tracker_url.starts_with("http") {
        return Err(format!("unsupported tracker protocol: {}", tracker_url).into());
    }

    let mut url = String::from(tracker_url);
    url.push(if tracker_url.contains('?') { '&' } else { '?' });
    write!(
        &mut url,
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        urlencoding::encode_binary(info_hash),
        urlencoding::encode_binary(peer_id),
        port,
        left
    )?;

    let client = Client::builder()
        .user_agent("leech/0.1")
        .timeout(ANNOUNCE_TIMEOUT)
        .build()?;

    let mut response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(format!("tracker returned HTTP {}", response.status()).into());
    }

    let bencoded = bencode::decode_from_reader(&mut response)?;
    TrackerResponse::from_bencode(&bencoded)
}

/// Walks the torrent's trackers in order until one hands out peers.
pub fn gather_peers(torrent: &Torrent, peer_id: &[u8; 20], port: u16) -> Vec<SocketAddr> {
    let mut urls: Vec<&String> = Vec::new();
    if torrent.announce_list.is_empty() {
        urls.extend(torrent.announce.iter());
    } else {
        urls.extend(torrent.announce_list.iter().flatten());
    }

    for url in urls {
        log::info!(
            "announcing {} to {}",
            to_hex(&torrent.info_hash),
            url
        );
        match announce(
            url,
            &torrent.info_hash,
            peer_id,
            port,
            torrent.info.total_length,
        ) {
            Ok(response) => {
                log::debug!(
                    "tracker {}: {} seeders / {} leechers, {} peers",
                    url,
                    response.complete.unwrap_or(0),
                    response.incomplete.unwrap_or(0),
                    response.peers.len()
                );
                if !response.peers.is_empty() {
                    return response.peers;
                }
            }
            Err(e) => {
                log::warn!("{} failed to announce: {}", url, e);
            }
        }
    }

    Vec::new()
}
