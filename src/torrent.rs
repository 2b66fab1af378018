use std::{
    fmt,
    fs::File,
    io::{BufReader, Read},
};

use sha1::{Digest, Sha1};

use crate::bencode::{self, Bencode};

#[derive(Debug)]
pub enum Error {
    Load(String),
    Io(std::io::Error),
    Bencode(bencode::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bencode::Error> for Error {
    fn from(err: bencode::Error) -> Self {
        Error::Bencode(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Load(msg) => write!(f, "invalid torrent: {}", msg),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Bencode(e) => Some(e),
            _ => None,
        }
    }
}

/// The payload description from the metainfo's `info` dictionary.
///
/// Only single-file torrents are accepted; the four fields below are all
/// required and their absence is fatal at load time.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
}

impl TorrentInfo {
    pub fn from_bencode(bencode: &Bencode) -> Result<Self, Error> {
        let map = bencode.dict()?;

        let name = match map.get(b"name".as_slice()) {
            Some(value) => String::from_utf8_lossy(value.bytes()?).to_string(),
            None => return Err(Error::Load("missing 'name' field".into())),
        };

        let piece_length = match map.get(b"piece length".as_slice()) {
            Some(value) => value.int()?,
            None => return Err(Error::Load("missing 'piece length' field".into())),
        };
        if piece_length <= 0 {
            return Err(Error::Load("'piece length' must be positive".into()));
        }
        let piece_length = piece_length as u32;

        let total_length = match map.get(b"length".as_slice()) {
            Some(value) => value.int()?,
            None if map.contains_key(b"files".as_slice()) => {
                return Err(Error::Load("multi-file torrents are not supported".into()));
            }
            None => return Err(Error::Load("missing 'length' field".into())),
        };
        if total_length <= 0 {
            return Err(Error::Load("'length' must be positive".into()));
        }
        let total_length = total_length as u64;

        let piece_hashes = match map.get(b"pieces".as_slice()) {
            Some(value) => {
                let blob = value.bytes()?;
                if blob.len() % 20 != 0 {
                    return Err(Error::Load(format!(
                        "pieces blob length {} is not a multiple of 20",
                        blob.len()
                    )));
                }
                blob.chunks_exact(20)
                    .map(|chunk| {
                        let mut hash = [0u8; 20];
                        hash.copy_from_slice(chunk);
                        hash
                    })
                    .collect::<Vec<_>>()
            }
            None => return Err(Error::Load("missing 'pieces' field".into())),
        };

        let expected = total_length.div_ceil(piece_length as u64) as usize;
        if piece_hashes.len() != expected {
            return Err(Error::Load(format!(
                "{} piece hashes for a {}-piece payload",
                piece_hashes.len(),
                expected
            )));
        }

        Ok(TorrentInfo {
            name,
            piece_length,
            piece_hashes,
            total_length,
        })
    }
}

/// A loaded torrent descriptor: the payload info plus tracker URLs and the
/// infohash identifying the swarm.
#[derive(Debug, Clone)]
pub struct Torrent {
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub info: TorrentInfo,
    pub info_hash: [u8; 20],
}

impl Torrent {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let bencode = bencode::decode(bytes)?;
        Torrent::from_bencode(&bencode)
    }

    pub fn from_file(file: &File) -> Result<Self, Error> {
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Torrent::from_bytes(&bytes)
    }

    pub fn from_bencode(bencode: &Bencode) -> Result<Self, Error> {
        let map = bencode
            .as_dict()
            .ok_or_else(|| Error::Load("metainfo must be a dictionary".into()))?;

        let announce = match map.get(b"announce".as_slice()) {
            Some(value) => Some(String::from_utf8_lossy(value.bytes()?).to_string()),
            None => None,
        };

        let mut announce_list = Vec::new();
        if let Some(tiers) = map.get(b"announce-list".as_slice()) {
            for tier in tiers.list()? {
                let mut urls = Vec::new();
                for url in tier.list()? {
                    urls.push(String::from_utf8_lossy(url.bytes()?).to_string());
                }
                if !urls.is_empty() {
                    announce_list.push(urls);
                }
            }
        }

        let info_value = map
            .get(b"info".as_slice())
            .ok_or_else(|| Error::Load("missing 'info' dict".into()))?;
        let info_hash = compute_info_hash(info_value);
        let info = TorrentInfo::from_bencode(info_value)?;

        Ok(Torrent {
            announce,
            announce_list,
            info,
            info_hash,
        })
    }
}

/// The infohash is the SHA-1 of the `info` dictionary's canonical bencode
/// form; it pairs the client with peers on the same swarm.
fn compute_info_hash(info: &Bencode) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bencode::encode(info));
    let digest = hasher.finalize();

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    hash
}
