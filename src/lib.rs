use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use crate::bitfield::Bitfield;

pub mod announce;
pub mod bencode;
pub mod bitfield;
pub mod collector;
pub mod engine;
pub mod hasher;
pub mod net;
pub mod session;
pub mod torrent;
pub mod work;

/// Size of a single requested block. Pieces are fetched in blocks of at most
/// this many bytes, per the wire protocol convention.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Maximum number of outstanding block requests per peer.
pub const MAX_BACKLOG: u32 = 5;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Length of the fixed opening exchange: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LEN: usize = 68;

/// The fixed-size opening message exchanged before any framed traffic.
///
/// Layout on the wire: protocol string length (1 byte), the protocol string
/// itself, 8 reserved bytes (sent as zero, ignored on receipt), the 20-byte
/// infohash and the 20-byte peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(HANDSHAKE_LEN);
        b.put_u8(PROTOCOL.len() as u8);
        b.extend_from_slice(PROTOCOL);
        b.extend_from_slice(&[0u8; 8]);
        b.extend_from_slice(&self.info_hash);
        b.extend_from_slice(&self.peer_id);
        b.freeze()
    }

    pub fn parse(raw: &[u8]) -> Result<Handshake, io::Error> {
        if raw.len() < HANDSHAKE_LEN {
            return Err(invalid("handshake too short"));
        }
        if raw[0] as usize != PROTOCOL.len() || &raw[1..20] != PROTOCOL {
            return Err(invalid("unknown protocol string"));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&raw[48..68]);
        Ok(Handshake { info_hash, peer_id })
    }
}

/// A message exchanged between peers according to the standard peer wire
/// protocol.
///
/// Every framed message starts with a big-endian u32 giving the number of
/// bytes that follow (message id plus payload). A length of zero is a
/// keep-alive and carries neither id nor payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// The receiving peer is choked; requests will not be answered.
    Choke,

    /// The receiving peer is unchoked and may request blocks.
    Unchoke,

    /// The sending peer wants to download.
    Interested,

    /// The sending peer does not want to download.
    NotInterested,

    /// The sending peer now has the piece at this index.
    Have(u32),

    /// The set of pieces the sending peer can serve.
    Bitfield(Bitfield),

    /// Request for a block: piece index, offset within the piece, length.
    Request { index: u32, begin: u32, length: u32 },

    /// A block of data: piece index, offset within the piece, the bytes.
    Piece { index: u32, begin: u32, block: Bytes },

    /// Cancels a previously sent `Request`; same fields.
    Cancel { index: u32, begin: u32, length: u32 },

    KeepAlive,
}

impl PeerMessage {
    pub fn encode(&self) -> Bytes {
        let buf = match self {
            PeerMessage::Choke => Self::simple(0),
            PeerMessage::Unchoke => Self::simple(1),
            PeerMessage::Interested => Self::simple(2),
            PeerMessage::NotInterested => Self::simple(3),
            PeerMessage::Have(index) => {
                let mut b = BytesMut::with_capacity(9);
                b.put_u32(5);
                b.put_u8(4);
                b.put_u32(*index);
                b
            }
            PeerMessage::Bitfield(bitfield) => {
                let bytes = bitfield.as_bytes();
                let mut b = BytesMut::with_capacity(5 + bytes.len());
                b.put_u32(1 + bytes.len() as u32);
                b.put_u8(5);
                b.extend_from_slice(bytes);
                b
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => Self::block_info(6, *index, *begin, *length),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                let mut b = BytesMut::with_capacity(13 + block.len());
                b.put_u32(9 + block.len() as u32);
                b.put_u8(7);
                b.put_u32(*index);
                b.put_u32(*begin);
                b.extend_from_slice(block);
                b
            }
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => Self::block_info(8, *index, *begin, *length),
            PeerMessage::KeepAlive => {
                let mut b = BytesMut::with_capacity(4);
                b.put_u32(0);
                b
            }
        };

        buf.freeze()
    }

    fn simple(id: u8) -> BytesMut {
        let mut b = BytesMut::with_capacity(5);
        b.put_u32(1);
        b.put_u8(id);
        b
    }

    fn block_info(id: u8, index: u32, begin: u32, length: u32) -> BytesMut {
        let mut b = BytesMut::with_capacity(17);
        b.put_u32(13);
        b.put_u8(id);
        b.put_u32(index);
        b.put_u32(begin);
        b.put_u32(length);
        b
    }

    /// Parses the body of one frame (everything after the length prefix).
    ///
    /// An empty body is a keep-alive. Unknown ids and truncated payloads are
    /// errors; callers that must tolerate them skip the frame.
    pub fn parse(payload: Bytes) -> Result<PeerMessage, io::Error> {
        if payload.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = payload[0];
        let data = payload.slice(1..);

        let msg = match id {
            0 => PeerMessage::Choke,
            1 => PeerMessage::Unchoke,
            2 => PeerMessage::Interested,
            3 => PeerMessage::NotInterested,
            4 => PeerMessage::Have(read_u32(&data, 0)?),
            5 => PeerMessage::Bitfield(Bitfield::from_bytes(data.to_vec())),
            6 => PeerMessage::Request {
                index: read_u32(&data, 0)?,
                begin: read_u32(&data, 4)?,
                length: read_u32(&data, 8)?,
            },
            7 => {
                if data.len() < 8 {
                    return Err(invalid("piece payload too short"));
                }
                PeerMessage::Piece {
                    index: read_u32(&data, 0)?,
                    begin: read_u32(&data, 4)?,
                    block: data.slice(8..),
                }
            }
            8 => PeerMessage::Cancel {
                index: read_u32(&data, 0)?,
                begin: read_u32(&data, 4)?,
                length: read_u32(&data, 8)?,
            },
            other => {
                return Err(invalid(format!("unknown message id: {}", other)));
            }
        };

        Ok(msg)
    }
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, io::Error> {
    match data.get(at..at + 4) {
        Some(slice) => Ok(u32::from_be_bytes(slice.try_into().unwrap())),
        None => Err(invalid("payload too short")),
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
