use std::{collections::VecDeque, fmt};

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    BLOCK_SIZE, HANDSHAKE_LEN, Handshake, MAX_BACKLOG, PeerMessage, bitfield::Bitfield,
    work::PieceWork,
};

/// Frames longer than this are treated as a protocol violation and kill the
/// session. A well-behaved peer never sends more than one block per frame.
pub const MAX_FRAME_LEN: usize = 2 * BLOCK_SIZE;

/// Protocol violations that terminate the session. Everything else the
/// session absorbs by skipping the offending frame.
#[derive(Debug)]
pub enum SessionError {
    BadHandshake,
    InfoHashMismatch,
    ExpectedBitfield,
    FrameTooLarge(usize),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::BadHandshake => write!(f, "malformed handshake"),
            SessionError::InfoHashMismatch => write!(f, "handshake infohash mismatch"),
            SessionError::ExpectedBitfield => write!(f, "first message was not a bitfield"),
            SessionError::FrameTooLarge(len) => write!(f, "frame length {} implausible", len),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the remote handshake.
    Handshaking,
    /// Handshake done; the first framed message must be the bitfield.
    AwaitingBitfield,
    /// Bitfield exchanged; accepting work.
    Ready,
    /// A piece assignment is in progress.
    Working,
}

/// What the session tells its owner after digesting inbound bytes.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake and bitfield completed; the peer can be scheduled.
    Ready { bitfield: Bitfield },
    /// The peer announced one more piece.
    Have { piece: u32 },
    /// The current assignment finished downloading.
    PieceDone { work: PieceWork, data: Vec<u8> },
}

#[derive(Debug)]
struct Assignment {
    work: PieceWork,
    buffer: Vec<u8>,
    downloaded: u32,
    requested: u32,
    backlog: u32,
}

impl Assignment {
    fn new(work: PieceWork) -> Self {
        Self {
            work,
            buffer: vec![0; work.size as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }
}

/// Protocol state machine for a single peer connection.
///
/// The session owns no socket. Its owner feeds it inbound bytes through
/// [`PeerSession::receive`] and drains [`PeerSession::outgoing`] onto the
/// wire; assignment commands arrive through [`PeerSession::assign`]. A
/// `SessionError` from `receive` means the connection must be closed.
#[derive(Debug)]
pub struct PeerSession {
    state: SessionState,
    choked: bool,
    bitfield: Bitfield,
    inbound: BytesMut,
    outgoing: VecDeque<Bytes>,
    assignment: Option<Assignment>,
    info_hash: [u8; 20],
}

impl PeerSession {
    /// Creates a session that has just connected. Our handshake is queued
    /// for sending immediately.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut outgoing = VecDeque::new();
        outgoing.push_back(Handshake::new(info_hash, peer_id).encode());
        Self {
            state: SessionState::Handshaking,
            choked: true,
            bitfield: Bitfield::from_bytes(Vec::new()),
            inbound: BytesMut::new(),
            outgoing,
            assignment: None,
            info_hash,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Frames queued for the wire. The owner writes from the front and
    /// drops fully-written entries.
    pub fn outgoing(&mut self) -> &mut VecDeque<Bytes> {
        &mut self.outgoing
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Appends inbound bytes and processes every complete frame in the
    /// buffer. Frames split across reads are held until the tail arrives;
    /// coalesced frames are all handled in one call.
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<SessionEvent>, SessionError> {
        self.inbound.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            if self.state == SessionState::Handshaking {
                if self.inbound.len() < HANDSHAKE_LEN {
                    break;
                }
                let raw = self.inbound.split_to(HANDSHAKE_LEN);
                let handshake =
                    Handshake::parse(&raw).map_err(|_| SessionError::BadHandshake)?;
                if handshake.info_hash != self.info_hash {
                    return Err(SessionError::InfoHashMismatch);
                }
                self.state = SessionState::AwaitingBitfield;
                continue;
            }

            if self.inbound.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes(self.inbound[0..4].try_into().unwrap()) as usize;
            if len == 0 {
                // keep-alive
                self.inbound.advance(4);
                continue;
            }
            if len > MAX_FRAME_LEN {
                return Err(SessionError::FrameTooLarge(len));
            }
            if self.inbound.len() < 4 + len {
                break;
            }
            self.inbound.advance(4);
            let payload = self.inbound.split_to(len).freeze();
            self.handle_frame(payload, &mut events)?;
        }

        // One refill for the whole batch. A completed piece cleared the
        // assignment above, so this is a no-op until the next assign.
        self.pump_requests();

        Ok(events)
    }

    fn handle_frame(
        &mut self,
        payload: Bytes,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), SessionError> {
        let msg = match PeerMessage::parse(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("skipping unparseable frame: {}", e);
                return Ok(());
            }
        };

        if self.state == SessionState::AwaitingBitfield {
            return match msg {
                PeerMessage::Bitfield(bitfield) => {
                    self.bitfield = bitfield;
                    self.outgoing.push_back(PeerMessage::Unchoke.encode());
                    self.outgoing.push_back(PeerMessage::Interested.encode());
                    self.state = SessionState::Ready;
                    events.push(SessionEvent::Ready {
                        bitfield: self.bitfield.clone(),
                    });
                    Ok(())
                }
                PeerMessage::KeepAlive => Ok(()),
                _ => Err(SessionError::ExpectedBitfield),
            };
        }

        match msg {
            PeerMessage::Choke => self.choked = true,
            PeerMessage::Unchoke => self.choked = false,
            PeerMessage::Have(piece) => {
                self.bitfield.set(piece as usize);
                events.push(SessionEvent::Have { piece });
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => self.on_block(index, begin, &block, events),
            other => {
                log::debug!("ignoring {} message", message_name(&other));
            }
        }

        Ok(())
    }

    fn on_block(&mut self, index: u32, begin: u32, block: &[u8], events: &mut Vec<SessionEvent>) {
        let Some(assignment) = self.assignment.as_mut() else {
            log::debug!("dropping block for piece {}: nothing assigned", index);
            return;
        };
        if index != assignment.work.index {
            log::debug!(
                "dropping block for piece {}: working on {}",
                index,
                assignment.work.index
            );
            return;
        }
        let begin = begin as usize;
        if begin + block.len() > assignment.buffer.len() {
            log::debug!("dropping block for piece {}: offset out of bounds", index);
            return;
        }

        assignment.buffer[begin..begin + block.len()].copy_from_slice(block);
        assignment.downloaded += block.len() as u32;
        assignment.backlog = assignment.backlog.saturating_sub(1);

        if assignment.downloaded >= assignment.work.size {
            let done = self.assignment.take().unwrap();
            self.state = SessionState::Ready;
            events.push(SessionEvent::PieceDone {
                work: done.work,
                data: done.buffer,
            });
        }
    }

    /// Starts downloading the given piece. Replaces any prior assignment;
    /// the coordinator never assigns while one is outstanding.
    pub fn assign(&mut self, work: PieceWork) {
        self.assignment = Some(Assignment::new(work));
        self.state = SessionState::Working;
        self.pump_requests();
    }

    /// Keeps the outbound request window full: one request per missing
    /// block until the backlog cap or the end of the piece is reached.
    fn pump_requests(&mut self) {
        if self.state != SessionState::Working || self.choked {
            return;
        }
        let Some(assignment) = self.assignment.as_mut() else {
            return;
        };
        while assignment.backlog < MAX_BACKLOG && assignment.requested < assignment.work.size {
            let length = (assignment.work.size - assignment.requested).min(BLOCK_SIZE as u32);
            self.outgoing.push_back(
                PeerMessage::Request {
                    index: assignment.work.index,
                    begin: assignment.requested,
                    length,
                }
                .encode(),
            );
            assignment.requested += length;
            assignment.backlog += 1;
        }
    }
}

fn message_name(msg: &PeerMessage) -> &'static str {
    match msg {
        PeerMessage::Choke => "choke",
        PeerMessage::Unchoke => "unchoke",
        PeerMessage::Interested => "interested",
        PeerMessage::NotInterested => "not interested",
        PeerMessage::Have(_) => "have",
        PeerMessage::Bitfield(_) => "bitfield",
        PeerMessage::Request { .. } => "request",
        PeerMessage::Piece { .. } => "piece",
        PeerMessage::Cancel { .. } => "cancel",
        PeerMessage::KeepAlive => "keep-alive",
    }
}
