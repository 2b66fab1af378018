use bytes::Bytes;
use leech::bitfield::Bitfield;
use leech::session::{PeerSession, SessionError, SessionEvent, SessionState};
use leech::work::PieceWork;
use leech::{BLOCK_SIZE, Handshake, PeerMessage};

const INFO_HASH: [u8; 20] = [7u8; 20];
const BLOCK: u32 = BLOCK_SIZE as u32;

fn new_session() -> PeerSession {
    PeerSession::new(INFO_HASH, [1u8; 20])
}

fn remote_handshake() -> Bytes {
    Handshake::new(INFO_HASH, [9u8; 20]).encode()
}

fn full_bitfield(pieces: usize) -> Bitfield {
    let mut bf = Bitfield::new(pieces);
    for i in 0..pieces {
        bf.set(i);
    }
    bf
}

fn ready_session(pieces: usize) -> PeerSession {
    let mut session = new_session();
    session.outgoing().clear();
    let events = session.receive(&remote_handshake()).unwrap();
    assert!(events.is_empty());
    let events = session
        .receive(&PeerMessage::Bitfield(full_bitfield(pieces)).encode())
        .unwrap();
    assert!(matches!(events[0], SessionEvent::Ready { .. }));
    session.outgoing().clear();
    session
}

fn unchoke(session: &mut PeerSession) {
    let events = session.receive(&PeerMessage::Unchoke.encode()).unwrap();
    assert!(events.is_empty());
}

fn block_frame(index: u32, begin: u32, data: Vec<u8>) -> Bytes {
    PeerMessage::Piece {
        index,
        begin,
        block: data.into(),
    }
    .encode()
}

fn queued_requests(session: &mut PeerSession) -> Vec<(u32, u32, u32)> {
    session
        .outgoing()
        .iter()
        .filter_map(|frame| match PeerMessage::parse(frame.slice(4..)) {
            Ok(PeerMessage::Request {
                index,
                begin,
                length,
            }) => Some((index, begin, length)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_handshake_is_queued_on_construction() {
    let mut session = new_session();
    let first = session.outgoing().pop_front().unwrap();
    let handshake = Handshake::parse(&first).unwrap();
    assert_eq!(handshake.info_hash, INFO_HASH);
    assert_eq!(handshake.peer_id, [1u8; 20]);
}

#[test]
fn test_handshake_and_bitfield_in_one_read() {
    let mut session = new_session();
    session.outgoing().clear();

    let mut bytes = remote_handshake().to_vec();
    bytes.extend_from_slice(&PeerMessage::Bitfield(full_bitfield(4)).encode());

    let events = session.receive(&bytes).unwrap();
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::Ready { bitfield } => {
            assert!(bitfield.get(0));
            assert!(bitfield.get(3));
        }
        other => panic!("expected Ready, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Ready);

    // The bitfield reply goes straight out: unchoke then interested.
    let sent: Vec<PeerMessage> = session
        .outgoing()
        .iter()
        .map(|f| PeerMessage::parse(f.slice(4..)).unwrap())
        .collect();
    assert_eq!(sent, vec![PeerMessage::Unchoke, PeerMessage::Interested]);
}

#[test]
fn test_infohash_mismatch_is_fatal() {
    let mut session = new_session();
    let foreign = Handshake::new([8u8; 20], [9u8; 20]).encode();
    let err = session.receive(&foreign).unwrap_err();
    assert!(matches!(err, SessionError::InfoHashMismatch));
}

#[test]
fn test_garbage_handshake_is_fatal() {
    let mut session = new_session();
    let err = session.receive(&[0u8; 68]).unwrap_err();
    assert!(matches!(err, SessionError::BadHandshake));
}

#[test]
fn test_first_frame_must_be_bitfield() {
    let mut session = new_session();
    session.receive(&remote_handshake()).unwrap();
    let err = session
        .receive(&PeerMessage::Have(0).encode())
        .unwrap_err();
    assert!(matches!(err, SessionError::ExpectedBitfield));
}

#[test]
fn test_keepalive_before_bitfield_is_skipped() {
    let mut session = new_session();
    session.receive(&remote_handshake()).unwrap();
    session.receive(&PeerMessage::KeepAlive.encode()).unwrap();
    let events = session
        .receive(&PeerMessage::Bitfield(full_bitfield(2)).encode())
        .unwrap();
    assert!(matches!(events[0], SessionEvent::Ready { .. }));
}

#[test]
fn test_oversized_frame_is_fatal() {
    let mut session = ready_session(2);
    let huge = (10 * 1024 * 1024u32).to_be_bytes();
    let err = session.receive(&huge).unwrap_err();
    assert!(matches!(err, SessionError::FrameTooLarge(_)));
}

#[test]
fn test_pump_waits_for_unchoke_and_caps_backlog() {
    let mut session = ready_session(1);
    session.assign(PieceWork {
        index: 0,
        size: 7 * BLOCK,
    });
    assert!(queued_requests(&mut session).is_empty());

    unchoke(&mut session);

    let requests = queued_requests(&mut session);
    assert_eq!(requests.len(), 5);
    for (i, (index, begin, length)) in requests.iter().enumerate() {
        assert_eq!(*index, 0);
        assert_eq!(*begin, i as u32 * BLOCK);
        assert_eq!(*length, BLOCK);
    }
}

#[test]
fn test_pump_refills_after_a_block() {
    let mut session = ready_session(1);
    session.assign(PieceWork {
        index: 0,
        size: 7 * BLOCK,
    });
    unchoke(&mut session);
    session.outgoing().clear();

    let events = session
        .receive(&block_frame(0, 0, vec![0xAA; BLOCK_SIZE]))
        .unwrap();
    assert!(events.is_empty());

    let requests = queued_requests(&mut session);
    assert_eq!(requests, vec![(0, 5 * BLOCK, BLOCK)]);
}

#[test]
fn test_short_last_block_request() {
    let mut session = ready_session(1);
    session.assign(PieceWork {
        index: 0,
        size: BLOCK + 5,
    });
    unchoke(&mut session);

    let requests = queued_requests(&mut session);
    assert_eq!(requests, vec![(0, 0, BLOCK), (0, BLOCK, 5)]);
}

#[test]
fn test_coalesced_blocks_complete_without_refill() {
    let mut session = ready_session(1);
    session.assign(PieceWork {
        index: 0,
        size: 2 * BLOCK,
    });
    unchoke(&mut session);
    session.outgoing().clear();

    let mut bytes = block_frame(0, 0, vec![0x11; BLOCK_SIZE]).to_vec();
    bytes.extend_from_slice(&block_frame(0, BLOCK, vec![0x22; BLOCK_SIZE]));

    let events = session.receive(&bytes).unwrap();
    assert_eq!(events.len(), 1);
    match &events[0] {
        SessionEvent::PieceDone { work, data } => {
            assert_eq!(work.index, 0);
            assert_eq!(data.len(), 2 * BLOCK_SIZE);
            assert!(data[..BLOCK_SIZE].iter().all(|b| *b == 0x11));
            assert!(data[BLOCK_SIZE..].iter().all(|b| *b == 0x22));
        }
        other => panic!("expected PieceDone, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Ready);
    assert!(queued_requests(&mut session).is_empty());
}

#[test]
fn test_frame_split_across_reads() {
    let mut session = ready_session(8);
    let frame = PeerMessage::Have(5).encode();

    let events = session.receive(&frame[..5]).unwrap();
    assert!(events.is_empty());

    let events = session.receive(&frame[5..]).unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SessionEvent::Have { piece: 5 }));
}

#[test]
fn test_keepalive_between_frames() {
    let mut session = ready_session(8);
    let mut bytes = PeerMessage::KeepAlive.encode().to_vec();
    bytes.extend_from_slice(&PeerMessage::Have(3).encode());

    let events = session.receive(&bytes).unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SessionEvent::Have { piece: 3 }));
}

#[test]
fn test_unknown_frame_is_skipped() {
    let mut session = ready_session(8);
    let mut bytes = vec![0, 0, 0, 4, 99, 1, 2, 3];
    bytes.extend_from_slice(&PeerMessage::Have(1).encode());

    let events = session.receive(&bytes).unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], SessionEvent::Have { piece: 1 }));
}

#[test]
fn test_block_for_wrong_piece_is_dropped() {
    let mut session = ready_session(8);
    session.assign(PieceWork {
        index: 0,
        size: BLOCK,
    });
    unchoke(&mut session);

    let events = session
        .receive(&block_frame(3, 0, vec![0xFF; BLOCK_SIZE]))
        .unwrap();
    assert!(events.is_empty());

    let events = session
        .receive(&block_frame(0, 0, vec![0xCC; BLOCK_SIZE]))
        .unwrap();
    assert!(matches!(&events[0], SessionEvent::PieceDone { work, .. } if work.index == 0));
}

#[test]
fn test_choke_pauses_the_pump() {
    let mut session = ready_session(1);
    session.assign(PieceWork {
        index: 0,
        size: 7 * BLOCK,
    });
    unchoke(&mut session);
    session.outgoing().clear();

    session.receive(&PeerMessage::Choke.encode()).unwrap();
    let events = session
        .receive(&block_frame(0, 0, vec![0xAB; BLOCK_SIZE]))
        .unwrap();
    assert!(events.is_empty());
    assert!(queued_requests(&mut session).is_empty());
}
