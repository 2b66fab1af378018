use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use leech::bitfield::Bitfield;
use leech::engine::Engine;
use leech::torrent::TorrentInfo;
use leech::{HANDSHAKE_LEN, PeerMessage};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy)]
enum Behavior {
    /// Serves every request faithfully.
    Honest,
    /// Serves every request with flipped bytes, so every piece fails its
    /// hash check.
    Corrupt,
    /// Serves this many blocks, then drops the connection.
    QuitAfterBlocks(usize),
    /// Advertises an empty bitfield; has nothing to serve.
    NoPieces,
}

fn spawn_seeder(payload: Vec<u8>, piece_length: usize, behavior: Behavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        while let Ok((stream, _)) = listener.accept() {
            let _ = serve(stream, &payload, piece_length, behavior);
            if matches!(behavior, Behavior::QuitAfterBlocks(_)) {
                return;
            }
        }
    });
    addr
}

fn serve(
    mut stream: TcpStream,
    payload: &[u8],
    piece_length: usize,
    behavior: Behavior,
) -> io::Result<()> {
    let pieces = payload.len().div_ceil(piece_length);

    let mut theirs = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut theirs)?;

    // Echo a handshake for the same swarm.
    let mut reply = Vec::with_capacity(HANDSHAKE_LEN);
    reply.push(19);
    reply.extend_from_slice(b"BitTorrent protocol");
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&theirs[28..48]);
    reply.extend_from_slice(b"-SD0100-aaaaaaaaaaaa");
    stream.write_all(&reply)?;

    let mut bitfield = Bitfield::new(pieces);
    if !matches!(behavior, Behavior::NoPieces) {
        for i in 0..pieces {
            bitfield.set(i);
        }
    }
    stream.write_all(&PeerMessage::Bitfield(bitfield).encode())?;
    stream.write_all(&PeerMessage::Unchoke.encode())?;

    let mut served = 0usize;
    loop {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame)?;
        let msg = match PeerMessage::parse(Bytes::from(frame)) {
            Ok(msg) => msg,
            Err(_) => continue,
        };
        let PeerMessage::Request {
            index,
            begin,
            length,
        } = msg
        else {
            continue;
        };

        let start = index as usize * piece_length + begin as usize;
        let mut data = payload[start..start + length as usize].to_vec();
        if matches!(behavior, Behavior::Corrupt) {
            for byte in &mut data {
                *byte ^= 0xFF;
            }
        }
        stream.write_all(
            &PeerMessage::Piece {
                index,
                begin,
                block: data.into(),
            }
            .encode(),
        )?;
        served += 1;

        if let Behavior::QuitAfterBlocks(limit) = behavior {
            if served >= limit {
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(());
            }
        }
    }
}

fn make_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

fn make_info(payload: &[u8], piece_length: u32) -> TorrentInfo {
    let piece_hashes = payload
        .chunks(piece_length as usize)
        .map(|chunk| {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            let digest = hasher.finalize();
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            hash
        })
        .collect();
    TorrentInfo {
        name: String::from("payload.bin"),
        piece_length,
        piece_hashes,
        total_length: payload.len() as u64,
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("leech-swarm-{}-{}", std::process::id(), name))
}

fn run_download(info: TorrentInfo, peers: Vec<SocketAddr>, out: PathBuf) {
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let result = (|| {
            let mut engine = Engine::new(&info, &out, [0xAB; 20], *b"-LE0100-tttttttttttt")
                .map_err(|e| e.to_string())?;
            engine.start();
            engine.add_peers(peers);
            engine.run().map_err(|e| e.to_string())
        })();
        let _ = done_tx.send(result);
    });
    done_rx
        .recv_timeout(DOWNLOAD_TIMEOUT)
        .expect("download timed out")
        .expect("download failed");
}

#[test]
fn test_single_peer_downloads_everything() {
    let piece_length = 16_384u32;
    let payload = make_payload(40_000);
    let info = make_info(&payload, piece_length);
    let out = temp_path("single");

    let seeder = spawn_seeder(payload.clone(), piece_length as usize, Behavior::Honest);
    run_download(info, vec![seeder], out.clone());

    assert_eq!(fs::read(&out).unwrap(), payload);
    let _ = fs::remove_file(&out);
}

#[test]
fn test_bad_hashes_get_fetched_from_another_peer() {
    let piece_length = 16_384u32;
    let payload = make_payload(32_768);
    let info = make_info(&payload, piece_length);
    let out = temp_path("badhash");

    let liar = spawn_seeder(payload.clone(), piece_length as usize, Behavior::Corrupt);
    let honest = spawn_seeder(payload.clone(), piece_length as usize, Behavior::Honest);
    run_download(info, vec![liar, honest], out.clone());

    assert_eq!(fs::read(&out).unwrap(), payload);
    let _ = fs::remove_file(&out);
}

#[test]
fn test_peer_with_empty_bitfield_is_ignored() {
    let piece_length = 16_384u32;
    let payload = make_payload(20_000);
    let info = make_info(&payload, piece_length);
    let out = temp_path("empty");

    let useless = spawn_seeder(payload.clone(), piece_length as usize, Behavior::NoPieces);
    let honest = spawn_seeder(payload.clone(), piece_length as usize, Behavior::Honest);
    run_download(info, vec![useless, honest], out.clone());

    assert_eq!(fs::read(&out).unwrap(), payload);
    let _ = fs::remove_file(&out);
}

#[test]
fn test_mid_piece_disconnect_requeues_the_piece() {
    let piece_length = 32_768u32; // two blocks per piece
    let payload = make_payload(65_536);
    let info = make_info(&payload, piece_length);
    let out = temp_path("requeue");

    let flaky = spawn_seeder(
        payload.clone(),
        piece_length as usize,
        Behavior::QuitAfterBlocks(1),
    );
    let honest = spawn_seeder(payload.clone(), piece_length as usize, Behavior::Honest);
    run_download(info, vec![flaky, honest], out.clone());

    assert_eq!(fs::read(&out).unwrap(), payload);
    let _ = fs::remove_file(&out);
}
