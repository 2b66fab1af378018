use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distr::Alphanumeric;

use leech::announce;
use leech::engine::Engine;
use leech::torrent::Torrent;

const LISTEN_PORT: u16 = 6881;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = env::args().collect::<Vec<String>>();
    let program = Path::new(&args[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("leech"));

    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <torrent-file> [output-path]", program);
        std::process::exit(1);
    }

    let file = File::open(&args[1])?;
    let torrent = Torrent::from_file(&file)?;
    let output = match args.get(2) {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(&torrent.info.name),
    };

    log::info!(
        "'{}': {} bytes in {} pieces of {} bytes",
        torrent.info.name,
        torrent.info.total_length,
        torrent.info.piece_hashes.len(),
        torrent.info.piece_length
    );

    let peer_id = generate_peer_id();
    let peers = announce::gather_peers(&torrent, &peer_id, LISTEN_PORT);
    if peers.is_empty() {
        return Err("no tracker handed out any peers".into());
    }

    let mut engine = Engine::new(&torrent.info, &output, torrent.info_hash, peer_id)?;
    engine.start();
    engine.add_peers(peers);
    engine.run()?;

    println!("downloaded '{}' to {}", torrent.info.name, output.display());
    Ok(())
}

fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];

    let prefix = b"-LE0100-";
    peer_id[..prefix.len()].copy_from_slice(prefix);

    let mut rng = rand::rng();
    for byte in peer_id[prefix.len()..].iter_mut() {
        *byte = rng.sample(Alphanumeric) as u8;
    }

    peer_id
}
