use std::{
    collections::{HashMap, HashSet},
    error::Error,
    net::SocketAddr,
    path::Path,
};

use crossbeam::channel::{self, Receiver, Sender};

use crate::{
    bitfield::Bitfield,
    collector::{DiskManager, PieceCollector},
    hasher::Hasher,
    net::{NetEvent, NetManager},
    torrent::TorrentInfo,
    work::{PieceWork, WorkQueues, piece_works},
};

pub type Result<T> = std::result::Result<T, Box<dyn Error>>;

/// Everything the coordinator reacts to, from either the socket thread or
/// the disk thread.
#[derive(Debug)]
pub enum EngineEvent {
    /// A session finished its handshake and bitfield exchange.
    PeerReady {
        addr: SocketAddr,
        bitfield: Bitfield,
    },
    /// A connected peer announced one more piece.
    PeerHave { addr: SocketAddr, piece: u32 },
    /// A session downloaded its assigned piece; not yet validated.
    PieceDone {
        addr: SocketAddr,
        work: PieceWork,
        data: Vec<u8>,
    },
    /// A session went away, at any stage of its life.
    PeerDisconnected { addr: SocketAddr },
    /// Every piece is in the collector; writing has begun.
    CollectionComplete,
    /// The output file is fully written.
    WriteComplete,
    /// The disk side failed; the download cannot finish.
    DiskError { reason: String },
}

/// Work for the disk thread.
#[derive(Debug)]
pub enum DiskEvent {
    Collect { index: u32, data: Vec<u8> },
}

/// How many validated pieces may sit in the disk channel before the
/// coordinator blocks handing over more.
const DISK_CHANNEL_BOUND: usize = 64;

/// The download coordinator.
///
/// Owns the scheduling queues and the per-peer bookkeeping, and is their
/// only mutator; the socket and disk threads communicate with it purely
/// through events. Piece validation happens here, inline in the handler.
pub struct Engine {
    event_tx: Sender<EngineEvent>,
    event_rx: Receiver<EngineEvent>,
    net_tx: Sender<NetEvent>,
    net_rx: Receiver<NetEvent>,
    disk_tx: Sender<DiskEvent>,
    disk_rx: Receiver<DiskEvent>,
    net: NetManager,
    disk: DiskManager,
    collector: Option<PieceCollector>,
    queues: WorkQueues,
    peers: HashMap<SocketAddr, Bitfield>,
    connected: HashSet<SocketAddr>,
    collected: Bitfield,
    collected_count: usize,
    total_pieces: usize,
    hasher: Hasher,
    complete: bool,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
}

impl Engine {
    /// Builds a coordinator for the given descriptor, creating (and
    /// truncating) the output file up front.
    pub fn new(
        info: &TorrentInfo,
        output: &Path,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<Self> {
        let total_pieces = info.piece_hashes.len();
        let works = piece_works(info.total_length, info.piece_length);
        let collector = PieceCollector::new(total_pieces, output)?;

        let (event_tx, event_rx) = channel::unbounded();
        let (net_tx, net_rx) = channel::unbounded();
        let (disk_tx, disk_rx) = channel::bounded(DISK_CHANNEL_BOUND);

        Ok(Self {
            event_tx,
            event_rx,
            net_tx,
            net_rx,
            disk_tx,
            disk_rx,
            net: NetManager::new(),
            disk: DiskManager::new(),
            collector: Some(collector),
            queues: WorkQueues::new(works),
            peers: HashMap::new(),
            connected: HashSet::new(),
            collected: Bitfield::new(total_pieces),
            collected_count: 0,
            total_pieces,
            hasher: Hasher::new(info.piece_hashes.clone()),
            complete: false,
            info_hash,
            peer_id,
        })
    }

    /// Spawns the socket and disk threads.
    pub fn start(&mut self) {
        self.net
            .start(&self.net_rx, &self.event_tx, self.info_hash, self.peer_id);
        if let Some(collector) = self.collector.take() {
            self.disk.start(collector, &self.disk_rx, &self.event_tx);
        }
    }

    /// Opens a session towards every given endpoint.
    pub fn add_peers(&self, addrs: Vec<SocketAddr>) {
        log::info!("dialing {} peers", addrs.len());
        let _ = self.net_tx.send(NetEvent::Connect { addrs });
    }

    /// Drives the download to completion. Returns once the output file is
    /// fully written, or with an error if the disk side fails.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let ev = self.event_rx.recv()?;
            match ev {
                EngineEvent::PeerReady { addr, bitfield } => self.on_peer_ready(addr, bitfield),
                EngineEvent::PeerHave { addr, piece } => {
                    if let Some(bitfield) = self.peers.get_mut(&addr) {
                        bitfield.set(piece as usize);
                    }
                }
                EngineEvent::PieceDone { addr, work, data } => {
                    self.on_piece_done(addr, work, data)
                }
                EngineEvent::PeerDisconnected { addr } => self.on_peer_disconnected(addr),
                EngineEvent::CollectionComplete => {
                    log::info!("all pieces collected, disconnecting peers");
                    self.complete = true;
                    let _ = self.net_tx.send(NetEvent::DisconnectAll);
                }
                EngineEvent::WriteComplete => {
                    log::info!("output file written");
                    break;
                }
                EngineEvent::DiskError { reason } => {
                    self.shutdown();
                    return Err(reason.into());
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.net_tx.send(NetEvent::Shutdown);
        self.net.join();
        self.disk.join();
    }

    fn on_peer_ready(&mut self, addr: SocketAddr, bitfield: Bitfield) {
        log::debug!(
            "{} ready, serves {} of {} pieces",
            addr,
            bitfield.count_ones().min(self.total_pieces),
            self.total_pieces
        );
        self.connected.insert(addr);
        self.peers.insert(addr, bitfield);
        self.queues.push_idle(addr);
        self.assign_idle();
    }

    fn on_piece_done(&mut self, addr: SocketAddr, work: PieceWork, data: Vec<u8>) {
        if self.hasher.verify(work.index, &data) {
            if !self.collected.get(work.index as usize) {
                self.collected.set(work.index as usize);
                self.collected_count += 1;
                log::info!(
                    "({:5.1}%) downloaded piece {} from {} ({} peers connected)",
                    self.collected_count as f64 / self.total_pieces as f64 * 100.0,
                    work.index,
                    addr,
                    self.connected.len()
                );
            }
            if !self.complete {
                // Blocks when the disk falls behind; that is the backpressure.
                let _ = self.disk_tx.send(DiskEvent::Collect {
                    index: work.index,
                    data,
                });
            }
        } else {
            log::warn!("{} delivered piece {} with a bad hash", addr, work.index);
            // This worker is still counted, so one worker means no one else
            // is fetching the piece and it has to go back in the pool.
            if !self.collected.get(work.index as usize) && self.queues.workers_on(work.index) == 1
            {
                self.queues.push_unclaimed(work);
            }
        }

        let _ = self.queues.remove_pending(&addr);
        if self.connected.contains(&addr) {
            self.queues.push_idle(addr);
        }
        self.assign_idle();
    }

    fn on_peer_disconnected(&mut self, addr: SocketAddr) {
        if self.connected.remove(&addr) {
            log::debug!("{} disconnected ({} peers left)", addr, self.connected.len());
        }
        self.peers.remove(&addr);
        self.queues.remove_idle(&addr);
        if let Some(work) = self.queues.remove_pending(&addr) {
            if !self.complete
                && !self.collected.get(work.index as usize)
                && self.queues.workers_on(work.index) == 0
            {
                log::debug!("requeueing piece {} after disconnect", work.index);
                self.queues.push_unclaimed(work);
            }
        }
        self.assign_idle();
    }

    /// The assignment policy. Every idle peer either claims an unclaimed
    /// piece it can serve, doubles up on a pending piece near the end of
    /// the download, or gets disconnected for having nothing to offer.
    /// Sessions are only told about their new work afterwards, via the
    /// start cursor, never from inside this loop.
    fn assign_idle(&mut self) {
        if self.complete {
            return;
        }
        while let Some(addr) = self.queues.pop_idle() {
            let Some(bitfield) = self.peers.get(&addr) else {
                continue;
            };
            if let Some(work) = self.queues.claim_for(bitfield) {
                self.queues.push_pending(addr, work);
                continue;
            }
            if let Some(work) = self.queues.duplicate_for(bitfield, &self.collected) {
                self.queues.push_pending(addr, work);
                continue;
            }
            log::debug!("{} has nothing left to offer, disconnecting", addr);
            let _ = self.net_tx.send(NetEvent::Disconnect { addr });
        }
        for (addr, work) in self.queues.start_all() {
            let _ = self.net_tx.send(NetEvent::Assign { addr, work });
        }
    }
}
