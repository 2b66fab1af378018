use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::SocketAddr,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bytes::Buf;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use mio::{Events, Interest, Poll, Token, net::TcpStream};

use crate::{
    engine::EngineEvent,
    session::{PeerSession, SessionEvent},
    work::PieceWork,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const CHANNEL_TIMEOUT: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 16 * 1024;

/// Commands the coordinator posts to the socket thread.
#[derive(Debug)]
pub enum NetEvent {
    Connect { addrs: Vec<SocketAddr> },
    Assign { addr: SocketAddr, work: PieceWork },
    Disconnect { addr: SocketAddr },
    DisconnectAll,
    Shutdown,
}

struct Connection {
    token: Token,
    socket: TcpStream,
    session: PeerSession,
    connecting: bool,
    /// Connect deadline while connecting, then the handshake-and-bitfield
    /// deadline; cleared once the session reports ready.
    deadline: Option<Instant>,
    last_interest: Interest,
}

impl Connection {
    fn interest(&self) -> Interest {
        if self.connecting || self.session.has_outgoing() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }
}

struct NetLoop {
    poll: Poll,
    connections: HashMap<SocketAddr, Connection>,
    token_to_addr: HashMap<Token, SocketAddr>,
    next_token: usize,
    engine_tx: Sender<EngineEvent>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
}

impl NetLoop {
    /// Returns true when the loop should exit.
    fn handle_command(&mut self, ev: NetEvent) -> bool {
        match ev {
            NetEvent::Connect { addrs } => {
                for addr in addrs {
                    if self.connections.contains_key(&addr) {
                        continue;
                    }
                    if let Err(e) = self.connect(addr) {
                        log::warn!("{} connect failed: {}", addr, e);
                    }
                }
            }
            NetEvent::Assign { addr, work } => {
                if let Some(conn) = self.connections.get_mut(&addr) {
                    conn.session.assign(work);
                }
                self.refresh_interest(&addr);
            }
            NetEvent::Disconnect { addr } => {
                self.close(&addr, true);
            }
            NetEvent::DisconnectAll => {
                let addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();
                for addr in addrs {
                    self.close(&addr, true);
                }
            }
            NetEvent::Shutdown => {
                let addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();
                for addr in addrs {
                    self.close(&addr, false);
                }
                return true;
            }
        }
        false
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut socket = TcpStream::connect(addr)?;
        let token = Token(self.next_token);
        self.next_token += 1;

        let interest = Interest::READABLE.add(Interest::WRITABLE);
        self.poll.registry().register(&mut socket, token, interest)?;

        self.token_to_addr.insert(token, addr);
        self.connections.insert(
            addr,
            Connection {
                token,
                socket,
                session: PeerSession::new(self.info_hash, self.peer_id),
                connecting: true,
                deadline: Some(Instant::now() + CONNECT_TIMEOUT),
                last_interest: interest,
            },
        );
        Ok(())
    }

    fn close(&mut self, addr: &SocketAddr, notify: bool) {
        let Some(mut conn) = self.connections.remove(addr) else {
            return;
        };
        self.token_to_addr.remove(&conn.token);
        if let Err(e) = self.poll.registry().deregister(&mut conn.socket) {
            log::error!("{} failed to deregister socket: {}", addr, e);
        }
        if notify {
            let _ = self
                .engine_tx
                .send(EngineEvent::PeerDisconnected { addr: *addr });
        }
    }

    fn check_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<SocketAddr> = self
            .connections
            .iter()
            .filter(|(_, c)| c.deadline.is_some_and(|d| now >= d))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in expired {
            log::warn!("{} timed out before completing the preamble", addr);
            self.close(&addr, true);
        }
    }

    fn on_readable(&mut self, addr: SocketAddr) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let Some(conn) = self.connections.get_mut(&addr) else {
                return;
            };
            match conn.socket.read(&mut buf) {
                Ok(0) => {
                    log::debug!("{} closed the connection", addr);
                    self.close(&addr, true);
                    return;
                }
                Ok(n) => match conn.session.receive(&buf[..n]) {
                    Ok(events) => self.forward_session_events(addr, events),
                    Err(e) => {
                        log::debug!("{} protocol error: {}", addr, e);
                        self.close(&addr, true);
                        return;
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{} read error: {}", addr, e);
                    self.close(&addr, true);
                    return;
                }
            }
        }
    }

    fn forward_session_events(&mut self, addr: SocketAddr, events: Vec<SessionEvent>) {
        for ev in events {
            match ev {
                SessionEvent::Ready { bitfield } => {
                    if let Some(conn) = self.connections.get_mut(&addr) {
                        conn.deadline = None;
                    }
                    let _ = self.engine_tx.send(EngineEvent::PeerReady { addr, bitfield });
                }
                SessionEvent::Have { piece } => {
                    let _ = self.engine_tx.send(EngineEvent::PeerHave { addr, piece });
                }
                SessionEvent::PieceDone { work, data } => {
                    let _ = self
                        .engine_tx
                        .send(EngineEvent::PieceDone { addr, work, data });
                }
            }
        }
    }

    fn on_writable(&mut self, addr: SocketAddr) {
        let Some(conn) = self.connections.get_mut(&addr) else {
            return;
        };

        if conn.connecting {
            match conn.socket.take_error() {
                Ok(Some(e)) => {
                    log::debug!("{} connect error: {}", addr, e);
                    self.close(&addr, true);
                    return;
                }
                Ok(None) => {
                    conn.connecting = false;
                    conn.deadline = Some(Instant::now() + PREAMBLE_TIMEOUT);
                }
                Err(e) => {
                    log::debug!("{} connect error: {}", addr, e);
                    self.close(&addr, true);
                    return;
                }
            }
        }

        loop {
            let Some(conn) = self.connections.get_mut(&addr) else {
                return;
            };
            let Some(front) = conn.session.outgoing().front_mut() else {
                return;
            };
            match conn.socket.write(front) {
                Ok(0) => {
                    self.close(&addr, true);
                    return;
                }
                Ok(n) => {
                    front.advance(n);
                    if front.is_empty() {
                        conn.session.outgoing().pop_front();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{} write error: {}", addr, e);
                    self.close(&addr, true);
                    return;
                }
            }
        }
    }

    fn refresh_interest(&mut self, addr: &SocketAddr) {
        let Some(conn) = self.connections.get_mut(addr) else {
            return;
        };
        let interest = conn.interest();
        if interest == conn.last_interest {
            return;
        }
        match self
            .poll
            .registry()
            .reregister(&mut conn.socket, conn.token, interest)
        {
            Ok(()) => conn.last_interest = interest,
            Err(e) => {
                log::error!("{} failed to reregister poll: {}", addr, e);
                self.close(addr, true);
            }
        }
    }
}

/// Owns the socket thread: all connects, reads, writes and per-connection
/// sessions live there, driven by a mio poll.
#[derive(Debug)]
pub struct NetManager {
    join: Option<JoinHandle<()>>,
}

impl NetManager {
    pub fn new() -> Self {
        Self { join: None }
    }

    pub fn start(
        &mut self,
        rx: &Receiver<NetEvent>,
        engine_tx: &Sender<EngineEvent>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) {
        let rx = rx.clone();
        let engine_tx = engine_tx.clone();
        let join = std::thread::spawn(move || {
            let poll = match Poll::new() {
                Ok(p) => p,
                Err(e) => {
                    log::error!("failed to create poll: {}", e);
                    return;
                }
            };
            let mut net = NetLoop {
                poll,
                connections: HashMap::new(),
                token_to_addr: HashMap::new(),
                next_token: 1,
                engine_tx,
                info_hash,
                peer_id,
            };
            let mut events = Events::with_capacity(256);

            loop {
                loop {
                    match rx.recv_timeout(CHANNEL_TIMEOUT) {
                        Ok(cmd) => {
                            if net.handle_command(cmd) {
                                return;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }

                net.check_deadlines();

                if let Err(e) = net.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                    log::error!("failed to poll sockets: {}", e);
                    continue;
                }

                for event in events.iter() {
                    let addr = match net.token_to_addr.get(&event.token()) {
                        Some(a) => *a,
                        None => continue,
                    };
                    if event.is_readable() {
                        net.on_readable(addr);
                    }
                    if event.is_writable() {
                        net.on_writable(addr);
                    }
                    net.refresh_interest(&addr);
                }
            }
        });
        self.join = Some(join);
    }

    pub fn join(&mut self) {
        let join = match self.join.take() {
            Some(j) => j,
            None => return,
        };
        let _ = join.join();
    }
}

impl Default for NetManager {
    fn default() -> Self {
        Self::new()
    }
}
