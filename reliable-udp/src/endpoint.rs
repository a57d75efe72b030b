//! UDP endpoint: one socket, many sessions, one event loop.
//!
//! [`Endpoint`] owns the socket and the [`Registry`] and funnels every
//! session entry point through a single task, so no session state is ever
//! shared between threads:
//!
//! ```text
//!                 ┌────────────────── Endpoint::run ──────────────────┐
//!  UdpSocket ───▶ │ recv_from  ─▶ peers[addr] ─▶ Registry::receive    │
//!  Stream::write ▶│ ready(peer) ─▶ peers[addr] ─▶ Registry::read      │
//!  interval ────▶ │ tick        ─────────────────▶ Registry::tick     │
//!                 └───────────────────────────────────────────────────┘
//! ```
//!
//! A client endpoint opens sessions with [`Endpoint::connect`] and its
//! `run` returns once all of them have finished.  A server endpoint opens a
//! session for every new peer whose first valid packet is data packet 1,
//! and hands the matching [`Stream`] out through [`Endpoint::incoming`].
//!
//! A finished peer lingers for [`Config::linger`]: its retransmitted data
//! packets are acknowledged again so it can finish too, and none of them can
//! open a new session.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, ConfigError};
use crate::packet::{encode_ack, Packet};
use crate::registry::{Registry, SessionError, SessionId};
use crate::state::Status;
use crate::stream::{self, Stream, UdpConnection};

/// Largest datagram we are prepared to read; anything longer is truncated
/// and then rejected by the codec.
const RECV_BUFFER: usize = 2048;

/// Whether the endpoint accepts sessions from unknown peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
}

/// A bound UDP socket multiplexing reliable sessions by peer address.
#[derive(Debug)]
pub struct Endpoint {
    socket: Arc<UdpSocket>,
    config: Config,
    mode: Mode,
    registry: Registry<UdpConnection>,
    peers: HashMap<SocketAddr, SessionId>,
    /// Finished peers and when to forget them.
    lingering: HashMap<SocketAddr, Instant>,
    ready_tx: mpsc::UnboundedSender<SocketAddr>,
    ready_rx: mpsc::UnboundedReceiver<SocketAddr>,
    incoming_tx: mpsc::UnboundedSender<Stream>,
    incoming_rx: Option<mpsc::UnboundedReceiver<Stream>>,
}

impl Endpoint {
    /// Validate `config` and bind a socket to `addr`.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub async fn bind(addr: SocketAddr, config: Config, mode: Mode) -> Result<Self, EndpointError> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        log::info!("[rel] {mode:?} endpoint bound to {}", socket.local_addr()?);

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Ok(Self {
            socket: Arc::new(socket),
            config,
            mode,
            registry: Registry::new(),
            peers: HashMap::new(),
            lingering: HashMap::new(),
            ready_tx,
            ready_rx,
            incoming_tx,
            incoming_rx: Some(incoming_rx),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of live sessions.
    pub fn sessions(&self) -> usize {
        self.registry.len()
    }

    /// Open a session to `peer`.
    ///
    /// Nothing is sent until the returned stream is written to or finished.
    pub fn connect(&mut self, peer: SocketAddr) -> Result<Stream, EndpointError> {
        self.lingering.remove(&peer);
        if self.peers.contains_key(&peer) {
            return Err(EndpointError::AlreadyConnected(peer));
        }
        let (parts, stream) = stream::pair(peer, self.ready_tx.clone());
        let socket = Arc::clone(&self.socket);
        let id = self
            .registry
            .connect(&self.config, move || UdpConnection::open(socket, peer, parts))?;
        self.peers.insert(peer, id);
        log::info!("[rel] connecting to {peer}");
        Ok(stream)
    }

    /// Streams for sessions opened by remote peers.  Only the first call
    /// returns the receiver.
    pub fn incoming(&mut self) -> Option<mpsc::UnboundedReceiver<Stream>> {
        self.incoming_rx.take()
    }

    /// Drive every session until the endpoint is done.
    ///
    /// A client returns once its last session is destroyed; a server runs
    /// until the task is dropped or the socket fails.
    pub async fn run(mut self) -> Result<(), EndpointError> {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            if self.mode == Mode::Client && self.registry.is_empty() {
                log::info!("[rel] all sessions closed");
                return Ok(());
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((n, from)) => self.on_datagram(&buf[..n], from, Instant::now()),
                    Err(e) if is_transient(&e) => {
                        log::warn!("[rel] recv_from: {e}; continuing");
                    }
                    Err(e) => return Err(e.into()),
                },
                Some(peer) = self.ready_rx.recv() => {
                    self.on_ready(peer, Instant::now());
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.lingering.retain(|_, until| *until > now);
                    let resent = self.registry.tick(now);
                    if resent > 0 {
                        log::debug!("[rel] sweep retransmitted {resent} packet(s)");
                    }
                }
            }
        }
    }

    fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let id = match self.peers.get(&from) {
            Some(&id) => id,
            None if self.lingering.contains_key(&from) => {
                self.reack_finished(datagram, from);
                return;
            }
            None => match self.accept(datagram, from) {
                Some(id) => id,
                None => return,
            },
        };

        match self.registry.receive(id, datagram, datagram.len(), now) {
            Ok(Status::Open) => {}
            Ok(Status::Finished) => {
                self.peers.remove(&from);
                self.lingering.insert(from, now + self.config.linger());
                log::info!("[rel] session with {from} finished");
            }
            Err(e) => {
                log::warn!("[rel] {from}: {e}");
                self.peers.remove(&from);
            }
        }
    }

    /// Open a server-side session for a previously unknown peer.
    fn accept(&mut self, datagram: &[u8], from: SocketAddr) -> Option<SessionId> {
        if self.mode != Mode::Server {
            log::trace!("[rel] ← {from}: not a known peer; dropped");
            return None;
        }
        // Only the start of a stream opens a session; stray ACKs and late
        // retransmissions from finished sessions do not.
        match Packet::decode(datagram, datagram.len()) {
            Ok(Packet::Data(data)) if data.seqno == 1 => {}
            _ => {
                log::trace!("[rel] ← {from}: ignoring packet from unknown peer");
                return None;
            }
        }

        let (parts, stream) = stream::pair(from, self.ready_tx.clone());
        let socket = Arc::clone(&self.socket);
        let id = match self
            .registry
            .connect(&self.config, move || UdpConnection::open(socket, from, parts))
        {
            Ok(id) => id,
            Err(e) => {
                log::warn!("[rel] cannot accept {from}: {e}");
                return None;
            }
        };
        self.peers.insert(from, id);
        log::info!("[rel] accepted session from {from}");

        if self.incoming_tx.send(stream).is_err() {
            log::warn!("[rel] no one is accepting streams; {from} will only be acknowledged");
        }
        Some(id)
    }

    /// Answer a retransmission from a peer whose session already finished.
    ///
    /// The session delivered the peer's whole stream, so every data packet
    /// it can still be resending is covered by an ack for `seqno + 1`.
    fn reack_finished(&self, datagram: &[u8], from: SocketAddr) {
        let seqno = match Packet::decode(datagram, datagram.len()) {
            Ok(Packet::Data(data)) => data.seqno,
            _ => {
                log::trace!("[rel] ← {from}: finished peer; dropped");
                return;
            }
        };
        let ackno = seqno.saturating_add(1);
        log::trace!("[rel] ← {from}: DATA seq={seqno} after finish; → ACK ack={ackno}");
        if let Err(e) = self.socket.try_send_to(&encode_ack(ackno), from) {
            log::warn!("[rel] → {from}: send failed, treating as loss: {e}");
        }
    }

    fn on_ready(&mut self, peer: SocketAddr, now: Instant) {
        let Some(&id) = self.peers.get(&peer) else {
            log::trace!("[rel] readiness for closed session {peer}");
            return;
        };
        if let Err(e) = self.registry.read(id, now) {
            log::warn!("[rel] {peer}: {e}");
            self.peers.remove(&peer);
        }
    }
}

/// Receive errors caused by one unreachable peer rather than the socket.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
