//! Application-facing byte streams and the UDP-backed [`Connection`].
//!
//! Each session is split in two halves that share a small outbound pipe:
//!
//! ```text
//!  application                         event loop task
//!  ┌──────────┐  write / finish  ┌──────────────────────┐
//!  │  Stream  │ ───▶ Pipe ─────▶ │ UdpConnection::input │
//!  │          │  ── ready(peer) ▶│   (Endpoint::run)    │
//!  │          │ ◀── delivered ── │ UdpConnection::output│
//!  └──────────┘                  └──────────┬───────────┘
//!                                           │ try_send_to
//!                                       UdpSocket
//! ```
//!
//! The session side never waits: it drains whatever the pipe holds and
//! pushes delivered chunks into an unbounded channel.  The application side
//! wakes the event loop by sending the peer address on the ready channel.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::connection::{Connection, Input};

#[derive(Debug, Default)]
struct Pipe {
    data: VecDeque<u8>,
    finished: bool,
}

fn lock(pipe: &Mutex<Pipe>) -> MutexGuard<'_, Pipe> {
    // A panic while holding this lock cannot leave the pipe half-updated.
    pipe.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// `write` or `finish` after the stream was already finished.
    #[error("stream already finished")]
    Finished,
    /// The event loop that owned the session has stopped.
    #[error("connection closed")]
    Closed,
}

/// The application's handle to one reliable connection.
#[derive(Debug)]
pub struct Stream {
    peer: SocketAddr,
    pipe: Arc<Mutex<Pipe>>,
    ready: mpsc::UnboundedSender<SocketAddr>,
    delivered: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Session-side halves of a [`Stream`], consumed by [`UdpConnection::open`].
#[derive(Debug)]
pub struct StreamParts {
    pipe: Arc<Mutex<Pipe>>,
    delivered: mpsc::UnboundedSender<Vec<u8>>,
}

/// Create a connected application stream and the parts its session needs.
///
/// `ready` is the event loop's readiness channel; the stream announces new
/// outbound data by sending `peer` on it.
pub fn pair(peer: SocketAddr, ready: mpsc::UnboundedSender<SocketAddr>) -> (StreamParts, Stream) {
    let pipe = Arc::new(Mutex::new(Pipe::default()));
    let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
    (
        StreamParts {
            pipe: Arc::clone(&pipe),
            delivered: delivered_tx,
        },
        Stream {
            peer,
            pipe,
            ready,
            delivered: delivered_rx,
        },
    )
}

impl Stream {
    /// Address of the remote end.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue `data` for reliable delivery to the peer.
    pub fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        {
            let mut pipe = lock(&self.pipe);
            if pipe.finished {
                return Err(StreamError::Finished);
            }
            pipe.data.extend(data);
        }
        self.notify()
    }

    /// Signal end-of-stream.  Already queued data is still delivered first.
    pub fn finish(&self) -> Result<(), StreamError> {
        {
            let mut pipe = lock(&self.pipe);
            if pipe.finished {
                return Err(StreamError::Finished);
            }
            pipe.finished = true;
        }
        self.notify()
    }

    /// Next chunk of in-order data from the peer.
    ///
    /// Returns `None` once the peer has finished writing (or the connection
    /// went away).
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.delivered.recv().await
    }

    fn notify(&self) -> Result<(), StreamError> {
        self.ready.send(self.peer).map_err(|_| StreamError::Closed)
    }
}

/// [`Connection`] over a shared UDP socket and an application [`Stream`].
#[derive(Debug)]
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    pipe: Arc<Mutex<Pipe>>,
    delivered: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl UdpConnection {
    /// Create the session side of a connection to `peer`.
    ///
    /// Fails for peers that can never be reached (unspecified address or
    /// port 0).
    pub fn open(socket: Arc<UdpSocket>, peer: SocketAddr, parts: StreamParts) -> io::Result<Self> {
        if peer.ip().is_unspecified() || peer.port() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot connect to {peer}"),
            ));
        }
        Ok(Self {
            socket,
            peer,
            pipe: parts.pipe,
            delivered: Some(parts.delivered),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn deliver(&mut self, chunk: Vec<u8>) {
        let gone = match &self.delivered {
            Some(tx) => tx.send(chunk).is_err(),
            None => false,
        };
        if gone {
            log::warn!("[rel] {}: application stopped reading; dropping output", self.peer);
            self.delivered = None;
        }
    }
}

impl Connection for UdpConnection {
    fn input(&mut self, buf: &mut [u8]) -> Input {
        let mut pipe = lock(&self.pipe);
        if pipe.data.is_empty() {
            return if pipe.finished { Input::Eof } else { Input::Empty };
        }
        let n = buf.len().min(pipe.data.len());
        for (dst, src) in buf[..n].iter_mut().zip(pipe.data.drain(..n)) {
            *dst = src;
        }
        Input::Data(n)
    }

    fn output(&mut self, data: &[u8]) {
        self.deliver(data.to_vec());
    }

    fn output_eof(&mut self) {
        // Dropping the sender ends the application's `recv` loop.
        self.delivered = None;
    }

    fn send_packet(&mut self, packet: &[u8]) {
        if let Err(e) = self.socket.try_send_to(packet, self.peer) {
            log::warn!("[rel] → {}: send failed, treating as loss: {e}", self.peer);
        }
    }

    fn destroy(&mut self) {
        self.delivered = None;
        log::info!("[rel] connection to {} closed", self.peer);
    }
}
