//! `reliable-udp`: an ordered, reliable byte stream over UDP using a
//! fixed sliding window, cumulative ACKs, and timeout retransmission.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  write/finish   ┌────────────────────────────────────┐
//!  │  Stream  │────────────────▶│             Endpoint               │
//!  │  (app)   │◀────────────────│  (event loop: socket, ready, tick) │
//!  └──────────┘   delivered     └────┬───────────────────────────────┘
//!                                    │ owns
//!                               ┌────▼─────┐  traverses  ┌───────────┐
//!                               │ Registry │────────────▶│  Session  │ × N
//!                               └──────────┘             │ send/recv │
//!                                                        │  buffers  │
//!                                                        └─────┬─────┘
//!                                          Connection trait    │
//!                                    (UdpConnection in prod)   ▼
//!                                                          UdpSocket
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      — wire format (serialise / deserialise / checksum)
//! - [`buffer`]      — sequence-ordered packet buffer
//! - [`session`]     — per-connection sliding-window state machine
//! - [`state`]       — end-of-stream and session status types
//! - [`connection`]  — the trait a session uses to reach the outside world
//! - [`registry`]    — live sessions and the retransmission timer sweep
//! - [`config`]      — window and timeout parameters
//! - [`stream`]      — application stream handles and the UDP connection
//! - [`endpoint`]    — tokio event loop multiplexing sessions on one socket
//! - [`simulator`]   — seeded lossy/reordering link for testing

pub mod buffer;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod packet;
pub mod registry;
pub mod session;
pub mod simulator;
pub mod state;
pub mod stream;

pub use config::{Config, ConfigError};
pub use connection::{Connection, Input};
pub use endpoint::{Endpoint, EndpointError, Mode};
pub use packet::{DataPacket, Packet, PacketError};
pub use registry::{Registry, SessionError, SessionId};
pub use session::Session;
pub use state::{SendEofState, Status};
pub use stream::{Stream, StreamError};
