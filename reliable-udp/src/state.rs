//! Session lifecycle state types.
//!
//! A session is two independent half-connections.  The receive half is
//! either still open or has seen the peer's end-of-stream marker (a plain
//! `bool` on the session).  The send half moves through [`SendEofState`]:
//!
//! ```text
//!  None ──app EOF, marker sent──▶ Sent ──marker acked, window empty──▶ Acked
//! ```
//!
//! Once the receive half has seen EOF and the send half is `Acked` with
//! nothing in flight, the session reports [`Status::Finished`] and its
//! owner destroys it.

/// Progress of the local end-of-stream handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendEofState {
    /// The application has not signalled end-of-stream yet.
    #[default]
    None,
    /// The end-of-stream marker is on the wire; waiting for it to be acked.
    Sent,
    /// Everything we sent, marker included, has been acknowledged.
    Acked,
}

/// Outcome of delivering a packet to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The session is still live.
    Open,
    /// Both directions are finished and drained; destroy the session.
    Finished,
}

impl std::fmt::Display for SendEofState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
