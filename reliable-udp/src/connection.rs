//! The boundary between a session and the outside world.
//!
//! A [`crate::session::Session`] never touches a socket or the application
//! directly.  Everything it needs from its surroundings goes through the
//! [`Connection`] trait: pulling outbound application bytes, handing
//! inbound bytes to the application, and putting datagrams on the wire.
//!
//! [`crate::stream::UdpConnection`] is the production implementation; tests
//! plug in in-memory connections.

/// Result of polling the application for outbound data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// `n` bytes were copied into the caller's buffer (`n > 0`).
    Data(usize),
    /// Nothing available right now; try again on the next readiness event.
    Empty,
    /// The application has finished writing.
    Eof,
}

/// Everything a session needs from its environment.
///
/// None of these methods may block.
pub trait Connection {
    /// Copy up to `buf.len()` outbound application bytes into `buf`.
    fn input(&mut self, buf: &mut [u8]) -> Input;

    /// Deliver in-order stream bytes to the application.
    fn output(&mut self, data: &[u8]);

    /// Tell the application the peer has finished writing.
    fn output_eof(&mut self);

    /// Transmit one encoded packet.  Failures are treated as loss.
    fn send_packet(&mut self, packet: &[u8]);

    /// Tear down the underlying connection.  Called exactly once, when the
    /// owning session is destroyed.
    fn destroy(&mut self);
}
