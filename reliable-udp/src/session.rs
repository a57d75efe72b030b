//! Per-connection sliding-window state machine.
//!
//! [`Session`] owns both halves of one reliable connection:
//!
//! ```text
//!        send_una            send_next
//!            │                   │
//!  ──────────┼───────────────────┼──────────────────▶ our seq space
//!   acked    │ <── in flight ──▶ │ <── sendable while
//!            │    (send_buffer)  │     send_wnd < max_window
//!
//!        recv_next           recv_next + max_window
//!            │                   │
//!  ──────────┼───────────────────┼──────────────────▶ peer seq space
//!  delivered │ <── buffered ───▶ │ <── dropped
//!            │    (recv_buffer)  │
//! ```
//!
//! Sequence numbers count packets, not bytes, and start at 1 in both
//! directions.  Acknowledgments are cumulative: `ackno = K` means every
//! packet below `K` arrived.
//!
//! There are three entry points, all synchronous and run to completion:
//! - [`Session::receive`] — an inbound datagram,
//! - [`Session::read`] — the application may have data to send,
//! - [`Session::retransmit_expired`] — a tick of the timer sweep.
//!
//! Corrupt, truncated, duplicate, and out-of-window packets are handled
//! silently; the peer's retransmission timer recovers from all of them.
//! All socket and application I/O goes through the [`Connection`] trait.

use std::time::{Duration, Instant};

use crate::buffer::PacketBuffer;
use crate::config::Config;
use crate::connection::{Connection, Input};
use crate::packet::{encode_ack, DataPacket, Packet, MAX_PAYLOAD};
use crate::state::{SendEofState, Status};

/// One reliable connection.
#[derive(Debug)]
pub struct Session<C> {
    conn: C,

    /// Upper bound on in-flight packets (`window + 1`).
    max_window: u32,
    timeout: Duration,

    // -- sender half --
    /// Oldest unacknowledged sequence number.
    send_una: u32,
    /// Sequence number for the next new packet.
    send_next: u32,
    send_eof: SendEofState,
    send_buffer: PacketBuffer,

    // -- receiver half --
    /// Lowest sequence number not yet received contiguously.
    recv_next: u32,
    recv_eof_seen: bool,
    recv_buffer: PacketBuffer,
}

impl<C: Connection> Session<C> {
    pub fn new(conn: C, config: &Config) -> Self {
        Self {
            conn,
            max_window: config.max_window(),
            timeout: config.timeout,
            send_una: 1,
            send_next: 1,
            send_eof: SendEofState::None,
            send_buffer: PacketBuffer::new(),
            recv_next: 1,
            recv_eof_seen: false,
            recv_buffer: PacketBuffer::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Process one inbound datagram of `n` bytes held in `buf`.
    ///
    /// Returns [`Status::Finished`] when both directions are done; the
    /// caller must then destroy the session.
    pub fn receive(&mut self, buf: &[u8], n: usize, now: Instant) -> Status {
        let packet = match Packet::decode(buf, n) {
            Ok(packet) => packet,
            Err(e) => {
                log::trace!("[rel] ← discarded {n}-byte datagram: {e}");
                return Status::Open;
            }
        };

        match packet {
            Packet::Ack { ackno } => self.on_ack(ackno, now),
            Packet::Data(data) => self.on_data(data, now),
        }
    }

    /// Pull application data and transmit it while the window allows.
    ///
    /// Never waits for data: returns as soon as the application has nothing
    /// to offer.  Once the end-of-stream marker is out, this is a no-op.
    pub fn read(&mut self, now: Instant) {
        if self.send_eof != SendEofState::None {
            return;
        }

        let mut buf = [0u8; MAX_PAYLOAD];
        while self.send_wnd() < self.max_window {
            let payload = match self.conn.input(&mut buf) {
                Input::Data(0) | Input::Empty => return,
                Input::Data(n) => buf[..n.min(MAX_PAYLOAD)].to_vec(),
                Input::Eof => {
                    self.send_eof = SendEofState::Sent;
                    Vec::new()
                }
            };

            let packet = DataPacket {
                seqno: self.send_next,
                ackno: self.recv_next,
                payload,
            };
            self.conn.send_packet(&packet.encode());
            log::debug!(
                "[rel] → DATA seq={} len={} in_flight={}",
                packet.seqno,
                packet.payload.len(),
                self.send_wnd() + 1
            );
            self.send_buffer.insert(packet, now);
            self.send_next += 1;

            if self.send_eof == SendEofState::Sent {
                log::debug!("[rel] → EOF seq={} (send half {})", self.send_next - 1, self.send_eof);
                return;
            }
        }
    }

    /// Resend every unacknowledged packet whose last transmission is at
    /// least `timeout` old.  Returns how many packets went out.
    pub fn retransmit_expired(&mut self, now: Instant) -> usize {
        let mut resent = 0;
        for entry in self.send_buffer.iter_mut() {
            if now.saturating_duration_since(entry.last_retransmit) >= self.timeout {
                self.conn.send_packet(&entry.packet.encode());
                entry.last_retransmit = now;
                resent += 1;
                log::debug!("[rel] timeout, retransmit seq={}", entry.packet.seqno);
            }
        }
        resent
    }

    /// Tear down the underlying connection and release both buffers.
    ///
    /// Consumes the session, so it can only happen once.
    pub fn destroy(mut self) {
        log::debug!(
            "[rel] destroy: sent {} packet(s), received {}",
            self.send_next - 1,
            self.recv_next - 1
        );
        self.send_buffer.clear();
        self.recv_buffer.clear();
        self.conn.destroy();
    }

    // -----------------------------------------------------------------------
    // Inbound paths
    // -----------------------------------------------------------------------

    fn on_ack(&mut self, ackno: u32, now: Instant) -> Status {
        let advanced = ackno > self.send_una && ackno <= self.send_next;
        if advanced {
            self.send_una = ackno;
            let n = self.send_buffer.remove_below(ackno);
            log::debug!("[rel] ← ACK ack={ackno} (slid {n} pkt)");
        } else {
            log::trace!(
                "[rel] ← ACK ack={ackno} ignored (una={} next={})",
                self.send_una,
                self.send_next
            );
        }

        if self.send_eof == SendEofState::Sent && self.send_wnd() == 0 {
            self.send_eof = SendEofState::Acked;
            log::debug!("[rel] ← ACK of EOF; send half {}", self.send_eof);
        }

        if self.is_finished() {
            return Status::Finished;
        }
        if advanced && self.send_wnd() < self.max_window {
            self.read(now);
        }
        Status::Open
    }

    fn on_data(&mut self, data: DataPacket, now: Instant) -> Status {
        let seqno = data.seqno;

        if self.recv_eof_seen {
            if self.is_finished() {
                return Status::Finished;
            }
            // The peer is still retransmitting something we already took,
            // most likely its EOF marker; it needs the ack to finish.
            if seqno < self.recv_next {
                self.send_ack();
            }
            return Status::Open;
        }

        if seqno < self.recv_next {
            log::trace!("[rel] ← DATA seq={seqno} duplicate; → ACK ack={}", self.recv_next);
            self.send_ack();
            return Status::Open;
        }

        if seqno >= self.recv_next.saturating_add(self.max_window) {
            log::trace!(
                "[rel] ← DATA seq={seqno} outside window [{}, {})",
                self.recv_next,
                self.recv_next.saturating_add(self.max_window)
            );
            return Status::Open;
        }

        let len = data.payload.len();
        let fresh = self.recv_buffer.insert(data, now);

        if seqno == self.recv_next {
            while self.recv_buffer.contains(self.recv_next) {
                self.recv_next += 1;
            }
            self.output();
        }

        log::debug!(
            "[rel] ← DATA seq={seqno} len={len} fresh={fresh}; → ACK ack={}",
            self.recv_next
        );
        self.send_ack();

        if self.is_finished() {
            Status::Finished
        } else {
            Status::Open
        }
    }

    /// Release every in-order buffered packet to the application.
    ///
    /// Stops at the end-of-stream marker, which stays buffered.
    fn output(&mut self) {
        loop {
            let (seqno, eof) = match self.recv_buffer.first() {
                Some(entry) => (entry.packet.seqno, entry.packet.is_eof()),
                None => return,
            };
            if seqno >= self.recv_next {
                return;
            }
            if eof {
                self.conn.output_eof();
                self.recv_eof_seen = true;
                log::debug!("[rel] ← EOF seq={seqno}; receive half closed");
                return;
            }
            if let Some(entry) = self.recv_buffer.remove_first() {
                self.conn.output(&entry.packet.payload);
            }
        }
    }

    fn send_ack(&mut self) {
        self.conn.send_packet(&encode_ack(self.recv_next));
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Packets sent but not yet cumulatively acknowledged.
    pub fn send_wnd(&self) -> u32 {
        self.send_next - self.send_una
    }

    /// Both halves done and nothing left in flight.
    pub fn is_finished(&self) -> bool {
        self.recv_eof_seen && self.send_eof == SendEofState::Acked && self.send_wnd() == 0
    }

    pub fn send_una(&self) -> u32 {
        self.send_una
    }

    pub fn send_next(&self) -> u32 {
        self.send_next
    }

    pub fn recv_next(&self) -> u32 {
        self.recv_next
    }

    pub fn max_window(&self) -> u32 {
        self.max_window
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn send_eof_state(&self) -> SendEofState {
        self.send_eof
    }

    pub fn recv_eof_seen(&self) -> bool {
        self.recv_eof_seen
    }

    pub fn send_buffer(&self) -> &PacketBuffer {
        &self.send_buffer
    }

    pub fn recv_buffer(&self) -> &PacketBuffer {
        &self.recv_buffer
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::packet::{encode_data, ACK_LEN};

    /// In-memory connection recording everything the session does.
    #[derive(Debug, Default)]
    struct Mock {
        input: VecDeque<u8>,
        input_eof: bool,
        delivered: Vec<u8>,
        eof_signals: usize,
        sent: Vec<Vec<u8>>,
        destroyed: usize,
    }

    impl Connection for Mock {
        fn input(&mut self, buf: &mut [u8]) -> Input {
            if self.input.is_empty() {
                return if self.input_eof { Input::Eof } else { Input::Empty };
            }
            let n = buf.len().min(self.input.len());
            for (dst, src) in buf[..n].iter_mut().zip(self.input.drain(..n)) {
                *dst = src;
            }
            Input::Data(n)
        }

        fn output(&mut self, data: &[u8]) {
            self.delivered.extend_from_slice(data);
        }

        fn output_eof(&mut self) {
            self.eof_signals += 1;
        }

        fn send_packet(&mut self, packet: &[u8]) {
            self.sent.push(packet.to_vec());
        }

        fn destroy(&mut self) {
            self.destroyed += 1;
        }
    }

    fn session(window: u32) -> Session<Mock> {
        Session::new(Mock::default(), &Config::new(window, 100))
    }

    /// Decode and clear everything the session transmitted so far.
    fn take_sent(s: &mut Session<Mock>) -> Vec<Packet> {
        s.connection_mut()
            .sent
            .drain(..)
            .map(|b| Packet::decode(&b, b.len()).expect("session sent a bad packet"))
            .collect()
    }

    fn deliver(s: &mut Session<Mock>, bytes: &[u8], now: Instant) -> Status {
        s.receive(bytes, bytes.len(), now)
    }

    fn ack(ackno: u32) -> Packet {
        Packet::Ack { ackno }
    }

    #[test]
    fn initial_state() {
        let s = session(4);
        assert_eq!(s.send_una(), 1);
        assert_eq!(s.send_next(), 1);
        assert_eq!(s.send_wnd(), 0);
        assert_eq!(s.recv_next(), 1);
        assert_eq!(s.max_window(), 5);
        assert_eq!(s.send_eof_state(), SendEofState::None);
        assert!(!s.recv_eof_seen());
    }

    #[test]
    fn in_order_packet_delivered_and_acked() {
        let mut s = session(1);
        let now = Instant::now();

        assert_eq!(deliver(&mut s, &encode_data(1, 1, b"hi"), now), Status::Open);

        assert_eq!(s.connection().delivered, b"hi");
        assert_eq!(s.recv_next(), 2);
        assert_eq!(take_sent(&mut s), vec![ack(2)]);
        assert!(s.recv_buffer().is_empty());
    }

    #[test]
    fn reordered_packets_released_together() {
        let mut s = session(4);
        let now = Instant::now();

        deliver(&mut s, &encode_data(1, 1, b"a"), now);
        take_sent(&mut s);

        deliver(&mut s, &encode_data(3, 1, b"c"), now);
        assert_eq!(s.connection().delivered, b"a");
        assert_eq!(s.recv_next(), 2);
        assert_eq!(take_sent(&mut s), vec![ack(2)]);
        assert!(s.recv_buffer().contains(3));

        deliver(&mut s, &encode_data(2, 1, b"b"), now);
        assert_eq!(s.connection().delivered, b"abc");
        assert_eq!(s.recv_next(), 4);
        assert_eq!(take_sent(&mut s), vec![ack(4)]);
        assert!(s.recv_buffer().is_empty());
    }

    #[test]
    fn first_packet_missing_holds_ack_at_one() {
        let mut s = session(4);
        deliver(&mut s, &encode_data(3, 1, b"c"), Instant::now());
        assert!(s.connection().delivered.is_empty());
        assert_eq!(take_sent(&mut s), vec![ack(1)]);
    }

    #[test]
    fn duplicate_of_delivered_packet_is_reacked_not_redelivered() {
        let mut s = session(2);
        let now = Instant::now();
        let bytes = encode_data(1, 1, b"once");

        deliver(&mut s, &bytes, now);
        deliver(&mut s, &bytes, now);

        assert_eq!(s.connection().delivered, b"once");
        assert_eq!(take_sent(&mut s), vec![ack(2), ack(2)]);
    }

    #[test]
    fn duplicate_of_buffered_packet_stored_once() {
        let mut s = session(4);
        let now = Instant::now();
        deliver(&mut s, &encode_data(2, 1, b"x"), now);
        deliver(&mut s, &encode_data(2, 1, b"x"), now);
        assert_eq!(s.recv_buffer().len(), 1);

        deliver(&mut s, &encode_data(1, 1, b"w"), now);
        assert_eq!(s.connection().delivered, b"wx");
    }

    #[test]
    fn packet_beyond_receive_window_dropped_silently() {
        let mut s = session(2); // max_window = 3, accepts seq 1..=3
        let now = Instant::now();

        deliver(&mut s, &encode_data(4, 1, b"far"), now);
        assert!(s.recv_buffer().is_empty());
        assert!(take_sent(&mut s).is_empty());

        deliver(&mut s, &encode_data(3, 1, b"edge"), now);
        assert!(s.recv_buffer().contains(3));
    }

    #[test]
    fn corrupted_packet_discarded_without_ack() {
        let mut s = session(1);
        let mut bytes = encode_data(1, 1, b"hi");
        bytes[0] ^= 0xff;

        assert_eq!(deliver(&mut s, &bytes, Instant::now()), Status::Open);
        assert!(take_sent(&mut s).is_empty());
        assert!(s.connection().delivered.is_empty());
        assert_eq!(s.recv_next(), 1);
    }

    #[test]
    fn truncated_packet_discarded() {
        let mut s = session(1);
        let bytes = encode_data(1, 1, b"hello");
        s.receive(&bytes, bytes.len() - 1, Instant::now());
        assert!(take_sent(&mut s).is_empty());
    }

    #[test]
    fn read_fills_window_then_stops() {
        let mut s = session(4);
        s.connection_mut().input.extend(vec![7u8; MAX_PAYLOAD * 8]);

        s.read(Instant::now());

        let sent = take_sent(&mut s);
        assert_eq!(sent.len(), 5);
        assert_eq!(s.send_wnd(), 5);
        assert_eq!(s.send_buffer().len(), 5);
        for (i, pkt) in sent.iter().enumerate() {
            match pkt {
                Packet::Data(d) => {
                    assert_eq!(d.seqno, i as u32 + 1);
                    assert_eq!(d.payload.len(), MAX_PAYLOAD);
                }
                other => panic!("expected data, got {other:?}"),
            }
        }

        // Window full: more reads send nothing.
        s.read(Instant::now());
        assert!(take_sent(&mut s).is_empty());
    }

    #[test]
    fn ack_reopens_window_and_pulls_more_data() {
        let mut s = session(4);
        let now = Instant::now();
        s.connection_mut().input.extend(vec![1u8; MAX_PAYLOAD * 7]);
        s.read(now);
        take_sent(&mut s);

        deliver(&mut s, &encode_ack(3), now);

        assert_eq!(s.send_una(), 3);
        assert_eq!(s.send_buffer().len(), 5);
        let seqs: Vec<u32> = take_sent(&mut s)
            .into_iter()
            .filter_map(|p| match p {
                Packet::Data(d) => Some(d.seqno),
                Packet::Ack { .. } => None,
            })
            .collect();
        assert_eq!(seqs, vec![6, 7]);
        assert_eq!(s.send_wnd(), 5);
    }

    #[test]
    fn ack_equal_to_send_una_is_ignored() {
        let mut s = session(4);
        let now = Instant::now();
        s.connection_mut().input.extend(b"abc");
        s.read(now);
        take_sent(&mut s);

        // New data is waiting, but a non-advancing ack must not pull it.
        s.connection_mut().input.extend(b"def");
        deliver(&mut s, &encode_ack(1), now);

        assert_eq!(s.send_una(), 1);
        assert_eq!(s.send_buffer().len(), 1);
        assert!(take_sent(&mut s).is_empty());
    }

    #[test]
    fn ack_beyond_send_next_is_ignored() {
        let mut s = session(4);
        let now = Instant::now();
        s.connection_mut().input.extend(b"abc");
        s.read(now);

        deliver(&mut s, &encode_ack(10), now);
        assert_eq!(s.send_una(), 1);
        assert_eq!(s.send_wnd(), 1);
    }

    #[test]
    fn cumulative_ack_clears_everything_below() {
        let mut s = session(4);
        let now = Instant::now();
        s.connection_mut().input.extend(vec![0u8; MAX_PAYLOAD * 3]);
        s.read(now);

        deliver(&mut s, &encode_ack(3), now);
        assert_eq!(s.send_buffer().first().map(|e| e.packet.seqno), Some(3));
        assert_eq!(s.send_wnd(), 1);
    }

    #[test]
    fn data_packets_carry_recv_next() {
        let mut s = session(2);
        let now = Instant::now();
        deliver(&mut s, &encode_data(1, 1, b"in"), now);
        take_sent(&mut s);

        s.connection_mut().input.extend(b"out");
        s.read(now);
        match take_sent(&mut s).as_slice() {
            [Packet::Data(d)] => assert_eq!(d.ackno, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn retransmit_waits_for_timeout() {
        let mut s = session(2);
        let start = Instant::now();
        s.connection_mut().input.extend(b"payload");
        s.read(start);
        let original = s.connection_mut().sent.remove(0);

        assert_eq!(s.retransmit_expired(start + Duration::from_millis(99)), 0);
        assert!(s.connection().sent.is_empty());

        let later = start + Duration::from_millis(100);
        assert_eq!(s.retransmit_expired(later), 1);
        assert_eq!(s.connection().sent, vec![original]);
        assert_eq!(s.send_buffer().first().map(|e| e.last_retransmit), Some(later));

        // Timestamp refreshed: not due again until another full timeout.
        assert_eq!(s.retransmit_expired(later + Duration::from_millis(50)), 0);
        assert_eq!(s.send_buffer().len(), 1);
    }

    #[test]
    fn corrupted_packet_recovered_by_retransmission() {
        let start = Instant::now();
        let mut tx = session(1);
        let mut rx = session(1);

        tx.connection_mut().input.extend(b"hello");
        tx.read(start);
        let mut wire = tx.connection_mut().sent.remove(0);
        wire[5] ^= 0x01;
        deliver(&mut rx, &wire, start);
        assert!(take_sent(&mut rx).is_empty());

        tx.retransmit_expired(start + Duration::from_millis(100));
        let resent = tx.connection_mut().sent.remove(0);
        deliver(&mut rx, &resent, start);
        assert_eq!(rx.connection().delivered, b"hello");
        assert_eq!(take_sent(&mut rx), vec![ack(2)]);
    }

    #[test]
    fn eof_marker_sent_once() {
        let mut s = session(4);
        let now = Instant::now();
        s.connection_mut().input.extend(b"bye");
        s.connection_mut().input_eof = true;

        s.read(now);
        let sent = take_sent(&mut s);
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[1], Packet::Data(d) if d.seqno == 2 && d.is_eof()));
        assert_eq!(s.send_eof_state(), SendEofState::Sent);

        s.read(now);
        assert!(take_sent(&mut s).is_empty());
    }

    #[test]
    fn eof_acked_closes_send_half() {
        let mut s = session(1);
        let now = Instant::now();
        s.connection_mut().input_eof = true;
        s.read(now);

        assert_eq!(deliver(&mut s, &encode_ack(2), now), Status::Open);
        assert_eq!(s.send_eof_state(), SendEofState::Acked);
        assert_eq!(s.send_wnd(), 0);
    }

    #[test]
    fn peer_eof_signalled_once_and_stays_buffered() {
        let mut s = session(2);
        let now = Instant::now();
        deliver(&mut s, &encode_data(1, 1, b"last"), now);
        deliver(&mut s, &encode_data(2, 1, b""), now);

        assert_eq!(s.connection().delivered, b"last");
        assert_eq!(s.connection().eof_signals, 1);
        assert!(s.recv_eof_seen());
        assert!(s.recv_buffer().contains(2));

        // Retransmitted EOF: re-acked so the peer can finish, not re-signalled.
        take_sent(&mut s);
        deliver(&mut s, &encode_data(2, 1, b""), now);
        assert_eq!(s.connection().eof_signals, 1);
        assert_eq!(take_sent(&mut s), vec![ack(3)]);

        // Anything newer than the EOF is ignored outright.
        deliver(&mut s, &encode_data(3, 1, b"late"), now);
        assert!(take_sent(&mut s).is_empty());
        assert_eq!(s.connection().delivered, b"last");
    }

    #[test]
    fn finishes_on_final_ack() {
        let mut s = session(1);
        let now = Instant::now();
        deliver(&mut s, &encode_data(1, 1, b""), now);
        assert!(s.recv_eof_seen());

        s.connection_mut().input_eof = true;
        s.read(now);
        assert_eq!(deliver(&mut s, &encode_ack(2), now), Status::Finished);
        assert!(s.is_finished());
    }

    #[test]
    fn finishes_on_peer_eof_after_own_eof_acked() {
        let mut s = session(1);
        let now = Instant::now();
        s.connection_mut().input_eof = true;
        s.read(now);
        deliver(&mut s, &encode_ack(2), now);

        assert_eq!(deliver(&mut s, &encode_data(1, 1, b""), now), Status::Finished);
        assert_eq!(s.connection().eof_signals, 1);
    }

    #[test]
    fn unfinished_while_eof_in_flight() {
        let mut s = session(1);
        let now = Instant::now();
        deliver(&mut s, &encode_data(1, 1, b""), now);
        s.connection_mut().input_eof = true;
        s.read(now);

        assert!(!s.is_finished());
        assert_eq!(deliver(&mut s, &encode_ack(1), now), Status::Open);
    }

    #[test]
    fn ack_len_matches_wire() {
        let mut s = session(1);
        deliver(&mut s, &encode_data(1, 1, b"z"), Instant::now());
        assert!(s.connection().sent.iter().all(|b| b.len() == ACK_LEN));
    }
}
