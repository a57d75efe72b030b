//! Wire-format definitions for protocol packets.
//!
//! Every datagram exchanged between peers is a [`Packet`]: either a data
//! packet carrying up to [`MAX_PAYLOAD`] bytes of the byte stream, or a bare
//! cumulative acknowledgment.  This module is responsible for:
//! - Defining the on-wire binary layout of both shapes.
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], rejecting
//!   truncated, oversized, or corrupted input.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Checksum           |             Length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Acknowledgment Number                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               Sequence Number (data packets only)             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Payload (0..=500 bytes) ...                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! An acknowledgment is exactly [`ACK_LEN`] = 8 bytes.  A data packet is
//! [`DATA_HEADER_LEN`] = 12 bytes plus its payload; a data packet with an
//! empty payload marks end-of-stream.  The length field always holds the
//! total packet size, which is what tells the two shapes apart.

use thiserror::Error;

/// Total size of an acknowledgment packet.
pub const ACK_LEN: usize = 8;

/// Size of the fixed data packet header.
pub const DATA_HEADER_LEN: usize = 12;

/// Largest payload a single data packet may carry.
pub const MAX_PAYLOAD: usize = 500;

/// Largest packet that can appear on the wire.
pub const MAX_PACKET_LEN: usize = DATA_HEADER_LEN + MAX_PAYLOAD;

// Byte offsets of each field within the serialised header.
const OFF_CHECKSUM: usize = 0;
const OFF_LEN: usize = 2;
const OFF_ACKNO: usize = 4;
const OFF_SEQNO: usize = 8;

/// A data packet: one slice of the byte stream, or the end-of-stream marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Position of this packet in the sender's stream, starting at 1.
    pub seqno: u32,
    /// Sender's `recv_next` at build time.  Informational only; receivers
    /// never act on it.
    pub ackno: u32,
    /// Stream bytes; empty for the end-of-stream marker.
    pub payload: Vec<u8>,
}

impl DataPacket {
    /// `true` when this packet is the end-of-stream marker.
    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }

    /// Total on-wire size, header included.
    pub fn wire_len(&self) -> usize {
        DATA_HEADER_LEN + self.payload.len()
    }

    /// Serialise into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        encode_data(self.seqno, self.ackno, &self.payload)
    }
}

/// A complete protocol datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    /// Cumulative acknowledgment: every sequence number below `ackno` has
    /// been received.
    Ack { ackno: u32 },
}

impl Packet {
    /// Serialise this packet into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Data(data) => data.encode(),
            Packet::Ack { ackno } => encode_ack(*ackno),
        }
    }

    /// Parse the first `n` bytes of `buf` as a [`Packet`].
    ///
    /// `n` is the number of bytes the datagram layer delivered.  Returns
    /// [`Err`] if:
    /// - fewer than `n` bytes are available in `buf`,
    /// - the header's length field disagrees with `n`,
    /// - the checksum does not verify, or
    /// - `n` matches neither packet shape.
    pub fn decode(buf: &[u8], n: usize) -> Result<Self, PacketError> {
        if n > buf.len() {
            return Err(PacketError::Truncated {
                received: n,
                available: buf.len(),
            });
        }
        if n < ACK_LEN {
            return Err(PacketError::TooShort(n));
        }
        let buf = &buf[..n];

        let checksum = read_u16(buf, OFF_CHECKSUM);
        let len = usize::from(read_u16(buf, OFF_LEN));
        if len != n {
            return Err(PacketError::LengthMismatch {
                declared: len,
                received: n,
            });
        }

        // Verify checksum: zero the stored field, recompute, compare.
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&0u16.to_be_bytes());
        if internet_checksum(&scratch) != checksum {
            return Err(PacketError::ChecksumFailed);
        }

        let ackno = read_u32(buf, OFF_ACKNO);
        match n {
            ACK_LEN => Ok(Packet::Ack { ackno }),
            n if n < DATA_HEADER_LEN => Err(PacketError::TooShort(n)),
            n if n > MAX_PACKET_LEN => Err(PacketError::TooLong(n)),
            _ => Ok(Packet::Data(DataPacket {
                seqno: read_u32(buf, OFF_SEQNO),
                ackno,
                payload: buf[DATA_HEADER_LEN..].to_vec(),
            })),
        }
    }
}

/// Build the wire bytes of a data packet.
///
/// Callers must keep `payload` within [`MAX_PAYLOAD`]; the session layer
/// never reads more than that from the application.
pub fn encode_data(seqno: u32, ackno: u32, payload: &[u8]) -> Vec<u8> {
    debug_assert!(
        payload.len() <= MAX_PAYLOAD,
        "payload of {} bytes exceeds {MAX_PAYLOAD}",
        payload.len()
    );
    let len = DATA_HEADER_LEN + payload.len();
    let mut buf = vec![0u8; len];

    buf[OFF_LEN..OFF_LEN + 2].copy_from_slice(&(len as u16).to_be_bytes());
    buf[OFF_ACKNO..OFF_ACKNO + 4].copy_from_slice(&ackno.to_be_bytes());
    buf[OFF_SEQNO..OFF_SEQNO + 4].copy_from_slice(&seqno.to_be_bytes());
    buf[DATA_HEADER_LEN..].copy_from_slice(payload);

    seal(&mut buf);
    log::trace!("[rel] encode DATA seq={seqno} ack={ackno} len={len}");
    buf
}

/// Build the wire bytes of a cumulative acknowledgment.
pub fn encode_ack(ackno: u32) -> Vec<u8> {
    let mut buf = vec![0u8; ACK_LEN];

    buf[OFF_LEN..OFF_LEN + 2].copy_from_slice(&(ACK_LEN as u16).to_be_bytes());
    buf[OFF_ACKNO..OFF_ACKNO + 4].copy_from_slice(&ackno.to_be_bytes());

    seal(&mut buf);
    log::trace!("[rel] encode ACK ack={ackno}");
    buf
}

/// Errors that can arise when parsing a raw datagram.
///
/// The session layer treats every variant as packet loss.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram claims {received} bytes but only {available} are available")]
    Truncated { received: usize, available: usize },
    #[error("packet of {0} bytes is shorter than any header")]
    TooShort(usize),
    #[error("packet of {0} bytes exceeds the maximum packet size")]
    TooLong(usize),
    #[error("length field says {declared} bytes but {received} were received")]
    LengthMismatch { declared: usize, received: usize },
    #[error("checksum verification failed")]
    ChecksumFailed,
}

/// Write the checksum of `buf` (whose checksum field is still zero).
fn seal(buf: &mut [u8]) {
    let csum = internet_checksum(buf);
    buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  The caller must zero any checksum field within `data`
/// before calling this function.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte: pad with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
