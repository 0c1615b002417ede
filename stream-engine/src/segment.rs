//! Wire-format definitions for stream segments.
//!
//! Every unit exchanged for a stream is a segment.  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising an [`OutSegment`] into a byte buffer ready for transmission.
//! - Validating a borrowed inbound buffer ([`Segment::check_segment`])
//!   without copying it, so the caller may recycle the buffer as soon as the
//!   stream returns.
//! - Encoding the handshake options carried by SYN and SYN-ACK.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Stream ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |        Destination Port       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Window Size          |         Payload Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Checksum           |     Flags     |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 23 bytes.
//! id(4) + ports(4) + seq(4) + ack(4) + window(2) + payload_len(2) +
//! checksum(2) + flags(1)

use thiserror::Error;

use crate::stream::StreamId;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish — sender has no more data to send.
    pub const FIN: u8 = 0b0000_0100;
    /// Reset the stream.
    pub const RST: u8 = 0b0000_1000;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 23;

// Byte offsets of each field within the serialised header.
const OFF_STREAM: usize = 0;
const OFF_SRC_PORT: usize = 4;
const OFF_DST_PORT: usize = 6;
const OFF_SEQ: usize = 8;
const OFF_ACK: usize = 12;
const OFF_WINDOW: usize = 16;
const OFF_PAYLOAD_LEN: usize = 18;
const OFF_CHECKSUM: usize = 20;
const OFF_FLAGS: usize = 22;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Validation faults.  None of these ever cause a state transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("segment addressed to stream {found}, delivered to stream {expected}")]
    WrongStream { expected: StreamId, found: StreamId },
    #[error("malformed handshake options")]
    BadOptions,
    #[error("payload of {0} bytes does not fit in one segment")]
    PayloadTooLarge(usize),
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed-size segment header in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub stream_id: StreamId,
    pub src_port: u16,
    pub dst_port: u16,
    /// Sequence number of the first payload byte (or of the SYN/FIN).
    pub seq: u32,
    /// Next sequence number expected from the peer; valid with `ACK`.
    pub ack: u32,
    /// Advertised receive window in bytes.
    pub window: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
}

impl Header {
    /// `true` when every bit in `mask` is set.
    pub fn has(&self, mask: u8) -> bool {
        self.flags & mask == mask
    }

    /// `true` when the flags are exactly `mask`.
    pub fn is(&self, mask: u8) -> bool {
        self.flags == mask
    }
}

// ---------------------------------------------------------------------------
// Inbound (borrowed)
// ---------------------------------------------------------------------------

/// A borrowed view over one framed inbound segment.
///
/// Nothing is parsed until [`check_segment`](Self::check_segment) runs.  The
/// lifetime ties every derived slice to the caller's buffer, so a stream
/// cannot keep a reference past the call that received it.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    buf: &'a [u8],
}

impl<'a> Segment<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Stream id for demultiplexing, without validating the rest.
    pub fn peek_stream_id(&self) -> Option<StreamId> {
        (self.buf.len() >= HEADER_LEN).then(|| StreamId::new(read_u32(self.buf, OFF_STREAM)))
    }

    /// Flags for demultiplexing, without validating the rest.
    pub fn peek_flags(&self) -> Option<u8> {
        (self.buf.len() >= HEADER_LEN).then(|| self.buf[OFF_FLAGS])
    }

    /// Validate framing and checksum, then return the parsed header.
    ///
    /// Returns [`Err`] if:
    /// - the buffer is shorter than [`HEADER_LEN`],
    /// - the `payload_len` field disagrees with the buffer length, or
    /// - the checksum does not verify.
    pub fn check_segment(&self) -> Result<Header, SegmentError> {
        let buf = self.buf;
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::BufferTooShort);
        }

        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN);
        if buf.len() != HEADER_LEN + payload_len as usize {
            return Err(SegmentError::LengthMismatch);
        }

        if internet_checksum(buf) != read_u16(buf, OFF_CHECKSUM) {
            return Err(SegmentError::ChecksumFailed);
        }

        Ok(Header {
            stream_id: StreamId::new(read_u32(buf, OFF_STREAM)),
            src_port: read_u16(buf, OFF_SRC_PORT),
            dst_port: read_u16(buf, OFF_DST_PORT),
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            window: read_u16(buf, OFF_WINDOW),
            flags: buf[OFF_FLAGS],
        })
    }

    /// Payload bytes.  Only meaningful after a successful check.
    pub fn payload(&self) -> &'a [u8] {
        self.buf.get(HEADER_LEN..).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Outbound (owned)
// ---------------------------------------------------------------------------

/// A segment built by a stream, waiting to be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutSegment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl OutSegment {
    /// Sequence space consumed: payload bytes plus one for SYN and for FIN.
    ///
    /// The payload of a SYN holds [`SynOptions`], not stream data, and
    /// consumes nothing.
    pub fn seq_len(&self) -> u32 {
        if self.header.flags & flags::SYN != 0 {
            return 1;
        }
        let mut len = self.payload.len() as u32;
        if self.header.flags & flags::FIN != 0 {
            len += 1;
        }
        len
    }

    /// Serialise into a newly allocated byte vector.
    ///
    /// The payload length and checksum are computed here.
    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| SegmentError::PayloadTooLarge(self.payload.len()))?;
        let h = &self.header;
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_STREAM..OFF_STREAM + 4].copy_from_slice(&h.stream_id.get().to_be_bytes());
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&h.src_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&h.dst_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&h.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&h.ack.to_be_bytes());
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&h.window.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2].copy_from_slice(&payload_len.to_be_bytes());
        buf[OFF_FLAGS] = h.flags;
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// Handshake options
// ---------------------------------------------------------------------------

/// Options carried in the payload of SYN and SYN-ACK segments.
///
/// ```text
/// service(8) | protocol(2) | mss(2) | weight(1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynOptions {
    /// Routed operation on the acceptor side; zero in a SYN-ACK.
    pub service: u64,
    /// Payload protocol identifier.
    pub protocol: u16,
    /// Largest payload the sender is willing to receive per segment.
    pub mss: u16,
    /// Priority weight, `0..=15`.
    pub weight: u8,
}

impl SynOptions {
    pub const LEN: usize = 13;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&self.service.to_be_bytes());
        buf.extend_from_slice(&self.protocol.to_be_bytes());
        buf.extend_from_slice(&self.mss.to_be_bytes());
        buf.push(self.weight);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() != Self::LEN {
            return Err(SegmentError::BadOptions);
        }
        let mut service = [0u8; 8];
        service.copy_from_slice(&buf[0..8]);
        let options = Self {
            service: u64::from_be_bytes(service),
            protocol: read_u16(buf, 8),
            mss: read_u16(buf, 10),
            weight: buf[12],
        };
        if options.mss == 0 {
            return Err(SegmentError::BadOptions);
        }
        Ok(options)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Compute the Internet checksum (RFC 1071) over `data`, treating the
/// checksum field as zero.
///
/// The checksum sits on an even offset, so it occupies exactly one 16-bit
/// word and can be skipped instead of zeroed in a scratch copy.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    for (i, word) in data.chunks(2).enumerate() {
        if i * 2 == OFF_CHECKSUM {
            continue;
        }
        sum += match *word {
            [hi, lo] => u32::from(u16::from_be_bytes([hi, lo])),
            // Odd trailing byte — pad with a zero byte on the right.
            [hi] => u32::from(hi) << 8,
            _ => 0,
        };
    }

    // Fold 32-bit sum into 16 bits.
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
