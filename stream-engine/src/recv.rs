//! Go-Back-N receive block.
//!
//! - Only **in-order** segments are accepted (`seq == nxt`).
//! - Out-of-order segments are discarded; duplicates are discarded too.
//! - Either way the stream answers with a cumulative ACK of [`RecvBlock::ack_number`],
//!   which is also how a keep-alive probe (a zero-length duplicate) gets its
//!   answer.
//! - A FIN consumes one sequence number.  Nothing is accepted after it.
//! - At most `capacity` unread bytes are buffered.  An in-order segment that
//!   does not fit is refused whole and re-ACKed; the advertised window is the
//!   space left.
//!
//! Accepted payload accumulates until the stream hands the whole body off.

use crate::send::seq_lt;

/// What happened to an inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// `seq == nxt`: `bytes` were appended, `fin` consumed if set.
    InOrder { bytes: usize, fin: bool },
    /// Entirely before `nxt`; already received.
    Duplicate,
    /// Beyond `nxt`, or data after the peer's FIN.
    OutOfOrder,
    /// In order, but the payload does not fit in the buffer.
    WindowFull,
}

impl Accepted {
    /// `true` when the segment must be answered with an ACK.
    pub fn needs_ack(self) -> bool {
        match self {
            Self::InOrder { bytes, fin } => bytes > 0 || fin,
            Self::Duplicate | Self::OutOfOrder | Self::WindowFull => true,
        }
    }

    pub fn fin(self) -> bool {
        matches!(self, Self::InOrder { fin: true, .. })
    }
}

/// Inbound state of one stream.
#[derive(Debug)]
pub struct RecvBlock {
    /// Peer's initial sequence number (`IRS`).
    irs: u32,
    /// Next expected sequence number (`RCV.NXT`).
    nxt: u32,
    /// Most unread bytes this block will hold.
    capacity: u16,
    buffer: Vec<u8>,
    fin: bool,
}

impl RecvBlock {
    pub fn new(capacity: u16) -> Self {
        Self {
            irs: 0,
            nxt: 0,
            capacity,
            buffer: Vec::new(),
            fin: false,
        }
    }

    /// Synchronise on the peer's SYN.
    pub fn init(&mut self, irs: u32) {
        self.irs = irs;
        self.nxt = irs.wrapping_add(1);
    }

    /// Back to the pooled state, keeping the buffer's allocation.
    pub fn reset(&mut self) {
        self.irs = 0;
        self.nxt = 0;
        self.buffer.clear();
        self.fin = false;
    }

    pub fn irs(&self) -> u32 {
        self.irs
    }

    /// Cumulative ACK number for the next outbound segment.
    pub fn ack_number(&self) -> u32 {
        self.nxt
    }

    /// Space left in the buffer, advertised in every outbound header.
    pub fn window(&self) -> u16 {
        let free = usize::from(self.capacity).saturating_sub(self.buffer.len());
        u16::try_from(free).unwrap_or(u16::MAX)
    }

    pub fn fin_received(&self) -> bool {
        self.fin
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn on_segment(&mut self, seq: u32, payload: &[u8], fin: bool) -> Accepted {
        if seq_lt(seq, self.nxt) {
            return Accepted::Duplicate;
        }
        if seq != self.nxt {
            return Accepted::OutOfOrder;
        }
        if self.fin && (!payload.is_empty() || fin) {
            return Accepted::OutOfOrder;
        }
        if payload.len() > usize::from(self.window()) {
            return Accepted::WindowFull;
        }

        self.buffer.extend_from_slice(payload);
        self.nxt = self.nxt.wrapping_add(payload.len() as u32);
        if fin {
            self.nxt = self.nxt.wrapping_add(1);
            self.fin = true;
        }
        Accepted::InOrder {
            bytes: payload.len(),
            fin,
        }
    }

    /// `true` when an RST's sequence number falls inside the window.
    pub fn accepts_reset(&self, seq: u32) -> bool {
        seq.wrapping_sub(self.nxt) <= u32::from(self.capacity.max(1))
    }

    /// Drain everything received so far.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Copy up to `buf.len()` buffered bytes into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        n
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
