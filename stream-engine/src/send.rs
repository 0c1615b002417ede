//! Go-Back-N send block.
//!
//! [`SendBlock`] owns the outbound half of a stream: the sequence counters,
//! the bytes the application queued but the window has not admitted yet, and
//! the in-flight segments awaiting acknowledgement.
//!
//! # Protocol contract
//!
//! - At most `window_size` segments are in flight at once.  SYN and FIN
//!   occupy a window slot like data, so handshake and teardown retransmit
//!   through the same path.
//! - ACKs are **cumulative**: `ack = K` acknowledges every sequence number
//!   below `K`.
//! - On timeout the stream retransmits **all** in-flight segments.
//! - Sequence numbers wrap; two numbers compare correctly while they are
//!   less than `u32::MAX / 2` apart.
//!
//! No I/O happens here.  The stream builds segments and hands them back via
//! [`SendBlock::record_sent`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::segment::{flags, OutSegment};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns `true` when sequence number `a` is ≤ `b` in wrap-around space.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Returns `true` when sequence number `a` is < `b` in wrap-around space.
#[inline]
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

// ---------------------------------------------------------------------------
// InFlight
// ---------------------------------------------------------------------------

/// A transmitted segment occupying one window slot.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub segment: OutSegment,
    /// Times this segment has been transmitted.
    pub tx_count: u32,
    /// Most recent transmission, for RTT sampling.
    pub sent_at: Instant,
}

impl InFlight {
    /// First sequence number after this segment.
    fn end(&self) -> u32 {
        self.segment.header.seq.wrapping_add(self.segment.seq_len())
    }
}

/// Result of applying a cumulative ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckOutcome {
    /// Segments removed from the window.
    pub acked: usize,
    /// RTT sample, present only when the newest acknowledged segment was
    /// transmitted exactly once (Karn's rule).
    pub rtt: Option<Duration>,
}

// ---------------------------------------------------------------------------
// SendBlock
// ---------------------------------------------------------------------------

/// Outbound state of one stream.
///
/// ```text
///     una                 nxt
///      │                   │
///  ────┼───────────────────┼──────────────────▶ seq space
///      │ <── in flight ──▶ │ <── pending ───▶
/// ```
#[derive(Debug)]
pub struct SendBlock {
    iss: u32,
    /// Oldest unacknowledged sequence number (`SND.UNA`).
    una: u32,
    /// Next sequence number to send (`SND.NXT`).
    nxt: u32,
    window_size: usize,
    in_flight: VecDeque<InFlight>,
    /// Application bytes not yet cut into segments.
    pending: VecDeque<u8>,
    fin_requested: bool,
    /// Sequence number of our FIN once it has been sent.
    fin_seq: Option<u32>,
}

impl SendBlock {
    pub fn new(window_size: usize) -> Self {
        Self {
            iss: 0,
            una: 0,
            nxt: 0,
            window_size: window_size.max(1),
            in_flight: VecDeque::with_capacity(window_size),
            pending: VecDeque::new(),
            fin_requested: false,
            fin_seq: None,
        }
    }

    /// Start a new sequence space at `iss`.
    pub fn init(&mut self, iss: u32) {
        self.iss = iss;
        self.una = iss;
        self.nxt = iss;
    }

    /// Back to the pooled state, keeping allocations.
    pub fn reset(&mut self) {
        self.init(0);
        self.in_flight.clear();
        self.pending.clear();
        self.fin_requested = false;
        self.fin_seq = None;
    }

    pub fn iss(&self) -> u32 {
        self.iss
    }

    pub fn una(&self) -> u32 {
        self.una
    }

    pub fn nxt(&self) -> u32 {
        self.nxt
    }

    /// `true` when there is room for at least one more in-flight segment.
    pub fn can_send(&self) -> bool {
        self.in_flight.len() < self.window_size
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_unacked(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Bytes queued by the application and not yet sent.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// `true` when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.pending.is_empty()
    }

    /// `true` when `ack` lies in `[una, nxt]`.
    pub fn ack_acceptable(&self, ack: u32) -> bool {
        seq_le(self.una, ack) && seq_le(ack, self.nxt)
    }

    /// `true` when `ack` acknowledges our SYN and nothing beyond it.
    pub fn acks_syn(&self, ack: u32) -> bool {
        ack == self.iss.wrapping_add(1)
    }

    pub fn queue(&mut self, data: &[u8]) {
        self.pending.extend(data.iter().copied());
    }

    /// Cut the next segment payload, at most `mss` bytes, if the window has
    /// room.
    pub fn next_chunk(&mut self, mss: usize) -> Option<Vec<u8>> {
        if !self.can_send() || self.pending.is_empty() {
            return None;
        }
        let n = mss.max(1).min(self.pending.len());
        Some(self.pending.drain(..n).collect())
    }

    pub fn request_fin(&mut self) {
        self.fin_requested = true;
    }

    pub fn fin_requested(&self) -> bool {
        self.fin_requested
    }

    /// `true` when the FIN is requested, all data has been cut, and the
    /// window has room for it.
    pub fn fin_ready(&self) -> bool {
        self.fin_requested && self.fin_seq.is_none() && self.pending.is_empty() && self.can_send()
    }

    pub fn fin_sent(&self) -> bool {
        self.fin_seq.is_some()
    }

    /// `true` once the peer has acknowledged our FIN.
    pub fn fin_acked(&self) -> bool {
        self.fin_seq.is_some_and(|fin| seq_lt(fin, self.una))
    }

    /// Place a just-transmitted segment into the window and advance `nxt`.
    ///
    /// Pure ACKs and RSTs consume no sequence space and are not tracked.
    pub fn record_sent(&mut self, segment: OutSegment, now: Instant) {
        let len = segment.seq_len();
        if len == 0 {
            return;
        }
        debug_assert_eq!(segment.header.seq, self.nxt, "segment sent out of sequence");
        if segment.header.has(flags::FIN) {
            self.fin_seq = Some(self.nxt.wrapping_add(segment.payload.len() as u32));
        }
        self.nxt = self.nxt.wrapping_add(len);
        self.in_flight.push_back(InFlight {
            segment,
            tx_count: 1,
            sent_at: now,
        });
    }

    /// Process a cumulative ACK.
    ///
    /// Removes every in-flight segment that ends at or before `ack` and
    /// advances `una`.  Duplicate or out-of-range ACKs change nothing.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> AckOutcome {
        if !self.ack_acceptable(ack) || ack == self.una {
            return AckOutcome::default();
        }

        let mut outcome = AckOutcome::default();
        let mut newest = None;
        while let Some(front) = self.in_flight.front() {
            if !seq_le(front.end(), ack) {
                break;
            }
            newest = self.in_flight.pop_front();
            outcome.acked += 1;
        }
        // `ack` may land inside a segment only if the peer misbehaves; the
        // cumulative point still moves.
        self.una = ack;

        if let Some(entry) = newest {
            if entry.tx_count == 1 {
                outcome.rtt = Some(now.saturating_duration_since(entry.sent_at));
            }
        }
        outcome
    }

    /// In-flight segments from oldest to newest, for a go-back-N resend.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut InFlight> {
        self.in_flight.iter_mut()
    }

    /// Time the oldest in-flight segment was last sent.
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.in_flight.front().map(|e| e.sent_at)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Header;
    use crate::stream::StreamId;

    fn make_seg(seq: u32, flags: u8, payload_len: usize) -> OutSegment {
        OutSegment {
            header: Header {
                stream_id: StreamId::new(2),
                src_port: 1,
                dst_port: 2,
                seq,
                ack: 0,
                window: 8192,
                flags,
            },
            payload: vec![0u8; payload_len],
        }
    }

    fn block(iss: u32, window: usize) -> SendBlock {
        let mut s = SendBlock::new(window);
        s.init(iss);
        s
    }

    #[test]
    fn syn_consumes_one_sequence_number() {
        let now = Instant::now();
        let mut s = block(100, 4);
        s.record_sent(make_seg(100, flags::SYN, 0), now);
        assert_eq!(s.nxt(), 101);
        assert!(s.acks_syn(101));
        assert!(!s.acks_syn(100));

        let outcome = s.on_ack(101, now);
        assert_eq!(outcome.acked, 1);
        assert!(!s.has_unacked());
    }

    #[test]
    fn pure_ack_is_not_tracked() {
        let mut s = block(5, 4);
        s.record_sent(make_seg(5, flags::ACK, 0), Instant::now());
        assert_eq!(s.nxt(), 5);
        assert_eq!(s.in_flight(), 0);
    }

    #[test]
    fn cumulative_ack_slides_multiple() {
        let now = Instant::now();
        let mut s = block(0, 4);
        for i in 0..3u32 {
            s.record_sent(make_seg(i * 5, flags::ACK, 5), now);
        }
        assert_eq!(s.nxt(), 15);
        assert!(s.ack_acceptable(15));
        assert!(!s.ack_acceptable(16));

        let outcome = s.on_ack(10, now);
        assert_eq!(outcome.acked, 2);
        assert_eq!(s.una(), 10);
        assert_eq!(s.in_flight(), 1);

        // Duplicate.
        assert_eq!(s.on_ack(10, now).acked, 0);
        // Beyond nxt.
        assert_eq!(s.on_ack(1000, now).acked, 0);
        assert_eq!(s.una(), 10);
    }

    #[test]
    fn window_limits_chunks() {
        let now = Instant::now();
        let mut s = block(0, 2);
        s.queue(&[7u8; 25]);
        let first = s.next_chunk(10).unwrap();
        assert_eq!(first.len(), 10);
        s.record_sent(make_seg(0, flags::ACK, 10), now);
        let second = s.next_chunk(10).unwrap();
        s.record_sent(make_seg(10, flags::ACK, second.len()), now);
        assert!(!s.can_send());
        assert_eq!(s.next_chunk(10), None);
        assert_eq!(s.pending(), 5);

        s.on_ack(10, now);
        assert_eq!(s.next_chunk(10).map(|c| c.len()), Some(5));
    }

    #[test]
    fn fin_waits_for_pending_data() {
        let now = Instant::now();
        let mut s = block(0, 4);
        s.queue(b"abc");
        s.request_fin();
        assert!(!s.fin_ready());
        let chunk = s.next_chunk(100).unwrap();
        s.record_sent(make_seg(0, flags::ACK, chunk.len()), now);
        assert!(s.fin_ready());

        s.record_sent(make_seg(3, flags::FIN | flags::ACK, 0), now);
        assert!(s.fin_sent());
        assert!(!s.fin_ready());
        assert_eq!(s.nxt(), 4);

        s.on_ack(3, now);
        assert!(!s.fin_acked());
        s.on_ack(4, now);
        assert!(s.fin_acked());
        assert!(s.is_idle());
    }

    #[test]
    fn karns_rule_skips_retransmitted_samples() {
        let start = Instant::now();
        let later = start + Duration::from_millis(40);
        let mut s = block(0, 4);
        s.record_sent(make_seg(0, flags::ACK, 4), start);
        assert_eq!(
            s.on_ack(4, later).rtt,
            Some(Duration::from_millis(40))
        );

        s.record_sent(make_seg(4, flags::ACK, 4), start);
        for entry in s.entries_mut() {
            entry.tx_count += 1;
        }
        let outcome = s.on_ack(8, later);
        assert_eq!(outcome.acked, 1);
        assert_eq!(outcome.rtt, None);
    }

    #[test]
    fn sequence_space_wraps() {
        let now = Instant::now();
        let start = u32::MAX - 2;
        let mut s = block(start, 4);
        s.record_sent(make_seg(start, flags::ACK, 5), now);
        assert_eq!(s.nxt(), 2);
        assert!(s.ack_acceptable(2));
        assert_eq!(s.on_ack(2, now).acked, 1);
        assert!(seq_lt(u32::MAX, 0));
        assert!(!seq_lt(0, u32::MAX));
    }

    #[test]
    fn reset_clears_everything() {
        let mut s = block(9, 4);
        s.queue(b"xyz");
        s.request_fin();
        s.record_sent(make_seg(9, flags::SYN, 0), Instant::now());
        s.reset();
        assert!(s.is_idle());
        assert!(!s.fin_requested());
        assert_eq!(s.nxt(), 0);
    }
}
