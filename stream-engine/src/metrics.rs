//! Traffic counters.
//!
//! Counters only; nothing here feeds back into control decisions.  Each
//! stream keeps a [`StreamMetrics`]; the worker folds it into its
//! [`WorkerMetrics`] totals when the stream is recycled.

use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamMetrics {
    pub segments_sent: u64,
    pub segments_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub invalid_segments: u64,
    pub sequencing_faults: u64,
    pub keepalive_probes: u64,
    pub dispatches: u64,
}

impl StreamMetrics {
    pub(crate) fn record_sent(&mut self, payload: usize) {
        self.segments_sent += 1;
        self.bytes_sent += payload as u64;
    }

    pub(crate) fn record_received(&mut self, payload: usize) {
        self.segments_received += 1;
        self.bytes_received += payload as u64;
    }
}

impl AddAssign for StreamMetrics {
    fn add_assign(&mut self, rhs: Self) {
        self.segments_sent += rhs.segments_sent;
        self.segments_received += rhs.segments_received;
        self.bytes_sent += rhs.bytes_sent;
        self.bytes_received += rhs.bytes_received;
        self.retransmits += rhs.retransmits;
        self.invalid_segments += rhs.invalid_segments;
        self.sequencing_faults += rhs.sequencing_faults;
        self.keepalive_probes += rhs.keepalive_probes;
        self.dispatches += rhs.dispatches;
    }
}

/// Per-worker totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerMetrics {
    /// Sum over every stream this worker has recycled.
    pub streams: StreamMetrics,
    pub opened: u64,
    pub accepted: u64,
    pub closed: u64,
    /// Streams that ended with a fault (reset, timeout, denial).
    pub failed: u64,
    /// Datagrams that could not be routed to any stream.
    pub unroutable: u64,
    pub ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assign_sums_every_counter() {
        let mut total = StreamMetrics::default();
        let mut one = StreamMetrics::default();
        one.record_sent(10);
        one.record_received(4);
        one.retransmits = 2;
        one.dispatches = 1;
        total += one;
        total += one;
        assert_eq!(total.segments_sent, 2);
        assert_eq!(total.bytes_sent, 20);
        assert_eq!(total.bytes_received, 8);
        assert_eq!(total.retransmits, 4);
        assert_eq!(total.dispatches, 2);
    }
}
