//! Stream timers and retransmit-timeout estimation.
//!
//! A stream registers three kinds of timer on its worker's wheel:
//!
//! | Kind        | Shape                 | Armed                          |
//! |-------------|-----------------------|--------------------------------|
//! | Retransmit  | one-shot, current RTO | whenever segments are in flight|
//! | KeepAlive   | periodic, forever     | from `ESTABLISHED` until linger|
//! | Linger      | one-shot, 2×MSL       | on entering `TIME_WAIT`        |
//!
//! The wheel token is a [`StreamTimer`]: the stream's arena key plus the
//! kind.  A recycled stream changes its key's generation, so a timer that
//! somehow outlives its stream is dropped by the worker instead of firing
//! into the new occupant.
//!
//! RTO follows RFC 6298: `RTO = SRTT + 4 × RTTVAR`, doubling on each
//! consecutive timeout up to a configured maximum.  It never drops below one
//! wheel tick, so a retransmit timer is always placed rather than fired
//! inline.

use std::time::Duration;

use timing_wheel::TimerId;

use crate::arena::StreamKey;
use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// Wheel token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Retransmit,
    KeepAlive,
    Linger,
}

/// Token stored in the wheel for every stream timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTimer {
    pub stream: StreamKey,
    pub kind: TimerKind,
}

// ---------------------------------------------------------------------------
// RtoEstimator
// ---------------------------------------------------------------------------

/// Smoothed RTT / RTO state for one stream.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    initial: Duration,
    min: Duration,
    max: Duration,
    /// Current RTO, updated after each RTT sample or back-off.
    current: Duration,
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl RtoEstimator {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        let initial = initial.clamp(min, max.max(min));
        Self {
            initial,
            min,
            max,
            current: initial,
            srtt: None,
            rttvar: Duration::ZERO,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        self.restore();
    }

    /// Double the RTO after a retransmit timeout (RFC 6298 §5.5), capped at
    /// the maximum.
    pub fn back_off(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max).max(self.min);
    }

    /// Recompute the RTO from the estimates, or fall back to the initial
    /// RTO before the first sample.
    pub fn restore(&mut self) {
        self.current = match self.srtt {
            Some(srtt) => (srtt + self.rttvar * 4).clamp(self.min, self.max.max(self.min)),
            None => self.initial,
        };
    }

    /// Forget every sample.
    pub fn reset(&mut self) {
        self.srtt = None;
        self.rttvar = Duration::ZERO;
        self.current = self.initial;
    }
}

// ---------------------------------------------------------------------------
// Timing block
// ---------------------------------------------------------------------------

/// The stream's registered timers and retry bookkeeping.
#[derive(Debug, Clone)]
pub struct Timing {
    pub rto: RtoEstimator,
    pub retransmit: Option<TimerId>,
    pub keepalive: Option<TimerId>,
    pub linger: Option<TimerId>,
    /// Consecutive retransmit timeouts without progress.
    pub retries: u32,
}

impl Timing {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            rto: RtoEstimator::new(config.initial_rto, config.tick_interval, config.max_rto),
            retransmit: None,
            keepalive: None,
            linger: None,
            retries: 0,
        }
    }

    /// Take every registered id, leaving the block disarmed.
    pub fn disarm_all(&mut self) -> impl Iterator<Item = TimerId> {
        [
            self.retransmit.take(),
            self.keepalive.take(),
            self.linger.take(),
        ]
        .into_iter()
        .flatten()
    }

    pub fn reset(&mut self) {
        self.rto.reset();
        self.retransmit = None;
        self.keepalive = None;
        self.linger = None;
        self.retries = 0;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn initial_rto_before_samples() {
        let rto = RtoEstimator::new(ms(1000), ms(10), ms(60_000));
        assert_eq!(rto.current(), ms(1000));
        assert_eq!(rto.srtt(), None);
    }

    #[test]
    fn first_sample_sets_srtt_and_rttvar() {
        let mut rto = RtoEstimator::new(ms(1000), ms(10), ms(60_000));
        rto.record_rtt_sample(ms(100));
        assert_eq!(rto.srtt(), Some(ms(100)));
        // 100 + 4 * 50
        assert_eq!(rto.current(), ms(300));
    }

    #[test]
    fn subsequent_samples_smooth() {
        let mut rto = RtoEstimator::new(ms(1000), ms(10), ms(60_000));
        rto.record_rtt_sample(ms(100));
        rto.record_rtt_sample(ms(200));
        // rttvar = 50*3/4 + 100/4 = 62.5ms, srtt = 87.5 + 25 = 112.5ms
        assert_eq!(rto.srtt(), Some(Duration::from_micros(112_500)));
        assert_eq!(rto.current(), Duration::from_micros(362_500));
    }

    #[test]
    fn back_off_doubles_up_to_max() {
        let mut rto = RtoEstimator::new(ms(1000), ms(10), ms(5000));
        rto.back_off();
        assert_eq!(rto.current(), ms(2000));
        rto.back_off();
        rto.back_off();
        assert_eq!(rto.current(), ms(5000));
        rto.restore();
        assert_eq!(rto.current(), ms(1000));
    }

    #[test]
    fn rto_never_drops_below_one_tick() {
        let mut rto = RtoEstimator::new(ms(1000), ms(100), ms(60_000));
        rto.record_rtt_sample(ms(1));
        assert_eq!(rto.current(), ms(100));
        assert_eq!(RtoEstimator::new(ms(5), ms(100), ms(60_000)).current(), ms(100));
    }

    #[test]
    fn disarm_all_takes_every_id() {
        let mut wheel = timing_wheel::TimingWheel::new(ms(10), 8).unwrap();
        let mut timing = Timing::new(&EngineConfig::default());
        let key = crate::arena::StreamKey::for_tests(0);
        let mut arm = |kind| {
            wheel
                .add_timer(
                    timing_wheel::Timer::once(StreamTimer { stream: key, kind }, ms(50)),
                    &mut |_: &StreamTimer| {},
                )
                .unwrap()
        };
        timing.retransmit = Some(arm(TimerKind::Retransmit));
        timing.linger = Some(arm(TimerKind::Linger));

        let ids: Vec<_> = timing.disarm_all().collect();
        assert_eq!(ids.len(), 2);
        assert!(timing.retransmit.is_none() && timing.linger.is_none());
        for id in ids {
            assert!(wheel.cancel(id).is_some());
        }
        assert!(wheel.is_empty());
    }
}
