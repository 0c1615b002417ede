//! Engine tuning knobs.
//!
//! Every timer a stream arms (retransmit, keep-alive, time-wait linger) is
//! bounded by a field here, so [`EngineConfig::validate`] can prove up front
//! that none of them can overflow the worker's timing wheel.

use std::time::Duration;

use thiserror::Error;
use timing_wheel::WheelError;

use crate::segment::HEADER_LEN;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("{name} of {delay:?} exceeds the wheel capacity of {capacity:?}")]
    TimerOverflow {
        name: &'static str,
        delay: Duration,
        capacity: Duration,
    },
    #[error("mtu {0} leaves no room for a payload after the header")]
    MtuTooSmall(u16),
    #[error("initial rto {initial:?} exceeds max rto {max:?}")]
    RtoRange { initial: Duration, max: Duration },
    #[error("idle timeout {idle:?} must be longer than the keep-alive interval {keepalive:?}")]
    IdleBelowKeepAlive { idle: Duration, keepalive: Duration },
    #[error("timing wheel: {0}")]
    Wheel(#[from] WheelError),
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Per-worker engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Timing wheel tick.
    pub tick_interval: Duration,
    /// Number of wheel buckets.
    pub wheel_size: usize,
    /// Default MTU for connections that do not specify one.
    pub mtu: u16,
    /// Ceiling on the payload bytes per segment, before negotiation.
    pub max_segment_size: u16,
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// RTO ceiling after repeated back-off.
    pub max_rto: Duration,
    /// Consecutive retransmissions before the operation fails.
    pub max_retries: u32,
    /// Silence after which a keep-alive probe is sent.
    pub keepalive_interval: Duration,
    /// Silence after which the stream is aborted.
    pub idle_timeout: Duration,
    /// Maximum segment lifetime; time-wait lasts twice this.
    pub msl: Duration,
    /// Segments in flight (Go-Back-N window size N).
    pub send_window: usize,
    /// Bytes of unread data a stream will buffer; larger in-order segments
    /// are refused until the buffer drains.
    pub recv_window: u16,
    /// Live streams per worker.
    pub max_streams: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            wheel_size: 1024,
            mtu: 1500,
            max_segment_size: 1400,
            initial_rto: Duration::from_millis(1000),
            max_rto: Duration::from_secs(60),
            max_retries: 6,
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            msl: Duration::from_secs(30),
            send_window: 16,
            recv_window: u16::MAX,
            max_streams: 65_536,
        }
    }
}

impl EngineConfig {
    /// Length of the time-wait linger.
    pub fn time_wait(&self) -> Duration {
        self.msl.saturating_mul(2)
    }

    /// Longest delay the worker's wheel can represent.
    pub fn wheel_capacity(&self) -> Duration {
        let size = u32::try_from(self.wheel_size).unwrap_or(u32::MAX);
        self.tick_interval.saturating_mul(size)
    }

    /// Largest payload this side accepts per segment on a path with `mtu`.
    pub fn local_mss(&self, mtu: u16) -> u16 {
        let path = mtu.saturating_sub(HEADER_LEN as u16);
        self.max_segment_size.min(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Zero("tick_interval"));
        }
        for (name, value) in [
            ("wheel_size", self.wheel_size),
            ("max_segment_size", usize::from(self.max_segment_size)),
            ("send_window", self.send_window),
            ("recv_window", usize::from(self.recv_window)),
            ("max_streams", self.max_streams),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.local_mss(self.mtu) == 0 {
            return Err(ConfigError::MtuTooSmall(self.mtu));
        }
        if self.initial_rto > self.max_rto {
            return Err(ConfigError::RtoRange {
                initial: self.initial_rto,
                max: self.max_rto,
            });
        }
        if self.idle_timeout <= self.keepalive_interval {
            return Err(ConfigError::IdleBelowKeepAlive {
                idle: self.idle_timeout,
                keepalive: self.keepalive_interval,
            });
        }

        let capacity = self.wheel_capacity();
        for (name, delay) in [
            ("max_rto", self.max_rto),
            ("keepalive_interval", self.keepalive_interval),
            ("time_wait", self.time_wait()),
        ] {
            if delay > capacity {
                return Err(ConfigError::TimerOverflow {
                    name,
                    delay,
                    capacity,
                });
            }
        }
        Ok(())
    }
}
