//! Fault taxonomy for stream operations.
//!
//! Every fallible stream or worker operation returns [`StreamError`].
//! Validation and sequencing faults never change state; authorization faults
//! abort the stream before any dispatch; timeout faults are produced by timer
//! expiry and land in the stream's error slot instead of a caller.

use std::time::Duration;

use thiserror::Error;
use timing_wheel::WheelError;

use crate::arena::WorkerId;
use crate::auth::AuthError;
use crate::connection::ConnectionId;
use crate::segment::SegmentError;
use crate::service::ServiceId;
use crate::state::StreamState;
use crate::stream::StreamId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Malformed or corrupt segment.
    #[error("invalid segment: {0}")]
    Segment(#[from] SegmentError),

    /// Structurally valid segment that is illegal in the current state.
    #[error("segment with flags {flags:#04x} is not legal in state {state}")]
    Sequencing { state: StreamState, flags: u8 },

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("no service registered under id {0}")]
    ServiceNotFound(ServiceId),

    /// A timer could not be registered.  Unreachable with a validated config.
    #[error("timer registration failed: {0}")]
    Wheel(#[from] WheelError),

    #[error("stream reset by peer")]
    Reset,

    #[error("no acknowledgement after {retries} retransmissions")]
    Timeout { retries: u32 },

    #[error("handshake not completed after {retries} retransmissions")]
    HandshakeFailed { retries: u32 },

    #[error("stream idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("`{op}` is not valid in state {state}")]
    InvalidState { state: StreamState, op: &'static str },

    #[error("stream is closed")]
    Closed,

    #[error("connection {0} is not attached to this worker")]
    UnknownConnection(ConnectionId),

    #[error("no stream {id} on connection {connection}")]
    UnknownStream { connection: ConnectionId, id: StreamId },

    /// A stream key was presented to a worker that does not own it.
    #[error("stream owned by worker {owner} used on worker {worker}")]
    WrongWorker { owner: WorkerId, worker: WorkerId },

    /// The key's slot has been recycled since the key was issued.
    #[error("stream key is stale")]
    StaleStream,

    /// An inbound SYN carried an id only the local side may allocate.
    #[error("stream id {0} has the local side's parity")]
    ParityViolation(StreamId),

    /// An inbound SYN named a stream the peer opened and closed recently.
    #[error("SYN for stream {0}, which was recently closed")]
    RetiredStream(StreamId),

    #[error("stream ids exhausted on connection {0}")]
    IdsExhausted(ConnectionId),

    #[error("worker already holds {0} streams")]
    TooManyStreams(usize),
}

impl StreamError {
    /// `true` for faults that leave the stream untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Segment(_) | Self::Sequencing { .. })
    }
}
