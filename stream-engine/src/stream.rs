//! One multiplexed stream: identity, lifecycle and the segment state machine.
//!
//! A [`Stream`] performs no I/O and reads no clock.  Every operation takes a
//! [`StreamIo`] borrowed from the owning worker, which supplies the timing
//! wheel, the outbox, the service registry, the dispatcher and the current
//! time.  Outbound segments are appended to the outbox; timers that expire
//! inline while being armed are appended to `expired` and the worker drains
//! them after the operation returns.
//!
//! # Inbound processing
//!
//! ```text
//!  buffer ─▶ check_segment ─▶ stream id ─▶ RST? ─▶ per-state handler
//!              │ fault           │ fault                 │ illegal
//!              ▼                 ▼                       ▼
//!        invalid_segments  invalid_segments     sequencing_faults
//! ```
//!
//! Every handler validates the segment fully before touching any state, so a
//! rejected segment leaves the stream exactly as it found it.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use rand::Rng;
use timing_wheel::{Repeat, Timer, TimerId, TimingWheel, WheelError};
use tokio::time::Instant;

use crate::arena::StreamKey;
use crate::auth;
use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionId, Side};
use crate::error::StreamError;
use crate::metrics::StreamMetrics;
use crate::recv::{Accepted, RecvBlock};
use crate::segment::{flags, Header, OutSegment, Segment, SegmentError, SynOptions};
use crate::send::{seq_le, SendBlock};
use crate::service::{Dispatch, DispatchJob, Request, Service, ServiceId, ServiceRegistry};
use crate::state::StreamState;
use crate::timing::{StreamTimer, TimerKind, Timing};

/// Ephemeral range for the local port of actively opened streams.
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stream identifier, unique within one connection.
///
/// Even ids are allocated by the [`Side::Peer`] end, odd ids by the
/// [`Side::Server`] end, so both ends can open streams without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(u32);

impl StreamId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// The side that is allowed to allocate this id.
    pub fn opened_by(self) -> Side {
        if self.0 % 2 == 0 {
            Side::Peer
        } else {
            Side::Server
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parity-respecting id allocator for one side of one connection.
#[derive(Debug, Clone)]
pub struct StreamIdAllocator {
    side: Side,
    next: Option<u32>,
}

impl StreamIdAllocator {
    pub fn new(side: Side) -> Self {
        let first = match side {
            Side::Peer => 2,
            Side::Server => 1,
        };
        Self {
            side,
            next: Some(first),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Next unused id, or `None` once the id space is spent.
    pub fn allocate(&mut self) -> Option<StreamId> {
        let id = self.next?;
        self.next = id.checked_add(2);
        Some(StreamId(id))
    }
}

/// Which end opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opened locally: sends a request and receives the response.
    Active,
    /// Created by an inbound SYN: receives a request and serves it.
    Passive,
}

/// Scheduling priority, `0..=15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Weight(u8);

impl Weight {
    pub const MAX: u8 = 15;

    /// Values above [`Weight::MAX`] are clamped.
    pub fn new(weight: u8) -> Self {
        Self(weight.min(Self::MAX))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Parameters of an active open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    pub service: ServiceId,
    pub protocol: u16,
    pub weight: Weight,
    /// Port of the service on the remote end.
    pub port: u16,
}

impl OpenRequest {
    pub fn new(service: ServiceId) -> Self {
        Self {
            service,
            protocol: 0,
            weight: Weight::default(),
            port: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// I/O context
// ---------------------------------------------------------------------------

/// A segment ready to leave on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub connection: ConnectionId,
    pub weight: Weight,
    pub segment: OutSegment,
}

/// What a successful inbound segment set in motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    Idle,
    /// A complete message was handed to the dispatcher.
    Dispatched,
}

/// Everything a stream operation may touch besides the stream itself.
pub struct StreamIo<'a> {
    pub wheel: &'a mut TimingWheel<StreamTimer>,
    /// Timers that fired while being armed.
    pub expired: &'a mut Vec<StreamTimer>,
    pub outbox: &'a mut Vec<Transmit>,
    pub services: &'a dyn ServiceRegistry,
    pub dispatcher: &'a dyn Dispatch,
    pub config: &'a EngineConfig,
    pub now: Instant,
    /// Wall clock, for calendar-based authorization.
    pub wall: SystemTime,
}

impl StreamIo<'_> {
    fn arm(&mut self, timer: Timer<StreamTimer>) -> Result<TimerId, WheelError> {
        let expired = &mut *self.expired;
        self.wheel
            .add_timer(timer, &mut |t: &StreamTimer| expired.push(*t))
    }

    fn cancel(&mut self, id: Option<TimerId>) {
        if let Some(id) = id {
            self.wheel.cancel(id);
        }
    }

    fn is_armed(&self, id: Option<TimerId>) -> bool {
        id.is_some_and(|id| self.wheel.is_pending(id))
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

pub struct Stream {
    key: Option<StreamKey>,
    id: StreamId,
    role: Role,
    connection: Option<Arc<dyn Connection>>,
    connection_id: ConnectionId,
    state: StreamState,
    /// Payload bytes per outbound segment, after negotiation.
    mss: u16,
    local_port: u16,
    remote_port: u16,
    last_activity: Instant,
    service: Option<Arc<dyn Service>>,
    service_id: ServiceId,
    protocol: u16,
    weight: Weight,
    /// Why the stream failed, once it has.
    error: Option<StreamError>,
    dispatched: bool,
    timing: Timing,
    send: SendBlock,
    recv: RecvBlock,
    metrics: StreamMetrics,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("role", &self.role)
            .field("connection", &self.connection_id)
            .field("state", &self.state)
            .field("mss", &self.mss)
            .field("service", &self.service_id)
            .field("error", &self.error)
            .field("send", &self.send)
            .field("recv", &self.recv)
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// A pooled stream, ready to be bound.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            key: None,
            id: StreamId::default(),
            role: Role::Passive,
            connection: None,
            connection_id: ConnectionId(0),
            state: StreamState::Listen,
            mss: config.local_mss(config.mtu),
            local_port: 0,
            remote_port: 0,
            last_activity: Instant::now(),
            service: None,
            service_id: ServiceId(0),
            protocol: 0,
            weight: Weight::default(),
            error: None,
            dispatched: false,
            timing: Timing::new(config),
            send: SendBlock::new(config.send_window),
            recv: RecvBlock::new(config.recv_window),
            metrics: StreamMetrics::default(),
        }
    }

    /// Attach a pooled stream to its slot and connection.
    pub(crate) fn bind(
        &mut self,
        key: StreamKey,
        id: StreamId,
        role: Role,
        connection: Arc<dyn Connection>,
        config: &EngineConfig,
        now: Instant,
    ) {
        self.key = Some(key);
        self.id = id;
        self.role = role;
        self.connection_id = connection.id();
        self.mss = config.local_mss(connection.mtu());
        self.connection = Some(connection);
        self.last_activity = now;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn key(&self) -> Option<StreamKey> {
        self.key
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    pub fn weight(&self) -> Weight {
        self.weight
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn sender(&self) -> &SendBlock {
        &self.send
    }

    pub fn receiver(&self) -> &RecvBlock {
        &self.recv
    }

    /// `true` once the stream has handed its message to the dispatcher.
    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Drain bytes received but not yet dispatched.
    pub fn take_received(&mut self) -> Vec<u8> {
        self.recv.take()
    }

    // -----------------------------------------------------------------------
    // Application operations
    // -----------------------------------------------------------------------

    /// Active open: send a SYN carrying the handshake options.
    pub fn open(&mut self, request: OpenRequest, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        if self.state != StreamState::Listen || self.role != Role::Active {
            return Err(self.invalid("open"));
        }
        self.service_id = request.service;
        self.protocol = request.protocol;
        self.weight = request.weight;
        self.remote_port = request.port;
        self.local_port = rand::thread_rng().gen_range(EPHEMERAL_PORTS);
        self.send.init(rand::random());

        let options = SynOptions {
            service: request.service.0,
            protocol: self.protocol,
            mss: self.mss,
            weight: self.weight.get(),
        };
        self.transition(StreamState::SynSent);
        self.send_tracked(flags::SYN, options.encode(), io)
    }

    /// Queue `data` for transmission and send what the window admits.
    pub fn send(&mut self, data: &[u8], io: &mut StreamIo<'_>) -> Result<usize, StreamError> {
        if self.state.is_terminal() {
            return Err(StreamError::Closed);
        }
        if !self.state.can_send() || self.send.fin_requested() {
            return Err(self.invalid("send"));
        }
        self.send.queue(data);
        self.pump(io)?;
        Ok(data.len())
    }

    /// Half-close: no more data will be sent after what is already queued.
    ///
    /// Calling it again once sending is closed is a no-op.
    pub fn close_sending(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        match self.state {
            StreamState::SynSent | StreamState::SynReceived => {
                // Sent once the handshake completes.
                self.send.request_fin();
                Ok(())
            }
            StreamState::Established => {
                self.send.request_fin();
                self.transition(StreamState::FinWait1);
                self.pump(io)
            }
            StreamState::CloseWait => {
                self.send.request_fin();
                self.transition(StreamState::LastAck);
                self.pump(io)
            }
            s if s.is_sending_closed() => Ok(()),
            StreamState::Close => Err(StreamError::Closed),
            _ => Err(self.invalid("close_sending")),
        }
    }

    /// Tear the stream down at once, resetting the peer if it knows us.
    pub fn abort(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        if self.state.is_terminal() {
            return Err(StreamError::Closed);
        }
        log::info!("[stream {}] aborted in {}", self.id, self.state);
        if self.state.is_synchronized() {
            self.send_reset(io);
        }
        self.terminate(io);
        Ok(())
    }

    /// Return a finished stream to its pooled state.
    ///
    /// Live streams must be aborted first.
    pub fn reset(&mut self, wheel: &mut TimingWheel<StreamTimer>) -> Result<(), StreamError> {
        if !matches!(self.state, StreamState::Close | StreamState::Listen) {
            return Err(self.invalid("reset"));
        }
        for id in self.timing.disarm_all() {
            wheel.cancel(id);
        }
        self.timing.reset();
        self.send.reset();
        self.recv.reset();
        self.key = None;
        self.id = StreamId::default();
        self.role = Role::Passive;
        self.connection = None;
        self.connection_id = ConnectionId(0);
        self.state = StreamState::Listen;
        self.local_port = 0;
        self.remote_port = 0;
        self.service = None;
        self.service_id = ServiceId(0);
        self.protocol = 0;
        self.weight = Weight::default();
        self.error = None;
        self.dispatched = false;
        self.metrics = StreamMetrics::default();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound segments
    // -----------------------------------------------------------------------

    /// Validate and process one inbound segment.
    ///
    /// Validation and sequencing faults are returned without any state
    /// change, except that any segment addressed to this stream counts as
    /// peer activity.  The buffer is not retained.
    pub fn receive(
        &mut self,
        segment: Segment<'_>,
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        let header = match segment.check_segment() {
            Ok(header) => header,
            Err(err) => {
                self.metrics.invalid_segments += 1;
                log::warn!("[stream {}] dropped segment: {err}", self.id);
                return Err(err.into());
            }
        };
        if header.stream_id != self.id {
            self.metrics.invalid_segments += 1;
            return Err(SegmentError::WrongStream {
                expected: self.id,
                found: header.stream_id,
            }
            .into());
        }
        self.last_activity = io.now;
        let payload = segment.payload();
        self.metrics.record_received(payload.len());
        log::debug!(
            "[stream {}] ← {} seq={} ack={} len={} in {}",
            self.id,
            describe(header.flags),
            header.seq,
            header.ack,
            payload.len(),
            self.state
        );

        if header.has(flags::RST) {
            return self.on_reset(&header, io);
        }

        let result = match self.state {
            StreamState::Listen => self.on_listen(&header, payload, io),
            StreamState::SynSent => self.on_syn_sent(&header, payload, io),
            StreamState::SynReceived => self.on_syn_received(&header, payload, io),
            StreamState::Established => self.on_established(&header, payload, io),
            StreamState::FinWait1 => self.on_fin_wait_1(&header, payload, io),
            StreamState::FinWait2 => self.on_fin_wait_2(&header, payload, io),
            StreamState::CloseWait => self.on_close_wait(&header, payload, io),
            StreamState::Closing => self.on_closing(&header, payload, io),
            StreamState::LastAck => self.on_last_ack(&header, payload, io),
            StreamState::TimeWait => self.on_time_wait(&header, io),
            StreamState::Close => Err(self.sequencing(&header)),
        };
        if let Err(err @ StreamError::Sequencing { .. }) = &result {
            self.metrics.sequencing_faults += 1;
            log::warn!("[stream {}] {err}", self.id);
        }
        result
    }

    fn on_reset(&mut self, h: &Header, io: &mut StreamIo<'_>) -> Result<Scheduled, StreamError> {
        let acceptable = match self.state {
            StreamState::Listen | StreamState::TimeWait | StreamState::Close => {
                log::debug!("[stream {}] ignoring RST in {}", self.id, self.state);
                return Ok(Scheduled::Idle);
            }
            StreamState::SynSent => h.has(flags::ACK) && self.send.acks_syn(h.ack),
            _ => self.recv.accepts_reset(h.seq),
        };
        if !acceptable {
            self.metrics.sequencing_faults += 1;
            return Err(self.sequencing(h));
        }
        log::warn!("[stream {}] reset by peer in {}", self.id, self.state);
        self.error = Some(StreamError::Reset);
        self.terminate(io);
        Err(StreamError::Reset)
    }

    fn on_listen(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        if !h.is(flags::SYN) {
            return Err(self.sequencing(h));
        }
        let options = SynOptions::decode(payload)?;
        let service_id = ServiceId(options.service);
        let Some(service) = io.services.find(service_id) else {
            log::warn!("[stream {}] refused: no service {service_id}", self.id);
            self.refuse(h, io);
            self.error = Some(StreamError::ServiceNotFound(service_id));
            self.terminate(io);
            return Err(StreamError::ServiceNotFound(service_id));
        };

        let local_mss = self.mss;
        self.local_port = h.dst_port;
        self.remote_port = h.src_port;
        self.service = Some(service);
        self.service_id = service_id;
        self.protocol = options.protocol;
        self.weight = Weight::new(options.weight);
        self.mss = local_mss.min(options.mss);
        self.recv.init(h.seq);
        self.send.init(rand::random());

        let reply = SynOptions {
            service: 0,
            protocol: self.protocol,
            mss: local_mss,
            weight: self.weight.get(),
        };
        self.transition(StreamState::SynReceived);
        self.send_tracked(flags::SYN | flags::ACK, reply.encode(), io)?;
        Ok(Scheduled::Idle)
    }

    fn on_syn_sent(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        // Ids carry the opener's parity, so a bare SYN here can only be a
        // confused peer; simultaneous open does not exist.
        if !h.is(flags::SYN | flags::ACK) || !self.send.acks_syn(h.ack) {
            return Err(self.sequencing(h));
        }
        let options = SynOptions::decode(payload)?;
        self.recv.init(h.seq);
        self.mss = self.mss.min(options.mss);
        self.apply_ack(h.ack, io)?;
        self.send_ack(io);
        self.establish(io)?;
        self.pump(io)?;
        Ok(Scheduled::Idle)
    }

    fn on_syn_received(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        if h.is(flags::SYN) && h.seq == self.recv.irs() {
            log::debug!("[stream {}] duplicate SYN, resending SYN-ACK", self.id);
            self.resend_in_flight(io);
            return Ok(Scheduled::Idle);
        }
        if !h.has(flags::ACK) || h.has(flags::SYN) || !self.send.acks_syn(h.ack) {
            return Err(self.sequencing(h));
        }
        self.apply_ack(h.ack, io)?;
        self.establish(io)?;
        // The handshake ACK may already carry request data.
        let accepted = self.accept_text(h, payload, io);
        if accepted.fin() {
            self.on_peer_fin_established();
        }
        self.pump(io)?;
        self.schedule_if(accepted, io)
    }

    fn on_established(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        if self.role == Role::Active && h.is(flags::SYN | flags::ACK) && h.seq == self.recv.irs() {
            log::debug!("[stream {}] duplicate SYN-ACK, re-acknowledging", self.id);
            self.send_ack(io);
            return Ok(Scheduled::Idle);
        }
        self.check_synchronized(h)?;
        self.apply_ack(h.ack, io)?;
        let accepted = self.accept_text(h, payload, io);
        if accepted.fin() {
            self.on_peer_fin_established();
        }
        self.pump(io)?;
        self.schedule_if(accepted, io)
    }

    fn on_fin_wait_1(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        self.check_synchronized(h)?;
        self.apply_ack(h.ack, io)?;
        let accepted = self.accept_text(h, payload, io);
        match (self.send.fin_acked(), accepted.fin()) {
            (true, true) => self.enter_time_wait(io)?,
            (true, false) => self.transition(StreamState::FinWait2),
            (false, true) => self.transition(StreamState::Closing),
            (false, false) => {}
        }
        self.pump(io)?;
        self.schedule_if(accepted, io)
    }

    fn on_fin_wait_2(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        self.check_synchronized(h)?;
        self.apply_ack(h.ack, io)?;
        let accepted = self.accept_text(h, payload, io);
        if accepted.fin() {
            self.enter_time_wait(io)?;
        }
        self.schedule_if(accepted, io)
    }

    fn on_close_wait(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        self.check_synchronized(h)?;
        self.apply_ack(h.ack, io)?;
        self.accept_text(h, payload, io);
        self.pump(io)?;
        Ok(Scheduled::Idle)
    }

    fn on_closing(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        self.check_synchronized(h)?;
        self.apply_ack(h.ack, io)?;
        self.accept_text(h, payload, io);
        self.pump(io)?;
        if self.send.fin_acked() {
            self.enter_time_wait(io)?;
        }
        Ok(Scheduled::Idle)
    }

    fn on_last_ack(
        &mut self,
        h: &Header,
        payload: &[u8],
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        self.check_synchronized(h)?;
        self.apply_ack(h.ack, io)?;
        self.accept_text(h, payload, io);
        self.pump(io)?;
        if self.send.fin_acked() {
            log::debug!("[stream {}] FIN acknowledged, closed", self.id);
            self.terminate(io);
        }
        Ok(Scheduled::Idle)
    }

    fn on_time_wait(&mut self, h: &Header, io: &mut StreamIo<'_>) -> Result<Scheduled, StreamError> {
        // Only retransmissions of what has already been seen are expected.
        if !h.has(flags::ACK)
            || h.has(flags::SYN)
            || !self.send.ack_acceptable(h.ack)
            || !seq_le(h.seq, self.recv.ack_number())
        {
            return Err(self.sequencing(h));
        }
        if h.has(flags::FIN) {
            log::debug!("[stream {}] retransmitted FIN, re-acknowledging", self.id);
            self.send_ack(io);
            self.enter_time_wait(io)?;
        }
        Ok(Scheduled::Idle)
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// React to one of this stream's timers firing.
    ///
    /// Returns the fault that ended the stream, if the timer ended it.
    pub fn on_timer(&mut self, kind: TimerKind, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        match kind {
            TimerKind::Retransmit => self.on_retransmit_timeout(io),
            TimerKind::KeepAlive => self.on_keepalive(io),
            TimerKind::Linger => {
                io.cancel(self.timing.linger.take());
                if self.state == StreamState::TimeWait {
                    log::debug!("[stream {}] time-wait over", self.id);
                    self.terminate(io);
                }
                Ok(())
            }
        }
    }

    fn on_retransmit_timeout(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        io.cancel(self.timing.retransmit.take());
        if !self.send.has_unacked() {
            return Ok(());
        }
        if self.timing.retries >= io.config.max_retries {
            let retries = self.timing.retries;
            let err = match self.state {
                StreamState::SynSent | StreamState::SynReceived => {
                    StreamError::HandshakeFailed { retries }
                }
                _ => StreamError::Timeout { retries },
            };
            log::warn!("[stream {}] {err}", self.id);
            return Err(self.fail(err, io));
        }
        self.timing.retries += 1;
        self.timing.rto.back_off();
        log::debug!(
            "[stream {}] timeout, go-back-N from seq={} (retry {}, rto {:?})",
            self.id,
            self.send.una(),
            self.timing.retries,
            self.timing.rto.current()
        );
        self.resend_in_flight(io);
        self.arm_retransmit(io)
    }

    fn on_keepalive(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        let idle = io.now.saturating_duration_since(self.last_activity);
        if idle >= io.config.idle_timeout {
            log::warn!("[stream {}] idle for {idle:?}, aborting", self.id);
            return Err(self.fail(StreamError::IdleTimeout(idle), io));
        }
        if idle >= io.config.keepalive_interval {
            // A zero-length segment just below `nxt` is a duplicate the peer
            // must answer with an ACK.
            let probe = OutSegment {
                header: self.header(
                    self.send.nxt().wrapping_sub(1),
                    self.recv.ack_number(),
                    flags::ACK,
                ),
                payload: Vec::new(),
            };
            self.metrics.keepalive_probes += 1;
            self.emit(probe, io);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn transition(&mut self, to: StreamState) {
        log::debug!("[stream {}] {} → {}", self.id, self.state, to);
        self.state = to;
    }

    fn invalid(&self, op: &'static str) -> StreamError {
        StreamError::InvalidState {
            state: self.state,
            op,
        }
    }

    fn sequencing(&self, h: &Header) -> StreamError {
        StreamError::Sequencing {
            state: self.state,
            flags: h.flags,
        }
    }

    /// Reject anything that is not a plain acknowledged segment within the
    /// send window.
    fn check_synchronized(&self, h: &Header) -> Result<(), StreamError> {
        if !h.has(flags::ACK) || h.has(flags::SYN) || !self.send.ack_acceptable(h.ack) {
            return Err(self.sequencing(h));
        }
        Ok(())
    }

    fn establish(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        self.transition(StreamState::Established);
        self.arm_keepalive(io)?;
        if self.send.fin_requested() {
            self.transition(StreamState::FinWait1);
        }
        Ok(())
    }

    fn on_peer_fin_established(&mut self) {
        match self.state {
            StreamState::Established => self.transition(StreamState::CloseWait),
            StreamState::FinWait1 => self.transition(StreamState::Closing),
            _ => {}
        }
    }

    fn enter_time_wait(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        if self.state != StreamState::TimeWait {
            self.transition(StreamState::TimeWait);
        }
        io.cancel(self.timing.keepalive.take());
        io.cancel(self.timing.retransmit.take());
        io.cancel(self.timing.linger.take());
        let timer = Timer::once(self.timer(TimerKind::Linger), io.config.time_wait());
        self.timing.linger = Some(io.arm(timer)?);
        Ok(())
    }

    /// Move to `CLOSE` and drop every timer.
    fn terminate(&mut self, io: &mut StreamIo<'_>) {
        for id in self.timing.disarm_all() {
            io.wheel.cancel(id);
        }
        if self.state != StreamState::Close {
            self.transition(StreamState::Close);
        }
    }

    /// Record `err`, reset the peer and terminate.
    fn fail(&mut self, err: StreamError, io: &mut StreamIo<'_>) -> StreamError {
        if self.state.is_synchronized() {
            self.send_reset(io);
        }
        self.error = Some(err.clone());
        self.terminate(io);
        err
    }

    fn timer(&self, kind: TimerKind) -> StreamTimer {
        StreamTimer {
            // Unbound streams never arm timers; the default key is never seen.
            stream: self.key.unwrap_or_else(StreamKey::unbound),
            kind,
        }
    }

    fn arm_retransmit(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        io.cancel(self.timing.retransmit.take());
        if !self.send.has_unacked() {
            return Ok(());
        }
        let timer = Timer::once(self.timer(TimerKind::Retransmit), self.timing.rto.current());
        self.timing.retransmit = Some(io.arm(timer)?);
        Ok(())
    }

    fn arm_keepalive(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        if io.is_armed(self.timing.keepalive) {
            return Ok(());
        }
        let timer = Timer::periodic(
            self.timer(TimerKind::KeepAlive),
            io.config.keepalive_interval,
            Repeat::Forever,
        );
        self.timing.keepalive = Some(io.arm(timer)?);
        Ok(())
    }

    /// Apply a cumulative ACK: sample RTT, reset retries and rearm.
    fn apply_ack(&mut self, ack: u32, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        let outcome = self.send.on_ack(ack, io.now);
        if outcome.acked == 0 {
            return Ok(());
        }
        if let Some(rtt) = outcome.rtt {
            self.timing.rto.record_rtt_sample(rtt);
        }
        self.timing.retries = 0;
        self.arm_retransmit(io)
    }

    /// Feed the segment's text to the receive block and ACK when needed.
    fn accept_text(&mut self, h: &Header, payload: &[u8], io: &mut StreamIo<'_>) -> Accepted {
        let accepted = self.recv.on_segment(h.seq, payload, h.has(flags::FIN));
        if accepted.needs_ack() {
            self.send_ack(io);
        }
        accepted
    }

    /// Cut queued data into segments while the window has room, then the
    /// FIN once everything before it is out.
    fn pump(&mut self, io: &mut StreamIo<'_>) -> Result<(), StreamError> {
        if !matches!(
            self.state,
            StreamState::Established
                | StreamState::CloseWait
                | StreamState::FinWait1
                | StreamState::Closing
                | StreamState::LastAck
        ) {
            return Ok(());
        }
        while let Some(chunk) = self.send.next_chunk(usize::from(self.mss)) {
            self.send_tracked(flags::ACK, chunk, io)?;
        }
        if self.send.fin_ready() {
            self.send_tracked(flags::FIN | flags::ACK, Vec::new(), io)?;
        }
        Ok(())
    }

    /// Hand the complete message to the dispatcher, once.
    fn schedule_if(
        &mut self,
        accepted: Accepted,
        io: &mut StreamIo<'_>,
    ) -> Result<Scheduled, StreamError> {
        if !accepted.fin() || self.dispatched {
            return Ok(Scheduled::Idle);
        }
        let Some(key) = self.key else {
            return Ok(Scheduled::Idle);
        };
        self.dispatched = true;
        let job = match self.role {
            Role::Passive => {
                let (Some(service), Some(connection)) =
                    (self.service.clone(), self.connection.clone())
                else {
                    return Ok(Scheduled::Idle);
                };
                if let Err(denied) = auth::authorize(&*connection, service.descriptor(), io.wall)
                {
                    log::warn!("[stream {}] {denied}", self.id);
                    return Err(self.fail(denied.into(), io));
                }
                DispatchJob::Request {
                    key,
                    service,
                    request: Request {
                        stream: self.id,
                        protocol: self.protocol,
                        origin: connection.origin(),
                        body: self.recv.take(),
                    },
                }
            }
            Role::Active => DispatchJob::Response {
                key,
                stream: self.id,
                body: self.recv.take(),
            },
        };
        log::debug!("[stream {}] dispatching {job:?}", self.id);
        self.metrics.dispatches += 1;
        io.dispatcher.dispatch(job);
        Ok(Scheduled::Dispatched)
    }

    fn header(&self, seq: u32, ack: u32, bits: u8) -> Header {
        Header {
            stream_id: self.id,
            src_port: self.local_port,
            dst_port: self.remote_port,
            seq,
            ack,
            window: self.recv.window(),
            flags: bits,
        }
    }

    fn emit(&mut self, segment: OutSegment, io: &mut StreamIo<'_>) {
        let h = &segment.header;
        log::debug!(
            "[stream {}] → {} seq={} ack={} len={}",
            self.id,
            describe(h.flags),
            h.seq,
            h.ack,
            segment.payload.len()
        );
        self.metrics.record_sent(segment.payload.len());
        io.outbox.push(Transmit {
            connection: self.connection_id,
            weight: self.weight,
            segment,
        });
    }

    /// Send a segment that occupies sequence space and keep it for
    /// retransmission.
    fn send_tracked(
        &mut self,
        bits: u8,
        payload: Vec<u8>,
        io: &mut StreamIo<'_>,
    ) -> Result<(), StreamError> {
        let ack = if bits & flags::ACK != 0 {
            self.recv.ack_number()
        } else {
            0
        };
        let segment = OutSegment {
            header: self.header(self.send.nxt(), ack, bits),
            payload,
        };
        self.emit(segment.clone(), io);
        self.send.record_sent(segment, io.now);
        self.last_activity = io.now;
        if !io.is_armed(self.timing.retransmit) {
            self.arm_retransmit(io)?;
        }
        Ok(())
    }

    fn send_ack(&mut self, io: &mut StreamIo<'_>) {
        let segment = OutSegment {
            header: self.header(self.send.nxt(), self.recv.ack_number(), flags::ACK),
            payload: Vec::new(),
        };
        self.emit(segment, io);
        self.last_activity = io.now;
    }

    fn send_reset(&mut self, io: &mut StreamIo<'_>) {
        let segment = OutSegment {
            header: self.header(
                self.send.nxt(),
                self.recv.ack_number(),
                flags::RST | flags::ACK,
            ),
            payload: Vec::new(),
        };
        self.emit(segment, io);
    }

    /// Answer a SYN we cannot accept.
    fn refuse(&mut self, syn: &Header, io: &mut StreamIo<'_>) {
        let segment = OutSegment {
            header: Header {
                stream_id: self.id,
                src_port: syn.dst_port,
                dst_port: syn.src_port,
                seq: 0,
                ack: syn.seq.wrapping_add(1),
                window: 0,
                flags: flags::RST | flags::ACK,
            },
            payload: Vec::new(),
        };
        self.emit(segment, io);
    }

    /// Go-back-N: transmit every in-flight segment again.
    fn resend_in_flight(&mut self, io: &mut StreamIo<'_>) {
        let ack = self.recv.ack_number();
        let mut resend = Vec::with_capacity(self.send.in_flight());
        for entry in self.send.entries_mut() {
            if entry.segment.header.has(flags::ACK) {
                entry.segment.header.ack = ack;
            }
            entry.tx_count += 1;
            entry.sent_at = io.now;
            resend.push(entry.segment.clone());
        }
        for segment in resend {
            self.metrics.retransmits += 1;
            self.emit(segment, io);
        }
    }
}

/// Short name of a flag combination, for logs.
fn describe(bits: u8) -> &'static str {
    const SYN_ACK: u8 = flags::SYN | flags::ACK;
    const FIN_ACK: u8 = flags::FIN | flags::ACK;
    const RST_ACK: u8 = flags::RST | flags::ACK;
    match bits {
        flags::SYN => "SYN",
        SYN_ACK => "SYN-ACK",
        flags::ACK => "ACK",
        FIN_ACK => "FIN",
        flags::RST | RST_ACK => "RST",
        _ => "?",
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
