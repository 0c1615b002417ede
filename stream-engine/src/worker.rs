//! The single-threaded owner of a set of streams.
//!
//! A [`Worker`] holds the arena, the timing wheel and the routing index for
//! every stream assigned to it.  All stream operations run here, one at a
//! time, so no stream state is ever shared across threads.  The worker is
//! deliberately `!Send`: code that wants to reach a stream from elsewhere
//! sends a [`Command`] to the worker's loop.
//!
//! Each operation ends by draining timers that fired while being armed and
//! recycling streams that reached `CLOSE`, so a caller never observes a
//! closed stream still occupying its slot.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;

use timing_wheel::TimingWheel;
use tokio::time::Instant;

use crate::arena::{Arena, StreamKey, WorkerId};
use crate::config::{ConfigError, EngineConfig};
use crate::connection::{Connection, ConnectionId};
use crate::error::StreamError;
use crate::metrics::WorkerMetrics;
use crate::segment::{flags, Segment, SegmentError};
use crate::service::{Dispatch, ServiceError, ServiceRegistry};
use crate::state::StreamState;
use crate::stream::{
    OpenRequest, Role, Scheduled, Stream, StreamId, StreamIdAllocator, StreamIo, Transmit,
};
use crate::timing::StreamTimer;

/// Work posted to a worker from outside its loop.
#[derive(Debug)]
pub enum Command {
    /// A service finished with the request on `key`.
    Respond {
        key: StreamKey,
        result: Result<Vec<u8>, ServiceError>,
    },
    Abort { key: StreamKey },
}

struct Attached {
    connection: Arc<dyn Connection>,
    ids: StreamIdAllocator,
    /// Peer-opened ids recently recycled, with when.  A SYN for one of
    /// these is a delayed duplicate and is refused until `time_wait` passes.
    retired: HashMap<StreamId, Instant>,
}

/// Borrow the worker's fields a stream operation needs, leaving the arena
/// and the index free.
macro_rules! stream_io {
    ($worker:ident, $now:expr) => {
        StreamIo {
            wheel: &mut $worker.wheel,
            expired: &mut $worker.expired,
            outbox: &mut $worker.outbox,
            services: &*$worker.services,
            dispatcher: &*$worker.dispatcher,
            config: &$worker.config,
            now: $now,
            wall: SystemTime::now(),
        }
    };
}

pub struct Worker {
    id: WorkerId,
    config: EngineConfig,
    wheel: TimingWheel<StreamTimer>,
    arena: Arena,
    index: HashMap<(ConnectionId, StreamId), StreamKey>,
    connections: HashMap<ConnectionId, Attached>,
    outbox: Vec<Transmit>,
    expired: Vec<StreamTimer>,
    /// Streams that reached a recyclable state during the current operation.
    finished: Vec<StreamKey>,
    services: Arc<dyn ServiceRegistry>,
    dispatcher: Box<dyn Dispatch>,
    metrics: WorkerMetrics,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("streams", &self.arena.len())
            .field("connections", &self.connections.len())
            .field("timers", &self.wheel.len())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        id: WorkerId,
        config: EngineConfig,
        services: Arc<dyn ServiceRegistry>,
        dispatcher: Box<dyn Dispatch>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let wheel = TimingWheel::new(config.tick_interval, config.wheel_size)?;
        log::info!(
            "[worker {id}] tick {:?} × {} buckets, up to {} streams",
            config.tick_interval,
            config.wheel_size,
            config.max_streams
        );
        Ok(Self {
            id,
            arena: Arena::new(id, config.max_streams),
            config,
            wheel,
            index: HashMap::new(),
            connections: HashMap::new(),
            outbox: Vec::new(),
            expired: Vec::new(),
            finished: Vec::new(),
            services,
            dispatcher,
            metrics: WorkerMetrics::default(),
            _not_send: PhantomData,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Live streams.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Timers registered on the wheel.
    pub fn pending_timers(&self) -> usize {
        self.wheel.len()
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Make streams on `connection` routable through this worker.
    pub fn attach(&mut self, connection: Arc<dyn Connection>) {
        let id = connection.id();
        let ids = StreamIdAllocator::new(connection.side());
        log::debug!("[worker {}] attached connection {id}", self.id);
        self.connections.insert(
            id,
            Attached {
                connection,
                ids,
                retired: HashMap::new(),
            },
        );
    }

    /// Abort every stream on `connection` and forget it.  Returns how many
    /// streams were aborted.
    pub fn detach(&mut self, connection: ConnectionId) -> usize {
        let keys: Vec<StreamKey> = self
            .index
            .iter()
            .filter(|((conn, _), _)| *conn == connection)
            .map(|(_, key)| *key)
            .collect();
        let mut aborted = 0;
        for key in keys {
            if self.abort(key).is_ok() {
                aborted += 1;
            }
        }
        self.connections.remove(&connection);
        log::debug!(
            "[worker {}] detached connection {connection}, {aborted} streams aborted",
            self.id
        );
        aborted
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Arc<dyn Connection>> {
        self.connections.get(&id).map(|a| &a.connection)
    }

    // -----------------------------------------------------------------------
    // Stream operations
    // -----------------------------------------------------------------------

    /// Open a new stream to `request.service` on `connection`.
    pub fn open(
        &mut self,
        connection: ConnectionId,
        request: OpenRequest,
    ) -> Result<StreamKey, StreamError> {
        let attached = self
            .connections
            .get_mut(&connection)
            .ok_or(StreamError::UnknownConnection(connection))?;
        let id = attached
            .ids
            .allocate()
            .ok_or(StreamError::IdsExhausted(connection))?;
        let conn = Arc::clone(&attached.connection);

        let key = self.place(id, Role::Active, conn)?;
        self.metrics.opened += 1;
        log::debug!("[worker {}] opening stream {id} as {key}", self.id);
        self.with_stream(key, |stream, io| stream.open(request, io))?;
        Ok(key)
    }

    /// Route one inbound datagram to its stream.
    ///
    /// A SYN for an unknown id creates a passive stream; an RST for an
    /// unknown id is dropped; anything else is unroutable.
    pub fn receive(
        &mut self,
        connection: ConnectionId,
        buf: &[u8],
    ) -> Result<Scheduled, StreamError> {
        let segment = Segment::new(buf);
        let Some(id) = segment.peek_stream_id() else {
            self.metrics.unroutable += 1;
            return Err(SegmentError::BufferTooShort.into());
        };
        let key = match self.index.get(&(connection, id)) {
            Some(&key) => key,
            None => match self.accept(connection, id, &segment)? {
                Some(key) => key,
                None => return Ok(Scheduled::Idle),
            },
        };
        self.with_stream(key, |stream, io| stream.receive(segment, io))
    }

    pub fn send(&mut self, key: StreamKey, data: &[u8]) -> Result<usize, StreamError> {
        self.with_stream(key, |stream, io| stream.send(data, io))
    }

    pub fn close_sending(&mut self, key: StreamKey) -> Result<(), StreamError> {
        self.with_stream(key, |stream, io| stream.close_sending(io))
    }

    pub fn abort(&mut self, key: StreamKey) -> Result<(), StreamError> {
        self.with_stream(key, |stream, io| stream.abort(io))
    }

    pub fn state(&self, key: StreamKey) -> Result<StreamState, StreamError> {
        self.arena.get(key).map(Stream::state)
    }

    pub fn stream(&self, key: StreamKey) -> Result<&Stream, StreamError> {
        self.arena.get(key)
    }

    /// Key of stream `id` on `connection`, if it is live.
    pub fn lookup(&self, connection: ConnectionId, id: StreamId) -> Option<StreamKey> {
        self.index.get(&(connection, id)).copied()
    }

    pub fn handle(&mut self, command: Command) -> Result<(), StreamError> {
        match command {
            Command::Respond {
                key,
                result: Ok(body),
            } => {
                self.send(key, &body)?;
                self.close_sending(key)
            }
            Command::Respond {
                key,
                result: Err(err),
            } => {
                log::warn!("[worker {}] {err}, aborting {key}", self.id);
                self.abort(key)
            }
            Command::Abort { key } => self.abort(key),
        }
    }

    /// Advance the wheel by one tick and run whatever expired.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let expired = &mut self.expired;
        self.wheel.tick(&mut |t: &StreamTimer| expired.push(*t));
        self.metrics.ticks += 1;
        let linger = self.config.time_wait();
        for attached in self.connections.values_mut() {
            attached
                .retired
                .retain(|_, at| now.saturating_duration_since(*at) < linger);
        }
        self.settle(now);
    }

    /// Take every segment produced so far, higher weights first.
    ///
    /// The sort is stable, so one stream's segments keep their order.
    pub fn drain_transmits(&mut self) -> Vec<Transmit> {
        let mut out = std::mem::take(&mut self.outbox);
        out.sort_by_key(|t| Reverse(t.weight));
        out
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn accept(
        &mut self,
        connection: ConnectionId,
        id: StreamId,
        segment: &Segment<'_>,
    ) -> Result<Option<StreamKey>, StreamError> {
        let bits = segment.peek_flags().unwrap_or(0);
        if bits & flags::RST != 0 {
            log::debug!("[worker {}] RST for unknown stream {id} dropped", self.id);
            return Ok(None);
        }
        if bits & (flags::SYN | flags::ACK) != flags::SYN {
            self.metrics.unroutable += 1;
            return Err(StreamError::UnknownStream { connection, id });
        }
        let Some(attached) = self.connections.get(&connection) else {
            self.metrics.unroutable += 1;
            return Err(StreamError::UnknownConnection(connection));
        };
        if id.opened_by() == attached.connection.side() {
            self.metrics.unroutable += 1;
            log::warn!("[worker {}] SYN for stream {id} with our parity", self.id);
            return Err(StreamError::ParityViolation(id));
        }
        if let Some(at) = attached.retired.get(&id) {
            if at.elapsed() < self.config.time_wait() {
                self.metrics.unroutable += 1;
                log::debug!("[worker {}] duplicate SYN for retired stream {id}", self.id);
                return Err(StreamError::RetiredStream(id));
            }
        }
        let conn = Arc::clone(&attached.connection);
        let key = self.place(id, Role::Passive, conn)?;
        self.metrics.accepted += 1;
        Ok(Some(key))
    }

    /// Claim a slot, bind the stream and index it.
    fn place(
        &mut self,
        id: StreamId,
        role: Role,
        connection: Arc<dyn Connection>,
    ) -> Result<StreamKey, StreamError> {
        let conn_id = connection.id();
        let config = &self.config;
        let (key, stream) = self.arena.allocate(|| Stream::new(config))?;
        stream.bind(key, id, role, connection, config, Instant::now());
        self.index.insert((conn_id, id), key);
        Ok(key)
    }

    fn with_stream<R>(
        &mut self,
        key: StreamKey,
        op: impl FnOnce(&mut Stream, &mut StreamIo<'_>) -> Result<R, StreamError>,
    ) -> Result<R, StreamError> {
        let now = Instant::now();
        let stream = self.arena.get_mut(key)?;
        let mut io = stream_io!(self, now);
        let result = op(stream, &mut io);
        if is_finished(stream) {
            self.finished.push(key);
        }
        self.settle(now);
        result
    }

    /// Run expired timers until none are left, then recycle finished streams.
    fn settle(&mut self, now: Instant) {
        while !self.expired.is_empty() {
            let batch = std::mem::take(&mut self.expired);
            for timer in batch {
                self.fire(timer, now);
            }
        }
        self.recycle();
    }

    fn fire(&mut self, timer: StreamTimer, now: Instant) {
        let Ok(stream) = self.arena.get_mut(timer.stream) else {
            log::debug!("[worker {}] timer for recycled stream {}", self.id, timer.stream);
            return;
        };
        let mut io = stream_io!(self, now);
        if let Err(err) = stream.on_timer(timer.kind, &mut io) {
            log::info!("[worker {}] stream {} ended: {err}", self.id, stream.id());
        }
        if is_finished(stream) {
            self.finished.push(timer.stream);
        }
    }

    /// Return finished streams to the pool, folding their counters in.
    fn recycle(&mut self) {
        for key in std::mem::take(&mut self.finished) {
            let Ok(stream) = self.arena.get_mut(key) else {
                continue;
            };
            let conn_id = stream.connection_id();
            self.index.remove(&(conn_id, stream.id()));
            if stream.role() == Role::Passive && stream.state() == StreamState::Close {
                if let Some(attached) = self.connections.get_mut(&conn_id) {
                    attached.retired.insert(stream.id(), Instant::now());
                }
            }
            self.metrics.streams += *stream.metrics();
            if stream.error().is_some() {
                self.metrics.failed += 1;
            } else if stream.state() == StreamState::Close {
                self.metrics.closed += 1;
            }
            if let Err(err) = stream.reset(&mut self.wheel) {
                log::error!("[worker {}] cannot recycle {key}: {err}", self.id);
                continue;
            }
            if let Err(err) = self.arena.release(key) {
                log::error!("[worker {}] cannot release {key}: {err}", self.id);
            }
        }
    }
}

/// Closed, or never got past `LISTEN` (a refused SYN, a failed open).
fn is_finished(stream: &Stream) -> bool {
    stream.is_closed() || stream.state() == StreamState::Listen
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::connection::{PeerConnection, Side};
    use crate::segment::{Header, OutSegment, SynOptions};
    use crate::service::{DispatchJob, ServiceId, Services};

    fn worker(side: Side) -> (Worker, Rc<RefCell<Vec<DispatchJob>>>) {
        let jobs = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&jobs);
        let mut w = Worker::new(
            WorkerId(0),
            EngineConfig::default(),
            Arc::new(Services::new()),
            Box::new(move |job: DispatchJob| sink.borrow_mut().push(job)),
        )
        .unwrap();
        w.attach(Arc::new(PeerConnection::new(ConnectionId(1), side)));
        (w, jobs)
    }

    fn raw(id: u32, bits: u8, payload: Vec<u8>) -> Vec<u8> {
        OutSegment {
            header: Header {
                stream_id: StreamId::new(id),
                src_port: 1,
                dst_port: 2,
                seq: 10,
                ack: 0,
                window: 100,
                flags: bits,
            },
            payload,
        }
        .encode()
        .unwrap()
    }

    fn syn_for(service: u64) -> Vec<u8> {
        let options = SynOptions {
            service,
            protocol: 0,
            mss: 100,
            weight: 0,
        };
        options.encode()
    }

    #[test]
    fn open_allocates_ids_with_local_parity() {
        let (mut w, _) = worker(Side::Server);
        let a = w.open(ConnectionId(1), OpenRequest::new(ServiceId(1))).unwrap();
        let b = w.open(ConnectionId(1), OpenRequest::new(ServiceId(1))).unwrap();
        assert_eq!(w.stream(a).unwrap().id(), StreamId::new(1));
        assert_eq!(w.stream(b).unwrap().id(), StreamId::new(3));
        assert_eq!(w.state(a).unwrap(), StreamState::SynSent);
        assert_eq!(w.drain_transmits().len(), 2);
        assert_eq!(w.metrics().opened, 2);
        assert_eq!(w.pending_timers(), 2);
    }

    #[test]
    fn open_on_unknown_connection_fails() {
        let (mut w, _) = worker(Side::Peer);
        assert_eq!(
            w.open(ConnectionId(9), OpenRequest::new(ServiceId(1))),
            Err(StreamError::UnknownConnection(ConnectionId(9)))
        );
        assert!(w.is_empty());
    }

    #[test]
    fn inbound_syn_with_local_parity_is_rejected() {
        let (mut w, _) = worker(Side::Peer);
        let err = w
            .receive(ConnectionId(1), &raw(4, flags::SYN, syn_for(1)))
            .unwrap_err();
        assert_eq!(err, StreamError::ParityViolation(StreamId::new(4)));
        assert!(w.is_empty());
    }

    #[test]
    fn refused_syn_is_recycled() {
        let (mut w, _) = worker(Side::Peer);
        let err = w
            .receive(ConnectionId(1), &raw(3, flags::SYN, syn_for(77)))
            .unwrap_err();
        assert_eq!(err, StreamError::ServiceNotFound(ServiceId(77)));
        assert!(w.is_empty());
        assert_eq!(w.lookup(ConnectionId(1), StreamId::new(3)), None);
        assert_eq!(w.metrics().failed, 1);
        let out = w.drain_transmits();
        assert_eq!(out.len(), 1);
        assert!(out[0].segment.header.has(flags::RST));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_syn_for_a_closed_stream_is_refused() {
        let (mut w, _) = worker(Side::Peer);
        let syn = raw(3, flags::SYN, syn_for(77));
        w.receive(ConnectionId(1), &syn).unwrap_err();
        assert!(w.is_empty());
        w.drain_transmits();

        let err = w.receive(ConnectionId(1), &syn).unwrap_err();
        assert_eq!(err, StreamError::RetiredStream(StreamId::new(3)));
        assert!(w.is_empty());
        assert!(w.drain_transmits().is_empty());
        assert_eq!(w.metrics().accepted, 1);
        assert_eq!(w.metrics().unroutable, 1);

        // Other ids are unaffected.
        let err = w
            .receive(ConnectionId(1), &raw(5, flags::SYN, syn_for(77)))
            .unwrap_err();
        assert_eq!(err, StreamError::ServiceNotFound(ServiceId(77)));

        tokio::time::advance(w.config().time_wait()).await;
        w.tick();
        let err = w.receive(ConnectionId(1), &syn).unwrap_err();
        assert_eq!(err, StreamError::ServiceNotFound(ServiceId(77)));
        assert_eq!(w.metrics().accepted, 3);
    }

    #[test]
    fn malformed_syn_leaves_nothing_behind() {
        let (mut w, _) = worker(Side::Peer);
        let err = w
            .receive(ConnectionId(1), &raw(3, flags::SYN, vec![1, 2, 3]))
            .unwrap_err();
        assert_eq!(err, StreamError::Segment(SegmentError::BadOptions));
        assert!(w.is_empty());
        assert_eq!(w.arena.pooled(), 1);
    }

    #[test]
    fn unknown_streams_are_unroutable_and_rsts_are_dropped() {
        let (mut w, _) = worker(Side::Peer);
        assert_eq!(
            w.receive(ConnectionId(1), &raw(3, flags::ACK, vec![])),
            Err(StreamError::UnknownStream {
                connection: ConnectionId(1),
                id: StreamId::new(3)
            })
        );
        assert_eq!(
            w.receive(ConnectionId(1), &raw(3, flags::RST, vec![])),
            Ok(Scheduled::Idle)
        );
        assert_eq!(
            w.receive(ConnectionId(1), &[0u8; 3]),
            Err(StreamError::Segment(SegmentError::BufferTooShort))
        );
        assert_eq!(w.metrics().unroutable, 2);
        assert!(w.drain_transmits().is_empty());
    }

    #[test]
    fn abort_recycles_and_stale_keys_fail() {
        let (mut w, _) = worker(Side::Peer);
        let key = w.open(ConnectionId(1), OpenRequest::new(ServiceId(1))).unwrap();
        w.handle(Command::Abort { key }).unwrap();
        assert!(w.is_empty());
        assert_eq!(w.pending_timers(), 0);
        assert_eq!(w.state(key), Err(StreamError::StaleStream));
        assert_eq!(w.send(key, b"late"), Err(StreamError::StaleStream));
    }

    #[test]
    fn detach_aborts_every_stream_on_the_connection() {
        let (mut w, _) = worker(Side::Peer);
        for _ in 0..3 {
            w.open(ConnectionId(1), OpenRequest::new(ServiceId(1))).unwrap();
        }
        assert_eq!(w.detach(ConnectionId(1)), 3);
        assert!(w.is_empty());
        assert!(w.connection(ConnectionId(1)).is_none());
    }

    #[test]
    fn transmits_are_ordered_by_weight() {
        let (mut w, _) = worker(Side::Peer);
        let low = OpenRequest::new(ServiceId(1));
        let high = OpenRequest {
            weight: crate::stream::Weight::new(9),
            ..OpenRequest::new(ServiceId(1))
        };
        w.open(ConnectionId(1), low).unwrap();
        w.open(ConnectionId(1), high).unwrap();
        let out = w.drain_transmits();
        assert_eq!(out[0].weight.get(), 9);
        assert_eq!(out[1].weight.get(), 0);
    }
}
