//! Deterministic network simulator.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To
//! exercise the reliability mechanisms without depending on actual network
//! conditions, this module provides:
//!
//! - a [`Simulator`] that applies a seeded fault model to a batch of
//!   datagrams, and
//! - a [`Network`] that wires two [`Worker`]s together through one simulator
//!   per direction and runs their services inline.
//!
//! | Fault            | Description                                          |
//! |------------------|------------------------------------------------------|
//! | Loss             | Drop a datagram with probability `loss_rate`.        |
//! | Reordering       | Hold a datagram back until the next batch.           |
//! | Duplication      | Deliver a datagram twice.                            |
//! | Corruption       | Flip one random bit.                                 |
//!
//! The same seed always produces the same run.  Time only moves through
//! [`Network::advance`], which sleeps on tokio's clock; under a paused test
//! runtime the whole run is instantaneous.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::arena::{StreamKey, WorkerId};
use crate::config::{ConfigError, EngineConfig};
use crate::connection::{Connection, ConnectionId, PeerConnection, Side};
use crate::error::StreamError;
use crate::segment::{Header, Segment};
use crate::service::{Delivered, DispatchJob, ServiceId, ServiceRegistry};
use crate::stream::{OpenRequest, Transmit};
use crate::worker::{Command, Worker};

/// Exchange rounds after which [`Network::exchange`] gives up.
const MAX_ROUNDS: usize = 10_000;

// ---------------------------------------------------------------------------
// Fault model
// ---------------------------------------------------------------------------

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub reorder_rate: f64,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0,
        }
    }
}

/// What the fault model did so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub offered: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    pub corrupted: u64,
}

/// One direction of a lossy link.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    /// Datagrams held back by reordering.
    held: Vec<Vec<u8>>,
    stats: LinkStats,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            held: Vec::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Change the fault model mid-run, keeping the RNG stream.
    pub fn set_config(&mut self, config: SimulatorConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// `true` when datagrams are being held for a later batch.
    pub fn has_held(&self) -> bool {
        !self.held.is_empty()
    }

    /// Run `batch` through the fault model and return what arrives, in
    /// arrival order.  Datagrams held by an earlier call arrive after this
    /// batch's.
    pub fn transmit(&mut self, batch: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let released = std::mem::take(&mut self.held);
        let mut out = Vec::with_capacity(batch.len() + released.len());
        for mut datagram in batch {
            self.stats.offered += 1;
            if self.chance(self.config.loss_rate) {
                self.stats.dropped += 1;
                continue;
            }
            if self.chance(self.config.corrupt_rate) && !datagram.is_empty() {
                let byte = self.rng.gen_range(0..datagram.len());
                let bit = self.rng.gen_range(0..8);
                datagram[byte] ^= 1 << bit;
                self.stats.corrupted += 1;
            }
            if self.chance(self.config.duplicate_rate) {
                self.stats.duplicated += 1;
                out.push(datagram.clone());
            }
            if self.chance(self.config.reorder_rate) {
                self.stats.reordered += 1;
                self.held.push(datagram);
                continue;
            }
            out.push(datagram);
        }
        out.extend(released);
        self.stats.delivered += out.len() as u64;
        out
    }

    fn chance(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.gen_bool(p.min(1.0))
    }
}

// ---------------------------------------------------------------------------
// Two workers and a link
// ---------------------------------------------------------------------------

/// Direction of a traced segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    Up,
    /// Server to client.
    Down,
}

/// A segment that arrived intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traced {
    pub direction: Direction,
    pub header: Header,
    pub payload_len: usize,
}

type Jobs = Rc<RefCell<Vec<DispatchJob>>>;

/// A client worker and a server worker joined by a simulated link.
///
/// Services run inline on [`Network::exchange`]; responses to client
/// streams collect in [`Network::take_delivered`].
pub struct Network {
    pub client: Worker,
    pub server: Worker,
    client_conn: ConnectionId,
    server_conn: ConnectionId,
    uplink: Simulator,
    downlink: Simulator,
    client_jobs: Jobs,
    server_jobs: Jobs,
    delivered: Vec<Delivered>,
    trace: Vec<Traced>,
    /// Faults returned by the workers while routing datagrams.
    errors: Vec<StreamError>,
}

impl Network {
    /// `server_view` is the server's description of the client: its id,
    /// user type, origin and access policy.
    pub fn new(
        config: EngineConfig,
        services: Arc<dyn ServiceRegistry>,
        server_view: PeerConnection,
        faults: SimulatorConfig,
    ) -> Result<Self, ConfigError> {
        let client_jobs: Jobs = Rc::default();
        let server_jobs: Jobs = Rc::default();
        let mut client = Worker::new(
            WorkerId(0),
            config.clone(),
            services.clone(),
            Box::new(queue(&client_jobs)),
        )?;
        let mut server = Worker::new(WorkerId(1), config, services, Box::new(queue(&server_jobs)))?;

        let client_conn = ConnectionId(1);
        let server_conn = server_view.id();
        client.attach(Arc::new(PeerConnection::new(client_conn, Side::Peer)));
        server.attach(Arc::new(server_view));

        let downlink = Simulator::new(SimulatorConfig {
            seed: faults.seed.wrapping_add(1),
            ..faults.clone()
        });
        Ok(Self {
            client,
            server,
            client_conn,
            server_conn,
            uplink: Simulator::new(faults),
            downlink,
            client_jobs,
            server_jobs,
            delivered: Vec::new(),
            trace: Vec::new(),
            errors: Vec::new(),
        })
    }

    /// Open a stream, send `body` and half-close, then exchange.
    pub fn request(&mut self, service: ServiceId, body: &[u8]) -> Result<StreamKey, StreamError> {
        self.request_with(OpenRequest::new(service), body)
    }

    pub fn request_with(
        &mut self,
        request: OpenRequest,
        body: &[u8],
    ) -> Result<StreamKey, StreamError> {
        let key = self.client.open(self.client_conn, request)?;
        self.client.send(key, body)?;
        self.client.close_sending(key)?;
        self.exchange();
        Ok(key)
    }

    /// Move datagrams both ways and run services until nothing moves.
    pub fn exchange(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let up = self.client.drain_transmits();
            let down = self.server.drain_transmits();
            let mut moved = up.len() + down.len();
            self.deliver(Direction::Up, up);
            self.deliver(Direction::Down, down);
            moved += self.run_jobs();
            if moved == 0 && !self.uplink.has_held() && !self.downlink.has_held() {
                return;
            }
        }
        log::warn!("[sim] exchange did not settle after {MAX_ROUNDS} rounds");
    }

    /// Let `duration` pass one wheel tick at a time, exchanging after each.
    pub async fn advance(&mut self, duration: Duration) {
        let tick = self.client.config().tick_interval;
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            tokio::time::sleep(tick).await;
            elapsed += tick;
            self.client.tick();
            self.server.tick();
            self.exchange();
        }
    }

    pub fn take_delivered(&mut self) -> Vec<Delivered> {
        std::mem::take(&mut self.delivered)
    }

    pub fn trace(&self) -> &[Traced] {
        &self.trace
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }

    pub fn errors(&self) -> &[StreamError] {
        &self.errors
    }

    pub fn uplink(&mut self) -> &mut Simulator {
        &mut self.uplink
    }

    pub fn downlink(&mut self) -> &mut Simulator {
        &mut self.downlink
    }

    pub fn client_connection(&self) -> ConnectionId {
        self.client_conn
    }

    pub fn server_connection(&self) -> ConnectionId {
        self.server_conn
    }

    fn deliver(&mut self, direction: Direction, transmits: Vec<Transmit>) {
        let mut batch = Vec::with_capacity(transmits.len());
        for t in transmits {
            match t.segment.encode() {
                Ok(bytes) => batch.push(bytes),
                Err(err) => log::error!("[sim] cannot encode segment: {err}"),
            }
        }
        let (link, worker, conn) = match direction {
            Direction::Up => (&mut self.uplink, &mut self.server, self.server_conn),
            Direction::Down => (&mut self.downlink, &mut self.client, self.client_conn),
        };
        for datagram in link.transmit(batch) {
            let segment = Segment::new(&datagram);
            if let Ok(header) = segment.check_segment() {
                self.trace.push(Traced {
                    direction,
                    header,
                    payload_len: segment.payload().len(),
                });
            }
            if let Err(err) = worker.receive(conn, &datagram) {
                log::debug!("[sim] {direction:?} datagram rejected: {err}");
                self.errors.push(err);
            }
        }
    }

    /// Serve queued requests and collect responses.  Returns the number of
    /// jobs run.
    fn run_jobs(&mut self) -> usize {
        let mut ran = 0;
        for job in self.server_jobs.take() {
            ran += 1;
            match job {
                DispatchJob::Request {
                    key,
                    service,
                    request,
                } => {
                    let result = service.serve(&request);
                    if let Err(err) = self.server.handle(Command::Respond { key, result }) {
                        log::debug!("[sim] response for {key} not sent: {err}");
                    }
                }
                DispatchJob::Response { key, stream, .. } => {
                    log::warn!("[sim] server received a response on {stream} ({key})");
                }
            }
        }
        for job in self.client_jobs.take() {
            ran += 1;
            match job {
                DispatchJob::Response { key, stream, body } => {
                    self.delivered.push(Delivered { key, stream, body });
                }
                DispatchJob::Request { key, .. } => {
                    log::warn!("[sim] client received a request on {key}");
                }
            }
        }
        ran
    }
}

fn queue(jobs: &Jobs) -> impl Fn(DispatchJob) {
    let jobs = Rc::clone(jobs);
    move |job| jobs.borrow_mut().push(job)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: u8) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i; 4]).collect()
    }

    #[test]
    fn pass_through_by_default() {
        let mut sim = Simulator::new(SimulatorConfig::default());
        assert_eq!(sim.transmit(batch(5)), batch(5));
        assert_eq!(sim.stats().delivered, 5);
    }

    #[test]
    fn total_loss_drops_everything() {
        let mut sim = Simulator::new(SimulatorConfig {
            loss_rate: 1.0,
            ..SimulatorConfig::default()
        });
        assert!(sim.transmit(batch(5)).is_empty());
        assert_eq!(sim.stats().dropped, 5);
    }

    #[test]
    fn same_seed_same_faults() {
        let config = SimulatorConfig {
            loss_rate: 0.3,
            duplicate_rate: 0.2,
            reorder_rate: 0.2,
            corrupt_rate: 0.1,
            seed: 42,
        };
        let mut a = Simulator::new(config.clone());
        let mut b = Simulator::new(config);
        for _ in 0..10 {
            assert_eq!(a.transmit(batch(20)), b.transmit(batch(20)));
        }
        assert_eq!(a.stats(), b.stats());
    }

    #[test]
    fn reordered_datagrams_arrive_with_the_next_batch() {
        let mut sim = Simulator::new(SimulatorConfig {
            reorder_rate: 1.0,
            ..SimulatorConfig::default()
        });
        assert!(sim.transmit(batch(2)).is_empty());
        assert!(sim.has_held());
        assert_eq!(sim.transmit(Vec::new()), batch(2));
        assert!(!sim.has_held());
    }
}
