//! UDP endpoint: one worker driven by a tokio event loop.
//!
//! [`Endpoint`] owns a `tokio::net::UdpSocket` and a [`Worker`].  Every
//! remote address becomes one connection; datagrams from it are routed to
//! the worker, and segments the worker produces are encoded and sent back.
//! All protocol logic lives in the worker; this module owns only byte I/O
//! and the loop.
//!
//! ```text
//!        ┌───────────── select! ──────────────┐
//!        │ recv_from │ tick │ command │ stop  │
//!        └─────┬─────────┬──────┬─────────────┘
//!              ▼         ▼      ▼
//!            Worker::receive / tick / handle
//!              │
//!              ▼
//!         drain_transmits ──▶ send_to
//! ```
//!
//! The worker is `!Send`, so the loop runs on the task that owns the
//! endpoint (a current-thread runtime or a `LocalSet`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::arena::{StreamKey, WorkerId};
use crate::config::{ConfigError, EngineConfig};
use crate::connection::{AccessPolicy, ConnectionId, Origin, PeerConnection, Side, UserType};
use crate::error::StreamError;
use crate::service::{Delivered, ServiceRegistry, TokioDispatcher};
use crate::stream::OpenRequest;
use crate::worker::{Command, Worker};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("no connection to {0}")]
    NoRoute(SocketAddr),
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// How remote parties are described to the worker.
#[derive(Debug, Clone)]
struct Template {
    user_type: UserType,
    origin: Origin,
    policy: AccessPolicy,
}

pub struct Endpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    side: Side,
    worker: Worker,
    template: Template,
    peers: HashMap<SocketAddr, ConnectionId>,
    addrs: HashMap<ConnectionId, SocketAddr>,
    next_connection: u64,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Endpoint {
    /// Bind a new endpoint to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.  `side` is
    /// this end of every connection the endpoint creates.  Responses to
    /// streams opened here arrive on the returned receiver.
    pub async fn bind(
        local_addr: SocketAddr,
        side: Side,
        config: EngineConfig,
        services: Arc<dyn ServiceRegistry>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Delivered>), EndpointError> {
        let socket = UdpSocket::bind(local_addr).await?;
        let local_addr = socket.local_addr()?;
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (delivered_tx, delivered) = mpsc::unbounded_channel();
        let dispatcher = TokioDispatcher::new(commands_tx.clone(), delivered_tx);
        let worker = Worker::new(WorkerId(0), config, services, Box::new(dispatcher))?;
        log::info!("[endpoint] bound {local_addr} as {side:?}");
        let endpoint = Self {
            socket,
            local_addr,
            side,
            worker,
            template: Template {
                user_type: UserType::GUEST,
                origin: Origin::default(),
                policy: AccessPolicy::allow_all(),
            },
            peers: HashMap::new(),
            addrs: HashMap::new(),
            next_connection: 1,
            commands_tx,
            commands,
        };
        Ok((endpoint, delivered))
    }

    /// Principal type assigned to connections created from now on.
    pub fn with_user_type(mut self, user_type: UserType) -> Self {
        self.template.user_type = user_type;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.template.origin = origin;
        self
    }

    /// Access policy applied to connections created from now on.
    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.template.policy = policy;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Sender for posting commands (e.g. aborts) into the loop.
    pub fn commands(&self) -> mpsc::UnboundedSender<Command> {
        self.commands_tx.clone()
    }

    /// Connection to `addr`, creating it on first use.
    pub fn connect(&mut self, addr: SocketAddr) -> ConnectionId {
        if let Some(&id) = self.peers.get(&addr) {
            return id;
        }
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        let connection = PeerConnection::new(id, self.side)
            .with_mtu(self.worker.config().mtu)
            .with_user_type(self.template.user_type)
            .with_origin(self.template.origin)
            .with_policy(self.template.policy.clone());
        self.worker.attach(Arc::new(connection));
        self.peers.insert(addr, id);
        self.addrs.insert(id, addr);
        log::info!("[endpoint] connection {id} ↔ {addr}");
        id
    }

    /// Open a stream and queue `body` as the complete request.
    pub async fn request(
        &mut self,
        addr: SocketAddr,
        request: OpenRequest,
        body: &[u8],
    ) -> Result<StreamKey, EndpointError> {
        let connection = self.connect(addr);
        let key = self.worker.open(connection, request)?;
        self.worker.send(key, body)?;
        self.worker.close_sending(key)?;
        self.flush().await?;
        Ok(key)
    }

    /// Drive the worker until `stop` turns `true` or its sender is dropped.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<(), EndpointError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut ticker = interval(self.worker.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (n, addr) = received?;
                    self.on_datagram(&buf[..n], addr);
                }
                _ = ticker.tick() => self.worker.tick(),
                Some(command) = self.commands.recv() => {
                    if let Err(err) = self.worker.handle(command) {
                        log::warn!("[endpoint] command failed: {err}");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
            self.flush().await?;
        }
        log::info!(
            "[endpoint] stopped with {} live streams: {:?}",
            self.worker.len(),
            self.worker.metrics()
        );
        Ok(())
    }

    fn on_datagram(&mut self, datagram: &[u8], addr: SocketAddr) {
        let connection = self.connect(addr);
        if let Err(err) = self.worker.receive(connection, datagram) {
            if err.is_rejection() {
                log::debug!("[endpoint] from {addr}: {err}");
            } else {
                log::info!("[endpoint] from {addr}: {err}");
            }
        }
    }

    /// Encode and send every segment the worker has produced.
    pub async fn flush(&mut self) -> Result<(), EndpointError> {
        for transmit in self.worker.drain_transmits() {
            let Some(&addr) = self.addrs.get(&transmit.connection) else {
                log::warn!("[endpoint] no address for connection {}", transmit.connection);
                continue;
            };
            let bytes = match transmit.segment.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::error!("[endpoint] cannot encode segment: {err}");
                    continue;
                }
            };
            self.socket.send_to(&bytes, addr).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_addr", &self.local_addr)
            .field("side", &self.side)
            .field("peers", &self.peers)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}
