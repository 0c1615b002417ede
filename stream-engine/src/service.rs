//! Services and the hand-off path to them.
//!
//! A stream never runs application code itself.  Once a passive stream holds
//! a complete, authorized request it packages it into a [`DispatchJob`] and
//! hands it to a [`Dispatch`] sink; the sink runs the [`Service`] somewhere
//! else and feeds the response back to the owning worker as a
//! [`Command`](crate::worker::Command).
//!
//! ```text
//!  Worker ──DispatchJob::Request──▶ TokioDispatcher ──spawn_blocking──▶ Service::serve
//!     ▲                                                                      │
//!     └─────────────────────── Command::Respond ◀────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::arena::StreamKey;
use crate::connection::{Crud, Origin, UserType};
use crate::stream::StreamId;
use crate::worker::Command;

// ---------------------------------------------------------------------------
// Identity and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service id {0} is already registered")]
    DuplicateId(ServiceId),
    #[error("service uri {0:?} is already registered")]
    DuplicateUri(String),
    #[error("service {service} failed: {reason}")]
    Failed { service: ServiceId, reason: String },
    #[error("service {0} panicked")]
    Panicked(ServiceId),
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Static routing and authorization data of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub uri: String,
    /// Principals allowed to call the service.
    pub user_types: UserType,
    /// Kind of operation, checked against the connection's policy.
    pub crud: Crud,
}

/// A complete request, owned by whoever serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub stream: StreamId,
    pub protocol: u16,
    pub origin: Origin,
    pub body: Vec<u8>,
}

/// Application handler reached through the registry.
///
/// `serve` runs on a blocking pool; it may take as long as it needs.
pub trait Service: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    fn serve(&self, request: &Request) -> Result<Vec<u8>, ServiceError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lookup half of the registry, the only part a stream needs.
pub trait ServiceRegistry {
    fn find(&self, id: ServiceId) -> Option<Arc<dyn Service>>;
}

/// Services indexed by id and by URI.
#[derive(Default)]
pub struct Services {
    by_id: HashMap<ServiceId, Arc<dyn Service>>,
    by_uri: HashMap<String, ServiceId>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `service`.  Both its id and its URI must be unused.
    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let descriptor = service.descriptor();
        let (id, uri) = (descriptor.id, descriptor.uri.clone());
        if self.by_id.contains_key(&id) {
            return Err(ServiceError::DuplicateId(id));
        }
        if self.by_uri.contains_key(&uri) {
            return Err(ServiceError::DuplicateUri(uri));
        }
        log::debug!("[services] registered {id} at {uri:?}");
        self.by_uri.insert(uri, id);
        self.by_id.insert(id, service);
        Ok(())
    }

    pub fn deregister(&mut self, id: ServiceId) -> Option<Arc<dyn Service>> {
        let service = self.by_id.remove(&id)?;
        self.by_uri.remove(&service.descriptor().uri);
        Some(service)
    }

    pub fn find_by_uri(&self, uri: &str) -> Option<Arc<dyn Service>> {
        self.by_uri.get(uri).and_then(|id| self.by_id.get(id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl ServiceRegistry for Services {
    fn find(&self, id: ServiceId) -> Option<Arc<dyn Service>> {
        self.by_id.get(&id).cloned()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.by_uri.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// Hand-off
// ---------------------------------------------------------------------------

/// A unit of application work leaving the segment path.
///
/// Ownership of the body moves with the job; the stream keeps nothing.
pub enum DispatchJob {
    /// A passive stream received a complete request.
    Request {
        key: StreamKey,
        service: Arc<dyn Service>,
        request: Request,
    },
    /// An active stream received a complete response.
    Response {
        key: StreamKey,
        stream: StreamId,
        body: Vec<u8>,
    },
}

impl fmt::Debug for DispatchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request {
                key,
                service,
                request,
            } => f
                .debug_struct("Request")
                .field("key", key)
                .field("service", &service.descriptor().id)
                .field("request", request)
                .finish(),
            Self::Response { key, stream, body } => f
                .debug_struct("Response")
                .field("key", key)
                .field("stream", stream)
                .field("body_len", &body.len())
                .finish(),
        }
    }
}

/// Sink that executes jobs on an independent unit of execution.
///
/// `dispatch` is called from the segment path and must return without
/// waiting on the job.
pub trait Dispatch {
    fn dispatch(&self, job: DispatchJob);
}

impl<F> Dispatch for F
where
    F: Fn(DispatchJob),
{
    fn dispatch(&self, job: DispatchJob) {
        self(job)
    }
}

/// A response body delivered to the application that opened the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub key: StreamKey,
    pub stream: StreamId,
    pub body: Vec<u8>,
}

/// Runs services on tokio's blocking pool.
///
/// Requests come back to the worker on `commands`; responses for locally
/// opened streams go to `delivered`.  Must be used inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
    commands: mpsc::UnboundedSender<Command>,
    delivered: mpsc::UnboundedSender<Delivered>,
}

impl TokioDispatcher {
    pub fn new(
        commands: mpsc::UnboundedSender<Command>,
        delivered: mpsc::UnboundedSender<Delivered>,
    ) -> Self {
        Self {
            commands,
            delivered,
        }
    }
}

impl Dispatch for TokioDispatcher {
    fn dispatch(&self, job: DispatchJob) {
        match job {
            DispatchJob::Request {
                key,
                service,
                request,
            } => {
                let id = service.descriptor().id;
                let commands = self.commands.clone();
                let serving = tokio::task::spawn_blocking(move || service.serve(&request));
                tokio::spawn(async move {
                    let result = match serving.await {
                        Ok(result) => result,
                        Err(err) => {
                            log::error!("[dispatch] service {id} did not complete: {err}");
                            Err(ServiceError::Panicked(id))
                        }
                    };
                    if commands.send(Command::Respond { key, result }).is_err() {
                        log::warn!("[dispatch] worker gone, dropping response for {key}");
                    }
                });
            }
            DispatchJob::Response { key, stream, body } => {
                let delivered = Delivered { key, stream, body };
                if self.delivered.send(delivered).is_err() {
                    log::warn!("[dispatch] no reader for response on stream {stream}");
                }
            }
        }
    }
}
