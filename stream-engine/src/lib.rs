//! `stream-engine`: multiplexed, TCP-like reliable streams over an
//! unreliable datagram path.
//!
//! # Architecture
//!
//! ```text
//!   datagram ─▶ Worker::receive ─▶ Stream::receive ─▶ per-state handler
//!                  │                     │
//!                  │ index               ├─▶ outbox ─▶ Transmit ─▶ datagram
//!                  ▼                     ├─▶ TimingWheel (retransmit,
//!                Arena ◀── recycle ──┐   │    keep-alive, linger)
//!                  │                 │   └─▶ Dispatch ─▶ Service
//!                  └─ StreamKey ─────┘                     │
//!                                                          ▼
//!                                     Command::Respond ─▶ Worker::handle
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]    — wire format, validation, handshake options
//! - [`state`]      — the eleven stream states
//! - [`stream`]     — per-stream state machine and identity
//! - [`send`]       — Go-Back-N outbound window
//! - [`recv`]       — cumulative-ACK inbound reassembly
//! - [`timing`]     — stream timers and RTO estimation
//! - [`worker`]     — single-threaded stream owner, routing and recycling
//! - [`arena`]      — generational stream storage
//! - [`connection`] — connection context and access policy
//! - [`auth`]       — the four authorization checks
//! - [`service`]    — service registry and dispatch
//! - [`metrics`]    — traffic counters
//! - [`config`]     — engine tuning knobs
//! - [`error`]      — fault taxonomy
//! - [`socket`]     — UDP endpoint event loop
//! - [`simulator`]  — seeded lossy link for deterministic tests

pub mod arena;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod recv;
pub mod segment;
pub mod send;
pub mod service;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stream;
pub mod timing;
pub mod worker;

pub use arena::{StreamKey, WorkerId};
pub use config::EngineConfig;
pub use connection::{Connection, ConnectionId, PeerConnection, Side};
pub use error::StreamError;
pub use service::{Service, ServiceDescriptor, ServiceId, Services};
pub use state::StreamState;
pub use stream::{OpenRequest, Stream, StreamId};
pub use worker::{Command, Worker};
