//! State-by-state tests with two workers and hand-carried segments.
//!
//! Nothing moves unless a test moves it, so each intermediate state of the
//! handshake and of both teardown orders can be observed and poked at.

use std::sync::Arc;
use std::time::Duration;

use stream_engine::connection::{Crud, UserType};
use stream_engine::segment::{flags, Header, OutSegment};
use stream_engine::service::{DispatchJob, Request, ServiceError};
use stream_engine::stream::Transmit;
use stream_engine::{
    ConnectionId, EngineConfig, OpenRequest, PeerConnection, Service, ServiceDescriptor,
    ServiceId, Services, Side, StreamError, StreamKey, StreamState, Worker, WorkerId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ECHO: ServiceId = ServiceId(0xEC40);
const CLIENT_CONN: ConnectionId = ConnectionId(1);
const SERVER_CONN: ConnectionId = ConnectionId(7);

struct Echo(ServiceDescriptor);

impl Service for Echo {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.0
    }

    fn serve(&self, request: &Request) -> Result<Vec<u8>, ServiceError> {
        Ok(request.body.clone())
    }
}

fn worker(id: u16, side: Side, connection: ConnectionId) -> Worker {
    let mut services = Services::new();
    services
        .register(Arc::new(Echo(ServiceDescriptor {
            id: ECHO,
            uri: "/echo".into(),
            user_types: UserType::ALL,
            crud: Crud::READ,
        })))
        .expect("register echo");
    let mut worker = Worker::new(
        WorkerId(id),
        EngineConfig::default(),
        Arc::new(services),
        Box::new(|_job: DispatchJob| {}),
    )
    .expect("valid config");
    worker.attach(Arc::new(PeerConnection::new(connection, side)));
    worker
}

/// Client and server workers plus the segments in flight between them.
struct Pair {
    client: Worker,
    server: Worker,
    up: Vec<Transmit>,
    down: Vec<Transmit>,
}

impl Pair {
    fn new() -> Self {
        Self {
            client: worker(0, Side::Peer, CLIENT_CONN),
            server: worker(1, Side::Server, SERVER_CONN),
            up: Vec::new(),
            down: Vec::new(),
        }
    }

    /// Pick up whatever either side has produced.
    fn collect(&mut self) {
        self.up.extend(self.client.drain_transmits());
        self.down.extend(self.server.drain_transmits());
    }

    /// Deliver the oldest client segment to the server.
    fn step_up(&mut self) {
        self.collect();
        let transmit = self.up.remove(0);
        let bytes = transmit.segment.encode().expect("encode");
        self.server.receive(SERVER_CONN, &bytes).expect("server accepts");
        self.collect();
    }

    /// Deliver the oldest server segment to the client.
    fn step_down(&mut self) {
        self.collect();
        let transmit = self.down.remove(0);
        let bytes = transmit.segment.encode().expect("encode");
        self.client.receive(CLIENT_CONN, &bytes).expect("client accepts");
        self.collect();
    }

    fn server_key(&self, client_key: StreamKey) -> StreamKey {
        let id = self.client.stream(client_key).expect("client stream").id();
        self.server.lookup(SERVER_CONN, id).expect("server stream")
    }

    async fn linger(&mut self, duration: Duration) {
        let tick = self.client.config().tick_interval;
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            tokio::time::sleep(tick).await;
            elapsed += tick;
            self.client.tick();
            self.server.tick();
            self.collect();
        }
    }
}

/// An ACK far beyond anything sent must be rejected without side effects,
/// however often it arrives.
fn assert_rejects_bogus_ack(worker: &mut Worker, connection: ConnectionId, key: StreamKey) {
    let stream = worker.stream(key).expect("stream");
    let state = stream.state();
    let before = (
        stream.sender().una(),
        stream.sender().nxt(),
        stream.receiver().ack_number(),
    );
    let faults = stream.metrics().sequencing_faults;
    let bogus = OutSegment {
        header: Header {
            stream_id: stream.id(),
            src_port: 0,
            dst_port: 0,
            seq: stream.receiver().ack_number().wrapping_add(50_000),
            ack: stream.sender().nxt().wrapping_add(1_000),
            window: u16::MAX,
            flags: flags::ACK,
        },
        payload: Vec::new(),
    }
    .encode()
    .expect("encode");

    for attempt in 0..2 {
        let err = worker
            .receive(connection, &bogus)
            .expect_err("bogus ACK accepted");
        assert!(
            matches!(err, StreamError::Sequencing { state: s, .. } if s == state),
            "attempt {attempt} in {state}: {err}"
        );
        assert!(
            worker.drain_transmits().is_empty(),
            "{state} answered a bogus ACK"
        );
    }

    let stream = worker.stream(key).expect("stream survives");
    assert_eq!(stream.state(), state);
    let after = (
        stream.sender().una(),
        stream.sender().nxt(),
        stream.receiver().ack_number(),
    );
    assert_eq!(after, before, "{state} changed its sequence variables");
    assert_eq!(stream.metrics().sequencing_faults, faults + 2);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Walk through the handshake and the client-first teardown, rejecting an
/// illegal segment in every state on the way.
#[tokio::test]
async fn illegal_segments_are_rejected_in_every_state() {
    let mut pair = Pair::new();

    let ck = pair
        .client
        .open(CLIENT_CONN, OpenRequest::new(ECHO))
        .expect("open");
    pair.collect();
    assert_eq!(pair.client.state(ck), Ok(StreamState::SynSent));
    assert_rejects_bogus_ack(&mut pair.client, CLIENT_CONN, ck);

    pair.step_up(); // SYN
    let sk = pair.server_key(ck);
    assert_eq!(pair.server.state(sk), Ok(StreamState::SynReceived));
    assert_rejects_bogus_ack(&mut pair.server, SERVER_CONN, sk);

    pair.step_down(); // SYN-ACK
    assert_eq!(pair.client.state(ck), Ok(StreamState::Established));
    assert_rejects_bogus_ack(&mut pair.client, CLIENT_CONN, ck);

    pair.step_up(); // ACK
    assert_eq!(pair.server.state(sk), Ok(StreamState::Established));
    assert_rejects_bogus_ack(&mut pair.server, SERVER_CONN, sk);

    pair.client.close_sending(ck).expect("close");
    pair.collect();
    assert_eq!(pair.client.state(ck), Ok(StreamState::FinWait1));
    assert_rejects_bogus_ack(&mut pair.client, CLIENT_CONN, ck);

    pair.step_up(); // FIN
    assert_eq!(pair.server.state(sk), Ok(StreamState::CloseWait));
    assert_rejects_bogus_ack(&mut pair.server, SERVER_CONN, sk);

    pair.step_down(); // ACK of FIN
    assert_eq!(pair.client.state(ck), Ok(StreamState::FinWait2));
    assert_rejects_bogus_ack(&mut pair.client, CLIENT_CONN, ck);

    pair.server.close_sending(sk).expect("close");
    pair.collect();
    assert_eq!(pair.server.state(sk), Ok(StreamState::LastAck));
    assert_rejects_bogus_ack(&mut pair.server, SERVER_CONN, sk);

    pair.step_down(); // FIN
    assert_eq!(pair.client.state(ck), Ok(StreamState::TimeWait));
    assert_rejects_bogus_ack(&mut pair.client, CLIENT_CONN, ck);

    pair.step_up(); // ACK of FIN
    assert_eq!(pair.server.state(sk), Err(StreamError::StaleStream));
    assert_eq!(pair.server.metrics().closed, 1);
    assert!(pair.server.is_empty());
}

/// Both sides send FIN before seeing the other's: each passes through
/// `CLOSING` and lingers in `TIME-WAIT`.
#[tokio::test(start_paused = true)]
async fn simultaneous_close_goes_through_closing() {
    let mut pair = Pair::new();
    let ck = pair
        .client
        .open(CLIENT_CONN, OpenRequest::new(ECHO))
        .expect("open");
    pair.step_up();
    pair.step_down();
    pair.step_up();
    let sk = pair.server_key(ck);

    pair.client.close_sending(ck).expect("client close");
    pair.server.close_sending(sk).expect("server close");
    pair.collect();
    assert_eq!(pair.client.state(ck), Ok(StreamState::FinWait1));
    assert_eq!(pair.server.state(sk), Ok(StreamState::FinWait1));

    pair.step_up(); // client FIN
    assert_eq!(pair.server.state(sk), Ok(StreamState::Closing));
    pair.step_down(); // server FIN
    assert_eq!(pair.client.state(ck), Ok(StreamState::Closing));

    pair.step_down(); // server's ACK of the client FIN
    assert_eq!(pair.client.state(ck), Ok(StreamState::TimeWait));
    pair.step_up(); // client's ACK of the server FIN
    assert_eq!(pair.server.state(sk), Ok(StreamState::TimeWait));

    let time_wait = pair.client.config().time_wait();
    pair.linger(time_wait / 2).await;
    assert_eq!(pair.client.state(ck), Ok(StreamState::TimeWait));

    pair.linger(time_wait).await;
    assert_eq!(pair.client.state(ck), Err(StreamError::StaleStream));
    assert_eq!(pair.server.state(sk), Err(StreamError::StaleStream));
    assert_eq!(pair.client.metrics().closed, 1);
    assert_eq!(pair.server.metrics().closed, 1);
    assert_eq!(pair.client.pending_timers(), 0);
    assert_eq!(pair.server.pending_timers(), 0);
}

/// A FIN retransmitted into `TIME-WAIT` is acknowledged again.
#[tokio::test]
async fn time_wait_reacknowledges_a_repeated_fin() {
    let mut pair = Pair::new();
    let ck = pair
        .client
        .open(CLIENT_CONN, OpenRequest::new(ECHO))
        .expect("open");
    pair.step_up();
    pair.step_down();
    pair.step_up();
    let sk = pair.server_key(ck);

    pair.client.close_sending(ck).expect("close");
    pair.step_up(); // FIN
    pair.step_down(); // ACK
    pair.server.close_sending(sk).expect("close");
    pair.collect();
    let fin = pair.down[0].segment.encode().expect("encode");
    pair.step_down();
    pair.up.clear();
    assert_eq!(pair.client.state(ck), Ok(StreamState::TimeWait));

    pair.client.receive(CLIENT_CONN, &fin).expect("repeated FIN");
    let replies = pair.client.drain_transmits();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].segment.header.is(flags::ACK));
    assert_eq!(pair.client.state(ck), Ok(StreamState::TimeWait));
}
