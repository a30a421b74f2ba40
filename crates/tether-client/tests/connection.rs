//! Connection manager behaviour against scripted transports, on a paused
//! clock so backoff and heartbeat timings are exact.

use std::collections::{HashMap, VecDeque};
use std::future;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, json};
use tether_client::{ClientBuilder, RealtimeClient};
use tether_core::{
    ClientError, ConnectionState, ConnectionStatus, CredentialStore, Credentials, Envelope,
    EventType, Generation, TransportError, TransportErrorKind, TransportKind,
};
use tether_settings::ClientSettings;
use tether_transport::{
    AdapterSink, CloseInfo, EventEmitter, TransportAdapter, TransportFactory,
};
use tokio::time::Instant;

const LONG: Duration = Duration::from_secs(3_600);

// ── Scripted transports ──

#[derive(Clone, Debug)]
enum Step {
    Accept,
    /// Emit these envelopes from inside the handshake, then accept.
    AcceptWith(Vec<Envelope>),
    Fail(TransportError),
    Hang,
}

/// What the test can see of one created adapter.
#[derive(Clone)]
struct Probe {
    kind: TransportKind,
    generation: Generation,
    created_at: Instant,
    events: EventEmitter,
    sent: Arc<Mutex<Vec<Envelope>>>,
    closed: Arc<Mutex<Option<u16>>>,
}

impl Probe {
    fn sent_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|e| match &e.room {
                Some(room) => format!("{}:{room}", e.event_type),
                None => e.event_type.to_string(),
            })
            .collect()
    }

    fn closed_with(&self) -> Option<u16> {
        *self.closed.lock()
    }
}

#[derive(Default)]
struct Script {
    plans: Mutex<HashMap<TransportKind, VecDeque<Step>>>,
    fallback: Mutex<HashMap<TransportKind, Step>>,
    auto_pong: Mutex<bool>,
    created: Mutex<Vec<Probe>>,
}

struct ScriptedFactory(Arc<Script>);

impl TransportFactory for ScriptedFactory {
    fn create(
        &self,
        kind: TransportKind,
        generation: Generation,
        sink: AdapterSink,
    ) -> Box<dyn TransportAdapter> {
        let step = self
            .0
            .plans
            .lock()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.0.fallback.lock().get(&kind).cloned())
            .unwrap_or_else(|| Step::Fail(TransportError::network("unreachable")));
        let probe = Probe {
            kind,
            generation,
            created_at: Instant::now(),
            events: EventEmitter::new(generation, sink),
            sent: Arc::default(),
            closed: Arc::default(),
        };
        self.0.created.lock().push(probe.clone());
        Box::new(ScriptedAdapter {
            step,
            auto_pong: *self.0.auto_pong.lock(),
            probe,
        })
    }
}

struct ScriptedAdapter {
    step: Step,
    auto_pong: bool,
    probe: Probe,
}

#[async_trait]
impl TransportAdapter for ScriptedAdapter {
    fn kind(&self) -> TransportKind {
        self.probe.kind
    }

    fn generation(&self) -> Generation {
        self.probe.generation
    }

    async fn connect(&mut self, _credentials: &Credentials) -> Result<(), TransportError> {
        match self.step.clone() {
            Step::Accept => Ok(()),
            Step::AcceptWith(envelopes) => {
                for envelope in envelopes {
                    self.probe.events.message(envelope);
                }
                Ok(())
            }
            Step::Fail(error) => Err(error),
            Step::Hang => future::pending().await,
        }
    }

    fn send(&self, envelope: &Envelope) {
        self.probe.sent.lock().push(envelope.clone());
        if self.auto_pong && envelope.event_type == EventType::Ping {
            self.probe.events.message(Envelope::pong());
        }
    }

    fn close(&mut self, code: u16, _reason: &str) {
        let mut closed = self.probe.closed.lock();
        if closed.is_none() {
            *closed = Some(code);
        }
    }
}

impl Drop for ScriptedAdapter {
    fn drop(&mut self) {
        self.close(1001, "dropped");
    }
}

// ── Harness ──

struct Harness {
    client: RealtimeClient,
    script: Arc<Script>,
    store: Arc<CredentialStore>,
    transitions: Arc<Mutex<Vec<ConnectionState>>>,
    errors: Arc<Mutex<Vec<ClientError>>>,
    diagnostics: Arc<Mutex<Vec<ClientError>>>,
}

fn settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    settings.reconnect.jitter_fraction = 0.0;
    settings
}

fn harness_with(settings: ClientSettings, credentials: Option<Credentials>) -> Harness {
    let script = Arc::new(Script::default());
    let store = Arc::new(CredentialStore::new(credentials));
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let diagnostics = Arc::new(Mutex::new(Vec::new()));

    let client = ClientBuilder::new(settings, store.clone())
        .transport_factory(Arc::new(ScriptedFactory(Arc::clone(&script))))
        .on_state_change({
            let transitions = Arc::clone(&transitions);
            move |status: &ConnectionStatus| transitions.lock().push(status.state)
        })
        .on_error({
            let errors = Arc::clone(&errors);
            move |error: &ClientError| errors.lock().push(error.clone())
        })
        .on_diagnostic({
            let diagnostics = Arc::clone(&diagnostics);
            move |error: &ClientError| diagnostics.lock().push(error.clone())
        })
        .build()
        .unwrap();

    Harness {
        client,
        script,
        store,
        transitions,
        errors,
        diagnostics,
    }
}

fn harness() -> Harness {
    harness_with(settings(), Some(Credentials::new("user-1", 1, "token-1")))
}

impl Harness {
    fn plan(&self, kind: TransportKind, steps: impl IntoIterator<Item = Step>) {
        self.script
            .plans
            .lock()
            .entry(kind)
            .or_default()
            .extend(steps);
    }

    fn fail_everything(&self) {
        let mut fallback = self.script.fallback.lock();
        for kind in TransportKind::CASCADE {
            let _ = fallback.insert(kind, Step::Fail(TransportError::network("refused")));
        }
    }

    fn auto_pong(&self) {
        *self.script.auto_pong.lock() = true;
    }

    fn probes(&self) -> Vec<Probe> {
        self.script.created.lock().clone()
    }

    fn probe(&self, index: usize) -> Probe {
        self.probes()[index].clone()
    }

    fn attempts(&self) -> Vec<TransportKind> {
        self.probes().iter().map(|p| p.kind).collect()
    }

    fn transitions(&self) -> Vec<ConnectionState> {
        self.transitions.lock().clone()
    }

    async fn wait_for(&self, state: ConnectionState) -> ConnectionStatus {
        let mut rx = self.client.subscribe_state();
        let reached = tokio::time::timeout(LONG, rx.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| panic!("never reached {state}"))
            .unwrap()
            .clone();
        drop(rx);
        reached
    }
}

/// Let spawned tasks run without moving the clock.
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

fn chat(text: &str) -> Envelope {
    Envelope::new(EventType::ChatMessage).with_field("text", text)
}

fn counter(client: &RealtimeClient, event_type: EventType) -> Arc<Mutex<Vec<Envelope>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _handle = client.on(event_type, move |env| {
        sink.lock().push(env.clone());
        Ok(())
    });
    seen
}

// ── Connect & cascade ──

#[tokio::test(start_paused = true)]
async fn connects_on_first_transport_and_replays_rooms() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    h.client.join_room("order_1");
    h.client.join_room("order_2");
    h.client.connect();

    let status = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(status.transport, Some(TransportKind::RawSocket));
    assert_eq!(status.attempt, 0);
    assert_eq!(status.generation, Generation::new(1));
    settle().await;

    assert_eq!(
        h.probe(0).sent_types(),
        vec!["join_room:order_1", "join_room:order_2"]
    );
    assert_eq!(
        h.transitions(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn cascade_falls_through_to_polling() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Fail(TransportError::network("blocked"))]);
    h.plan(
        TransportKind::MultiplexedSocket,
        [Step::Fail(TransportError::rejected(false, "HTTP 502"))],
    );
    h.plan(TransportKind::Polling, [Step::Accept]);
    h.client.connect();

    let status = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(status.transport, Some(TransportKind::Polling));
    assert_eq!(status.attempt, 0);
    assert_eq!(
        h.attempts(),
        vec![
            TransportKind::RawSocket,
            TransportKind::MultiplexedSocket,
            TransportKind::Polling
        ]
    );
    assert_eq!(
        h.transitions(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connecting,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
    assert_eq!(h.diagnostics.lock().len(), 2);
    assert!(h.errors.lock().is_empty());

    // Polling has no heartbeat.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.probe(2).sent_types().is_empty());
    assert!(h.client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn handshake_timeout_advances_cascade() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Hang]);
    h.plan(TransportKind::MultiplexedSocket, [Step::Accept]);
    let started = Instant::now();
    h.client.connect();

    let status = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert_eq!(status.transport, Some(TransportKind::MultiplexedSocket));
    assert_matches!(
        h.diagnostics.lock().as_slice(),
        [ClientError::Transport(e)] if e.kind == TransportErrorKind::Timeout
    );
    assert!(h.probe(0).closed_with().is_some());
}

#[tokio::test(start_paused = true)]
async fn custom_transport_order_is_honoured() {
    let mut custom = settings();
    custom.transports_order = vec![TransportKind::Polling, TransportKind::RawSocket];
    let h = harness_with(custom, Some(Credentials::new("u", 2, "t")));
    h.plan(TransportKind::Polling, [Step::Fail(TransportError::network("x"))]);
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    h.client.connect();

    let _ = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(h.attempts(), vec![TransportKind::Polling, TransportKind::RawSocket]);
}

// ── Backoff & terminal states ──

#[tokio::test(start_paused = true)]
async fn backoff_schedule_then_fatal_error() {
    let h = harness();
    h.fail_everything();
    let started = Instant::now();
    h.client.connect();

    let status = h.wait_for(ConnectionState::Error).await;
    assert_eq!(started.elapsed(), Duration::from_secs(31));
    assert_eq!(status.attempt, 5);

    let raw_attempts: Vec<u64> = h
        .probes()
        .iter()
        .filter(|p| p.kind == TransportKind::RawSocket)
        .map(|p| p.created_at.duration_since(started).as_secs())
        .collect();
    assert_eq!(raw_attempts, vec![0, 1, 3, 7, 15, 31]);
    assert_eq!(h.attempts().len(), 18);

    let backoffs = h
        .transitions()
        .iter()
        .filter(|s| **s == ConnectionState::Backoff)
        .count();
    assert_eq!(backoffs, 5);
    assert_matches!(
        h.errors.lock().as_slice(),
        [ClientError::Fatal { attempts: 5, .. }]
    );
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_is_terminal_and_immediate() {
    let h = harness();
    h.plan(
        TransportKind::RawSocket,
        [Step::Fail(TransportError::rejected(true, "bad token"))],
    );
    h.client.connect();

    let status = h.wait_for(ConnectionState::Error).await;
    assert_eq!(status.attempt, 0);
    assert_eq!(h.attempts(), vec![TransportKind::RawSocket]);
    assert_matches!(h.errors.lock().as_slice(), [ClientError::Auth(e)] if e.message == "bad token");

    // Stays put; connect() does not leave Error.
    h.client.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.client.state(), ConnectionState::Error);
    assert_eq!(h.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_leaves_error_through_disconnected() {
    let h = harness();
    h.plan(
        TransportKind::RawSocket,
        [Step::Fail(TransportError::rejected(true, "expired")), Step::Accept],
    );
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Error).await;

    h.client.reconnect();
    let status = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(status.generation, Generation::new(2));
    assert_eq!(
        h.transitions(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Error,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn successful_connection_resets_attempt_counter() {
    let h = harness();
    h.fail_everything();
    h.plan(
        TransportKind::RawSocket,
        [
            Step::Fail(TransportError::network("down")),
            Step::Fail(TransportError::network("down")),
            Step::Accept,
            Step::Accept,
        ],
    );
    h.client.connect();

    let status = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(status.attempt, 0);

    // The next loss starts again from the base delay.
    let lost_at = Instant::now();
    h.probe(h.probes().len() - 1)
        .events
        .closed(CloseInfo::abnormal("reset"));
    let backoff = h.wait_for(ConnectionState::Backoff).await;
    assert_eq!(backoff.attempt, 1);
    let _ = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(lost_at.elapsed(), Duration::from_secs(1));
}

// ── Live connection ──

#[tokio::test(start_paused = true)]
async fn missed_pong_triggers_backoff_and_recovery() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept, Step::Accept]);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;
    let connected_at = Instant::now();

    let _ = h.wait_for(ConnectionState::Backoff).await;
    assert_eq!(connected_at.elapsed(), Duration::from_secs(40));
    let first = h.probe(0);
    assert_eq!(first.sent_types(), vec!["ping"]);
    assert_eq!(first.closed_with(), Some(1001));

    let status = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(connected_at.elapsed(), Duration::from_secs(41));
    assert_eq!(status.generation, Generation::new(2));
}

#[tokio::test(start_paused = true)]
async fn answered_pings_keep_the_connection() {
    let h = harness();
    h.auto_pong();
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    let pongs = counter(&h.client, EventType::Pong);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert!(h.client.is_connected());
    assert_eq!(h.attempts().len(), 1);
    assert_eq!(h.probe(0).sent_types().len(), 6);
    assert!(pongs.lock().is_empty(), "pongs are not dispatched");
}

#[tokio::test(start_paused = true)]
async fn server_ping_is_answered() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    let pings = counter(&h.client, EventType::Ping);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    h.probe(0).events.message(Envelope::ping());
    settle().await;
    assert_eq!(h.probe(0).sent_types(), vec!["pong"]);
    assert!(pings.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn events_before_handshake_completion_are_delivered() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::AcceptWith(vec![chat("early")])]);
    let states = Arc::new(Mutex::new(Vec::new()));
    let _handle = {
        let states = Arc::clone(&states);
        let client = h.client.clone();
        h.client.on(EventType::ChatMessage, move |_| {
            states.lock().push(client.state());
            Ok(())
        })
    };
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;
    settle().await;

    assert_eq!(*states.lock(), vec![ConnectionState::Connected]);
}

#[tokio::test(start_paused = true)]
async fn events_dispatch_in_receipt_order_with_sequence_numbers() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    let seen = counter(&h.client, EventType::ChatMessage);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    let probe = h.probe(0);
    for text in ["a", "b", "c"] {
        probe.events.message(chat(text));
    }
    settle().await;

    let seen = seen.lock();
    let texts: Vec<_> = seen.iter().map(|e| e.field("text").cloned()).collect();
    assert_eq!(texts, vec![Some(json!("a")), Some(json!("b")), Some(json!("c"))]);
    let seqs: Vec<_> = seen.iter().map(|e| e.local_seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn stale_generation_events_are_ignored() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept, Step::Accept]);
    let seen = counter(&h.client, EventType::ChatMessage);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    let old = h.probe(0);
    old.events.closed(CloseInfo::abnormal("reset"));
    let _ = h.wait_for(ConnectionState::Backoff).await;
    let status = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(status.generation, Generation::new(2));

    old.events.message(chat("ghost"));
    old.events.closed(CloseInfo::abnormal("late"));
    settle().await;
    assert!(seen.lock().is_empty());
    assert!(h.client.is_connected());

    h.probe(1).events.message(chat("live"));
    settle().await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn protocol_errors_move_to_next_transport() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    h.plan(TransportKind::MultiplexedSocket, [Step::Accept]);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    let raw = h.probe(0);
    raw.events.protocol_error("garbage 1");
    raw.events.protocol_error("garbage 2");
    raw.events.message(chat("fine"));
    raw.events.protocol_error("garbage 3");
    raw.events.protocol_error("garbage 4");
    settle().await;
    assert!(h.client.is_connected(), "a valid message resets the count");

    raw.events.protocol_error("garbage 5");
    let _ = h.wait_for(ConnectionState::Backoff).await;
    let status = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(status.transport, Some(TransportKind::MultiplexedSocket));
    assert_eq!(
        h.attempts(),
        vec![TransportKind::RawSocket, TransportKind::MultiplexedSocket]
    );
}

#[tokio::test(start_paused = true)]
async fn server_auth_close_is_terminal() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    h.probe(0).events.closed(CloseInfo::new(4401, "token expired"));
    let _ = h.wait_for(ConnectionState::Error).await;
    assert_matches!(h.errors.lock().as_slice(), [ClientError::Auth(e)] if e.message == "token expired");
}

#[tokio::test(start_paused = true)]
async fn server_normal_close_is_a_loss() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept, Step::Accept]);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    h.probe(0).events.closed(CloseInfo::new(1000, "server restart"));
    let _ = h.wait_for(ConnectionState::Backoff).await;
    let _ = h.wait_for(ConnectionState::Connected).await;
    assert_eq!(h.attempts().len(), 2);
}

// ── Rooms & sending ──

#[tokio::test(start_paused = true)]
async fn rooms_replayed_once_per_connection() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept, Step::Accept]);
    h.client.join_room("order_1");
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    h.client.join_room("order_2");
    h.client.leave_room("order_1");
    settle().await;
    assert_eq!(
        h.probe(0).sent_types(),
        vec!["join_room:order_1", "join_room:order_2", "leave_room:order_1"]
    );

    h.probe(0).events.closed(CloseInfo::abnormal("reset"));
    let _ = h.wait_for(ConnectionState::Backoff).await;
    let _ = h.wait_for(ConnectionState::Connected).await;
    settle().await;
    assert_eq!(h.probe(1).sent_types(), vec!["join_room:order_2"]);
}

#[tokio::test(start_paused = true)]
async fn room_acknowledgements_follow_the_connection() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept, Step::Accept]);
    let joined = counter(&h.client, EventType::RoomJoined);
    h.client.join_room("order_1");
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    h.probe(0)
        .events
        .message(Envelope::new(EventType::RoomJoined).with_room("order_1"));
    settle().await;
    assert!(h.client.is_room_acknowledged("order_1"));
    assert_eq!(joined.lock().len(), 1);

    h.probe(0).events.closed(CloseInfo::abnormal("reset"));
    let _ = h.wait_for(ConnectionState::Backoff).await;
    assert!(!h.client.is_room_acknowledged("order_1"));
    assert_eq!(h.client.rooms(), vec!["order_1"]);
}

#[tokio::test(start_paused = true)]
async fn send_only_reaches_a_connected_adapter() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Hang]);
    h.plan(TransportKind::MultiplexedSocket, [Step::Accept]);
    h.client.connect();
    settle().await;
    assert_eq!(h.client.state(), ConnectionState::Connecting);

    h.client.send(EventType::ChatMessage, Map::new(), Some("order_1"));
    let _ = h.wait_for(ConnectionState::Connected).await;
    h.client.send("location_updated", Map::new(), None);
    settle().await;

    assert!(h.probe(0).sent_types().is_empty());
    assert_eq!(h.probe(1).sent_types(), vec!["location_updated"]);
}

// ── Disconnect & credentials ──

#[tokio::test(start_paused = true)]
async fn disconnect_during_handshake_discards_it() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Hang]);
    h.client.connect();
    settle().await;
    assert_eq!(h.client.state(), ConnectionState::Connecting);

    h.client.disconnect();
    let _ = h.wait_for(ConnectionState::Disconnected).await;
    settle().await;
    assert!(h.probe(0).closed_with().is_some());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert_eq!(h.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_backing_off_cancels_the_timer() {
    let h = harness();
    h.fail_everything();
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Backoff).await;

    h.client.disconnect();
    let _ = h.wait_for(ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.attempts().len(), 3);
    assert_eq!(h.client.status().attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn logout_disconnects() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;

    h.store.clear();
    let _ = h.wait_for(ConnectionState::Disconnected).await;
    assert_eq!(h.probe(0).closed_with(), Some(1000));
}

#[tokio::test(start_paused = true)]
async fn connect_without_credentials_stays_disconnected() {
    let h = harness_with(settings(), None);
    h.client.connect();
    settle().await;
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(h.attempts().is_empty());

    h.store.set(Credentials::new("u", 1, "t"));
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_stops_the_driver() {
    let h = harness();
    h.plan(TransportKind::RawSocket, [Step::Accept]);
    h.client.connect();
    let _ = h.wait_for(ConnectionState::Connected).await;
    let probe = h.probe(0);

    drop(h);
    settle().await;
    assert_eq!(probe.closed_with(), Some(1001));
}
