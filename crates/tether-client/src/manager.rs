//! Connection driver.
//!
//! One task owns every piece of mutable connection state and reacts to:
//! - client commands (connect, disconnect, reconnect, outbound envelopes)
//! - adapter events, tagged with the generation that produced them
//! - handshake completions and heartbeat signals from helper tasks
//! - the backoff deadline
//! - credential changes from the [`AuthProvider`]
//!
//! Anything carrying a generation other than the current one is discarded.

use std::future;
use std::mem;
use std::sync::Arc;

use tether_core::{
    AuthProvider, ClientError, ConnectionState, ConnectionStatus, Credentials, Envelope,
    EventType, Generation, TransportError, TransportKind,
};
use tether_settings::ClientSettings;
use tether_transport::{
    AdapterEvent, AdapterEventKind, AdapterSink, CloseInfo, TransportAdapter, TransportFactory,
    close_codes,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatResult, run_heartbeat};
use crate::rooms::RoomRegistry;

/// Callback for [`ClientError`]s.
pub type ErrorHook = Arc<dyn Fn(&ClientError) + Send + Sync>;
/// Callback for status transitions.
pub type StatusHook = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

/// Application callbacks invoked on the driver task. They must not block.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_diagnostic: Option<ErrorHook>,
    pub(crate) on_state_change: Option<StatusHook>,
}

/// Requests from client handles.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Send(Envelope),
}

/// Completions from helper tasks.
enum Signal {
    Handshake {
        generation: Generation,
        kind: TransportKind,
        result: Result<(), TransportError>,
        adapter: Box<dyn TransportAdapter>,
    },
    HeartbeatPing {
        generation: Generation,
    },
    HeartbeatExpired {
        generation: Generation,
    },
}

struct ActiveHeartbeat {
    monitor: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
}

/// Everything the driver needs from the client at spawn time.
pub(crate) struct DriverParts {
    pub(crate) settings: Arc<ClientSettings>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) rooms: Arc<RoomRegistry>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) status: watch::Sender<ConnectionStatus>,
    pub(crate) hooks: Hooks,
}

/// Spawn the driver. It runs until every command sender is dropped.
pub(crate) fn spawn_driver(
    parts: DriverParts,
    commands: mpsc::UnboundedReceiver<Command>,
) -> JoinHandle<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        settings: parts.settings,
        auth: parts.auth,
        factory: parts.factory,
        rooms: parts.rooms,
        dispatcher: parts.dispatcher,
        status: parts.status,
        hooks: parts.hooks,
        state: ConnectionState::Disconnected,
        generation: Generation::ZERO,
        attempt: 0,
        cascade_index: 0,
        resume_index: 0,
        kind: None,
        adapter: None,
        handshake: None,
        heartbeat: None,
        backoff_until: None,
        early: Vec::new(),
        protocol_errors: 0,
        events_tx,
        signals_tx,
    };
    tokio::spawn(driver.run(Inbox {
        commands,
        events: events_rx,
        signals: signals_rx,
    }))
}

struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<AdapterEvent>,
    signals: mpsc::UnboundedReceiver<Signal>,
}

struct Driver {
    settings: Arc<ClientSettings>,
    auth: Arc<dyn AuthProvider>,
    factory: Arc<dyn TransportFactory>,
    rooms: Arc<RoomRegistry>,
    dispatcher: Dispatcher,
    status: watch::Sender<ConnectionStatus>,
    hooks: Hooks,

    state: ConnectionState,
    generation: Generation,
    /// Backoff rounds since the last `Connected`.
    attempt: u32,
    /// Position in `transports_order` of the current attempt.
    cascade_index: usize,
    /// Where the next cycle starts.
    resume_index: usize,
    kind: Option<TransportKind>,
    adapter: Option<Box<dyn TransportAdapter>>,
    handshake: Option<JoinHandle<()>>,
    heartbeat: Option<ActiveHeartbeat>,
    backoff_until: Option<Instant>,
    /// Events of the current generation that beat the handshake signal.
    early: Vec<AdapterEventKind>,
    protocol_errors: u32,

    events_tx: AdapterSink,
    signals_tx: mpsc::UnboundedSender<Signal>,
}

impl Driver {
    async fn run(mut self, mut inbox: Inbox) {
        let mut auth_feed = self.auth.subscribe();
        debug!("connection driver started");

        loop {
            let backoff_until = self.backoff_until;
            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = inbox.events.recv() => self.handle_adapter_event(event),
                Some(signal) = inbox.signals.recv() => self.handle_signal(signal),
                () = backoff_elapsed(backoff_until) => self.on_backoff_elapsed(),
                change = credentials_changed(&mut auth_feed) => match change {
                    Some(logged_in) => self.on_credentials_changed(logged_in),
                    None => {
                        debug!("credential feed closed");
                        auth_feed = None;
                    }
                },
            }
        }

        self.teardown(close_codes::GOING_AWAY, "client dropped");
        debug!("connection driver stopped");
    }

    // ── commands ────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect("client disconnect"),
            Command::Reconnect => self.reconnect(),
            Command::Send(envelope) => self.send(&envelope),
        }
    }

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                self.attempt = 0;
                self.resume_index = 0;
                self.begin_attempt(0);
            }
            ConnectionState::Error => {
                info!("connect ignored in error state, use reconnect");
            }
            state => debug!(%state, "connect ignored, already active"),
        }
    }

    fn disconnect(&mut self, reason: &str) {
        self.teardown(close_codes::NORMAL, reason);
        self.attempt = 0;
        if self.state == ConnectionState::Disconnected {
            debug!("already disconnected");
            return;
        }
        info!(reason, generation = %self.generation, "disconnecting");
        let _ = self.transition(ConnectionState::Disconnected);
    }

    fn reconnect(&mut self) {
        info!(state = %self.state, "manual reconnect");
        self.teardown(close_codes::NORMAL, "manual reconnect");
        if self.state != ConnectionState::Disconnected {
            let _ = self.transition(ConnectionState::Disconnected);
        }
        self.attempt = 0;
        self.resume_index = 0;
        self.begin_attempt(0);
    }

    fn send(&mut self, envelope: &Envelope) {
        match (&self.adapter, self.state) {
            (Some(adapter), ConnectionState::Connected) => adapter.send(envelope),
            // Room changes are replayed from the registry on the next connect.
            _ if envelope.event_type.is_control() => debug!(
                event_type = %envelope.event_type,
                state = %self.state,
                "not connected, deferring room change"
            ),
            _ => warn!(
                event_type = %envelope.event_type,
                state = %self.state,
                "not connected, dropping outbound envelope"
            ),
        }
    }

    fn on_credentials_changed(&mut self, logged_in: bool) {
        if logged_in {
            debug!("credentials updated, used from the next attempt");
        } else if self.state != ConnectionState::Disconnected {
            info!("credentials cleared, disconnecting");
            self.disconnect("credentials cleared");
        }
    }

    // ── cascade ─────────────────────────────────────────────────────

    /// Enter `Connecting` on the kind at `index` of the cascade.
    fn begin_attempt(&mut self, index: usize) {
        let Some(credentials) = self.auth.credentials() else {
            info!("no credentials available, staying disconnected");
            if self.state != ConnectionState::Disconnected {
                let _ = self.transition(ConnectionState::Disconnected);
            }
            return;
        };
        let Some(&kind) = self.settings.transports_order.get(index) else {
            error!(index, "cascade index outside the transport order");
            return;
        };

        self.cascade_index = index;
        self.generation = self.generation.next();
        self.kind = Some(kind);
        self.protocol_errors = 0;
        self.early.clear();
        if !self.transition(ConnectionState::Connecting) {
            return;
        }
        info!(
            transport = %kind,
            generation = %self.generation,
            attempt = self.attempt,
            "connecting"
        );

        let adapter = self
            .factory
            .create(kind, self.generation, self.events_tx.clone());
        self.handshake = Some(spawn_handshake(
            adapter,
            credentials,
            self.generation,
            self.settings.connect_timeout(),
            self.signals_tx.clone(),
        ));
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Handshake {
                generation,
                kind,
                result,
                mut adapter,
            } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    debug!(
                        %generation,
                        current = %self.generation,
                        state = %self.state,
                        "discarding stale handshake"
                    );
                    adapter.close(close_codes::NORMAL, "stale handshake");
                    return;
                }
                self.handshake = None;
                match result {
                    Ok(()) => self.on_connected(kind, adapter),
                    Err(error) => {
                        drop(adapter);
                        self.early.clear();
                        self.attempt_failed(kind, error);
                    }
                }
            }
            Signal::HeartbeatPing { generation } => {
                if generation == self.generation && self.state == ConnectionState::Connected {
                    if let Some(adapter) = &self.adapter {
                        adapter.send(&Envelope::ping());
                    }
                }
            }
            Signal::HeartbeatExpired { generation } => {
                if generation == self.generation && self.state == ConnectionState::Connected {
                    let timeout_ms = self.settings.heartbeat_timeout_ms;
                    self.connection_lost(
                        TransportError::timeout(format!("no pong within {timeout_ms}ms")),
                        0,
                    );
                }
            }
        }
    }

    fn attempt_failed(&mut self, kind: TransportKind, error: TransportError) {
        if error.is_auth() {
            warn!(transport = %kind, error = %error, "credentials rejected");
            self.fail(ClientError::Auth(error));
            return;
        }
        warn!(
            transport = %kind,
            generation = %self.generation,
            error = %error,
            "transport attempt failed"
        );
        self.report_diagnostic(ClientError::Transport(error.clone()));

        let next = self.cascade_index + 1;
        if next < self.settings.transports_order.len() {
            self.begin_attempt(next);
        } else {
            self.resume_index = 0;
            self.cycle_failed(error);
        }
    }

    /// Every kind of the cycle failed, or a live connection was lost.
    fn cycle_failed(&mut self, last: TransportError) {
        let policy = &self.settings.reconnect;
        if policy.is_exhausted(self.attempt) {
            let attempts = self.attempt;
            error!(attempts, last = %last, "reconnect attempts exhausted");
            self.fail(ClientError::Fatal { attempts, last });
            return;
        }
        let delay = policy.delay(self.attempt);
        self.attempt += 1;
        self.backoff_until = Some(Instant::now() + delay);
        if self.transition(ConnectionState::Backoff) {
            info!(
                attempt = self.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "backing off before reconnecting"
            );
        } else {
            self.backoff_until = None;
        }
    }

    fn on_backoff_elapsed(&mut self) {
        self.backoff_until = None;
        if self.state == ConnectionState::Backoff {
            self.begin_attempt(self.resume_index);
        }
    }

    /// Terminal failure: stop until `reconnect()`.
    fn fail(&mut self, error: ClientError) {
        self.teardown(close_codes::NORMAL, "giving up");
        let _ = self.transition(ConnectionState::Error);
        error!(error = %error, "connection stopped");
        if let Some(hook) = &self.hooks.on_error {
            hook(&error);
        }
    }

    fn report_diagnostic(&self, error: ClientError) {
        if let Some(hook) = &self.hooks.on_diagnostic {
            hook(&error);
        }
    }

    // ── connected ───────────────────────────────────────────────────

    fn on_connected(&mut self, kind: TransportKind, adapter: Box<dyn TransportAdapter>) {
        self.adapter = Some(adapter);
        self.attempt = 0;
        if !self.transition(ConnectionState::Connected) {
            self.teardown(close_codes::NORMAL, "unexpected handshake");
            return;
        }
        let generation = self.generation;
        info!(transport = %kind, %generation, "connected");

        let rooms = self.rooms.snapshot();
        if let Some(adapter) = &self.adapter {
            for room in &rooms {
                adapter.send(&Envelope::join_room(room.as_str()));
            }
        }
        if !rooms.is_empty() {
            debug!(count = rooms.len(), "rooms replayed");
        }

        for event in mem::take(&mut self.early) {
            if self.state != ConnectionState::Connected || self.generation != generation {
                break;
            }
            self.process_event(event);
        }

        if kind.has_heartbeat()
            && self.state == ConnectionState::Connected
            && self.generation == generation
        {
            self.start_heartbeat();
        }
    }

    fn start_heartbeat(&mut self) {
        let monitor = Arc::new(HeartbeatMonitor::new(
            self.settings.heartbeat_interval(),
            self.settings.heartbeat_timeout(),
        ));
        let cancel = CancellationToken::new();
        let generation = self.generation;
        let signals = self.signals_tx.clone();
        let task_monitor = Arc::clone(&monitor);
        let task_cancel = cancel.clone();
        debug!(
            %generation,
            interval_ms = u64::try_from(monitor.interval().as_millis()).unwrap_or(u64::MAX),
            timeout_ms = u64::try_from(monitor.timeout().as_millis()).unwrap_or(u64::MAX),
            "heartbeat started"
        );

        drop(tokio::spawn(async move {
            let pings = signals.clone();
            let result = run_heartbeat(
                &task_monitor,
                move || {
                    let _ = pings.send(Signal::HeartbeatPing { generation });
                },
                task_cancel,
            )
            .await;
            if result == HeartbeatResult::TimedOut {
                let _ = signals.send(Signal::HeartbeatExpired { generation });
            }
        }));
        self.heartbeat = Some(ActiveHeartbeat { monitor, cancel });
    }

    fn handle_adapter_event(&mut self, event: AdapterEvent) {
        if event.generation != self.generation {
            debug!(
                generation = %event.generation,
                current = %self.generation,
                "discarding event from stale generation"
            );
            return;
        }
        match self.state {
            ConnectionState::Connecting if self.handshake.is_some() => self.early.push(event.kind),
            ConnectionState::Connected => self.process_event(event.kind),
            state => debug!(%state, "discarding adapter event while not connected"),
        }
    }

    fn process_event(&mut self, event: AdapterEventKind) {
        match event {
            AdapterEventKind::Message(envelope) => {
                self.protocol_errors = 0;
                self.on_message(envelope);
            }
            AdapterEventKind::ProtocolError(detail) => {
                self.protocol_errors += 1;
                let max = self.settings.max_protocol_errors;
                warn!(
                    generation = %self.generation,
                    detail = %detail,
                    count = self.protocol_errors,
                    max,
                    "protocol error"
                );
                if self.protocol_errors >= max {
                    let order = self.settings.transports_order.len().max(1);
                    let resume = (self.cascade_index + 1) % order;
                    self.connection_lost(
                        TransportError::protocol(format!("{max} consecutive protocol errors")),
                        resume,
                    );
                }
            }
            AdapterEventKind::Closed(info) => self.on_closed(&info),
        }
    }

    fn on_closed(&mut self, info: &CloseInfo) {
        if info.is_auth() {
            warn!(generation = %self.generation, %info, "server closed the connection for credentials");
            let reason = if info.reason.is_empty() {
                info.to_string()
            } else {
                info.reason.clone()
            };
            self.fail(ClientError::Auth(TransportError::rejected(true, reason)));
            return;
        }
        self.connection_lost(
            TransportError::network(format!("connection closed with {info}")),
            0,
        );
    }

    fn on_message(&mut self, envelope: Envelope) {
        match &envelope.event_type {
            EventType::Pong => {
                if let Some(heartbeat) = &self.heartbeat {
                    heartbeat.monitor.record_pong();
                }
                return;
            }
            EventType::Ping => {
                if let Some(adapter) = &self.adapter {
                    adapter.send(&Envelope::pong());
                }
                return;
            }
            EventType::RoomJoined => {
                if let Some(room) = &envelope.room {
                    self.rooms.mark_acknowledged(room);
                }
            }
            EventType::RoomLeft => {
                if let Some(room) = &envelope.room {
                    self.rooms.mark_released(room);
                }
            }
            _ => {}
        }
        let _ = self.dispatcher.dispatch(envelope);
    }

    /// A live connection ended without being asked to.
    fn connection_lost(&mut self, error: TransportError, resume_index: usize) {
        warn!(
            transport = self.kind.map(TransportKind::as_str),
            generation = %self.generation,
            error = %error,
            "connection lost"
        );
        self.teardown(close_codes::GOING_AWAY, "connection lost");
        self.report_diagnostic(ClientError::Transport(error.clone()));
        self.resume_index = resume_index;
        self.cycle_failed(error);
    }

    // ── plumbing ────────────────────────────────────────────────────

    /// Stop every per-generation resource.
    fn teardown(&mut self, code: u16, reason: &str) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel.cancel();
        }
        if let Some(mut adapter) = self.adapter.take() {
            adapter.close(code, reason);
        }
        self.backoff_until = None;
        self.early.clear();
        self.protocol_errors = 0;
        self.rooms.clear_acknowledged();
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "illegal state transition ignored");
            return false;
        }
        debug!(from = %self.state, to = %next, generation = %self.generation, "state transition");
        self.state = next;
        let status = ConnectionStatus {
            state: next,
            transport: self.kind,
            attempt: self.attempt,
            generation: self.generation,
        };
        if let Some(hook) = &self.hooks.on_state_change {
            hook(&status);
        }
        let _ = self.status.send_replace(status);
        true
    }
}

fn spawn_handshake(
    mut adapter: Box<dyn TransportAdapter>,
    credentials: Credentials,
    generation: Generation,
    timeout: std::time::Duration,
    signals: mpsc::UnboundedSender<Signal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let kind = adapter.kind();
        let result = match time::timeout(timeout, adapter.connect(&credentials)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "{kind} handshake exceeded {}ms",
                timeout.as_millis()
            ))),
        };
        let _ = signals.send(Signal::Handshake {
            generation,
            kind,
            result,
            adapter,
        });
    })
}

async fn backoff_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Next credential change: `Some(logged_in)`, or `None` once the feed closes.
async fn credentials_changed(
    feed: &mut Option<watch::Receiver<Option<Credentials>>>,
) -> Option<bool> {
    match feed {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().is_some()),
            Err(_) => None,
        },
        None => future::pending().await,
    }
}
