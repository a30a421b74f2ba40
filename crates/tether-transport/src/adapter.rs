//! The adapter seam between transports and the connection manager.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{Credentials, Envelope, Generation, TransportError, TransportKind};
use tether_settings::ClientSettings;
use tokio::sync::mpsc;

use crate::multiplexed::MultiplexedSocketTransport;
use crate::polling::PollingTransport;
use crate::raw_socket::RawSocketTransport;

/// WebSocket close codes the client produces or interprets.
pub mod close_codes {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Peer violated the protocol.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status code was present in the close frame.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Policy violation; servers use it for missing or bad auth.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Application-range "unauthorized".
    pub const UNAUTHORIZED: u16 = 4401;
    /// Application-range "forbidden".
    pub const FORBIDDEN: u16 = 4403;
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// How a live connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket-style close code (synthesised for HTTP transports).
    pub code: u16,
    /// Reason text, possibly empty.
    pub reason: String,
    /// Anything other than a clean `1000` close.
    pub abnormal: bool,
}

impl CloseInfo {
    /// Build a close, deriving `abnormal` from the code.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            abnormal: code != close_codes::NORMAL,
        }
    }

    /// The connection dropped without a close handshake.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(close_codes::ABNORMAL, reason)
    }

    /// The server closed because of credentials.
    pub fn is_auth(&self) -> bool {
        matches!(
            self.code,
            close_codes::POLICY_VIOLATION | close_codes::UNAUTHORIZED | close_codes::FORBIDDEN
        )
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {} ({})", self.code, self.reason)
        }
    }
}

/// What an adapter reports after a successful handshake.
#[derive(Clone, Debug, PartialEq)]
pub enum AdapterEventKind {
    /// A decoded inbound envelope.
    Message(Envelope),
    /// An inbound frame that could not be decoded.
    ProtocolError(String),
    /// The connection ended. Not emitted for closes the manager requested.
    Closed(CloseInfo),
}

/// An adapter event tagged with the producing adapter's generation.
#[derive(Clone, Debug, PartialEq)]
pub struct AdapterEvent {
    /// Generation of the adapter that produced the event.
    pub generation: Generation,
    /// The event itself.
    pub kind: AdapterEventKind,
}

/// Channel adapters push their events into.
pub type AdapterSink = mpsc::UnboundedSender<AdapterEvent>;

/// Generation-stamping wrapper around an [`AdapterSink`].
#[derive(Clone, Debug)]
pub struct EventEmitter {
    generation: Generation,
    sink: AdapterSink,
}

impl EventEmitter {
    /// Stamp every event with `generation`.
    pub fn new(generation: Generation, sink: AdapterSink) -> Self {
        Self { generation, sink }
    }

    /// Generation this emitter stamps.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    fn emit(&self, kind: AdapterEventKind) {
        // The manager may already be gone; nothing to report to then.
        let _ = self.sink.send(AdapterEvent {
            generation: self.generation,
            kind,
        });
    }

    /// Forward an inbound envelope.
    pub fn message(&self, envelope: Envelope) {
        self.emit(AdapterEventKind::Message(envelope));
    }

    /// Report an undecodable frame.
    pub fn protocol_error(&self, detail: impl Into<String>) {
        self.emit(AdapterEventKind::ProtocolError(detail.into()));
    }

    /// Report the end of the connection.
    pub fn closed(&self, info: CloseInfo) {
        self.emit(AdapterEventKind::Closed(info));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter + factory
// ─────────────────────────────────────────────────────────────────────────────

/// One connection attempt over one transport kind.
///
/// Adapters are single-use: created per attempt, connected at most once,
/// closed when the manager moves on. Dropping an adapter closes it.
#[async_trait]
pub trait TransportAdapter: Send {
    /// Transport family.
    fn kind(&self) -> TransportKind;

    /// Generation stamped at creation.
    fn generation(&self) -> Generation;

    /// Perform the handshake. `Ok` means the server acknowledged the
    /// session; events only flow after that.
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), TransportError>;

    /// Queue an envelope for delivery. Fire-and-forget.
    fn send(&self, envelope: &Envelope);

    /// Close the connection. Idempotent. Emits no `Closed` event.
    fn close(&mut self, code: u16, reason: &str);
}

/// Builds adapters on demand.
pub trait TransportFactory: Send + Sync {
    /// Create a fresh, unconnected adapter.
    fn create(
        &self,
        kind: TransportKind,
        generation: Generation,
        sink: AdapterSink,
    ) -> Box<dyn TransportAdapter>;
}

/// Factory for the real network adapters.
pub struct DefaultTransportFactory {
    settings: Arc<ClientSettings>,
    http: reqwest::Client,
}

impl DefaultTransportFactory {
    /// Build adapters against `settings`, sharing one HTTP connection pool.
    pub fn new(settings: Arc<ClientSettings>) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        generation: Generation,
        sink: AdapterSink,
    ) -> Box<dyn TransportAdapter> {
        let events = EventEmitter::new(generation, sink);
        match kind {
            TransportKind::RawSocket => {
                Box::new(RawSocketTransport::new(Arc::clone(&self.settings), events))
            }
            TransportKind::MultiplexedSocket => Box::new(MultiplexedSocketTransport::new(
                Arc::clone(&self.settings),
                self.http.clone(),
                events,
            )),
            TransportKind::Polling => Box::new(PollingTransport::new(
                Arc::clone(&self.settings),
                self.http.clone(),
                events,
            )),
        }
    }
}
