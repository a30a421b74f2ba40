//! Connection state machine vocabulary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::Generation;

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionState
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of the client connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Idle. No adapter, no timers.
    #[default]
    Disconnected,
    /// A handshake is in flight on some transport kind.
    Connecting,
    /// An adapter is live and traffic flows.
    Connected,
    /// Waiting out a reconnect delay.
    Backoff,
    /// Stopped after auth rejection or exhausted attempts.
    Error,
}

impl ConnectionState {
    /// Whether `self → next` is an edge of the state machine.
    ///
    /// `Connecting → Connecting` is the cascade moving to the next
    /// transport kind within one cycle.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected | Self::Backoff, Self::Connecting)
                | (
                    Self::Connecting,
                    Self::Connecting | Self::Connected | Self::Backoff
                )
                | (Self::Connected, Self::Backoff)
                | (Self::Connecting | Self::Connected, Self::Error)
                | (
                    Self::Connecting | Self::Connected | Self::Backoff | Self::Error,
                    Self::Disconnected
                )
        )
    }

    /// Whether traffic can flow.
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TransportKind
// ─────────────────────────────────────────────────────────────────────────────

/// The three transport families, in default cascade order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Plain WebSocket speaking JSON envelopes.
    RawSocket,
    /// Engine.IO / Socket.IO session with long-polling fallback and upgrade.
    MultiplexedSocket,
    /// Periodic HTTP mailbox polling.
    Polling,
}

impl TransportKind {
    /// Default cascade order.
    pub const CASCADE: [Self; 3] = [Self::RawSocket, Self::MultiplexedSocket, Self::Polling];

    /// Socket kinds get an application-level heartbeat. Polling is its own
    /// liveness check.
    pub fn has_heartbeat(self) -> bool {
        !matches!(self, Self::Polling)
    }

    /// Wire/config name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawSocket => "raw_socket",
            Self::MultiplexedSocket => "multiplexed_socket",
            Self::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised transport name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown transport kind: {0}")]
pub struct UnknownTransportKind(pub String);

impl FromStr for TransportKind {
    type Err = UnknownTransportKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw_socket" | "raw" | "websocket" => Ok(Self::RawSocket),
            "multiplexed_socket" | "multiplexed" | "socketio" => Ok(Self::MultiplexedSocket),
            "polling" | "poll" => Ok(Self::Polling),
            _ => Err(UnknownTransportKind(value.to_owned())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot published to state subscribers on every transition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Transport kind being attempted or in use.
    pub transport: Option<TransportKind>,
    /// Backoff rounds spent since the last successful connection.
    pub attempt: u32,
    /// Generation of the most recent adapter.
    pub generation: Generation,
}
