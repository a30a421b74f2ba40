//! Error types.
//!
//! [`TransportError`] is what an adapter reports when a handshake or a live
//! connection fails. [`ClientError`] is what the client surfaces to the
//! application through its error callback: only auth rejection and
//! exhausted reconnects are terminal.

use std::fmt;

use thiserror::Error;

/// Classification of a transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The handshake did not complete within the connect timeout.
    Timeout,
    /// The server refused the handshake.
    HandshakeRejected {
        /// The refusal was about credentials (401/403, auth close codes).
        auth: bool,
    },
    /// Socket or HTTP level failure.
    NetworkError,
    /// The peer sent something the adapter could not interpret.
    ProtocolError,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::HandshakeRejected { auth: true } => f.write_str("auth rejected"),
            Self::HandshakeRejected { auth: false } => f.write_str("handshake rejected"),
            Self::NetworkError => f.write_str("network"),
            Self::ProtocolError => f.write_str("protocol"),
        }
    }
}

/// A failure reported by a transport adapter.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    /// What went wrong.
    pub kind: TransportErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl TransportError {
    /// Build an error of the given kind.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Handshake deadline exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Server refused the handshake.
    pub fn rejected(auth: bool, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::HandshakeRejected { auth }, message)
    }

    /// Socket or HTTP failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NetworkError, message)
    }

    /// Undecodable traffic.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ProtocolError, message)
    }

    /// Whether the failure was a credential rejection.
    pub fn is_auth(&self) -> bool {
        matches!(self.kind, TransportErrorKind::HandshakeRejected { auth: true })
    }

    /// Whether retrying (on this or another transport) can help.
    pub fn is_retryable(&self) -> bool {
        !self.is_auth()
    }
}

/// Errors surfaced to the application.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The server rejected the credentials. Terminal until `reconnect()`.
    #[error("authentication rejected: {0}")]
    Auth(TransportError),

    /// Every reconnect attempt failed. Terminal until `reconnect()`.
    #[error("giving up after {attempts} reconnect attempts: {last}")]
    Fatal {
        /// Number of backoff rounds that were spent.
        attempts: u32,
        /// The failure that ended the last round.
        last: TransportError,
    },

    /// A non-terminal transport failure.
    #[error("transport failure: {0}")]
    Transport(TransportError),
}

impl ClientError {
    /// Whether the client stopped reconnecting because of this error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Fatal { .. })
    }

    /// The underlying transport failure.
    pub fn transport_error(&self) -> &TransportError {
        match self {
            Self::Auth(error) | Self::Transport(error) | Self::Fatal { last: error, .. } => error,
        }
    }
}
