//! Client settings.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::retry::MAX_JITTER_FRACTION;
use tether_core::{ReconnectPolicy, TransportKind};

use crate::errors::{Result, SettingsError};

/// Default backend base URL.
pub const DEFAULT_ENDPOINT_URL: &str = "http://localhost:8000";

/// Everything the client needs besides credentials.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Backend base URL (`http(s)://`). Socket URLs are derived from it.
    pub endpoint_url: String,
    /// Transport kinds tried per cycle, in order.
    pub transports_order: Vec<TransportKind>,
    /// Deadline for a single transport handshake.
    pub connect_timeout_ms: u64,
    /// Backoff between failed cycles.
    pub reconnect: ReconnectPolicy,
    /// Ping cadence on socket transports.
    pub heartbeat_interval_ms: u64,
    /// How long to wait for a pong after each ping.
    pub heartbeat_timeout_ms: u64,
    /// Mailbox poll cadence.
    pub poll_interval_ms: u64,
    /// Per-request timeout for mailbox polls and sends.
    pub poll_request_timeout_ms: u64,
    /// Consecutive failed polls before the polling transport reports a close.
    pub max_poll_failures: u32,
    /// Consecutive undecodable frames before the adapter is torn down.
    pub max_protocol_errors: u32,
    /// Raw socket path.
    pub raw_socket_path: String,
    /// Engine.IO endpoint path.
    pub engine_path: String,
    /// Mailbox poll path.
    pub poll_path: String,
    /// Outbound send path for the polling transport.
    pub send_path: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT_URL.to_string(),
            transports_order: TransportKind::CASCADE.to_vec(),
            connect_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            poll_interval_ms: 5_000,
            poll_request_timeout_ms: 5_000,
            max_poll_failures: 3,
            max_protocol_errors: 3,
            raw_socket_path: "/ws".to_string(),
            engine_path: "/socket.io/".to_string(),
            poll_path: "/notifications/poll".to_string(),
            send_path: "/notifications/send".to_string(),
        }
    }
}

impl ClientSettings {
    /// Handshake deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Ping cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Pong deadline.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Mailbox poll cadence.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-request HTTP timeout for the polling transport.
    pub fn poll_request_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_request_timeout_ms)
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.endpoint_url.trim();
        if endpoint.is_empty() {
            return Err(invalid("endpointUrl must not be empty"));
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(invalid(format!(
                "endpointUrl must be http(s), got {endpoint}"
            )));
        }
        if self.transports_order.is_empty() {
            return Err(invalid("transportsOrder must list at least one transport"));
        }
        let mut seen = HashSet::new();
        for kind in &self.transports_order {
            if !seen.insert(kind) {
                return Err(invalid(format!("transportsOrder lists {kind} twice")));
            }
        }
        for (name, value) in [
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("heartbeatTimeoutMs", self.heartbeat_timeout_ms),
            ("pollIntervalMs", self.poll_interval_ms),
            ("pollRequestTimeoutMs", self.poll_request_timeout_ms),
            ("reconnect.baseDelayMs", self.reconnect.base_delay_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(invalid("reconnect.maxDelayMs must be >= reconnect.baseDelayMs"));
        }
        if !(0.0..=MAX_JITTER_FRACTION).contains(&self.reconnect.jitter_fraction) {
            return Err(invalid(format!(
                "reconnect.jitterFraction must be within [0, 1/3], got {}",
                self.reconnect.jitter_fraction
            )));
        }
        if self.max_poll_failures == 0 || self.max_protocol_errors == 0 {
            return Err(invalid("maxPollFailures and maxProtocolErrors must be >= 1"));
        }
        for (name, path) in [
            ("rawSocketPath", &self.raw_socket_path),
            ("enginePath", &self.engine_path),
            ("pollPath", &self.poll_path),
            ("sendPath", &self.send_path),
        ] {
            if !path.starts_with('/') {
                return Err(invalid(format!("{name} must start with '/', got {path}")));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue(message.into())
}
