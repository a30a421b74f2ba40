//! HTTP polling fallback.
//!
//! `GET {poll_path}` with a bearer token every `poll_interval_ms`. The body is
//! a mailbox, `{"notifications":[<wire envelope>...]}` (a bare array is also
//! accepted). Outbound envelopes are `POST`ed to `{send_path}`. The first
//! successful poll is the handshake acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use tether_core::{
    Credentials, Envelope, Generation, TransportError, TransportErrorKind, TransportKind,
};
use tether_settings::ClientSettings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::{CloseInfo, EventEmitter, TransportAdapter, close_codes};
use crate::endpoint::{check_status, join_path, parse_endpoint, request_error};

/// Mailbox key holding the pending envelopes.
const NOTIFICATIONS_KEY: &str = "notifications";

/// Polling adapter.
pub struct PollingTransport {
    settings: Arc<ClientSettings>,
    http: reqwest::Client,
    events: EventEmitter,
    session: Option<Session>,
    closed: bool,
}

struct Session {
    outbound: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
}

impl PollingTransport {
    /// Create an unconnected adapter.
    pub fn new(settings: Arc<ClientSettings>, http: reqwest::Client, events: EventEmitter) -> Self {
        Self {
            settings,
            http,
            events,
            session: None,
            closed: false,
        }
    }

    fn mailbox(&self, credentials: &Credentials) -> Result<Mailbox, TransportError> {
        let base = parse_endpoint(&self.settings.endpoint_url)?;
        Ok(Mailbox {
            http: self.http.clone(),
            poll_url: join_path(&base, &self.settings.poll_path),
            send_url: join_path(&base, &self.settings.send_path),
            bearer: credentials.bearer(),
            request_timeout: self.settings.poll_request_timeout(),
        })
    }
}

#[async_trait]
impl TransportAdapter for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn generation(&self) -> Generation {
        self.events.generation()
    }

    async fn connect(&mut self, credentials: &Credentials) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::network("adapter already closed"));
        }
        let mailbox = self.mailbox(credentials)?;
        debug!(generation = %self.generation(), url = %mailbox.poll_url, "first poll");
        // Any 2xx is the ack; a body that does not parse is reported once the
        // session runs.
        let first = match mailbox.fetch().await {
            Err(e) if e.kind != TransportErrorKind::ProtocolError => return Err(e),
            first => first,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let poller = Poller {
            mailbox: mailbox.clone(),
            events: self.events.clone(),
            interval: self.settings.poll_interval(),
            max_failures: self.settings.max_poll_failures,
            cancel: cancel.clone(),
        };
        drop(tokio::spawn(poller.run(first)));
        drop(tokio::spawn(send_loop(mailbox, rx, cancel.clone())));
        self.session = Some(Session {
            outbound: tx,
            cancel,
        });
        Ok(())
    }

    fn send(&self, envelope: &Envelope) {
        let Some(session) = &self.session else {
            debug!(event_type = %envelope.event_type, "polling not open, dropping envelope");
            return;
        };
        if session.outbound.send(envelope.clone()).is_err() {
            debug!(event_type = %envelope.event_type, "polling sender gone, dropping envelope");
        }
    }

    fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(session) = self.session.take() {
            debug!(generation = %self.generation(), code, reason, "stopping polling");
            session.cancel.cancel();
        }
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.close(close_codes::GOING_AWAY, "adapter dropped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP exchange
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Mailbox {
    http: reqwest::Client,
    poll_url: Url,
    send_url: Url,
    bearer: String,
    request_timeout: Duration,
}

impl Mailbox {
    async fn fetch(&self) -> Result<Vec<Value>, TransportError> {
        let response = self
            .http
            .get(self.poll_url.clone())
            .header(AUTHORIZATION, &self.bearer)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| request_error(&e, "poll"))?;
        check_status(response.status(), "poll")?;
        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(&e, "poll"))?;
        parse_mailbox(&body)
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.send_url.clone())
            .header(AUTHORIZATION, &self.bearer)
            .timeout(self.request_timeout)
            .json(&envelope.to_wire())
            .send()
            .await
            .map_err(|e| request_error(&e, "send"))?;
        check_status(response.status(), "send")
    }
}

/// Pull the pending items out of a mailbox body. An empty body is an empty
/// mailbox.
fn parse_mailbox(body: &[u8]) -> Result<Vec<Value>, TransportError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| TransportError::protocol(format!("mailbox is not JSON: {e}")))?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut fields) => match fields.remove(NOTIFICATIONS_KEY) {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(TransportError::protocol(format!(
                "mailbox `{NOTIFICATIONS_KEY}` is not an array"
            ))),
        },
        _ => Err(TransportError::protocol("mailbox is not an object or array")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background tasks
// ─────────────────────────────────────────────────────────────────────────────

struct Poller {
    mailbox: Mailbox,
    events: EventEmitter,
    interval: Duration,
    max_failures: u32,
    cancel: CancellationToken,
}

impl Poller {
    fn emit_all(&self, items: Vec<Value>) {
        for item in items {
            match Envelope::from_wire(item) {
                Ok(envelope) => self.events.message(envelope),
                Err(e) => self.events.protocol_error(format!("undecodable mailbox item: {e}")),
            }
        }
    }

    fn finish(&self, info: CloseInfo) {
        self.events.closed(info);
        self.cancel.cancel();
    }

    async fn run(self, first: Result<Vec<Value>, TransportError>) {
        match first {
            Ok(items) => self.emit_all(items),
            Err(e) => self.events.protocol_error(e.message),
        }
        let mut failures = 0u32;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.interval) => {}
            }
            let result = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = self.mailbox.fetch() => result,
            };
            match result {
                Ok(items) => {
                    failures = 0;
                    self.emit_all(items);
                }
                Err(e) if e.is_auth() => {
                    warn!(generation = %self.events.generation(), error = %e, "poll rejected credentials");
                    self.finish(CloseInfo::new(close_codes::POLICY_VIOLATION, e.message));
                    return;
                }
                Err(e) if e.kind == TransportErrorKind::ProtocolError => {
                    failures = 0;
                    self.events.protocol_error(e.message);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        generation = %self.events.generation(),
                        failures,
                        max_failures = self.max_failures,
                        error = %e,
                        "poll failed"
                    );
                    if failures >= self.max_failures {
                        self.finish(CloseInfo::abnormal(format!(
                            "{failures} consecutive poll failures, last: {e}"
                        )));
                        return;
                    }
                }
            }
        }
    }
}

async fn send_loop(
    mailbox: Mailbox,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            () = cancel.cancelled() => return,
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => return,
            },
        };
        if let Err(e) = mailbox.deliver(&envelope).await {
            warn!(event_type = %envelope.event_type, error = %e, "send failed, envelope dropped");
        }
    }
}
