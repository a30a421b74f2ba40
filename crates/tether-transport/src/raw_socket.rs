//! Plain WebSocket transport.
//!
//! Connects to `ws(s)://host{raw_socket_path}?token=..&user_id=..&user_type=..`.
//! The HTTP 101 upgrade is the handshake acknowledgement. Every text frame is
//! one JSON envelope.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tether_core::{Credentials, Envelope, Generation, TransportError, TransportKind};
use tether_settings::ClientSettings;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::adapter::{CloseInfo, EventEmitter, TransportAdapter, close_codes};
use crate::endpoint::{join_path, parse_endpoint, websocket_url};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a locally requested close may take to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

enum Outbound {
    Frame(String),
    Close { code: u16, reason: String },
}

/// Plain WebSocket adapter.
pub struct RawSocketTransport {
    settings: Arc<ClientSettings>,
    events: EventEmitter,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    closed: bool,
}

impl RawSocketTransport {
    /// Create an unconnected adapter.
    pub fn new(settings: Arc<ClientSettings>, events: EventEmitter) -> Self {
        Self {
            settings,
            events,
            outbound: None,
            closed: false,
        }
    }

    /// The socket URL for `credentials`. Contains the token; never log it.
    pub fn socket_url(&self, credentials: &Credentials) -> Result<Url, TransportError> {
        let base = parse_endpoint(&self.settings.endpoint_url)?;
        let mut url = websocket_url(&join_path(&base, &self.settings.raw_socket_path))?;
        let _ = url
            .query_pairs_mut()
            .append_pair("token", &credentials.token)
            .append_pair("user_id", &credentials.user_id)
            .append_pair("user_type", &credentials.user_type.to_string());
        Ok(url)
    }
}

#[async_trait]
impl TransportAdapter for RawSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RawSocket
    }

    fn generation(&self) -> Generation {
        self.events.generation()
    }

    async fn connect(&mut self, credentials: &Credentials) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::network("adapter already closed"));
        }
        let url = self.socket_url(credentials)?;
        debug!(
            generation = %self.generation(),
            host = url.host_str().unwrap_or_default(),
            path = url.path(),
            "opening raw socket"
        );

        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(classify_handshake_error)?;
        debug!(generation = %self.generation(), status = %response.status(), "raw socket upgraded");

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        drop(tokio::spawn(socket_loop(ws, rx, self.events.clone())));
        Ok(())
    }

    fn send(&self, envelope: &Envelope) {
        let Some(tx) = &self.outbound else {
            debug!(event_type = %envelope.event_type, "raw socket not open, dropping frame");
            return;
        };
        if tx.send(Outbound::Frame(envelope.to_wire_string())).is_err() {
            debug!(event_type = %envelope.event_type, "raw socket writer gone, dropping frame");
        }
    }

    fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(tx) = self.outbound.take() {
            debug!(generation = %self.generation(), code, reason, "closing raw socket");
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }
}

impl Drop for RawSocketTransport {
    fn drop(&mut self) {
        self.close(close_codes::GOING_AWAY, "adapter dropped");
    }
}

/// Map a failed upgrade to the transport error taxonomy.
fn classify_handshake_error(error: WsError) -> TransportError {
    match error {
        WsError::Http(response) => {
            let status = response.status();
            let auth = matches!(status.as_u16(), 401 | 403);
            TransportError::rejected(auth, format!("upgrade rejected with HTTP {status}"))
        }
        WsError::Io(e) => TransportError::network(format!("socket error: {e}")),
        other => TransportError::network(other.to_string()),
    }
}

async fn socket_loop(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventEmitter,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        warn!(generation = %events.generation(), error = %e, "raw socket write failed");
                        events.closed(CloseInfo::abnormal(format!("write failed: {e}")));
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        let _ = ws_tx.close().await;
                    })
                    .await;
                    break;
                }
                None => break,
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => match Envelope::from_wire_str(text.as_str()) {
                    Ok(envelope) => events.message(envelope),
                    Err(e) => events.protocol_error(format!("undecodable frame: {e}")),
                },
                Some(Ok(Message::Binary(bytes))) => {
                    events.protocol_error(format!("unexpected binary frame ({} bytes)", bytes.len()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let info = frame.map_or_else(
                        || CloseInfo::new(close_codes::NO_STATUS, ""),
                        |f| CloseInfo::new(u16::from(f.code), f.reason.as_str()),
                    );
                    debug!(generation = %events.generation(), %info, "server closed raw socket");
                    events.closed(info);
                    break;
                }
                // Control frames are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.closed(CloseInfo::abnormal(e.to_string()));
                    break;
                }
                None => {
                    events.closed(CloseInfo::abnormal("stream ended"));
                    break;
                }
            }
        }
    }
}
