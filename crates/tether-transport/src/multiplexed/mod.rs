//! Engine.IO v4 / Socket.IO v5 transport.
//!
//! Handshake:
//! 1. `GET {engine_path}?EIO=4&transport=polling` returns the `open` packet
//! 2. `POST` the namespace CONNECT carrying `{token, user_id, user_type}`
//! 3. poll until the CONNECT ack (`40{...}`) arrives; `44{...}` is an auth
//!    rejection
//! 4. try the websocket upgrade (`2probe` / `3probe` / `5`); when a proxy
//!    blocks it the session stays on long-polling
//!
//! Engine pings are answered internally. `join_room` goes out with an ack id
//! and the server's ack is surfaced as a `room_joined` envelope.

pub mod codec;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Value, json};
use tether_core::{Credentials, Envelope, EventType, Generation, TransportError, TransportKind};
use tether_settings::ClientSettings;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::codec::{
    EnginePacket, OpenHandshake, SocketPacket, decode_payload, encode_payload, envelope_to_event,
    event_to_envelope,
};
use crate::adapter::{CloseInfo, EventEmitter, TransportAdapter, close_codes};
use crate::endpoint::{check_status, join_path, parse_endpoint, request_error, websocket_url};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Budget for the websocket upgrade, connect plus probe.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);
/// Long-poll request timeout when the server does not announce ping timings.
const DEFAULT_LONG_POLL: Duration = Duration::from_secs(45);
/// Slack added on top of `pingInterval + pingTimeout` for long polls.
const LONG_POLL_SLACK: Duration = Duration::from_secs(5);

/// Where an established session carries its traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// HTTP long-polling (upgrade unavailable).
    LongPolling,
    /// Upgraded to a websocket.
    WebSocket,
}

enum Outbound {
    Envelope(Envelope),
    Engine(EnginePacket),
    Close { code: u16, reason: String },
}

/// Outstanding `join_room` acks by id.
#[derive(Debug, Default)]
struct AckTable {
    next_id: u64,
    rooms: HashMap<u64, String>,
}

impl AckTable {
    fn register(&mut self, room: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let _ = self.rooms.insert(id, room);
        id
    }

    fn resolve(&mut self, id: u64) -> Option<String> {
        self.rooms.remove(&id)
    }
}

type SharedAcks = Arc<Mutex<AckTable>>;

/// What the session loop should do after an inbound packet.
#[derive(Debug, PartialEq)]
enum Inbound {
    Continue,
    Reply(EnginePacket),
    Closed(CloseInfo),
}

/// Engine.IO / Socket.IO adapter.
pub struct MultiplexedSocketTransport {
    settings: Arc<ClientSettings>,
    http: reqwest::Client,
    events: EventEmitter,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    mode: Option<SessionMode>,
    closed: bool,
}

impl MultiplexedSocketTransport {
    /// Create an unconnected adapter.
    pub fn new(settings: Arc<ClientSettings>, http: reqwest::Client, events: EventEmitter) -> Self {
        Self {
            settings,
            http,
            events,
            outbound: None,
            mode: None,
            closed: false,
        }
    }

    /// Session mode once connected.
    pub fn mode(&self) -> Option<SessionMode> {
        self.mode
    }

    async fn try_upgrade(&self, engine: &Url, sid: &str) -> Result<WsStream, TransportError> {
        let url = websocket_url(&engine_url(engine, "websocket", Some(sid)))?;
        let (mut ws, _) = tokio::time::timeout(UPGRADE_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::timeout("websocket upgrade timed out"))?
            .map_err(|e| TransportError::network(format!("websocket upgrade refused: {e}")))?;
        probe_upgrade(&mut ws).await?;
        Ok(ws)
    }
}

#[async_trait]
impl TransportAdapter for MultiplexedSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::MultiplexedSocket
    }

    fn generation(&self) -> Generation {
        self.events.generation()
    }

    async fn connect(&mut self, credentials: &Credentials) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::network("adapter already closed"));
        }
        let base = parse_endpoint(&self.settings.endpoint_url)?;
        let engine = join_path(&base, &self.settings.engine_path);

        let opener = PollingChannel {
            http: self.http.clone(),
            url: engine_url(&engine, "polling", None),
            bearer: credentials.bearer(),
            request_timeout: self.settings.connect_timeout(),
        };
        let open = read_open_packet(&opener.get().await?)?;
        debug!(
            generation = %self.generation(),
            sid = %open.sid,
            upgrades = ?open.upgrades,
            "engine session opened"
        );

        let channel = PollingChannel {
            url: engine_url(&engine, "polling", Some(&open.sid)),
            request_timeout: long_poll_timeout(&open),
            ..opener
        };
        let auth = json!({
            "token": credentials.token,
            "user_id": credentials.user_id,
            "user_type": credentials.user_type,
        });
        channel
            .post(SocketPacket::Connect(Some(auth)).into_engine().encode())
            .await?;
        let early = await_namespace_ack(&channel).await?;

        let acks = SharedAcks::default();
        let (tx, rx) = mpsc::unbounded_channel();

        let upgraded = if open.offers_websocket() {
            match self.try_upgrade(&engine, &open.sid).await {
                Ok(ws) => Some(ws),
                Err(e) => {
                    info!(
                        generation = %self.generation(),
                        error = %e,
                        "websocket upgrade unavailable, staying on long-polling"
                    );
                    None
                }
            }
        } else {
            None
        };

        let mode = match upgraded {
            Some(ws) => {
                drop(tokio::spawn(websocket_session(
                    ws,
                    rx,
                    self.events.clone(),
                    acks,
                    early,
                )));
                SessionMode::WebSocket
            }
            None => {
                let cancel = CancellationToken::new();
                drop(tokio::spawn(poll_loop(
                    channel.clone(),
                    tx.clone(),
                    self.events.clone(),
                    Arc::clone(&acks),
                    cancel.clone(),
                    early,
                )));
                drop(tokio::spawn(write_loop(channel, rx, acks, cancel)));
                SessionMode::LongPolling
            }
        };
        debug!(generation = %self.generation(), ?mode, "socket namespace connected");
        self.mode = Some(mode);
        self.outbound = Some(tx);
        Ok(())
    }

    fn send(&self, envelope: &Envelope) {
        let Some(tx) = &self.outbound else {
            debug!(event_type = %envelope.event_type, "multiplexed socket not open, dropping envelope");
            return;
        };
        if tx.send(Outbound::Envelope(envelope.clone())).is_err() {
            debug!(event_type = %envelope.event_type, "multiplexed session gone, dropping envelope");
        }
    }

    fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(tx) = self.outbound.take() {
            debug!(generation = %self.generation(), code, reason, "closing multiplexed socket");
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }
}

impl Drop for MultiplexedSocketTransport {
    fn drop(&mut self) {
        self.close(close_codes::GOING_AWAY, "adapter dropped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake helpers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct PollingChannel {
    http: reqwest::Client,
    url: Url,
    bearer: String,
    request_timeout: Duration,
}

impl PollingChannel {
    async fn get(&self) -> Result<String, TransportError> {
        let response = self
            .http
            .get(self.url.clone())
            .header(AUTHORIZATION, &self.bearer)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| request_error(&e, "engine poll"))?;
        check_status(response.status(), "engine poll")?;
        response
            .text()
            .await
            .map_err(|e| request_error(&e, "engine poll"))
    }

    async fn post(&self, body: String) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.url.clone())
            .header(AUTHORIZATION, &self.bearer)
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .timeout(self.request_timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| request_error(&e, "engine post"))?;
        check_status(response.status(), "engine post")
    }
}

fn engine_url(engine: &Url, transport: &str, sid: Option<&str>) -> Url {
    let mut url = engine.clone();
    {
        let mut query = url.query_pairs_mut();
        let _ = query.append_pair("EIO", "4").append_pair("transport", transport);
        if let Some(sid) = sid {
            let _ = query.append_pair("sid", sid);
        }
    }
    url
}

fn long_poll_timeout(open: &OpenHandshake) -> Duration {
    if open.ping_interval == 0 {
        return DEFAULT_LONG_POLL;
    }
    Duration::from_millis(open.ping_interval + open.ping_timeout) + LONG_POLL_SLACK
}

fn read_open_packet(body: &str) -> Result<OpenHandshake, TransportError> {
    let packets = decode_payload(body)
        .map_err(|e| TransportError::protocol(format!("undecodable open payload: {e}")))?;
    match packets.into_iter().next() {
        Some(EnginePacket::Open(open)) => Ok(open),
        other => Err(TransportError::protocol(format!(
            "expected engine open packet, got {other:?}"
        ))),
    }
}

fn connect_error_message(detail: &Value) -> String {
    detail
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| detail.to_string(), str::to_owned)
}

/// Poll until the namespace CONNECT ack. Other messages that arrive first
/// are kept for the session loop.
async fn await_namespace_ack(channel: &PollingChannel) -> Result<Vec<EnginePacket>, TransportError> {
    let mut early = Vec::new();
    loop {
        let body = channel.get().await?;
        let packets = decode_payload(&body)
            .map_err(|e| TransportError::protocol(format!("undecodable poll payload: {e}")))?;
        let mut acked = false;
        for packet in packets {
            match packet {
                EnginePacket::Message(text) => match SocketPacket::decode(&text) {
                    Ok(SocketPacket::Connect(_)) => acked = true,
                    Ok(SocketPacket::ConnectError(detail)) => {
                        return Err(TransportError::rejected(true, connect_error_message(&detail)));
                    }
                    _ => early.push(EnginePacket::Message(text)),
                },
                EnginePacket::Ping(data) => channel.post(EnginePacket::Pong(data).encode()).await?,
                EnginePacket::Close => {
                    return Err(TransportError::network(
                        "engine session closed during handshake",
                    ));
                }
                _ => {}
            }
        }
        if acked {
            return Ok(early);
        }
    }
}

/// `2probe` → expect `3probe` → `5`.
async fn probe_upgrade(ws: &mut WsStream) -> Result<(), TransportError> {
    let write_failed = |e: tokio_tungstenite::tungstenite::Error| TransportError::network(format!("upgrade write failed: {e}"));
    ws.send(Message::Text(EnginePacket::Ping("probe".into()).encode().into()))
        .await
        .map_err(write_failed)?;

    let reply = tokio::time::timeout(UPGRADE_TIMEOUT, async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Text(text)) => return Ok(text.as_str().to_owned()),
                Ok(Message::Close(_)) => {
                    return Err(TransportError::network("socket closed during upgrade probe"));
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::network(e.to_string())),
            }
        }
        Err(TransportError::network("socket ended during upgrade probe"))
    })
    .await
    .map_err(|_| TransportError::timeout("no upgrade probe reply"))??;

    if EnginePacket::decode(&reply) != Ok(EnginePacket::Pong("probe".into())) {
        return Err(TransportError::protocol(format!(
            "unexpected upgrade probe reply {reply:?}"
        )));
    }
    ws.send(Message::Text(EnginePacket::Upgrade.encode().into()))
        .await
        .map_err(write_failed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session loops
// ─────────────────────────────────────────────────────────────────────────────

fn encode_outbound(envelope: &Envelope, acks: &Mutex<AckTable>) -> EnginePacket {
    let id = match (&envelope.event_type, &envelope.room) {
        (EventType::JoinRoom, Some(room)) => Some(acks.lock().register(room.clone())),
        _ => None,
    };
    envelope_to_event(envelope, id).into_engine()
}

fn room_joined(room: String, data: &[Value]) -> Envelope {
    let mut envelope = Envelope::new(EventType::RoomJoined).with_room(room);
    if let Some(Value::Object(fields)) = data.first() {
        for (key, value) in fields {
            if key != "type" && key != "room" {
                let _ = envelope.payload.insert(key.clone(), value.clone());
            }
        }
    }
    envelope
}

fn interpret(packet: EnginePacket, events: &EventEmitter, acks: &Mutex<AckTable>) -> Inbound {
    match packet {
        EnginePacket::Ping(data) => Inbound::Reply(EnginePacket::Pong(data)),
        EnginePacket::Message(text) => {
            match SocketPacket::decode(&text) {
                Ok(SocketPacket::Event { data, .. }) => match event_to_envelope(&data) {
                    Ok(envelope) => events.message(envelope),
                    Err(e) => events.protocol_error(e.to_string()),
                },
                Ok(SocketPacket::Ack { id, data }) => {
                    let room = acks.lock().resolve(id);
                    match room {
                        Some(room) => events.message(room_joined(room, &data)),
                        None => debug!(id, "ack for unknown id"),
                    }
                }
                Ok(SocketPacket::Disconnect) => {
                    return Inbound::Closed(CloseInfo::new(
                        close_codes::NORMAL,
                        "server disconnected the namespace",
                    ));
                }
                Ok(SocketPacket::ConnectError(detail)) => {
                    return Inbound::Closed(CloseInfo::new(
                        close_codes::UNAUTHORIZED,
                        connect_error_message(&detail),
                    ));
                }
                Ok(SocketPacket::Connect(_)) => {}
                Err(e) => events.protocol_error(format!("undecodable socket packet: {e}")),
            }
            Inbound::Continue
        }
        EnginePacket::Close => Inbound::Closed(CloseInfo::new(
            close_codes::GOING_AWAY,
            "engine session closed by server",
        )),
        EnginePacket::Open(_) | EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => {
            Inbound::Continue
        }
    }
}

/// Replay packets that arrived before the CONNECT ack. Returns a close if one
/// of them ended the session.
fn replay_early(early: Vec<EnginePacket>, events: &EventEmitter, acks: &Mutex<AckTable>) -> Option<CloseInfo> {
    for packet in early {
        if let Inbound::Closed(info) = interpret(packet, events, acks) {
            return Some(info);
        }
    }
    None
}

async fn websocket_session(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventEmitter,
    acks: SharedAcks,
    early: Vec<EnginePacket>,
) {
    if let Some(info) = replay_early(early, &events, &acks) {
        events.closed(info);
        return;
    }
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            command = outbound.recv() => {
                let packet = match command {
                    Some(Outbound::Envelope(envelope)) => encode_outbound(&envelope, &acks),
                    Some(Outbound::Engine(packet)) => packet,
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let goodbye = SocketPacket::Disconnect.into_engine().encode();
                        let _ = tokio::time::timeout(UPGRADE_TIMEOUT, async {
                            let _ = ws_tx.send(Message::Text(goodbye.into())).await;
                            let _ = ws_tx.send(Message::Close(Some(frame))).await;
                            let _ = ws_tx.close().await;
                        })
                        .await;
                        break;
                    }
                    None => break,
                };
                if let Err(e) = ws_tx.send(Message::Text(packet.encode().into())).await {
                    warn!(generation = %events.generation(), error = %e, "engine socket write failed");
                    events.closed(CloseInfo::abnormal(format!("write failed: {e}")));
                    break;
                }
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => match EnginePacket::decode(text.as_str()) {
                    Ok(packet) => match interpret(packet, &events, &acks) {
                        Inbound::Continue => {}
                        Inbound::Reply(reply) => {
                            if let Err(e) = ws_tx.send(Message::Text(reply.encode().into())).await {
                                events.closed(CloseInfo::abnormal(format!("write failed: {e}")));
                                break;
                            }
                        }
                        Inbound::Closed(info) => {
                            events.closed(info);
                            break;
                        }
                    },
                    Err(e) => events.protocol_error(format!("undecodable engine packet: {e}")),
                },
                Some(Ok(Message::Close(frame))) => {
                    let info = frame.map_or_else(
                        || CloseInfo::new(close_codes::NO_STATUS, ""),
                        |f| CloseInfo::new(u16::from(f.code), f.reason.as_str()),
                    );
                    events.closed(info);
                    break;
                }
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

async fn poll_loop(
    channel: PollingChannel,
    replies: mpsc::UnboundedSender<Outbound>,
    events: EventEmitter,
    acks: SharedAcks,
    cancel: CancellationToken,
    early: Vec<EnginePacket>,
) {
    if let Some(info) = replay_early(early, &events, &acks) {
        events.closed(info);
        cancel.cancel();
        return;
    }

    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => return,
            result = channel.get() => result,
        };
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!(generation = %events.generation(), error = %e, "engine long-poll failed");
                let info = if e.is_auth() {
                    CloseInfo::new(close_codes::UNAUTHORIZED, e.message)
                } else {
                    CloseInfo::abnormal(e.to_string())
                };
                events.closed(info);
                cancel.cancel();
                return;
            }
        };
        let packets = match decode_payload(&body) {
            Ok(packets) => packets,
            Err(e) => {
                events.protocol_error(format!("undecodable poll payload: {e}"));
                continue;
            }
        };
        for packet in packets {
            match interpret(packet, &events, &acks) {
                Inbound::Continue => {}
                Inbound::Reply(reply) => {
                    let _ = replies.send(Outbound::Engine(reply));
                }
                Inbound::Closed(info) => {
                    events.closed(info);
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    channel: PollingChannel,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    acks: SharedAcks,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            () = cancel.cancelled() => return,
            command = outbound.recv() => command,
        };
        let body = match command {
            Some(Outbound::Envelope(envelope)) => encode_outbound(&envelope, &acks).encode(),
            Some(Outbound::Engine(packet)) => packet.encode(),
            Some(Outbound::Close { .. }) => {
                let goodbye =
                    encode_payload(&[SocketPacket::Disconnect.into_engine(), EnginePacket::Close]);
                let _ = channel.post(goodbye).await;
                cancel.cancel();
                return;
            }
            None => {
                cancel.cancel();
                return;
            }
        };
        if let Err(e) = channel.post(body).await {
            warn!(error = %e, "engine post failed");
        }
    }
}
