//! Engine.IO v4 and Socket.IO v5 text framing.
//!
//! An Engine.IO packet is a one-character type followed by data. Long-polling
//! payloads concatenate packets with the record separator `\x1e`. A
//! Socket.IO packet rides inside an Engine.IO `message` packet:
//!
//! ```text
//! 42["status_updated",{"room":"order_1","status":"en_route"}]
//! ^^ engine message + socket EVENT
//! 4217["join_room",{"room":"order_1"}]   (ack id 17)
//! 4317[{"ok":true}]                       (ack for 17)
//! ```
//!
//! Binary packets are not supported.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_core::Envelope;
use tether_core::envelope::TYPE_KEY;
use thiserror::Error;

/// Separator between packets in a long-polling payload.
pub const RECORD_SEPARATOR: char = '\x1e';

/// Framing failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Zero-length packet.
    #[error("empty packet")]
    Empty,
    /// First character is not an Engine.IO packet type.
    #[error("unknown engine packet type {0:?}")]
    UnknownEngineType(char),
    /// First character is not a Socket.IO packet type.
    #[error("unknown socket packet type {0:?}")]
    UnknownSocketType(char),
    /// Binary attachments.
    #[error("binary packets are not supported")]
    Binary,
    /// Structurally invalid packet data.
    #[error("malformed {what}: {detail}")]
    Malformed {
        /// Which part was malformed.
        what: &'static str,
        /// Parser detail.
        detail: String,
    },
}

fn malformed(what: &'static str, detail: impl ToString) -> CodecError {
    CodecError::Malformed {
        what,
        detail: detail.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine.IO
// ─────────────────────────────────────────────────────────────────────────────

/// Body of the Engine.IO `open` packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Session id.
    pub sid: String,
    /// Transports the session may upgrade to.
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Server ping cadence in ms.
    #[serde(default)]
    pub ping_interval: u64,
    /// Grace period after a ping in ms.
    #[serde(default)]
    pub ping_timeout: u64,
    /// Largest payload the server accepts, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    /// Whether the server offers a websocket upgrade.
    pub fn offers_websocket(&self) -> bool {
        self.upgrades.iter().any(|u| u == "websocket")
    }
}

/// One Engine.IO packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnginePacket {
    /// `0`: session opened.
    Open(OpenHandshake),
    /// `1`: session closed.
    Close,
    /// `2`: ping, with optional probe data.
    Ping(String),
    /// `3`: pong, echoing the ping data.
    Pong(String),
    /// `4`: carries a Socket.IO packet.
    Message(String),
    /// `5`: transport upgrade complete.
    Upgrade,
    /// `6`: no-op (flushes a pending poll).
    Noop,
}

impl EnginePacket {
    /// Decode one packet.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut chars = text.chars();
        let tag = chars.next().ok_or(CodecError::Empty)?;
        let body = chars.as_str();
        match tag {
            '0' => serde_json::from_str(body)
                .map(Self::Open)
                .map_err(|e| malformed("open packet", e)),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(body.to_owned())),
            '3' => Ok(Self::Pong(body.to_owned())),
            '4' => Ok(Self::Message(body.to_owned())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            'b' => Err(CodecError::Binary),
            other => Err(CodecError::UnknownEngineType(other)),
        }
    }

    /// Encode one packet.
    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => {
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            Self::Close => "1".to_owned(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_owned(),
            Self::Noop => "6".to_owned(),
        }
    }
}

/// Split a long-polling body into packets.
pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>, CodecError> {
    body.split(RECORD_SEPARATOR)
        .filter(|chunk| !chunk.is_empty())
        .map(EnginePacket::decode)
        .collect()
}

/// Join packets into a long-polling body.
pub fn encode_payload(packets: &[EnginePacket]) -> String {
    let mut body = String::new();
    for (i, packet) in packets.iter().enumerate() {
        if i > 0 {
            body.push(RECORD_SEPARATOR);
        }
        body.push_str(&packet.encode());
    }
    body
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket.IO
// ─────────────────────────────────────────────────────────────────────────────

/// One Socket.IO packet on the default namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketPacket {
    /// `0`: namespace connect (client → auth payload, server → `{sid}`).
    Connect(Option<Value>),
    /// `1`: namespace disconnect.
    Disconnect,
    /// `2`: event. `data[0]` is the event name.
    Event {
        /// Ack id requested by the sender.
        id: Option<u64>,
        /// Name followed by arguments.
        data: Vec<Value>,
    },
    /// `3`: acknowledgement of an event.
    Ack {
        /// Id of the acknowledged event.
        id: u64,
        /// Ack arguments.
        data: Vec<Value>,
    },
    /// `4`: namespace connect refused.
    ConnectError(Value),
}

impl SocketPacket {
    /// An event named `name` with one argument.
    pub fn event(name: &str, argument: Value, id: Option<u64>) -> Self {
        Self::Event {
            id,
            data: vec![Value::String(name.to_owned()), argument],
        }
    }

    /// Decode the Socket.IO part of an Engine.IO message.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let mut chars = text.chars();
        let tag = chars.next().ok_or(CodecError::Empty)?;
        let rest = skip_namespace(chars.as_str());
        match tag {
            '0' => {
                if rest.is_empty() {
                    Ok(Self::Connect(None))
                } else {
                    parse_json(rest, "connect payload").map(|v| Self::Connect(Some(v)))
                }
            }
            '1' => Ok(Self::Disconnect),
            '2' => {
                let (id, json) = split_ack_id(rest);
                let data = parse_array(json, "event payload")?;
                if !matches!(data.first(), Some(Value::String(_))) {
                    return Err(malformed("event payload", "first element must be the event name"));
                }
                Ok(Self::Event { id, data })
            }
            '3' => {
                let (id, json) = split_ack_id(rest);
                let id = id.ok_or_else(|| malformed("ack", "missing ack id"))?;
                let data = parse_array(json, "ack payload")?;
                Ok(Self::Ack { id, data })
            }
            '4' => parse_json(rest, "connect error").map(Self::ConnectError),
            '5' | '6' => Err(CodecError::Binary),
            other => Err(CodecError::UnknownSocketType(other)),
        }
    }

    /// Encode for the default namespace.
    pub fn encode(&self) -> String {
        match self {
            Self::Connect(None) => "0".to_owned(),
            Self::Connect(Some(payload)) => format!("0{payload}"),
            Self::Disconnect => "1".to_owned(),
            Self::Event { id, data } => {
                format!("2{}{}", ack_prefix(*id), Value::Array(data.clone()))
            }
            Self::Ack { id, data } => format!("3{id}{}", Value::Array(data.clone())),
            Self::ConnectError(payload) => format!("4{payload}"),
        }
    }

    /// Wrap into an Engine.IO message packet.
    pub fn into_engine(self) -> EnginePacket {
        EnginePacket::Message(self.encode())
    }
}

fn ack_prefix(id: Option<u64>) -> String {
    id.map(|id| id.to_string()).unwrap_or_default()
}

/// Drop a `/nsp,` prefix. Only the default namespace is used.
fn skip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(comma) => &rest[comma + 1..],
            None => "",
        }
    } else {
        rest
    }
}

fn split_ack_id(rest: &str) -> (Option<u64>, &str) {
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return (None, rest);
    }
    (rest[..digits].parse().ok(), &rest[digits..])
}

fn parse_json(text: &str, what: &'static str) -> Result<Value, CodecError> {
    serde_json::from_str(text).map_err(|e| malformed(what, e))
}

fn parse_array(text: &str, what: &'static str) -> Result<Vec<Value>, CodecError> {
    match parse_json(text, what)? {
        Value::Array(items) => Ok(items),
        _ => Err(malformed(what, "expected a JSON array")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope mapping
// ─────────────────────────────────────────────────────────────────────────────

/// `{type, ...rest}` → `["type", {...rest}]`.
pub fn envelope_to_event(envelope: &Envelope, id: Option<u64>) -> SocketPacket {
    let mut wire = envelope.to_wire();
    if let Value::Object(object) = &mut wire {
        let _ = object.remove(TYPE_KEY);
    }
    SocketPacket::event(envelope.event_type.as_wire(), wire, id)
}

/// `["type", arg]` → `{type, ...arg}`. A non-object argument lands under
/// `data`.
pub fn event_to_envelope(data: &[Value]) -> Result<Envelope, CodecError> {
    let Some(Value::String(name)) = data.first() else {
        return Err(malformed("event payload", "first element must be the event name"));
    };
    let mut object = match data.get(1) {
        Some(Value::Object(object)) => object.clone(),
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            let mut wrapped = Map::new();
            let _ = wrapped.insert("data".to_owned(), other.clone());
            wrapped
        }
    };
    let _ = object.insert(TYPE_KEY.to_owned(), Value::String(name.clone()));
    Envelope::from_wire(Value::Object(object)).map_err(|e| malformed("event envelope", e))
}
