//! Envelope and event-type vocabulary.
//!
//! Every transport carries the same logical message: an [`Envelope`] with a
//! type tag, an optional room, an arbitrary payload, and an optional server
//! timestamp. On the wire it is one flat JSON object:
//!
//! ```json
//! {"type": "status_updated", "room": "order_42", "status": "en_route", "server_timestamp": 1700000000000}
//! ```
//!
//! Payload keys sit next to the reserved `type`, `room`, and
//! `server_timestamp` keys. Decoding lifts the reserved keys out and keeps
//! everything else as the payload.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

/// Wire key holding the event type.
pub const TYPE_KEY: &str = "type";
/// Wire key holding the optional room id.
pub const ROOM_KEY: &str = "room";
/// Wire key holding the optional server timestamp.
pub const SERVER_TIMESTAMP_KEY: &str = "server_timestamp";

// ─────────────────────────────────────────────────────────────────────────────
// EventType
// ─────────────────────────────────────────────────────────────────────────────

/// Closed catalogue of known event types plus an escape hatch for anything
/// the backend adds later.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A new service request was created.
    NewRequest,
    /// A provider accepted a request.
    RequestAccepted,
    /// A request finished.
    RequestCompleted,
    /// A request was cancelled.
    RequestCancelled,
    /// Request status changed.
    StatusUpdated,
    /// A tracked location moved.
    LocationUpdated,
    /// An offer arrived for a request.
    OfferReceived,
    /// Generic lifecycle notification.
    Lifecycle,
    /// Chat message.
    ChatMessage,
    /// Presence change.
    Presence,
    /// Untyped message.
    Message,
    /// Server-reported error.
    Error,
    /// Client asks to subscribe to a room.
    JoinRoom,
    /// Client asks to unsubscribe from a room.
    LeaveRoom,
    /// Server acknowledged a room subscription.
    RoomJoined,
    /// Server acknowledged a room unsubscription.
    RoomLeft,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Any type not in the catalogue, kept verbatim.
    Other(String),
}

impl EventType {
    /// Map a wire string to an event type. Unknown strings become [`EventType::Other`].
    pub fn from_wire(value: &str) -> Self {
        match value {
            "new_request" => Self::NewRequest,
            "request_accepted" => Self::RequestAccepted,
            "request_completed" => Self::RequestCompleted,
            "request_cancelled" => Self::RequestCancelled,
            "status_updated" => Self::StatusUpdated,
            "location_updated" => Self::LocationUpdated,
            "offer_received" => Self::OfferReceived,
            "lifecycle" => Self::Lifecycle,
            "chat_message" => Self::ChatMessage,
            "presence" => Self::Presence,
            "message" => Self::Message,
            "error" => Self::Error,
            "join_room" => Self::JoinRoom,
            "leave_room" => Self::LeaveRoom,
            "room_joined" => Self::RoomJoined,
            "room_left" => Self::RoomLeft,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => Self::Other(other.to_owned()),
        }
    }

    /// The wire string for this event type.
    pub fn as_wire(&self) -> &str {
        match self {
            Self::NewRequest => "new_request",
            Self::RequestAccepted => "request_accepted",
            Self::RequestCompleted => "request_completed",
            Self::RequestCancelled => "request_cancelled",
            Self::StatusUpdated => "status_updated",
            Self::LocationUpdated => "location_updated",
            Self::OfferReceived => "offer_received",
            Self::Lifecycle => "lifecycle",
            Self::ChatMessage => "chat_message",
            Self::Presence => "presence",
            Self::Message => "message",
            Self::Error => "error",
            Self::JoinRoom => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::RoomJoined => "room_joined",
            Self::RoomLeft => "room_left",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Other(value) => value,
        }
    }

    /// Whether this type belongs to the connection's own control traffic
    /// (room membership and liveness) rather than application data.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::JoinRoom | Self::LeaveRoom | Self::Ping | Self::Pong
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::from_wire(value)
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&value))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Why an inbound frame could not be turned into an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The frame was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame was JSON but not an object.
    #[error("envelope must be a JSON object, got {found}")]
    NotAnObject {
        /// JSON kind that was found instead.
        found: &'static str,
    },
    /// The `type` key was absent, empty, or not a string.
    #[error("envelope is missing a string \"type\"")]
    MissingType,
    /// A reserved key held a value of the wrong JSON kind.
    #[error("envelope field \"{field}\" has the wrong type")]
    InvalidField {
        /// The offending key.
        field: &'static str,
    },
}

/// One logical message moving through the client.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Event type tag.
    pub event_type: EventType,
    /// Room the event belongs to, if any.
    pub room: Option<String>,
    /// Everything else in the wire object.
    pub payload: Map<String, Value>,
    /// Server-side timestamp, when the backend provides one.
    pub server_timestamp: Option<f64>,
    /// Local receive order, stamped by the dispatcher. Zero until dispatched.
    pub local_seq: u64,
}

impl Envelope {
    /// An envelope with the given type, no room, and an empty payload.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            room: None,
            payload: Map::new(),
            server_timestamp: None,
            local_seq: 0,
        }
    }

    /// Attach a room.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Replace the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Insert a single payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.payload.insert(key.into(), value.into());
        self
    }

    /// Control envelope subscribing to `room`.
    pub fn join_room(room: impl Into<String>) -> Self {
        Self::new(EventType::JoinRoom).with_room(room)
    }

    /// Control envelope unsubscribing from `room`.
    pub fn leave_room(room: impl Into<String>) -> Self {
        Self::new(EventType::LeaveRoom).with_room(room)
    }

    /// Liveness probe.
    pub fn ping() -> Self {
        Self::new(EventType::Ping)
    }

    /// Liveness reply.
    pub fn pong() -> Self {
        Self::new(EventType::Pong)
    }

    /// Look up a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Encode into the flat wire object.
    ///
    /// Reserved keys always come from the envelope's own fields, so a payload
    /// entry named `type` or `room` cannot shadow them.
    pub fn to_wire(&self) -> Value {
        let mut object = self.payload.clone();
        let _ = object.insert(
            TYPE_KEY.to_owned(),
            Value::String(self.event_type.as_wire().to_owned()),
        );
        match &self.room {
            Some(room) => {
                let _ = object.insert(ROOM_KEY.to_owned(), Value::String(room.clone()));
            }
            None => {
                let _ = object.remove(ROOM_KEY);
            }
        }
        match self.server_timestamp.and_then(timestamp_number) {
            Some(number) => {
                let _ = object.insert(SERVER_TIMESTAMP_KEY.to_owned(), Value::Number(number));
            }
            None => {
                let _ = object.remove(SERVER_TIMESTAMP_KEY);
            }
        }
        Value::Object(object)
    }

    /// Encode into a JSON text frame.
    pub fn to_wire_string(&self) -> String {
        self.to_wire().to_string()
    }

    /// Decode a wire object.
    pub fn from_wire(value: Value) -> Result<Self, EnvelopeError> {
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(EnvelopeError::NotAnObject {
                    found: json_kind(&other),
                });
            }
        };

        let event_type = match object.remove(TYPE_KEY) {
            Some(Value::String(tag)) if !tag.is_empty() => EventType::from_wire(&tag),
            _ => return Err(EnvelopeError::MissingType),
        };

        let room = match object.remove(ROOM_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(room)) => Some(room),
            Some(Value::Number(number)) => Some(number.to_string()),
            Some(_) => return Err(EnvelopeError::InvalidField { field: ROOM_KEY }),
        };

        let server_timestamp = match object.remove(SERVER_TIMESTAMP_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::Number(number)) => number.as_f64(),
            Some(_) => {
                return Err(EnvelopeError::InvalidField {
                    field: SERVER_TIMESTAMP_KEY,
                });
            }
        };

        Ok(Self {
            event_type,
            room,
            payload: object,
            server_timestamp,
            local_seq: 0,
        })
    }

    /// Decode a JSON text frame.
    pub fn from_wire_str(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_wire(value)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_wire(value).map_err(serde::de::Error::custom)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::float_cmp)]
fn timestamp_number(timestamp: f64) -> Option<Number> {
    // Whole millisecond values go out as integers.
    if timestamp.fract() == 0.0 && (0.0..9.0e15).contains(&timestamp) {
        return Some(Number::from(timestamp as u64));
    }
    Number::from_f64(timestamp)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
