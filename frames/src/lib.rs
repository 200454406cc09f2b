//! Shared frame model and protobuf codec for the canvas broadcast relay.
//!
//! This crate owns the wire representation used by the relay server and by
//! websocket clients of the sync layer. Frame payloads stay flexible
//! (`serde_json::Value`) while encoding over protobuf for compact binary
//! transport. Typed channel payloads live in [`channel`].

pub mod channel;

use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use prost_types::value::Kind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use channel::{ChannelMessage, Cursor, MessageKind, PresenceMap, PresenceRecord, PresenceStatus};

/// Syscall a client sends to join a topic.
pub const SYSCALL_SUBSCRIBE: &str = "channel:subscribe";
/// Syscall a client sends to leave a topic.
pub const SYSCALL_UNSUBSCRIBE: &str = "channel:unsubscribe";
/// Syscall carrying an outbound [`ChannelMessage`] from a client.
pub const SYSCALL_SEND: &str = "channel:send";
/// Syscall carrying a client's presence record.
pub const SYSCALL_TRACK: &str = "channel:track";
/// Syscall the relay uses to deliver a [`ChannelMessage`] to a client.
pub const SYSCALL_MESSAGE: &str = "channel:message";
/// Syscall the relay uses to report a rejected frame.
pub const SYSCALL_ERROR: &str = "channel:error";

/// Error returned by [`decode_frame`] and by typed payload extraction.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `status` integer on the wire does not map to a known [`Status`] variant.
    #[error("invalid frame status: {0}")]
    InvalidStatus(i32),
    /// The frame's JSON payload does not match the expected typed shape.
    #[error("invalid frame payload for {syscall}: {source}")]
    Payload {
        syscall: String,
        #[source]
        source: serde_json::Error,
    },
    /// The frame is not addressed to any topic.
    #[error("frame {syscall} is missing a topic")]
    MissingTopic { syscall: String },
}

/// Lifecycle status of a frame in a request/response exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Initial request frame sent by the client.
    Request,
    /// Intermediate streaming item (non-terminal).
    Item,
    /// Successful terminal response.
    Done,
    /// Error terminal response.
    Error,
}

impl Status {
    /// Convert status into wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Request => WireFrameStatus::Request as i32,
            Self::Item => WireFrameStatus::Item as i32,
            Self::Done => WireFrameStatus::Done as i32,
            Self::Error => WireFrameStatus::Error as i32,
        }
    }

    /// Parse a status from wire enum integer value.
    fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireFrameStatus::try_from(value) {
            Ok(WireFrameStatus::Request) => Ok(Self::Request),
            Ok(WireFrameStatus::Item) => Ok(Self::Item),
            Ok(WireFrameStatus::Done) => Ok(Self::Done),
            Ok(WireFrameStatus::Error) => Ok(Self::Error),
            Err(_) => Err(CodecError::InvalidStatus(value)),
        }
    }

    /// Terminal statuses end a response stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// A single message on the relay wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unique identifier for this frame (UUID string).
    pub id: String,
    /// ID of the request frame this is responding to, if any.
    pub parent_id: Option<String>,
    /// Milliseconds since the Unix epoch when the frame was created.
    pub ts: i64,
    /// Broadcast topic this frame targets, e.g. `"canvas:<id>"`.
    pub topic: Option<String>,
    /// Sender identifier (client ID or system label).
    pub from: Option<String>,
    /// Namespaced operation name, e.g. `"channel:send"`.
    pub syscall: String,
    /// Lifecycle position of the frame.
    pub status: Status,
    /// Arbitrary JSON payload.
    pub data: Value,
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame with a fresh id and the current timestamp.
    pub fn request(syscall: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            ts: now_ms(),
            topic: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    /// Create a done response correlated to this frame.
    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Value::Object(Map::new()))
    }

    /// Create an error response carrying `message`. Terminal.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("message".into(), Value::String(message.into()));
        let mut reply = self.reply(Status::Error, Value::Object(data));
        reply.syscall = SYSCALL_ERROR.to_owned();
        reply
    }

    fn reply(&self, status: Status, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            ts: now_ms(),
            topic: self.topic.clone(),
            from: None,
            syscall: self.syscall.clone(),
            status,
            data,
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// The topic this frame targets.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingTopic`] when the frame carries no topic.
    pub fn require_topic(&self) -> Result<&str, CodecError> {
        self.topic
            .as_deref()
            .ok_or_else(|| CodecError::MissingTopic { syscall: self.syscall.clone() })
    }

    /// Deserialize the JSON payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] if `data` does not match `T`.
    pub fn payload<T>(&self) -> Result<T, CodecError>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.data.clone())
            .map_err(|source| CodecError::Payload { syscall: self.syscall.clone(), source })
    }
}

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = frame_to_wire(frame);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot hit `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::InvalidStatus`] for out-of-range status values.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    wire_to_frame(wire)
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame {
        id: frame.id.clone(),
        parent_id: frame.parent_id.clone(),
        ts: frame.ts,
        topic: frame.topic.clone(),
        from: frame.from.clone(),
        syscall: frame.syscall.clone(),
        status: frame.status.as_i32(),
        data: Some(json_to_proto_value(&frame.data)),
    }
}

fn wire_to_frame(wire: WireFrame) -> Result<Frame, CodecError> {
    Ok(Frame {
        id: wire.id,
        parent_id: wire.parent_id,
        ts: wire.ts,
        topic: wire.topic,
        from: wire.from,
        syscall: wire.syscall,
        status: Status::from_i32(wire.status)?,
        data: wire
            .data
            .map_or(Value::Object(Map::new()), |v| proto_to_json_value(&v)),
    })
}

/// Largest magnitude at which every integer is exactly representable as f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue.into()),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue { values: items.iter().map(json_to_proto_value).collect() }),
        Value::Object(map) => Kind::StructValue(prost_types::Struct {
            fields: map.iter().map(|(key, v)| (key.clone(), json_to_proto_value(v))).collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

/// Inverse of [`json_to_proto_value`]. Protobuf carries every number as a
/// double; integral values inside the safe range come back as JSON integers
/// so counters and indices keep their type. NaN and infinities become null.
fn proto_to_json_value(value: &prost_types::Value) -> Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::NumberValue(n)) => number_to_json(*n),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::ListValue(list)) => Value::Array(list.values.iter().map(proto_to_json_value).collect()),
        Some(Kind::StructValue(st)) => {
            Value::Object(st.fields.iter().map(|(key, v)| (key.clone(), proto_to_json_value(v))).collect())
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    parent_id: Option<String>,
    #[prost(int64, tag = "3")]
    ts: i64,
    #[prost(string, optional, tag = "4")]
    topic: Option<String>,
    #[prost(string, optional, tag = "5")]
    from: Option<String>,
    #[prost(string, tag = "6")]
    syscall: String,
    #[prost(enumeration = "WireFrameStatus", tag = "7")]
    status: i32,
    #[prost(message, optional, tag = "8")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireFrameStatus {
    Request = 0,
    Done = 1,
    Error = 2,
    Item = 4,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
