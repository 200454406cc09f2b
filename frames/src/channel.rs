//! Typed payloads carried on canvas broadcast topics.
//!
//! DESIGN
//! ======
//! Every message on a topic is one [`ChannelMessage`] variant, tagged by
//! `kind` on the wire. Receivers dispatch on the enum instead of on free-form
//! event strings, so a malformed payload fails at decode time rather than
//! inside a handler.
//!
//! Byte payloads are hex-encoded: as a protobuf list every byte would cost
//! a tagged double on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{CodecError, Frame, SYSCALL_MESSAGE};

/// Collaborator presence keyed by user id. A user connected from several
/// sockets has several records.
pub type PresenceMap = BTreeMap<String, Vec<PresenceRecord>>;

/// Whether a collaborator is looking at the canvas or changing it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Viewing,
    Editing,
}

/// Pointer position in canvas world coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// One collaborator's ephemeral presence on a canvas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub status: PresenceStatus,
}

impl PresenceRecord {
    #[must_use]
    pub fn viewing(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), cursor: None, status: PresenceStatus::Viewing }
    }

    #[must_use]
    pub fn with_cursor(mut self, x: f64, y: f64) -> Self {
        self.cursor = Some(Cursor { x, y });
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: PresenceStatus) -> Self {
        self.status = status;
        self
    }
}

/// Discriminant of a [`ChannelMessage`], used to register typed listeners.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    AmChange,
    PresenceSync,
    CursorMoved,
    Custom(String),
}

/// A message published on a canvas topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// Opaque CRDT delta produced by a peer's replicator.
    AmChange(#[serde(with = "hex_bytes")] Vec<u8>),
    /// Aggregated membership view, emitted by the hub whenever it changes.
    PresenceSync(PresenceMap),
    /// High-frequency cursor movement that does not alter membership.
    CursorMoved(PresenceRecord),
    /// Application-defined event with a free JSON payload.
    Custom { event: String, payload: serde_json::Value },
}

impl ChannelMessage {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::AmChange(_) => MessageKind::AmChange,
            Self::PresenceSync(_) => MessageKind::PresenceSync,
            Self::CursorMoved(_) => MessageKind::CursorMoved,
            Self::Custom { event, .. } => MessageKind::Custom(event.clone()),
        }
    }

    /// Wrap this message in a relay delivery frame for `topic`.
    #[must_use]
    pub fn to_frame(&self, topic: &str) -> Frame {
        // Serializing plain data enums into a `Value` cannot fail.
        let data = serde_json::to_value(self).unwrap_or_default();
        Frame::request(SYSCALL_MESSAGE, data).with_topic(topic)
    }

    /// Extract a typed message from a frame's payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] when the payload is not a valid message.
    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        frame.payload()
    }
}

/// Lowercase hex encoding of a byte slice.
#[must_use]
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push(char::from(DIGITS[usize::from(b >> 4)]));
        s.push(char::from(DIGITS[usize::from(b & 0x0f)]));
    }
    s
}

/// Parse lowercase or uppercase hex into bytes. `None` on odd length or bad digits.
#[must_use]
pub fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            let pair = hex.get(i..i + 2)?;
            match u8::from_str_radix(pair, 16) {
                Ok(byte) => Some(byte),
                Err(_) => None,
            }
        })
        .collect()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::bytes_to_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::hex_to_bytes(&raw).ok_or_else(|| serde::de::Error::custom("invalid hex payload"))
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
