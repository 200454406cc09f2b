//! Broadcast transport: topic pub/sub with presence tracking.
//!
//! DESIGN
//! ======
//! A transport moves [`ChannelMessage`]s between clients subscribed to the
//! same topic. Delivery is fire-and-forget and at-most-once; a sender never
//! receives its own messages. Presence is tracked per `(topic, client_id)`
//! and every membership change is pushed to all subscribers as a full
//! [`ChannelMessage::PresenceSync`].
//!
//! Two implementations ship: [`MemoryHub`] for in-process fan-out (and the
//! relay server's shared state) and [`WsTransport`] for clients talking to a
//! relay over a websocket.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use frames::{ChannelMessage, CodecError, PresenceRecord};
use tokio::sync::mpsc;

pub use memory::MemoryHub;
pub use ws::WsTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{client_id} is not subscribed to {topic}")]
    NotSubscribed { topic: String, client_id: String },
    #[error("{client_id} is already subscribed to {topic}")]
    AlreadySubscribed { topic: String, client_id: String },
    #[error("transport closed")]
    Closed,
    #[error("no reply to {syscall} before timeout")]
    Timeout { syscall: String },
    #[error("relay rejected {syscall}: {message}")]
    Rejected { syscall: String, message: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// A live subscription. Inbound messages for the topic arrive on `inbound`
/// until the client unsubscribes or the transport shuts down.
#[derive(Debug)]
pub struct Subscription {
    pub topic: String,
    pub client_id: String,
    pub inbound: mpsc::Receiver<ChannelMessage>,
}

/// Topic pub/sub with presence.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Join `topic` as `client_id`.
    async fn subscribe(&self, topic: &str, client_id: &str) -> Result<Subscription, TransportError>;

    /// Publish to every other subscriber of `topic`.
    async fn send(&self, topic: &str, client_id: &str, message: ChannelMessage) -> Result<(), TransportError>;

    /// Set or replace this client's presence record on `topic`.
    async fn track(&self, topic: &str, client_id: &str, record: PresenceRecord) -> Result<(), TransportError>;

    /// Leave `topic`. Leaving a topic not joined is not an error.
    async fn unsubscribe(&self, topic: &str, client_id: &str) -> Result<(), TransportError>;
}
