//! Presence channel: one canvas topic, membership, and typed broadcast.
//!
//! DESIGN
//! ======
//! `join` subscribes to `canvas:{id}` exactly once and publishes the local
//! presence record. Later cursor/status changes go through `update`, which
//! re-tracks without re-subscribing. High-rate pointer motion goes through
//! `move_cursor`, which broadcasts a `CursorMoved` message and leaves the
//! tracked record alone.
//!
//! Dropping the last handle without `leave` stops the pump and unsubscribes
//! in the background, so peers see the departure.
//!
//! Inbound traffic is pumped off the subscription by a background task and
//! dispatched on [`ChannelMessage::kind`] to listeners registered with
//! [`PresenceChannel::on`]. Presence syncs are ordinary messages; the
//! `on_presence_sync` helper is a typed listener for them.
//!
//! Listeners run on the pump task with no lock held, so a listener may
//! register or remove listeners, or send on the channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use frames::{ChannelMessage, MessageKind, PresenceMap, PresenceRecord};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crdt::DeltaSink;
use crate::transport::{BroadcastTransport, TransportError};

type Callback = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// Handle returned by [`PresenceChannel::on`]; pass to [`PresenceChannel::off`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Listener {
    kind: MessageKind,
    id: u64,
}

impl Listener {
    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_kind: HashMap<MessageKind, Vec<(u64, Callback)>>,
}

struct Joined {
    topic: String,
    pump: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn BroadcastTransport>,
    client_id: String,
    joined: Mutex<Option<Joined>>,
    local: Mutex<Option<PresenceRecord>>,
    listeners: Mutex<Listeners>,
    presence: Mutex<PresenceMap>,
}

impl Inner {
    fn joined(&self) -> MutexGuard<'_, Option<Joined>> {
        self.joined.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local(&self) -> MutexGuard<'_, Option<PresenceRecord>> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn presence(&self) -> MutexGuard<'_, PresenceMap> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn topic(&self) -> Option<String> {
        self.joined().as_ref().map(|j| j.topic.clone())
    }

    fn dispatch(&self, message: &ChannelMessage) {
        if let ChannelMessage::PresenceSync(map) = message {
            self.presence().clone_from(map);
        }

        let kind = message.kind();
        let callbacks: Vec<Callback> = self
            .listeners()
            .by_kind
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            debug!(client_id = %self.client_id, ?kind, "no listener for message");
        }
        for callback in callbacks {
            callback(message);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let Some(joined) = self.joined.get_mut().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        joined.pump.abort();
        let topic = joined.topic;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(client_id = %self.client_id, %topic, "presence channel dropped outside a runtime; not unsubscribed");
            return;
        };

        let transport = Arc::clone(&self.transport);
        let client_id = self.client_id.clone();
        runtime.spawn(async move {
            match transport.unsubscribe(&topic, &client_id).await {
                Ok(()) => info!(%client_id, %topic, "dropped channel left canvas"),
                Err(e) => warn!(%client_id, %topic, error = %e, "unsubscribe after drop failed"),
            }
        });
    }
}

/// A client's membership in one canvas topic.
#[derive(Clone)]
pub struct PresenceChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PresenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceChannel")
            .field("client_id", &self.inner.client_id)
            .field("topic", &self.inner.topic())
            .finish_non_exhaustive()
    }
}

/// Topic name for a canvas.
#[must_use]
pub fn canvas_topic(canvas_id: &str) -> String {
    format!("canvas:{canvas_id}")
}

impl PresenceChannel {
    /// `client_id` identifies this connection; one user may hold several.
    #[must_use]
    pub fn new(transport: Arc<dyn BroadcastTransport>, client_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                client_id: client_id.into(),
                joined: Mutex::new(None),
                local: Mutex::new(None),
                listeners: Mutex::new(Listeners::default()),
                presence: Mutex::new(PresenceMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Topic currently joined, if any.
    #[must_use]
    pub fn topic(&self) -> Option<String> {
        self.inner.topic()
    }

    /// Last presence map received from the transport.
    #[must_use]
    pub fn presence(&self) -> PresenceMap {
        self.inner.presence().clone()
    }

    /// Join the topic for `canvas_id` and publish `record`.
    ///
    /// Joining the canvas already joined only re-publishes the record.
    /// Joining a different canvas leaves the current one first.
    ///
    /// # Errors
    ///
    /// Returns the transport error if subscribing or tracking fails.
    pub async fn join(&self, canvas_id: &str, record: PresenceRecord) -> Result<(), TransportError> {
        let topic = canvas_topic(canvas_id);
        match self.inner.topic() {
            Some(current) if current == topic => return self.update(record).await,
            Some(_) => self.leave().await?,
            None => {}
        }

        let mut subscription = self.inner.transport.subscribe(&topic, &self.inner.client_id).await?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let pump_topic = topic.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = subscription.inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.dispatch(&message);
            }
            debug!(topic = %pump_topic, "presence pump stopped");
        });

        let previous = self.inner.joined().replace(Joined { topic: topic.clone(), pump });
        if let Some(previous) = previous {
            previous.pump.abort();
        }
        info!(client_id = %self.inner.client_id, %topic, "joined canvas");

        self.update(record).await
    }

    /// Re-publish the local presence record after a cursor or status change.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotSubscribed`] before `join`.
    pub async fn update(&self, record: PresenceRecord) -> Result<(), TransportError> {
        let topic = self.require_topic()?;
        self.inner.transport.track(&topic, &self.inner.client_id, record.clone()).await?;
        *self.inner.local() = Some(record);
        Ok(())
    }

    /// Broadcast a cursor position without re-tracking presence.
    ///
    /// Peers receive [`ChannelMessage::CursorMoved`] carrying the last
    /// published record with the new cursor.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotSubscribed`] before `join`.
    pub async fn move_cursor(&self, x: f64, y: f64) -> Result<(), TransportError> {
        let record = self.inner.local().clone().ok_or_else(|| self.not_subscribed())?.with_cursor(x, y);
        self.send(ChannelMessage::CursorMoved(record.clone())).await?;
        *self.inner.local() = Some(record);
        Ok(())
    }

    /// Leave the joined topic. No-op when not joined.
    ///
    /// # Errors
    ///
    /// Returns the transport error if unsubscribing fails.
    pub async fn leave(&self) -> Result<(), TransportError> {
        let Some(joined) = self.inner.joined().take() else {
            return Ok(());
        };
        joined.pump.abort();
        self.inner.presence().clear();
        *self.inner.local() = None;
        info!(client_id = %self.inner.client_id, topic = %joined.topic, "left canvas");
        self.inner.transport.unsubscribe(&joined.topic, &self.inner.client_id).await
    }

    /// Broadcast `message` to the other members of the joined topic.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotSubscribed`] before `join`.
    pub async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        let topic = self.require_topic()?;
        self.inner.transport.send(&topic, &self.inner.client_id, message).await
    }

    /// Register `callback` for every inbound message of `kind`.
    pub fn on(&self, kind: MessageKind, callback: impl Fn(&ChannelMessage) + Send + Sync + 'static) -> Listener {
        let mut listeners = self.inner.listeners();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.by_kind.entry(kind.clone()).or_default().push((id, Arc::new(callback)));
        Listener { kind, id }
    }

    /// Register `callback` for every aggregated membership change.
    pub fn on_presence_sync(&self, callback: impl Fn(&PresenceMap) + Send + Sync + 'static) -> Listener {
        self.on(MessageKind::PresenceSync, move |message| {
            if let ChannelMessage::PresenceSync(map) = message {
                callback(map);
            }
        })
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, listener: &Listener) -> bool {
        let mut listeners = self.inner.listeners();
        let Some(entries) = listeners.by_kind.get_mut(&listener.kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != listener.id);
        entries.len() != before
    }

    fn require_topic(&self) -> Result<String, TransportError> {
        self.inner.topic().ok_or_else(|| self.not_subscribed())
    }

    fn not_subscribed(&self) -> TransportError {
        TransportError::NotSubscribed { topic: String::new(), client_id: self.inner.client_id.clone() }
    }
}

#[async_trait]
impl DeltaSink for PresenceChannel {
    async fn publish(&self, delta: Vec<u8>) {
        let bytes = delta.len();
        if let Err(e) = self.send(ChannelMessage::AmChange(delta)).await {
            warn!(client_id = %self.inner.client_id, bytes, error = %e, "delta broadcast failed; peers will miss it");
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
