//! In-process broadcast hub.
//!
//! Each subscriber gets a bounded mpsc channel. Fan-out uses `try_send` so a
//! slow consumer never stalls the sender; messages to a full channel are
//! dropped with a warning. A subscriber whose receiver is gone is pruned on
//! the next fan-out, and its presence is withdrawn with a fresh sync.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use frames::{ChannelMessage, PresenceMap, PresenceRecord};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::{BroadcastTransport, Subscription, TransportError};
use crate::config::DEFAULT_CHANNEL_CAPACITY;

struct Member {
    tx: mpsc::Sender<ChannelMessage>,
    presence: Option<PresenceRecord>,
}

/// Subscribers of one topic keyed by client id.
type Members = BTreeMap<String, Member>;

/// Shared pub/sub hub. Wrap in an `Arc` to share between clients.
pub struct MemoryHub {
    topics: Mutex<HashMap<String, Members>>,
    capacity: usize,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub")
            .field("capacity", &self.capacity)
            .field("topics", &self.topic_count())
            .finish()
    }
}

impl MemoryHub {
    /// Create a hub whose per-subscriber buffers hold `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { topics: Mutex::new(HashMap::new()), capacity: capacity.max(1) }
    }

    /// Current aggregated presence on `topic`.
    #[must_use]
    pub fn presence(&self, topic: &str) -> PresenceMap {
        self.topics().get(topic).map(aggregate).unwrap_or_default()
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics().get(topic).map_or(0, BTreeMap::len)
    }

    /// Per-subscriber buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics().len()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Members>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BroadcastTransport for MemoryHub {
    async fn subscribe(&self, topic: &str, client_id: &str) -> Result<Subscription, TransportError> {
        let mut topics = self.topics();
        let members = topics.entry(topic.to_owned()).or_default();
        if members.contains_key(client_id) {
            return Err(TransportError::AlreadySubscribed { topic: topic.to_owned(), client_id: client_id.to_owned() });
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        members.insert(client_id.to_owned(), Member { tx, presence: None });
        info!(%topic, %client_id, subscribers = members.len(), "client subscribed");

        Ok(Subscription { topic: topic.to_owned(), client_id: client_id.to_owned(), inbound: rx })
    }

    async fn send(&self, topic: &str, client_id: &str, message: ChannelMessage) -> Result<(), TransportError> {
        let mut topics = self.topics();
        let members = topics
            .get_mut(topic)
            .filter(|members| members.contains_key(client_id))
            .ok_or_else(|| TransportError::NotSubscribed { topic: topic.to_owned(), client_id: client_id.to_owned() })?;

        broadcast(topic, members, &message, Some(client_id));
        Ok(())
    }

    async fn track(&self, topic: &str, client_id: &str, record: PresenceRecord) -> Result<(), TransportError> {
        let mut topics = self.topics();
        let Some(members) = topics.get_mut(topic) else {
            return Err(TransportError::NotSubscribed { topic: topic.to_owned(), client_id: client_id.to_owned() });
        };
        let Some(member) = members.get_mut(client_id) else {
            return Err(TransportError::NotSubscribed { topic: topic.to_owned(), client_id: client_id.to_owned() });
        };

        member.presence = Some(record);
        let sync = ChannelMessage::PresenceSync(aggregate(members));
        broadcast(topic, members, &sync, None);
        if members.is_empty() {
            topics.remove(topic);
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, client_id: &str) -> Result<(), TransportError> {
        let mut topics = self.topics();
        let Some(members) = topics.get_mut(topic) else {
            return Ok(());
        };
        let Some(removed) = members.remove(client_id) else {
            return Ok(());
        };
        info!(%topic, %client_id, subscribers = members.len(), "client unsubscribed");

        if removed.presence.is_some() && !members.is_empty() {
            let sync = ChannelMessage::PresenceSync(aggregate(members));
            broadcast(topic, members, &sync, None);
        }
        if members.is_empty() {
            topics.remove(topic);
        }
        Ok(())
    }
}

fn aggregate(members: &Members) -> PresenceMap {
    let mut map = PresenceMap::new();
    for record in members.values().filter_map(|m| m.presence.as_ref()) {
        map.entry(record.user_id.clone()).or_default().push(record.clone());
    }
    map
}

/// Deliver `message`, then drop members whose receiver is gone. Losing a
/// tracked member triggers another presence sync to whoever remains.
fn broadcast(topic: &str, members: &mut Members, message: &ChannelMessage, exclude: Option<&str>) {
    let mut closed = fan_out(topic, members, message, exclude);
    while prune(topic, members, closed) && !members.is_empty() {
        let sync = ChannelMessage::PresenceSync(aggregate(members));
        closed = fan_out(topic, members, &sync, None);
    }
}

/// Remove `closed` members; true if any of them had tracked presence.
fn prune(topic: &str, members: &mut Members, closed: Vec<String>) -> bool {
    let mut lost_presence = false;
    for client_id in closed {
        if let Some(member) = members.remove(&client_id) {
            info!(%topic, %client_id, subscribers = members.len(), "pruned closed subscriber");
            lost_presence |= member.presence.is_some();
        }
    }
    lost_presence
}

fn fan_out(topic: &str, members: &Members, message: &ChannelMessage, exclude: Option<&str>) -> Vec<String> {
    let mut closed = Vec::new();
    for (client_id, member) in members {
        if exclude == Some(client_id.as_str()) {
            continue;
        }
        match member.tx.try_send(message.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%topic, %client_id, kind = ?message.kind(), "subscriber queue full; dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%topic, %client_id, "subscriber receiver dropped");
                closed.push(client_id.clone());
            }
        }
    }
    closed
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
