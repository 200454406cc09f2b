//! CRDT replicator: low-latency convergent collaboration on top of autosave.
//!
//! DESIGN
//! ======
//! Each peer keeps a [`Document`] replica of the canvas. Local edits are
//! diffed against the replica into a [`Delta`], merged locally and handed to
//! a [`DeltaSink`] (normally the presence channel). Remote deltas are merged
//! on arrival. Because merge is a join on last-writer-wins registers,
//! replicas converge under duplicate and reordered delivery.
//!
//! The replica is additive. The persistence API stays the source of truth
//! for reloads; a peer that misses a delta is corrected by its next reload.
//!
//! ERROR HANDLING
//! ==============
//! Malformed deltas and deltas that arrive before `initialize_from` return a
//! [`ReplicationError`] and leave the replica untouched. The channel listener
//! installed by [`Replicator::listen`] logs and drops them.

pub mod document;
pub mod sanitize;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use canvas::doc::{CanvasSnapshot, DocError, EntityKind};
use frames::{ChannelMessage, MessageKind};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use document::{Delta, Document, EntityDelta, EntityReplica, Materialized, Register, Stamp};
pub use sanitize::{SanitizedSnapshot, sanitize_snapshot, sanitize_value};

use crate::presence::{Listener, PresenceChannel};

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("replica not initialized")]
    NotInitialized,
    #[error("malformed delta: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode delta: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Snapshot(#[from] DocError),
}

/// Where locally produced deltas go.
#[async_trait]
pub trait DeltaSink: Send + Sync {
    /// Ship a serialized delta to peers. Best effort; failures are the
    /// sink's to log.
    async fn publish(&self, delta: Vec<u8>);
}

#[derive(Debug, Default)]
struct ReplicaState {
    doc: Option<Document>,
    clock: u64,
}

/// One peer's replica plus the plumbing to exchange deltas.
pub struct Replicator {
    actor: Uuid,
    state: Mutex<ReplicaState>,
    sink: Option<Arc<dyn DeltaSink>>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("actor", &self.actor)
            .field("initialized", &self.is_initialized())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Replicator {
    /// Replicator publishing local deltas to `sink`.
    #[must_use]
    pub fn new(actor: Uuid, sink: Arc<dyn DeltaSink>) -> Self {
        Self { actor, state: Mutex::new(ReplicaState::default()), sink: Some(sink) }
    }

    /// Replicator that only returns local deltas to the caller.
    #[must_use]
    pub fn detached(actor: Uuid) -> Self {
        Self { actor, state: Mutex::new(ReplicaState::default()), sink: None }
    }

    #[must_use]
    pub fn actor(&self) -> Uuid {
        self.actor
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state().doc.is_some()
    }

    /// Reset the replica to `snapshot`. All registers get [`Stamp::ORIGIN`],
    /// so peers initializing from the same persisted snapshot start equal.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Snapshot`] if an entity cannot be serialized.
    pub fn initialize_from(&self, snapshot: &CanvasSnapshot) -> Result<(), ReplicationError> {
        let sanitized = sanitize_snapshot(snapshot)?;
        let mut doc = Document::default();
        for (kind, collection) in sanitized.collections {
            let entities = doc.entities.entry(kind).or_default();
            for (position, (id, payload)) in (0u64..).zip(collection) {
                entities.insert(id, EntityReplica::from_payload(&payload, position, Stamp::ORIGIN));
            }
        }

        let mut state = self.state();
        state.doc = Some(doc);
        info!(actor = %self.actor, entities = snapshot.len(), "replica initialized");
        Ok(())
    }

    /// Merge a delta received from a peer. Returns whether the replica changed.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NotInitialized`] before `initialize_from`
    /// and [`ReplicationError::Decode`] for malformed bytes. The replica is
    /// unchanged in both cases.
    pub fn apply_remote_delta(&self, bytes: &[u8]) -> Result<bool, ReplicationError> {
        let mut state = self.state();
        if state.doc.is_none() {
            return Err(ReplicationError::NotInitialized);
        }
        let delta: Delta = serde_json::from_slice(bytes).map_err(ReplicationError::Decode)?;
        let from = delta.actor;
        state.clock = state.clock.max(delta.max_counter());
        let changed = state.doc.as_mut().is_some_and(|doc| doc.merge(delta));
        debug!(actor = %self.actor, %from, changed, "remote delta applied");
        Ok(changed)
    }

    /// Diff `snapshot` against the replica, apply the difference locally and
    /// publish it. Returns the serialized delta, or `None` when nothing changed.
    ///
    /// `snapshot` must be the full canvas currently shown, not a partial one:
    /// entities missing from it are recorded as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NotInitialized`] before `initialize_from`.
    pub async fn record_local_mutation(&self, snapshot: &CanvasSnapshot) -> Result<Option<Vec<u8>>, ReplicationError> {
        let sanitized = sanitize_snapshot(snapshot)?;
        let bytes = {
            let mut state = self.state();
            let stamp = Stamp { counter: state.clock + 1, actor: self.actor };
            let Some(doc) = state.doc.as_mut() else {
                return Err(ReplicationError::NotInitialized);
            };

            let delta = diff(doc, &sanitized, stamp, self.actor);
            if delta.is_empty() {
                return Ok(None);
            }
            let bytes = serde_json::to_vec(&delta).map_err(ReplicationError::Encode)?;
            let touched = delta.entities.len();
            doc.merge(delta);
            state.clock = stamp.counter;
            debug!(actor = %self.actor, counter = stamp.counter, touched, bytes = bytes.len(), "local delta recorded");
            bytes
        };

        if let Some(sink) = &self.sink {
            sink.publish(bytes.clone()).await;
        }
        Ok(Some(bytes))
    }

    /// Copy of the full replica, deleted entities included.
    #[must_use]
    pub fn document(&self) -> Option<Document> {
        self.state().doc.clone()
    }

    /// Live entities as JSON in display order.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NotInitialized`] before `initialize_from`.
    pub fn materialize(&self) -> Result<Materialized, ReplicationError> {
        self.state()
            .doc
            .as_ref()
            .map(Document::materialize)
            .ok_or(ReplicationError::NotInitialized)
    }

    /// Decode the replica back into typed canvas entities. Entities whose
    /// merged fields no longer form a valid entity are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NotInitialized`] before `initialize_from`.
    pub fn to_snapshot(&self) -> Result<CanvasSnapshot, ReplicationError> {
        let materialized = self.materialize()?;
        Ok(CanvasSnapshot {
            nodes: decode_collection(EntityKind::Node, materialized.nodes),
            edges: decode_collection(EntityKind::Edge, materialized.edges),
            groups: decode_collection(EntityKind::Group, materialized.groups),
        })
    }

    /// Feed `AmChange` messages from `channel` into this replica.
    ///
    /// The listener holds a weak reference; dropping the replicator
    /// silences it.
    pub fn listen(self: &Arc<Self>, channel: &PresenceChannel) -> Listener {
        let weak: Weak<Self> = Arc::downgrade(self);
        channel.on(MessageKind::AmChange, move |message| {
            let (Some(replicator), ChannelMessage::AmChange(bytes)) = (weak.upgrade(), message) else {
                return;
            };
            if let Err(e) = replicator.apply_remote_delta(bytes) {
                warn!(actor = %replicator.actor, bytes = bytes.len(), error = %e, "dropping remote delta");
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, ReplicaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registers that must change for `doc` to show `next`, all written at `stamp`.
fn diff(doc: &Document, next: &SanitizedSnapshot, stamp: Stamp, actor: Uuid) -> Delta {
    let mut delta = Delta { actor, entities: Vec::new() };

    for (kind, collection) in &next.collections {
        let mut present = HashSet::with_capacity(collection.len());

        for (position, (id, payload)) in (0u64..).zip(collection) {
            present.insert(id.as_str());
            let current = doc.get(*kind, id);
            let mut state = EntityReplica::default();

            if !current.is_some_and(EntityReplica::is_alive) {
                state.alive = Some(Register::new(stamp, true));
            }
            if current.is_none_or(|e| e.position.is_none() || e.position() != position) {
                state.position = Some(Register::new(stamp, position));
            }
            for (field, value) in payload {
                if current.and_then(|e| e.field(field)) != Some(value) {
                    state.fields.insert(field.clone(), Register::new(stamp, value.clone()));
                }
            }
            // Fields that disappeared become explicit nulls.
            if let Some(current) = current {
                for (field, register) in &current.fields {
                    if !payload.contains_key(field) && !register.value.is_null() {
                        state.fields.insert(field.clone(), Register::new(stamp, Value::Null));
                    }
                }
            }

            if !state.is_empty() {
                delta.entities.push(EntityDelta { kind: *kind, id: id.clone(), state });
            }
        }

        if let Some(existing) = doc.entities.get(kind) {
            for (id, entity) in existing {
                if entity.is_alive() && !present.contains(id.as_str()) {
                    let state = EntityReplica { alive: Some(Register::new(stamp, false)), ..EntityReplica::default() };
                    delta.entities.push(EntityDelta { kind: *kind, id: id.clone(), state });
                }
            }
        }
    }

    delta
}

fn decode_collection<T: serde::de::DeserializeOwned>(kind: EntityKind, payloads: Vec<canvas::doc::Payload>) -> Vec<T> {
    payloads
        .into_iter()
        .filter_map(|payload| {
            let id = payload.get("id").and_then(Value::as_str).unwrap_or_default().to_owned();
            match serde_json::from_value(Value::Object(payload)) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!(kind = kind.as_str(), %id, error = %e, "replica entity no longer decodes; skipping");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
