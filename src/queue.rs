//! Change queue: one pending write per dirty entity.
//!
//! DESIGN
//! ======
//! Local mutations are recorded keyed by entity id. A second mutation of the
//! same entity merges into the first instead of appending, so a flush only
//! ever sends the latest merged state and intermediate payloads are never
//! persisted on their own.
//!
//! Each enqueue bumps a monotonically increasing revision. A flush works on a
//! snapshot and acknowledges entries by revision: if the entity was edited
//! again while its write was in flight, the entry survives for the next
//! flush.

use std::collections::BTreeMap;

use canvas::doc::{EntityId, EntityKind, Payload};
use serde::{Deserialize, Serialize};

/// Which persistence call a pending change maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    /// Kind of write left after `next` lands on top of `self`.
    fn merged_with(self, next: Self) -> Self {
        match (self, next) {
            (_, Self::Delete) => Self::Delete,
            (Self::Create, Self::Update) | (_, Self::Create) => Self::Create,
            (Self::Update | Self::Delete, Self::Update) => Self::Update,
        }
    }
}

/// The merged, not-yet-persisted state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub op: ChangeOp,
    /// Shallow-merged fields of every enqueue since the last successful flush.
    pub payload: Payload,
    /// Milliseconds since the Unix epoch of the most recent enqueue.
    pub queued_at: i64,
    /// Revision stamped by the most recent enqueue.
    pub revision: u64,
}

/// Pending changes keyed by entity id.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    entries: BTreeMap<EntityId, PendingChange>,
    next_revision: u64,
}

impl ChangeQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation, merging into any existing entry for the entity.
    /// Returns the revision now carried by the entry.
    pub fn enqueue(
        &mut self,
        entity_id: impl Into<EntityId>,
        entity_kind: EntityKind,
        op: ChangeOp,
        payload: Payload,
        now_ms: i64,
    ) -> u64 {
        self.next_revision += 1;
        let revision = self.next_revision;
        let entity_id = entity_id.into();

        match self.entries.get_mut(&entity_id) {
            Some(existing) => {
                let previous_op = existing.op;
                existing.op = previous_op.merged_with(op);
                existing.entity_kind = entity_kind;
                match op {
                    ChangeOp::Delete => existing.payload.clear(),
                    _ if previous_op == ChangeOp::Delete => existing.payload = payload,
                    _ => existing.payload.extend(payload),
                }
                existing.queued_at = now_ms;
                existing.revision = revision;
            }
            None => {
                let payload = if op == ChangeOp::Delete { Payload::new() } else { payload };
                self.entries.insert(
                    entity_id.clone(),
                    PendingChange { entity_id, entity_kind, op, payload, queued_at: now_ms, revision },
                );
            }
        }
        revision
    }

    /// Copy of every pending change, oldest enqueue first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingChange> {
        let mut changes: Vec<PendingChange> = self.entries.values().cloned().collect();
        changes.sort_by_key(|c| c.revision);
        changes
    }

    /// Mark `flushed` as persisted. The entry is removed only if nothing was
    /// enqueued for the entity since the snapshot was taken; returns whether
    /// it was removed.
    pub fn acknowledge(&mut self, flushed: &PendingChange) -> bool {
        let Some(current) = self.entries.get_mut(&flushed.entity_id) else {
            return false;
        };

        if current.revision == flushed.revision {
            self.entries.remove(&flushed.entity_id);
            return true;
        }

        // EDGE: the row now exists remotely; the newer edit must not re-create it.
        if flushed.op == ChangeOp::Create && current.op == ChangeOp::Create {
            current.op = ChangeOp::Update;
        }
        false
    }

    /// Drop a pending change without persisting it.
    pub fn discard(&mut self, entity_id: &str) -> Option<PendingChange> {
        self.entries.remove(entity_id)
    }

    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<&PendingChange> {
        self.entries.get(entity_id)
    }

    #[must_use]
    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries.contains_key(entity_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod tests;
