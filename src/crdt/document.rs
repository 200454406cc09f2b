//! Replica state: last-writer-wins registers per entity field.
//!
//! DESIGN
//! ======
//! Every entity is an element of a map keyed by `(kind, id)`. An element
//! holds an `alive` register, a `position` register (its index in the
//! owning collection), and one register per JSON field. Each register keeps
//! the value written with the highest [`Stamp`].
//!
//! Merging two states takes the per-register maximum. That operation is
//! commutative, associative and idempotent, so replicas that have seen the
//! same set of deltas hold identical state whatever the delivery order and
//! however many duplicates arrived. A [`Delta`] is itself a partial state
//! and merges the same way.
//!
//! Registers are `Option`: `None` is the bottom of the lattice and loses to
//! any write.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use canvas::doc::{EntityId, EntityKind, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// STAMPS AND REGISTERS
// =============================================================================

/// Lamport timestamp. Ties on `counter` break on `actor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub actor: Uuid,
}

impl Stamp {
    /// Stamp of state loaded from the persisted snapshot. Every peer that
    /// initializes from the same snapshot writes identical origin registers.
    pub const ORIGIN: Self = Self { counter: 0, actor: Uuid::nil() };
}

/// A value and the stamp of the write that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Register<T> {
    pub stamp: Stamp,
    pub value: T,
}

impl<T: Serialize> Register<T> {
    #[must_use]
    pub fn new(stamp: Stamp, value: T) -> Self {
        Self { stamp, value }
    }

    /// Whether `self` beats `other`. Equal stamps only happen for origin
    /// writes from diverging snapshots; the serialized value decides those.
    fn beats(&self, other: &Self) -> bool {
        match self.stamp.cmp(&other.stamp) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => canonical(&self.value) > canonical(&other.value),
        }
    }
}

fn canonical<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Merge `incoming` into `slot`. Returns whether `slot` changed.
fn merge_register<T: Serialize>(slot: &mut Option<Register<T>>, incoming: Register<T>) -> bool {
    match slot {
        Some(current) if !incoming.beats(current) => false,
        _ => {
            *slot = Some(incoming);
            true
        }
    }
}

// =============================================================================
// ENTITY ELEMENT
// =============================================================================

/// Replicated state of one entity. Also used as the per-entity part of a
/// [`Delta`], where absent registers mean "not touched".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityReplica {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<Register<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Register<u64>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Register<Value>>,
}

impl EntityReplica {
    /// Entity as loaded from a snapshot at `position`.
    #[must_use]
    pub fn from_payload(payload: &Payload, position: u64, stamp: Stamp) -> Self {
        Self {
            alive: Some(Register::new(stamp, true)),
            position: Some(Register::new(stamp, position)),
            fields: payload
                .iter()
                .map(|(k, v)| (k.clone(), Register::new(stamp, v.clone())))
                .collect(),
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.as_ref().is_some_and(|r| r.value)
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.as_ref().map_or(0, |r| r.value)
    }

    /// Current field value, `None` if the field was never written.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).map(|r| &r.value)
    }

    /// Current fields as a JSON object. Explicit nulls are kept.
    #[must_use]
    pub fn payload(&self) -> Payload {
        self.fields.iter().map(|(k, r)| (k.clone(), r.value.clone())).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alive.is_none() && self.position.is_none() && self.fields.is_empty()
    }

    /// Highest counter of any register.
    #[must_use]
    pub fn max_counter(&self) -> u64 {
        let alive = self.alive.as_ref().map_or(0, |r| r.stamp.counter);
        let position = self.position.as_ref().map_or(0, |r| r.stamp.counter);
        let fields = self.fields.values().map(|r| r.stamp.counter).max().unwrap_or(0);
        alive.max(position).max(fields)
    }

    /// Merge another element of the same entity. Returns whether anything changed.
    pub fn merge(&mut self, other: Self) -> bool {
        let mut changed = false;
        if let Some(alive) = other.alive {
            changed |= merge_register(&mut self.alive, alive);
        }
        if let Some(position) = other.position {
            changed |= merge_register(&mut self.position, position);
        }
        for (name, register) in other.fields {
            match self.fields.entry(name) {
                Entry::Vacant(slot) => {
                    slot.insert(register);
                    changed = true;
                }
                Entry::Occupied(mut slot) => {
                    if register.beats(slot.get()) {
                        slot.insert(register);
                        changed = true;
                    }
                }
            }
        }
        changed
    }
}

// =============================================================================
// DOCUMENT
// =============================================================================

/// Full replica: every entity ever seen, live or deleted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub entities: BTreeMap<EntityKind, BTreeMap<EntityId, EntityReplica>>,
}

/// One entity's part of a [`Delta`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub kind: EntityKind,
    pub id: EntityId,
    #[serde(flatten)]
    pub state: EntityReplica,
}

/// Partial state exchanged between peers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub actor: Uuid,
    pub entities: Vec<EntityDelta>,
}

impl Delta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.iter().all(|e| e.state.is_empty())
    }

    #[must_use]
    pub fn max_counter(&self) -> u64 {
        self.entities.iter().map(|e| e.state.max_counter()).max().unwrap_or(0)
    }
}

/// Live entities of one collection in display order, as JSON objects.
pub type Collection = Vec<Payload>;

/// The replica as plain JSON, deleted entities removed.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Materialized {
    pub nodes: Collection,
    pub edges: Collection,
    pub groups: Collection,
}

impl Document {
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&EntityReplica> {
        self.entities.get(&kind).and_then(|c| c.get(id))
    }

    /// Live entities of `kind` ordered by `(position, id)`.
    #[must_use]
    pub fn live(&self, kind: EntityKind) -> Vec<(&EntityId, &EntityReplica)> {
        let mut live: Vec<_> = self
            .entities
            .get(&kind)
            .map(|c| c.iter().filter(|(_, e)| e.is_alive()).collect())
            .unwrap_or_default();
        live.sort_by(|(a_id, a), (b_id, b)| a.position().cmp(&b.position()).then_with(|| a_id.cmp(b_id)));
        live
    }

    /// Merge a delta. Returns whether the document changed.
    pub fn merge(&mut self, delta: Delta) -> bool {
        let mut changed = false;
        for EntityDelta { kind, id, state } in delta.entities {
            if state.is_empty() {
                continue;
            }
            changed |= self.entities.entry(kind).or_default().entry(id).or_default().merge(state);
        }
        changed
    }

    #[must_use]
    pub fn max_counter(&self) -> u64 {
        self.entities
            .values()
            .flat_map(BTreeMap::values)
            .map(EntityReplica::max_counter)
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn materialize(&self) -> Materialized {
        let collect = |kind: EntityKind| -> Collection { self.live(kind).into_iter().map(|(_, e)| e.payload()).collect() };
        Materialized {
            nodes: collect(EntityKind::Node),
            edges: collect(EntityKind::Edge),
            groups: collect(EntityKind::Group),
        }
    }
}

#[cfg(test)]
#[path = "document_test.rs"]
mod tests;
