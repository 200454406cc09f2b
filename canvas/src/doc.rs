//! Document model: metric nodes, causal edges, groups, and the in-memory store.
//!
//! This module defines what is on the canvas (`Node`, `Edge`, `Group`), the
//! full-canvas snapshot handed to the replicator (`CanvasSnapshot`), and the
//! runtime store that owns all live entities (`CanvasStore`).
//!
//! Optional fields serialize as explicit `null` rather than being omitted.
//! Downstream consumers (the CRDT replica in particular) have no notion of a
//! field that was never set, so the model never produces one.

#[cfg(test)]
#[path = "doc_test.rs"]
mod doc_test;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifier of a canvas entity as stored by the persistence API.
pub type EntityId = String;

/// A JSON object holding some or all fields of an entity.
pub type Payload = Map<String, Value>;

/// Which collection an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Node,
    Edge,
    Group,
}

impl EntityKind {
    /// Table-style name used by persistence adapters.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Edge => "edge",
            Self::Group => "group",
        }
    }
}

/// What a metric node represents on the causal map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A measured business metric.
    #[default]
    Metric,
    /// A lever the business controls that moves metrics.
    Driver,
    /// Free-standing annotation.
    Note,
}

/// A node on the causal map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: EntityId,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub label: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    /// Group this node is visually contained in, if any.
    #[serde(default)]
    pub group_id: Option<EntityId>,
    /// Open-ended per-node properties (owner, unit, tags, etc.).
    #[serde(default)]
    pub props: Value,
}

impl Node {
    /// Create a node with a fresh id at `(x, y)`.
    #[must_use]
    pub fn new(kind: NodeKind, label: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            x,
            y,
            width: None,
            height: None,
            group_id: None,
            props: Value::Object(Map::new()),
        }
    }
}

/// A causal relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EntityId,
    pub source: EntityId,
    pub target: EntityId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub props: Value,
}

impl Edge {
    #[must_use]
    pub fn new(source: impl Into<EntityId>, target: impl Into<EntityId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            label: None,
            props: Value::Object(Map::new()),
        }
    }
}

/// A named cluster of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: EntityId,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub node_ids: Vec<EntityId>,
    #[serde(default)]
    pub props: Value,
}

impl Group {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            node_ids: Vec::new(),
            props: Value::Object(Map::new()),
        }
    }
}

/// Common access to the three entity types.
pub trait Entity: Serialize + DeserializeOwned + Clone {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

impl Entity for Node {
    const KIND: EntityKind = EntityKind::Node;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Edge {
    const KIND: EntityKind = EntityKind::Edge;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Group {
    const KIND: EntityKind = EntityKind::Group;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Everything on one canvas at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl CanvasSnapshot {
    /// Total number of entities across all collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len() + self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Error returned by store mutations.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("{kind:?} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },
    #[error("patch for {kind:?} {id} produced an invalid entity: {source}")]
    InvalidPatch {
        kind: EntityKind,
        id: EntityId,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize {kind:?} {id}: {source}")]
    Serialize {
        kind: EntityKind,
        id: EntityId,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialize an entity into a JSON object payload.
///
/// # Errors
///
/// Returns [`DocError::Serialize`] if the entity does not serialize to an object.
pub fn to_payload<E: Entity>(entity: &E) -> Result<Payload, DocError> {
    let err = |source| DocError::Serialize { kind: E::KIND, id: entity.id().to_owned(), source };
    match serde_json::to_value(entity).map_err(err)? {
        Value::Object(map) => Ok(map),
        other => Err(err(serde::ser::Error::custom(format!("expected object, got {other}")))),
    }
}

/// In-memory store of canvas entities, one map per collection.
///
/// Iteration order is by id so snapshots are deterministic.
#[derive(Debug, Default)]
pub struct CanvasStore {
    nodes: BTreeMap<EntityId, Node>,
    edges: BTreeMap<EntityId, Edge>,
    groups: BTreeMap<EntityId, Group>,
}

impl CanvasStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all entities with a full snapshot.
    pub fn load_snapshot(&mut self, snapshot: CanvasSnapshot) {
        self.nodes = snapshot.nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        self.edges = snapshot.edges.into_iter().map(|e| (e.id.clone(), e)).collect();
        self.groups = snapshot.groups.into_iter().map(|g| (g.id.clone(), g)).collect();
    }

    /// Copy the current contents out as a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CanvasSnapshot {
        CanvasSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            groups: self.groups.values().cloned().collect(),
        }
    }

    pub fn upsert_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn upsert_edge(&mut self, edge: Edge) {
        self.edges.insert(edge.id.clone(), edge);
    }

    pub fn upsert_group(&mut self, group: Group) {
        self.groups.insert(group.id.clone(), group);
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    #[must_use]
    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// Whether an entity with this id exists in the given collection.
    #[must_use]
    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        match kind {
            EntityKind::Node => self.nodes.contains_key(id),
            EntityKind::Edge => self.edges.contains_key(id),
            EntityKind::Group => self.groups.contains_key(id),
        }
    }

    /// Remove an entity. Removing a node also drops edges attached to it and
    /// its membership in groups; the ids of removed edges are returned so the
    /// caller can queue their deletion too.
    pub fn remove(&mut self, kind: EntityKind, id: &str) -> Vec<EntityId> {
        match kind {
            EntityKind::Node => {
                if self.nodes.remove(id).is_none() {
                    return Vec::new();
                }
                let orphaned: Vec<EntityId> = self
                    .edges
                    .values()
                    .filter(|e| e.source == id || e.target == id)
                    .map(|e| e.id.clone())
                    .collect();
                for edge_id in &orphaned {
                    self.edges.remove(edge_id);
                }
                for group in self.groups.values_mut() {
                    group.node_ids.retain(|n| n != id);
                }
                orphaned
            }
            EntityKind::Edge => {
                self.edges.remove(id);
                Vec::new()
            }
            EntityKind::Group => {
                if self.groups.remove(id).is_some() {
                    for node in self.nodes.values_mut() {
                        if node.group_id.as_deref() == Some(id) {
                            node.group_id = None;
                        }
                    }
                }
                Vec::new()
            }
        }
    }

    /// Shallow-merge `patch` into an existing entity. Later fields win; the
    /// `id` field is never changed.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::NotFound`] if the entity is missing, or
    /// [`DocError::InvalidPatch`] if the merged object no longer matches the
    /// entity's shape (in which case the entity is left untouched).
    pub fn patch(&mut self, kind: EntityKind, id: &str, patch: &Payload) -> Result<(), DocError> {
        match kind {
            EntityKind::Node => patch_entity(&mut self.nodes, id, patch),
            EntityKind::Edge => patch_entity(&mut self.edges, id, patch),
            EntityKind::Group => patch_entity(&mut self.groups, id, patch),
        }
    }

    /// Number of entities across all collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len() + self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn patch_entity<E: Entity>(map: &mut BTreeMap<EntityId, E>, id: &str, patch: &Payload) -> Result<(), DocError> {
    let Some(current) = map.get(id) else {
        return Err(DocError::NotFound { kind: E::KIND, id: id.to_owned() });
    };

    let mut merged = to_payload(current)?;
    for (key, value) in patch {
        if key == "id" {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }

    let updated: E = serde_json::from_value(Value::Object(merged))
        .map_err(|source| DocError::InvalidPatch { kind: E::KIND, id: id.to_owned(), source })?;
    map.insert(id.to_owned(), updated);
    Ok(())
}
