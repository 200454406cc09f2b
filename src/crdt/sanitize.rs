//! Boundary normalization for values entering the replica.
//!
//! The replica cannot tell "never set" from "cleared". Before anything
//! crosses into it, optional fields are materialized as explicit `null`
//! (typed `Option`s already serialize that way) and null array members are
//! dropped, so two peers holding the same canvas always produce the same
//! registers.

use std::collections::HashMap;

use canvas::doc::{CanvasSnapshot, DocError, Entity, EntityId, EntityKind, Payload, to_payload};
use serde_json::Value;

/// Entities of one collection in snapshot order.
pub type SanitizedCollection = Vec<(EntityId, Payload)>;

/// A snapshot converted to replica-ready JSON, one collection per kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizedSnapshot {
    pub collections: Vec<(EntityKind, SanitizedCollection)>,
}

/// Recursively normalize a JSON value.
#[must_use]
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(sanitize_value)
                .collect(),
        ),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, sanitize_value(v))).collect()),
        other => other,
    }
}

/// Serialize and normalize one entity.
///
/// # Errors
///
/// Returns [`DocError::Serialize`] if the entity does not serialize to an object.
pub fn sanitize_entity<E: Entity>(entity: &E) -> Result<(EntityId, Payload), DocError> {
    let payload = to_payload(entity)?
        .into_iter()
        .map(|(k, v)| (k, sanitize_value(v)))
        .collect();
    Ok((entity.id().to_owned(), payload))
}

/// Normalize every entity of a snapshot, preserving collection order.
///
/// When an id appears twice in one collection the later entry wins and
/// takes the earlier one's place.
///
/// # Errors
///
/// Returns the first entity serialization failure.
pub fn sanitize_snapshot(snapshot: &CanvasSnapshot) -> Result<SanitizedSnapshot, DocError> {
    Ok(SanitizedSnapshot {
        collections: vec![
            (EntityKind::Node, sanitize_collection(&snapshot.nodes)?),
            (EntityKind::Edge, sanitize_collection(&snapshot.edges)?),
            (EntityKind::Group, sanitize_collection(&snapshot.groups)?),
        ],
    })
}

fn sanitize_collection<E: Entity>(entities: &[E]) -> Result<SanitizedCollection, DocError> {
    let mut out: SanitizedCollection = Vec::with_capacity(entities.len());
    let mut index: HashMap<EntityId, usize> = HashMap::with_capacity(entities.len());
    for entity in entities {
        let (id, payload) = sanitize_entity(entity)?;
        match index.get(&id) {
            Some(&at) => out[at].1 = payload,
            None => {
                index.insert(id.clone(), out.len());
                out.push((id, payload));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "sanitize_test.rs"]
mod tests;
