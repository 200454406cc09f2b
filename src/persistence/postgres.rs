//! Postgres-backed [`PersistenceApi`].
//!
//! Entities live in one `canvas_entities` table keyed by
//! `(canvas_id, kind, id)` with their fields in a JSONB `data` column.
//! Updates merge with `||`, matching the shallow-merge contract of the trait.

use async_trait::async_trait;
use canvas::doc::{CanvasSnapshot, EntityId, EntityKind, Payload};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{PersistenceApi, PersistenceError};

/// Persistence for one canvas.
#[derive(Debug, Clone)]
pub struct PgPersistence {
    pool: PgPool,
    canvas_id: Uuid,
}

impl PgPersistence {
    #[must_use]
    pub fn new(pool: PgPool, canvas_id: Uuid) -> Self {
        Self { pool, canvas_id }
    }

    #[must_use]
    pub fn canvas_id(&self) -> Uuid {
        self.canvas_id
    }

    /// Load every entity of the canvas.
    ///
    /// Rows that no longer deserialize into their entity type are skipped
    /// with a warning rather than failing the whole load.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub async fn load_snapshot(&self) -> Result<CanvasSnapshot, PersistenceError> {
        let rows = sqlx::query_as::<_, (String, String, Json<Value>)>(
            "SELECT kind, id, data
             FROM canvas_entities
             WHERE canvas_id = $1
             ORDER BY kind, id",
        )
        .bind(self.canvas_id)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = CanvasSnapshot::default();
        for (kind, id, Json(data)) in rows {
            let loaded = match kind.as_str() {
                "node" => serde_json::from_value(data).map(|n| snapshot.nodes.push(n)),
                "edge" => serde_json::from_value(data).map(|e| snapshot.edges.push(e)),
                "group" => serde_json::from_value(data).map(|g| snapshot.groups.push(g)),
                _ => {
                    warn!(canvas_id = %self.canvas_id, %kind, %id, "skipping row with unknown kind");
                    continue;
                }
            };
            if let Err(e) = loaded {
                warn!(canvas_id = %self.canvas_id, %kind, %id, error = %e, "skipping malformed entity row");
            }
        }

        info!(canvas_id = %self.canvas_id, entities = snapshot.len(), "canvas snapshot loaded");
        Ok(snapshot)
    }
}

#[async_trait]
impl PersistenceApi for PgPersistence {
    async fn create_entity(&self, kind: EntityKind, payload: &Payload) -> Result<EntityId, PersistenceError> {
        let id = match payload.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(other) => {
                return Err(PersistenceError::Validation(format!("entity id must be a non-empty string, got {other}")));
            }
            None => Uuid::new_v4().to_string(),
        };
        let mut data = payload.clone();
        data.insert("id".into(), Value::String(id.clone()));

        sqlx::query(
            "INSERT INTO canvas_entities (canvas_id, kind, id, data, updated_at) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (canvas_id, kind, id) DO UPDATE SET \
                 data = canvas_entities.data || EXCLUDED.data, updated_at = now()",
        )
        .bind(self.canvas_id)
        .bind(kind.as_str())
        .bind(&id)
        .bind(Json(&data))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn update_entity(&self, kind: EntityKind, id: &str, payload: &Payload) -> Result<(), PersistenceError> {
        let mut data = payload.clone();
        data.remove("id");

        let result = sqlx::query(
            "UPDATE canvas_entities SET data = data || $4, updated_at = now() \
             WHERE canvas_id = $1 AND kind = $2 AND id = $3",
        )
        .bind(self.canvas_id)
        .bind(kind.as_str())
        .bind(id)
        .bind(Json(&data))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::Validation(format!("{} {id} does not exist", kind.as_str())));
        }
        Ok(())
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM canvas_entities WHERE canvas_id = $1 AND kind = $2 AND id = $3")
            .bind(self.canvas_id)
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
