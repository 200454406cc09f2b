//! Persistence API: the remote store the auto-save controller flushes into.
//!
//! DESIGN
//! ======
//! The controller only sees the [`PersistenceApi`] trait, so it can be
//! driven by Postgres in the relay, by an HTTP client in a UI host, or by a
//! recording mock in tests. One call per pending change; batching is left
//! to the implementation.
//!
//! ERROR HANDLING
//! ==============
//! Errors are classified as retryable or not. A failed change stays in the
//! queue regardless; the classification only feeds logging and the status
//! surfaced to the UI.

pub mod postgres;

use async_trait::async_trait;
use canvas::doc::{EntityId, EntityKind, Payload};

pub use postgres::PgPersistence;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The store could not be reached. Retrying later may succeed.
    #[error("network error: {0}")]
    Network(String),
    /// The store rejected the change as sent.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistenceError {
    /// Whether the same change may succeed if sent again unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Validation(_) => false,
            Self::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_)
            ),
        }
    }
}

/// Remote CRUD for canvas entities.
#[async_trait]
pub trait PersistenceApi: Send + Sync {
    /// Create an entity. `payload` carries the client-assigned `id`; the
    /// returned id is the one the store settled on.
    async fn create_entity(&self, kind: EntityKind, payload: &Payload) -> Result<EntityId, PersistenceError>;

    /// Shallow-merge `payload` into an existing entity.
    async fn update_entity(&self, kind: EntityKind, id: &str, payload: &Payload) -> Result<(), PersistenceError>;

    /// Delete an entity. Deleting a missing entity is not an error.
    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<(), PersistenceError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
