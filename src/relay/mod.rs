//! Relay server: hosts a [`MemoryHub`] behind a websocket so clients on
//! different machines share canvas topics.
//!
//! SYSTEM CONTEXT
//! ==============
//! `WsTransport` clients connect to `/ws` and speak protobuf frames. Each
//! connection may join many topics; the relay forwards hub traffic for those
//! topics back down the socket. `/healthz` reports liveness and, when a
//! database is configured, that it still answers.

pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::RelayConfig;
use crate::transport::MemoryHub;

/// Shared state for every relay connection.
#[derive(Clone, Debug)]
pub struct RelayState {
    pub hub: Arc<MemoryHub>,
    pub pool: Option<PgPool>,
}

impl RelayState {
    #[must_use]
    pub fn new(hub: Arc<MemoryHub>, pool: Option<PgPool>) -> Self {
        Self { hub, pool }
    }

    #[must_use]
    pub fn from_config(config: &RelayConfig, pool: Option<PgPool>) -> Self {
        Self::new(Arc::new(MemoryHub::new(config.channel_capacity)), pool)
    }
}

/// Build the relay router.
pub fn router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<RelayState>) -> StatusCode {
    let Some(pool) = &state.pool else {
        return StatusCode::OK;
    };
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "healthz: database unreachable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
