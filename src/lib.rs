//! Sync layer for the causal metrics canvas.
//!
//! Everything that moves canvas state between the local editor, the
//! database, and other collaborators lives here. Pure model types come from
//! the `canvas` crate; wire frames come from `frames`.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`queue`] | Per-entity change coalescing with revision-checked acknowledge |
//! | [`autosave`] | Debounced flush of the queue to a [`persistence::PersistenceApi`] |
//! | [`persistence`] | Persistence trait, error taxonomy, Postgres adapter |
//! | [`db`] | Pool setup and migrations |
//! | [`crdt`] | Replicated document, snapshot sanitization, delta exchange |
//! | [`transport`] | Topic pub/sub with presence (in-memory hub, websocket client) |
//! | [`presence`] | Canvas channel: presence, typed broadcast listeners |
//! | [`viewport`] | Two-surface viewport mirroring with echo suppression |
//! | [`scheduler`] | Injectable timers (tokio and virtual time) |
//! | [`relay`] | Websocket relay server hosting a shared hub |
//! | [`config`] | Environment-driven settings |

pub mod autosave;
pub mod config;
pub mod crdt;
pub mod db;
pub mod persistence;
pub mod presence;
pub mod queue;
pub mod relay;
pub mod scheduler;
pub mod transport;
pub mod viewport;
