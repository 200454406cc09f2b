//! Canvas model for the causal metrics map.
//!
//! This crate holds the pieces of the canvas that carry no I/O: the entity
//! model and in-memory store that edits are applied to, viewport math for the
//! two co-mounted rendering surfaces, and the state machine that decides which
//! surface and tool own the pointer. The sync layer (`canvas-sync`) builds
//! persistence, replication, and presence on top of these types.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`doc`] | Nodes, edges, groups, snapshots, and the [`doc::CanvasStore`] |
//! | [`camera`] | Viewport state, pan-sign mirroring, and coordinate conversions |
//! | [`environment`] | Practical/design environment and tool state machine |
//! | [`consts`] | Shared numeric constants (zoom limits, stroke defaults, etc.) |

pub mod camera;
pub mod consts;
pub mod doc;
pub mod environment;
