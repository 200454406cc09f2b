//! Shared numeric constants for the canvas crate.

// ── Viewport ────────────────────────────────────────────────────

/// Tolerance when comparing two viewports read back from different surfaces.
pub const VIEWPORT_EPSILON: f64 = 1e-6;

// ── Drawing ─────────────────────────────────────────────────────

/// Stroke color for freshly mounted design mode.
pub const DEFAULT_STROKE_COLOR: &str = "#1F1A17";

/// Stroke width in world units for freshly mounted design mode.
pub const DEFAULT_STROKE_WIDTH: f64 = 2.0;

/// Widest stroke the drawing surface accepts.
pub const MAX_STROKE_WIDTH: f64 = 64.0;
