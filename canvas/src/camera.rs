#[cfg(test)]
#[path = "camera_test.rs"]
mod camera_test;

use serde::{Deserialize, Serialize};

use crate::consts::VIEWPORT_EPSILON;

/// A point in either screen or world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Pan/zoom state of one rendering surface.
///
/// `x` / `y` are the pan offset in CSS pixels.
/// `zoom` is a scale factor (1.0 = no zoom).
///
/// The graph surface and the drawing surface use opposite signs on both pan
/// axes; [`Viewport::mirrored`] converts between them. Zoom is shared as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, zoom: 1.0 }
    }
}

impl Viewport {
    #[must_use]
    pub fn new(x: f64, y: f64, zoom: f64) -> Self {
        Self { x, y, zoom }
    }

    /// The same view expressed in the opposite pan-sign convention.
    #[must_use]
    pub fn mirrored(self) -> Self {
        Self { x: -self.x, y: -self.y, zoom: self.zoom }
    }

    /// Whether both views are equal within floating-point noise.
    #[must_use]
    pub fn approx_eq(&self, other: &Self) -> bool {
        (self.x - other.x).abs() < VIEWPORT_EPSILON
            && (self.y - other.y).abs() < VIEWPORT_EPSILON
            && (self.zoom - other.zoom).abs() < VIEWPORT_EPSILON
    }

    /// Convert a screen-space point (CSS pixels) to world coordinates.
    #[must_use]
    pub fn screen_to_world(&self, screen: Point) -> Point {
        Point {
            x: (screen.x - self.x) / self.zoom,
            y: (screen.y - self.y) / self.zoom,
        }
    }

    /// Convert a world-space point to screen coordinates (CSS pixels).
    #[must_use]
    pub fn world_to_screen(&self, world: Point) -> Point {
        Point {
            x: world.x * self.zoom + self.x,
            y: world.y * self.zoom + self.y,
        }
    }
}
