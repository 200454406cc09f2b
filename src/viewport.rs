//! Viewport sync bridge between the graph surface (A) and the drawing
//! surface (B).
//!
//! DESIGN
//! ======
//! Both surfaces emit "viewport moved" events, including for moves the
//! bridge itself caused. Relaying every event blindly would bounce each
//! change back and forth forever. Every successful sync is stamped with its
//! direction and time; a sync in one direction is dropped while the opposite
//! direction's last successful sync is younger than `window`.
//!
//! B uses inverted pan signs relative to A; zoom is shared as-is. Pushes
//! are always applied with zero duration.
//!
//! ERROR HANDLING
//! ==============
//! A surface that fails to report or accept a viewport is logged and the
//! tick is skipped. The next viewport movement retries naturally.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use canvas::camera::Viewport;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::scheduler::Scheduler;

#[derive(Debug, thiserror::Error)]
pub enum ViewportError {
    #[error("surface is not mounted")]
    Unmounted,
    #[error("surface rejected viewport: {0}")]
    Rejected(String),
    #[error("non-finite viewport {x}, {y} @ {zoom}")]
    NonFinite { x: f64, y: f64, zoom: f64 },
}

/// A rendering surface whose pan/zoom can be read and set.
pub trait ViewportSurface: Send + Sync {
    /// Current viewport in the surface's own sign convention.
    fn get_viewport(&self) -> Result<Viewport, ViewportError>;

    /// Move to `viewport` over `duration`.
    fn set_viewport(&self, viewport: Viewport, duration: Duration) -> Result<(), ViewportError>;
}

/// Which surface a sync reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    A,
    B,
}

impl SyncSource {
    fn opposite(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Direction and time of the most recent successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStamp {
    pub source: SyncSource,
    pub at_ms: i64,
}

/// Result of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// The target now shows this viewport (in the target's convention).
    Synced(Viewport),
    /// Target already showed the source's view; nothing pushed.
    Unchanged,
    /// Dropped as an echo of a sync in the opposite direction.
    Suppressed,
    /// A surface failed; see logs.
    Failed,
}

#[derive(Debug, Default)]
struct BridgeState {
    last_from_a: Option<i64>,
    last_from_b: Option<i64>,
    last: Option<SyncStamp>,
    suppressed: u64,
}

impl BridgeState {
    fn last_from(&self, source: SyncSource) -> Option<i64> {
        match source {
            SyncSource::A => self.last_from_a,
            SyncSource::B => self.last_from_b,
        }
    }

    fn stamp(&mut self, source: SyncSource, at_ms: i64) {
        match source {
            SyncSource::A => self.last_from_a = Some(at_ms),
            SyncSource::B => self.last_from_b = Some(at_ms),
        }
        self.last = Some(SyncStamp { source, at_ms });
    }
}

/// Keeps two surfaces showing the same region.
pub struct ViewportSyncBridge {
    a: Arc<dyn ViewportSurface>,
    b: Arc<dyn ViewportSurface>,
    scheduler: Arc<dyn Scheduler>,
    window: Duration,
    state: Mutex<BridgeState>,
}

impl std::fmt::Debug for ViewportSyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewportSyncBridge")
            .field("window", &self.window)
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

impl ViewportSyncBridge {
    #[must_use]
    pub fn new(
        a: Arc<dyn ViewportSurface>,
        b: Arc<dyn ViewportSurface>,
        scheduler: Arc<dyn Scheduler>,
        window: Duration,
    ) -> Self {
        Self { a, b, scheduler, window, state: Mutex::new(BridgeState::default()) }
    }

    #[must_use]
    pub fn from_config(
        a: Arc<dyn ViewportSurface>,
        b: Arc<dyn ViewportSurface>,
        scheduler: Arc<dyn Scheduler>,
        config: &SyncConfig,
    ) -> Self {
        Self::new(a, b, scheduler, config.viewport_sync_window)
    }

    /// Push A's viewport into B.
    pub fn sync_a_to_b(&self) -> SyncOutcome {
        self.sync(SyncSource::A)
    }

    /// Push B's viewport into A.
    pub fn sync_b_to_a(&self) -> SyncOutcome {
        self.sync(SyncSource::B)
    }

    /// Number of syncs dropped as echoes.
    #[must_use]
    pub fn suppressed_count(&self) -> u64 {
        self.state().suppressed
    }

    #[must_use]
    pub fn last_sync(&self) -> Option<SyncStamp> {
        self.state().last
    }

    fn sync(&self, source: SyncSource) -> SyncOutcome {
        let now = self.scheduler.now_ms();
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);

        {
            let mut state = self.state();
            if let Some(echo_of) = state.last_from(source.opposite()) {
                if now.saturating_sub(echo_of) < window_ms {
                    state.suppressed += 1;
                    let suppressed = state.suppressed;
                    drop(state);
                    debug!(?source, since_ms = now - echo_of, suppressed, "viewport sync suppressed as echo");
                    return SyncOutcome::Suppressed;
                }
            }
        }

        let (from, to) = match source {
            SyncSource::A => (&self.a, &self.b),
            SyncSource::B => (&self.b, &self.a),
        };

        let target = match from.get_viewport().and_then(checked) {
            Ok(viewport) => viewport.mirrored(),
            Err(e) => {
                warn!(?source, error = %e, "viewport read failed; skipping sync");
                return SyncOutcome::Failed;
            }
        };

        match to.get_viewport() {
            Ok(current) if current.approx_eq(&target) => return SyncOutcome::Unchanged,
            Ok(_) => {}
            Err(e) => debug!(?source, error = %e, "target viewport unreadable; pushing anyway"),
        }

        if let Err(e) = to.set_viewport(target, Duration::ZERO) {
            warn!(?source, error = %e, "viewport write failed; skipping sync");
            return SyncOutcome::Failed;
        }

        self.state().stamp(source, now);
        debug!(?source, x = target.x, y = target.y, zoom = target.zoom, "viewport synced");
        SyncOutcome::Synced(target)
    }

    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn checked(viewport: Viewport) -> Result<Viewport, ViewportError> {
    if viewport.x.is_finite() && viewport.y.is_finite() && viewport.zoom.is_finite() {
        Ok(viewport)
    } else {
        Err(ViewportError::NonFinite { x: viewport.x, y: viewport.y, zoom: viewport.zoom })
    }
}

#[cfg(test)]
#[path = "viewport_test.rs"]
mod tests;
