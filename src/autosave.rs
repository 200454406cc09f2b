//! Auto-save controller: debounced flushing of the change queue.
//!
//! DESIGN
//! ======
//! Every accepted enqueue restarts a single debounce timer. When the canvas
//! goes quiet for `debounce`, the timer fires one [`AutoSaveController::flush_all`],
//! which issues one persistence call per pending entity. `save_now` skips
//! the wait.
//!
//! Only one flush runs at a time (`flush_gate`). A flush works on a snapshot
//! of the queue, so edits arriving while it is in flight stay queued and are
//! picked up by the next flush instead of being lost or sent half-merged.
//!
//! The controller ignores changes until [`AutoSaveController::hydrate`] is
//! called: the first batch of change notifications after mount is the store
//! being populated from the server, not user edits.
//!
//! ERROR HANDLING
//! ==============
//! A failed persistence call leaves its entry queued and records the error
//! message verbatim in `last_error`. A flush in which every call succeeds
//! clears `last_error`. Nothing is retried automatically; the next enqueue
//! or an explicit `save_now` retries.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use canvas::doc::{DocError, Entity, EntityKind, Payload, to_payload};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::persistence::{PersistenceApi, PersistenceError};
use crate::queue::{ChangeOp, ChangeQueue, PendingChange};
use crate::scheduler::{Scheduler, TaskHandle};

// =============================================================================
// TYPES
// =============================================================================

/// Snapshot of the save state, for a "Saving… / Saved / Failed" indicator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoSaveStatus {
    pub pending_count: usize,
    pub is_saving: bool,
    /// Milliseconds since the Unix epoch of the last flush that saved anything.
    pub last_saved_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub saved: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct SaveState {
    hydrated: bool,
    is_saving: bool,
    last_saved_at: Option<i64>,
    last_error: Option<String>,
}

struct Inner {
    queue: Mutex<ChangeQueue>,
    state: Mutex<SaveState>,
    timer: Mutex<Option<TaskHandle>>,
    flush_gate: tokio::sync::Mutex<()>,
    api: Arc<dyn PersistenceApi>,
    scheduler: Arc<dyn Scheduler>,
    debounce: Duration,
}

/// Debounced writer between local canvas edits and the persistence API.
///
/// Cheap to clone; clones share one queue and one timer.
#[derive(Clone)]
pub struct AutoSaveController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AutoSaveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSaveController")
            .field("debounce", &self.inner.debounce)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

impl AutoSaveController {
    #[must_use]
    pub fn new(api: Arc<dyn PersistenceApi>, scheduler: Arc<dyn Scheduler>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(ChangeQueue::new()),
                state: Mutex::new(SaveState::default()),
                timer: Mutex::new(None),
                flush_gate: tokio::sync::Mutex::new(()),
                api,
                scheduler,
                debounce,
            }),
        }
    }

    #[must_use]
    pub fn from_config(api: Arc<dyn PersistenceApi>, scheduler: Arc<dyn Scheduler>, config: &SyncConfig) -> Self {
        Self::new(api, scheduler, config.autosave_debounce)
    }

    /// Mark the initial server load as complete. Changes enqueued before
    /// this are ignored.
    pub fn hydrate(&self) {
        self.inner.state().hydrated = true;
        debug!("autosave hydrated");
    }

    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.inner.state().hydrated
    }

    /// Record a local mutation and restart the debounce timer.
    ///
    /// Returns `false` when the change was ignored because the controller
    /// has not been hydrated yet.
    pub fn enqueue(&self, entity_id: &str, kind: EntityKind, op: ChangeOp, payload: Payload) -> bool {
        if !self.is_hydrated() {
            warn!(entity_id, kind = kind.as_str(), ?op, "change reported before hydration; not queued");
            return false;
        }

        let now = self.inner.scheduler.now_ms();
        let revision = self.inner.queue().enqueue(entity_id, kind, op, payload, now);
        debug!(entity_id, kind = kind.as_str(), ?op, revision, "change queued");

        self.restart_timer();
        true
    }

    /// Enqueue the full current state of a typed entity.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::Serialize`] if the entity cannot be turned into a payload.
    pub fn enqueue_entity<E: Entity>(&self, entity: &E, op: ChangeOp) -> Result<bool, DocError> {
        let payload = to_payload(entity)?;
        Ok(self.enqueue(entity.id(), E::KIND, op, payload))
    }

    /// Drop a pending change without persisting it.
    pub fn discard(&self, entity_id: &str) -> bool {
        let removed = self.inner.queue().discard(entity_id).is_some();
        if removed {
            debug!(entity_id, "pending change discarded");
        }
        removed
    }

    /// Cancel the debounce timer and flush immediately.
    pub async fn save_now(&self) -> FlushReport {
        self.cancel_timer();
        self.flush_all().await
    }

    /// Cancel the debounce timer. Pending changes stay queued.
    pub fn dispose(&self) {
        self.cancel_timer();
        let pending = self.pending_count();
        if pending > 0 {
            warn!(pending, "autosave disposed with unsaved changes");
        }
    }

    /// Persist every pending change, one call per entity.
    ///
    /// Waits for any flush already in flight, then flushes whatever is
    /// queued at that point.
    pub async fn flush_all(&self) -> FlushReport {
        let _flushing = self.inner.flush_gate.lock().await;

        let batch = self.inner.queue().snapshot();
        if batch.is_empty() {
            return FlushReport::default();
        }

        self.inner.state().is_saving = true;
        let mut report = FlushReport { attempted: batch.len(), ..FlushReport::default() };
        let mut last_error = None;

        for change in &batch {
            match self.persist(change).await {
                Ok(()) => {
                    self.inner.queue().acknowledge(change);
                    report.saved += 1;
                }
                Err(e) => {
                    warn!(
                        entity_id = %change.entity_id,
                        kind = change.entity_kind.as_str(),
                        op = ?change.op,
                        retryable = e.is_retryable(),
                        error = %e,
                        "autosave write failed; change kept for retry"
                    );
                    last_error = Some(e.to_string());
                    report.failed += 1;
                }
            }
        }

        let now = self.inner.scheduler.now_ms();
        {
            let mut state = self.inner.state();
            state.is_saving = false;
            if report.saved > 0 {
                state.last_saved_at = Some(now);
            }
            state.last_error = last_error;
        }

        info!(attempted = report.attempted, saved = report.saved, failed = report.failed, "autosave flush complete");
        report
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    #[must_use]
    pub fn status(&self) -> AutoSaveStatus {
        let pending_count = self.pending_count();
        let state = self.inner.state();
        AutoSaveStatus {
            pending_count,
            is_saving: state.is_saving,
            last_saved_at: state.last_saved_at,
            last_error: state.last_error.clone(),
        }
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.inner.queue().is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queue().len()
    }

    #[must_use]
    pub fn pending(&self, entity_id: &str) -> Option<PendingChange> {
        self.inner.queue().get(entity_id).cloned()
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.inner.state().is_saving
    }

    #[must_use]
    pub fn last_saved(&self) -> Option<i64> {
        self.inner.state().last_saved_at
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.state().last_error.clone()
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    async fn persist(&self, change: &PendingChange) -> Result<(), PersistenceError> {
        let api = &self.inner.api;
        match change.op {
            ChangeOp::Create => {
                let mut payload = change.payload.clone();
                payload
                    .entry("id")
                    .or_insert_with(|| Value::String(change.entity_id.clone()));
                let assigned = api.create_entity(change.entity_kind, &payload).await?;
                if assigned != change.entity_id {
                    info!(entity_id = %change.entity_id, %assigned, "store assigned a different id");
                }
                Ok(())
            }
            ChangeOp::Update => {
                api.update_entity(change.entity_kind, &change.entity_id, &change.payload)
                    .await
            }
            ChangeOp::Delete => api.delete_entity(change.entity_kind, &change.entity_id).await,
        }
    }

    fn restart_timer(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                AutoSaveController { inner }.flush_all().await;
            }
        });
        let handle = self.inner.scheduler.schedule(self.inner.debounce, task);
        if let Some(previous) = self.inner.timer().replace(handle) {
            previous.cancel();
        }
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.inner.timer().take() {
            handle.cancel();
        }
    }
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, ChangeQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, SaveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer(&self) -> MutexGuard<'_, Option<TaskHandle>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "autosave_test.rs"]
mod tests;
