//! Cancellable deferred tasks and the clock they run against.
//!
//! DESIGN
//! ======
//! Components that debounce (auto-save) or compare timestamps (viewport
//! bridge) never touch `tokio::time` directly. They take an
//! `Arc<dyn Scheduler>` so production code runs on the tokio timer while
//! tests drive a [`ManualScheduler`] through virtual time.
//!
//! Cancellation is a flag checked when the delay elapses. A task that has
//! already started is never aborted mid-flight; cancelling it is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

/// Work to run once a delay elapses.
pub type Task = BoxFuture<'static, ()>;

/// Handle to a scheduled [`Task`].
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from starting. No effect once it has started.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Timer and clock source.
pub trait Scheduler: Send + Sync {
    /// Run `task` after `delay` unless the returned handle is cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;

    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

// =============================================================================
// TOKIO
// =============================================================================

/// Wall-clock scheduler backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let guard = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if guard.is_cancelled() {
                return;
            }
            task.await;
        });
        handle
    }

    fn now_ms(&self) -> i64 {
        frames::now_ms()
    }
}

// =============================================================================
// MANUAL
// =============================================================================

struct Pending {
    due: Duration,
    seq: u64,
    handle: TaskHandle,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    pending: Vec<Pending>,
}

/// Virtual-time scheduler. Nothing runs until [`ManualScheduler::advance`].
#[derive(Default)]
pub struct ManualScheduler {
    epoch_ms: i64,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the virtual clock at `epoch_ms` instead of zero.
    #[must_use]
    pub fn starting_at(epoch_ms: i64) -> Self {
        Self { epoch_ms, state: Mutex::new(ManualState::default()) }
    }

    /// Virtual time elapsed since construction.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.lock().now
    }

    /// Number of scheduled tasks that are neither cancelled nor started.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|p| !p.handle.is_cancelled())
            .count()
    }

    /// Move the clock forward by `by`, running every task that falls due, in
    /// due order. Tasks scheduled by running tasks also run if they fall due
    /// inside the window.
    pub async fn advance(&self, by: Duration) {
        let target = self.lock().now + by;
        while let Some(next) = self.pop_due(target) {
            if !next.handle.is_cancelled() {
                next.task.await;
            }
        }
        self.lock().now = target;
    }

    fn pop_due(&self, target: Duration) -> Option<Pending> {
        let mut state = self.lock();
        let index = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= target)
            .min_by_key(|(_, p)| (p.due, p.seq))
            .map(|(i, _)| i)?;
        let next = state.pending.swap_remove(index);
        state.now = state.now.max(next.due);
        Some(next)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.now + delay;
        state.pending.push(Pending { due, seq, handle: handle.clone(), task });
        handle
    }

    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.lock().now.as_millis()).unwrap_or(i64::MAX);
        self.epoch_ms.saturating_add(elapsed)
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod tests;
