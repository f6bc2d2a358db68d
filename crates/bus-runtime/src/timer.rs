//! Timer service for one-shot and recurring callbacks.
//!
//! Every component that needs deferred work receives a [`TimerService`]
//! instance at construction; nothing in the crate schedules through ambient
//! globals. Callbacks always run on a spawned task, never on the caller's
//! stack, and handles may be cancelled at any point: after the callback has
//! fired cancellation is a no-op, and concurrently with firing it is
//! best-effort (the callback may still run once).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(test)]
#[path = "timer_tests.rs"]
mod tests;

/// Whether a schedule fires once or repeats at a fixed period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Once,
    Repeating,
}

/// Cancellable handle for a scheduled callback
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the schedule. Safe to call repeatedly and after firing.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    /// Check whether the handle has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Shared-clock scheduler backed by the tokio runtime
#[derive(Debug, Default, Clone)]
pub struct TimerService;

impl TimerService {
    /// Create a new timer service
    pub fn new() -> Self {
        Self
    }

    /// Schedule `callback` to run after `delay`, once or repeatedly.
    ///
    /// The callback future is built fresh for each firing. The returned
    /// handle does not cancel on drop; cancellation is always explicit.
    pub fn schedule<F, Fut>(&self, delay: Duration, kind: TimerKind, callback: F) -> TimerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                callback().await;
                if kind == TimerKind::Once {
                    break;
                }
            }
        });

        TimerHandle { cancelled, task }
    }
}
