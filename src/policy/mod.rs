//! The two pluggable contracts the manager consumes: scheduling and
//! notification. Policies are injected by the embedder; the manager holds
//! them behind trait objects so a policy can live in a different crate.

use crate::error::Error;
use crate::registry::Registry;
use crate::tasklet::{InitData, Priority, Tasklet, TaskletState};
use std::sync::Arc;

mod stealing;
pub use stealing::{StealingConfig, StealingPolicy};

/// The narrow contract between the manager core and any scheduling policy.
///
/// The policy owns the tasklet records, the queues, the termination queue,
/// the recycle pool, and the per-state/per-worker counters. Queue
/// discipline (priorities, stealing, affinity) is entirely the policy's
/// business.
pub trait SchedulingPolicy: Send + Sync {
    /// Number of workers this policy was sized for. `run` must be called
    /// with the same number.
    fn worker_count(&self) -> usize;

    /// The handle -> record map, loaned out for lookup.
    fn registry(&self) -> &Registry;

    /// Materialize a record in `initial_state`, drawing storage from the
    /// recycle pool when possible, and install it in the registry. Does
    /// not enqueue.
    fn create(&self, init: InitData, initial_state: TaskletState) -> Arc<Tasklet>;

    /// Queue a deferred-instantiation submission; a worker reifies it into
    /// a record before first execution.
    fn stage(&self, init: InitData);

    /// Make `record` eligible to run. `worker_hint` names the worker whose
    /// local queue should receive it; the hint is only honored when the
    /// call happens on that worker's thread.
    fn enqueue(&self, record: Arc<Tasklet>, priority: Priority, worker_hint: Option<usize>);

    /// Next runnable record for `worker`, if any. The caller must claim it
    /// with a pending -> running CAS and re-dequeue when the CAS loses.
    fn dequeue(&self, worker: usize) -> Option<Arc<Tasklet>>;

    /// Wake one idle worker (or all of them for `None`).
    fn notify_work_available(&self, worker_hint: Option<usize>);

    /// Park the calling worker until work may be available. Bounded wait;
    /// spurious returns are fine.
    fn idle_wait(&self, worker: usize);

    /// Move a finished record to the termination queue.
    fn schedule_terminated(&self, record: Arc<Tasklet>);

    /// Drain the termination queue, recycling or destroying records.
    /// Returns true when nothing is left to do.
    fn cleanup_terminated(&self) -> bool;

    /// Records currently in `state`; `Unknown` means all live records.
    fn count(&self, state: TaskletState) -> i64;

    /// Completed invocations on `worker`.
    fn executed(&self, worker: usize) -> usize;

    fn note_executed(&self, worker: usize);

    /// Retag every suspended record to (pending, abort) and enqueue it.
    fn abort_all_suspended(&self);

    /// Hint that more work is available; `None` hints globally.
    fn do_some_work(&self, worker_hint: Option<usize>);

    fn on_start_worker(&self, worker: usize);
    fn on_stop_worker(&self, worker: usize);
    fn on_error(&self, worker: usize, error: &Error);
}

/// Startup/shutdown/error callbacks, decoupled from scheduling.
pub trait NotificationPolicy: Send + Sync {
    fn on_start_thread(&self, worker: usize);
    fn on_stop_thread(&self, worker: usize);
    fn on_error(&self, worker: usize, error: &Error);
}

/// Notification policy that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl NotificationPolicy for NullNotifier {
    fn on_start_thread(&self, _worker: usize) {}
    fn on_stop_thread(&self, _worker: usize) {}
    fn on_error(&self, _worker: usize, _error: &Error) {}
}

/// Notification policy that traces every callback. Useful for demos and
/// for debugging worker lifecycles.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationPolicy for LogNotifier {
    fn on_start_thread(&self, worker: usize) {
        tracing::debug!(worker, "worker thread started");
    }

    fn on_stop_thread(&self, worker: usize) {
        tracing::debug!(worker, "worker thread stopped");
    }

    fn on_error(&self, worker: usize, error: &Error) {
        tracing::warn!(worker, label = error.as_label(), %error, "worker reported error");
    }
}
