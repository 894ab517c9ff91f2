//! Thread-local worker identity.
//!
//! Any code called from a worker thread can answer "which worker am I?" in
//! O(1) through this slot. It is initialized once, before the startup
//! barrier, and never changes for the lifetime of the thread.

use std::cell::OnceCell;
use std::thread_local;

#[derive(Debug, Clone, Copy)]
struct WorkerContext {
    index: usize,
    numa_sensitive: bool,
}

thread_local! {
    static CONTEXT: OnceCell<WorkerContext> = const { OnceCell::new() };
}

#[track_caller]
pub(crate) fn init_worker(index: usize, numa_sensitive: bool) {
    CONTEXT.with(|ctx| {
        let installed = ctx.set(WorkerContext {
            index,
            numa_sensitive,
        });
        assert!(installed.is_ok(), "worker context initialized twice");
    });
}

/// Index of the calling worker, or `None` when called from a thread the
/// manager does not own (the embedder's threads, timer threads).
pub fn current_worker() -> Option<usize> {
    CONTEXT.with(|ctx| ctx.get().map(|c| c.index))
}

/// Whether the calling worker was started NUMA-sensitive. `false` outside
/// of worker threads.
pub fn is_numa_sensitive() -> bool {
    CONTEXT.with(|ctx| ctx.get().map(|c| c.numa_sensitive).unwrap_or(false))
}
