//! The manager facade: lifecycle, worker pool, the public tasklet API.

use crate::context;
use crate::counters::CounterRegistry;
use crate::error::{Error, Result};
use crate::policy::{NotificationPolicy, SchedulingPolicy};
use crate::tasklet::{
    Gid, InitData, Priority, TaskletId, TaskletState, TaskletStateEx,
};
use crate::timer::TimerPool;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

mod ticker;

mod worker;
use worker::StartupGate;

mod timed;
mod transition;


/// Description returned for handles that do not resolve.
const UNKNOWN_DESCRIPTION: &str = "<unknown>";

/// Lifecycle of the manager itself.
///
/// `run` is a one-shot: `Initializing -> Running` happens at most once.
/// `Suspended` is treated like `Running` by the worker loops (they keep
/// accepting work); `stop` drives `Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Initializing = 0,
    Running = 1,
    Suspended = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ManagerState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => ManagerState::Running,
            2 => ManagerState::Suspended,
            3 => ManagerState::Stopping,
            4 => ManagerState::Stopped,
            _ => ManagerState::Initializing,
        }
    }
}

/// Worker-pool knobs. The defaults fit tests and small embedders; real
/// deployments usually set a stack size.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Worker thread names are `"{prefix}-{index}"`.
    pub thread_name_prefix: String,

    /// Stack size for worker threads; platform default when `None`.
    pub thread_stack_size: Option<usize>,

    /// Recorded into each worker's thread-local context for NUMA-aware
    /// embedders; the core itself only stores and reports it.
    pub numa_sensitive: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            thread_name_prefix: "spindle-worker".to_string(),
            thread_stack_size: None,
            numa_sensitive: false,
        }
    }
}

/// Per-worker time accounting behind `avg_maint_ratio`.
#[derive(Debug, Default)]
struct WorkerTimes {
    exec_ns: AtomicU64,
    loop_ns: AtomicU64,
}

pub(crate) struct Core {
    state: AtomicU8,
    cfg: ManagerConfig,

    pub(crate) policy: Arc<dyn SchedulingPolicy>,
    pub(crate) notifier: Arc<dyn NotificationPolicy>,
    timer_pool: Arc<TimerPool>,

    /// Protects worker handles; taken only by lifecycle operations.
    lifecycle: Mutex<Vec<JoinHandle<()>>>,

    /// Sized when `run` succeeds.
    metrics: OnceLock<Vec<WorkerTimes>>,

    /// Armed timed transitions: wake-tasklet id -> triggered flag. The
    /// claimant (timer fire or cancel) removes the entry.
    pub(super) timers: DashMap<TaskletId, Arc<AtomicBool>>,

    /// Handed to shim and wake closures so a queued record never keeps the
    /// manager alive.
    pub(super) weak_self: Weak<Core>,
}

impl Core {
    pub(crate) fn state(&self) -> ManagerState {
        ManagerState::from_bits(self.state.load(Ordering::SeqCst))
    }

    fn set_state_raw(&self, state: ManagerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn try_begin_running(&self) -> bool {
        self.state
            .compare_exchange(
                ManagerState::Initializing as u8,
                ManagerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(super) fn numa_sensitive(&self) -> bool {
        self.cfg.numa_sensitive
    }

    pub(super) fn note_exec_time(&self, worker: usize, elapsed: Duration) {
        if let Some(metrics) = self.metrics.get() {
            metrics[worker]
                .exec_ns
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    pub(super) fn note_loop_time(&self, worker: usize, elapsed: Duration) {
        if let Some(metrics) = self.metrics.get() {
            metrics[worker]
                .loop_ns
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    pub(super) fn report_error(&self, worker: usize, error: &Error) {
        self.notifier.on_error(worker, error);
        self.policy.on_error(worker, error);
    }

    fn maint_ratio_of(&self, exec_ns: u64, loop_ns: u64) -> f64 {
        if loop_ns == 0 {
            0.0
        } else {
            (loop_ns.saturating_sub(exec_ns)) as f64 / loop_ns as f64
        }
    }
}

/// The user-space lightweight-task thread manager.
///
/// Owns a pool of worker kernel threads that cooperatively schedule
/// tasklets pulled from the injected [`SchedulingPolicy`]. Cheap to clone;
/// all clones drive the same pool.
#[derive(Clone)]
pub struct ThreadManager {
    core: Arc<Core>,
}

impl ThreadManager {
    pub fn new(
        timer_pool: Arc<TimerPool>,
        policy: Arc<dyn SchedulingPolicy>,
        notifier: Arc<dyn NotificationPolicy>,
    ) -> Self {
        Self::with_config(timer_pool, policy, notifier, ManagerConfig::default())
    }

    pub fn with_config(
        timer_pool: Arc<TimerPool>,
        policy: Arc<dyn SchedulingPolicy>,
        notifier: Arc<dyn NotificationPolicy>,
        cfg: ManagerConfig,
    ) -> Self {
        let core = Arc::new_cyclic(|weak_self| Core {
            state: AtomicU8::new(ManagerState::Initializing as u8),
            cfg,
            policy,
            notifier,
            timer_pool,
            lifecycle: Mutex::new(Vec::new()),
            metrics: OnceLock::new(),
            timers: DashMap::new(),
            weak_self: weak_self.clone(),
        });
        ThreadManager { core }
    }

    /// Start `num_workers` worker threads. One-shot: returns `Ok(false)`
    /// when the manager already left `Initializing`. Worker-creation
    /// failure unwinds the workers that did start and surfaces
    /// `ThreadResource`.
    pub fn run(&self, num_workers: usize) -> Result<bool> {
        if num_workers == 0 {
            return Err(Error::BadParameter("worker count cannot be 0".into()));
        }
        if num_workers != self.core.policy.worker_count() {
            return Err(Error::BadParameter(format!(
                "scheduling policy is sized for {} workers, not {num_workers}",
                self.core.policy.worker_count()
            )));
        }

        let mut handles = self.core.lifecycle.lock();
        if !self.core.try_begin_running() {
            return Ok(false);
        }

        let _ = self
            .core
            .metrics
            .set((0..num_workers).map(|_| WorkerTimes::default()).collect());

        let gate = Arc::new(StartupGate::new());
        for index in 0..num_workers {
            let mut builder =
                thread::Builder::new().name(format!("{}-{index}", self.core.cfg.thread_name_prefix));
            if let Some(stack_size) = self.core.cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let core = Arc::clone(&self.core);
            let worker_gate = Arc::clone(&gate);
            match builder.spawn(move || worker::worker_main(core, index, worker_gate)) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Unwind: tell the threads that did start to bail before
                    // entering their loops, then join them.
                    gate.release(false);
                    for handle in handles.drain(..) {
                        let _ = handle.join();
                    }
                    self.core.set_state_raw(ManagerState::Stopped);
                    tracing::warn!(worker = index, error = %e, "worker creation failed, run aborted");
                    return Err(Error::ThreadResource(e));
                }
            }
        }

        // Workers have registered their identity once they arrive; release
        // them into their loops together.
        gate.wait_arrivals(num_workers);
        gate.release(true);

        tracing::debug!(num_workers, "thread manager running");
        Ok(true)
    }

    /// Signal the workers to exit. With `blocking` the call also joins
    /// them and completes the transition to `Stopped`; without it, a later
    /// `stop(true)` finishes the job.
    ///
    /// Suspended tasklets are left as they are; call
    /// [`abort_all_suspended_threads`](Self::abort_all_suspended_threads)
    /// first for a draining shutdown.
    pub fn stop(&self, blocking: bool) {
        let mut handles = self.core.lifecycle.lock();

        match self.core.state() {
            ManagerState::Running | ManagerState::Suspended => {
                self.core.set_state_raw(ManagerState::Stopping);
                tracing::debug!("thread manager stopping");
                self.core.policy.notify_work_available(None);
            }
            ManagerState::Stopping => {}
            ManagerState::Initializing => {
                // Never ran; nothing to join.
                self.core.set_state_raw(ManagerState::Stopped);
                return;
            }
            ManagerState::Stopped => return,
        }

        if blocking {
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
            self.core.set_state_raw(ManagerState::Stopped);
            tracing::debug!("thread manager stopped");
        }
    }

    pub fn status(&self) -> ManagerState {
        self.core.state()
    }

    /// Number of worker kernel threads currently owned. Correct only while
    /// the manager is running.
    pub fn get_num_os_threads(&self) -> usize {
        self.core.lifecycle.lock().len()
    }

    /// Count of tasklets in `state`; `Unknown` counts all live records.
    pub fn get_thread_count(&self, state: TaskletState) -> i64 {
        self.core.policy.count(state)
    }

    pub fn abort_all_suspended_threads(&self) {
        self.core.policy.abort_all_suspended();
    }

    pub fn cleanup_terminated(&self) -> bool {
        self.core.policy.cleanup_terminated()
    }

    /// Materialize and (for pending) schedule a tasklet; returns its
    /// handle. `run_now` routes to the calling worker's local queue when
    /// invoked from a worker thread.
    pub fn register_thread(
        &self,
        init: InitData,
        initial_state: TaskletState,
        run_now: bool,
    ) -> Result<TaskletId> {
        self.check_accepting()?;
        Self::check_initial_state(initial_state)?;

        let priority = init.priority();
        let record = self.core.policy.create(init, initial_state);
        let id = record.id();

        if initial_state == TaskletState::Pending {
            let hint = if run_now { context::current_worker() } else { None };
            self.core.policy.enqueue(record, priority, hint);
        }
        Ok(id)
    }

    /// Deferred-instantiation registration: pending submissions are staged
    /// and reified by a worker before first execution; suspended ones are
    /// materialized immediately (a staged queue can never hand them out).
    /// No handle is returned.
    pub fn register_work(&self, init: InitData, initial_state: TaskletState) -> Result<()> {
        self.check_accepting()?;
        Self::check_initial_state(initial_state)?;

        match initial_state {
            TaskletState::Pending => self.core.policy.stage(init),
            _ => {
                self.core.policy.create(init, initial_state);
            }
        }
        Ok(())
    }

    /// Change the state of the tasklet behind `id`; returns the previous
    /// state (`Unknown` for a dead handle, `Active` when the transition
    /// was deferred behind a running invocation).
    pub fn set_state(
        &self,
        id: TaskletId,
        new_state: TaskletState,
        new_ex: TaskletStateEx,
        priority: Priority,
    ) -> Result<TaskletState> {
        self.core.set_state(id, new_state, new_ex, priority)
    }

    /// Arm a timed transition firing at `deadline`; returns the handle of
    /// the wake tasklet, usable with
    /// [`cancel_timed_transition`](Self::cancel_timed_transition).
    pub fn set_state_at(
        &self,
        deadline: std::time::Instant,
        id: TaskletId,
        new_state: TaskletState,
        new_ex: TaskletStateEx,
        priority: Priority,
    ) -> Result<TaskletId> {
        self.core
            .set_state_at(deadline, id, new_state, new_ex, priority)
    }

    /// Relative-deadline flavor; converted to an absolute deadline at
    /// arming time.
    pub fn set_state_after(
        &self,
        delay: Duration,
        id: TaskletId,
        new_state: TaskletState,
        new_ex: TaskletStateEx,
        priority: Priority,
    ) -> Result<TaskletId> {
        self.core.set_state_at(
            std::time::Instant::now() + delay,
            id,
            new_state,
            new_ex,
            priority,
        )
    }

    /// Revoke a timed transition before it fires. Returns whether the
    /// cancellation won; canceling an already-fired timer is a no-op.
    pub fn cancel_timed_transition(&self, timer: TaskletId) -> bool {
        self.core.cancel_timed(timer)
    }

    pub fn get_state(&self, id: TaskletId) -> TaskletState {
        self.core
            .policy
            .registry()
            .lookup(id)
            .map(|record| record.status().state)
            .unwrap_or(TaskletState::Unknown)
    }

    /// Phase of the tasklet, `u64::MAX` for a dead handle.
    pub fn get_phase(&self, id: TaskletId) -> u64 {
        self.core
            .policy
            .registry()
            .lookup(id)
            .map(|record| record.phase())
            .unwrap_or(u64::MAX)
    }

    pub fn get_description(&self, id: TaskletId) -> String {
        self.core
            .policy
            .registry()
            .lookup(id)
            .map(|record| record.description())
            .unwrap_or_else(|| UNKNOWN_DESCRIPTION.to_string())
    }

    pub fn set_description(&self, id: TaskletId, description: impl Into<String>) {
        if let Some(record) = self.core.policy.registry().lookup(id) {
            record.set_description(description);
        }
    }

    pub fn get_lco_description(&self, id: TaskletId) -> String {
        self.core
            .policy
            .registry()
            .lookup(id)
            .map(|record| record.lco_description())
            .unwrap_or_else(|| UNKNOWN_DESCRIPTION.to_string())
    }

    pub fn set_lco_description(&self, id: TaskletId, description: impl Into<String>) {
        if let Some(record) = self.core.policy.registry().lookup(id) {
            record.set_lco_description(description);
        }
    }

    pub fn get_thread_gid(&self, id: TaskletId) -> Gid {
        self.core
            .policy
            .registry()
            .lookup(id)
            .map(|record| record.gid())
            .unwrap_or_else(Gid::invalid)
    }

    /// Hint that more work is available. `None` hints globally; the policy
    /// decides whether that touches every worker or just wakes the pool.
    pub fn do_some_work(&self, worker_hint: Option<usize>) {
        self.core.policy.do_some_work(worker_hint);
    }

    /// Forward an error to both the notification and scheduling policies.
    pub fn report_error(&self, worker: usize, error: &Error) {
        self.core.report_error(worker, error);
    }

    /// Completed invocations, per worker or summed over the pool.
    pub fn get_executed_threads(&self, worker: Option<usize>) -> usize {
        match worker {
            Some(w) => self.core.policy.executed(w),
            None => (0..self.core.policy.worker_count())
                .map(|w| self.core.policy.executed(w))
                .sum(),
        }
    }

    /// Fraction of worker loop time spent outside tasklet execution
    /// (dequeueing, cleanup, parking), in `[0, 1]`. Zero before `run`.
    pub fn avg_maint_ratio(&self, worker: Option<usize>) -> f64 {
        let Some(metrics) = self.core.metrics.get() else {
            return 0.0;
        };
        match worker {
            Some(w) => {
                let times = &metrics[w];
                self.core.maint_ratio_of(
                    times.exec_ns.load(Ordering::Relaxed),
                    times.loop_ns.load(Ordering::Relaxed),
                )
            }
            None => {
                let exec: u64 = metrics.iter().map(|t| t.exec_ns.load(Ordering::Relaxed)).sum();
                let total: u64 = metrics.iter().map(|t| t.loop_ns.load(Ordering::Relaxed)).sum();
                self.core.maint_ratio_of(exec, total)
            }
        }
    }

    /// Register the manager's gauges: per-state counts, per-worker executed
    /// counts and maintenance ratios (permille).
    pub fn install_counters(&self, registry: &mut CounterRegistry) {
        const STATES: [(TaskletState, &str); 8] = [
            (TaskletState::Unknown, "all"),
            (TaskletState::Active, "active"),
            (TaskletState::Pending, "pending"),
            (TaskletState::Suspended, "suspended"),
            (TaskletState::Depleted, "depleted"),
            (TaskletState::Terminated, "terminated"),
            (TaskletState::Staged, "staged"),
            (TaskletState::Running, "running"),
        ];

        for (state, label) in STATES {
            let policy = Arc::clone(&self.core.policy);
            registry.register(
                format!("/threads/count/{label}"),
                Box::new(move || policy.count(state)),
            );
        }

        for worker in 0..self.core.policy.worker_count() {
            let policy = Arc::clone(&self.core.policy);
            registry.register(
                format!("/threads/executed/worker-{worker}"),
                Box::new(move || policy.executed(worker) as i64),
            );

            let weak = self.core.weak_self.clone();
            registry.register(
                format!("/threads/maint-ratio-permille/worker-{worker}"),
                Box::new(move || {
                    weak.upgrade()
                        .map(|core| {
                            let manager = ThreadManager { core };
                            (manager.avg_maint_ratio(Some(worker)) * 1000.0) as i64
                        })
                        .unwrap_or(0)
                }),
            );
        }
    }

    fn check_accepting(&self) -> Result<()> {
        match self.core.state() {
            ManagerState::Stopping | ManagerState::Stopped => {
                Err(Error::InvalidState(self.core.state()))
            }
            _ => Ok(()),
        }
    }

    fn check_initial_state(initial_state: TaskletState) -> Result<()> {
        match initial_state {
            TaskletState::Pending | TaskletState::Suspended => Ok(()),
            other => Err(Error::BadParameter(format!(
                "initial state must be pending or suspended, got {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadManager")
            .field("state", &self.status())
            .field("workers", &self.core.policy.worker_count())
            .finish_non_exhaustive()
    }
}
