use crate::counters::StateCounters;
use crate::error::Error;
use crate::policy::SchedulingPolicy;
use crate::registry::Registry;
use crate::tasklet::{InitData, Priority, Status, Tasklet, TaskletState, TaskletStateEx};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::iter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// How long an idle worker parks before re-checking the queues on its own.
/// A bounded wait keeps a lost wakeup from turning into a hang; the real
/// wake path is `notify_work_available`.
const IDLE_PARK_TIMEOUT: Duration = Duration::from_millis(50);

/// Cap on the recycle pool, and with it on how much storage terminated
/// records may pin between cleanups.
const MAX_RECYCLED_RECORDS: usize = 256;

const MAX_STEAL_RETRIES: usize = 4;

/// Sizing and tuning knobs for [`StealingPolicy`]. Validated at
/// construction.
#[derive(Debug, Clone)]
pub struct StealingConfig {
    pub(crate) workers: usize,
    pub(crate) max_steal_retries: usize,
    pub(crate) max_recycled: usize,
    pub(crate) idle_park_timeout: Duration,
}

impl StealingConfig {
    #[track_caller]
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "worker count cannot be 0");
        StealingConfig {
            workers,
            max_steal_retries: MAX_STEAL_RETRIES,
            max_recycled: MAX_RECYCLED_RECORDS,
            idle_park_timeout: IDLE_PARK_TIMEOUT,
        }
    }

    pub fn max_steal_retries(mut self, val: usize) -> Self {
        self.max_steal_retries = val;
        self
    }

    pub fn max_recycled(mut self, val: usize) -> Self {
        self.max_recycled = val;
        self
    }

    pub fn idle_park_timeout(mut self, val: Duration) -> Self {
        self.idle_park_timeout = val;
        self
    }
}

/// Per-worker LIFO deque. The `crossbeam_deque::Worker` half is only ever
/// pushed/popped from its owning worker thread; everyone else goes through
/// the stealers.
struct LocalQueue {
    queue: WorkerQueue<Arc<Tasklet>>,

    /// The kernel thread this deque belongs to, recorded by the worker
    /// itself in `on_start_worker`. Enqueue hints are only honored when the
    /// calling thread is the recorded owner.
    owner: OnceLock<ThreadId>,
}

// Safety: we store the local queues in the shared policy so the owning
// worker can reach its own by index, but push/pop are only issued from that
// worker's thread (enforced by the recorded owner ThreadId).
unsafe impl Send for LocalQueue {}
unsafe impl Sync for LocalQueue {}

/// Work-stealing scheduling policy: per-worker LIFO deques fed from a
/// global FIFO injector, an express lane for high/boost work, a staged
/// queue for deferred instantiation, and a termination queue drained into
/// a bounded recycle pool.
pub struct StealingPolicy {
    cfg: StealingConfig,

    registry: Registry,
    counters: Arc<StateCounters>,

    /// High/Boost records. Polled before anything local so a boosted shim
    /// gets a worker as soon as one comes around.
    express: Injector<Arc<Tasklet>>,

    /// Normal/Low records and the overflow target for unhinted enqueues.
    injector: Injector<Arc<Tasklet>>,

    /// Deferred-instantiation submissions (`register_work`), reified by
    /// workers when no ready record exists.
    staged: Injector<InitData>,

    locals: Vec<LocalQueue>,

    /// Stealer handles onto all *other* workers' deques, pre-shuffled per
    /// worker so the search order differs across workers and contention on
    /// any single victim stays low.
    stealers: Vec<Vec<Stealer<Arc<Tasklet>>>>,

    /// Records that yielded terminated/depleted, awaiting reclamation.
    terminated: Injector<Arc<Tasklet>>,

    /// Reclaimed record storage, reused by the next registration.
    recycled: Mutex<Vec<Tasklet>>,

    executed: Vec<AtomicUsize>,

    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl StealingPolicy {
    pub fn new(cfg: StealingConfig) -> Self {
        let locals: Vec<_> = (0..cfg.workers)
            .map(|_| LocalQueue {
                queue: WorkerQueue::new_lifo(),
                owner: OnceLock::new(),
            })
            .collect();

        let stealers = (0..cfg.workers)
            .map(|i| {
                let mut others: Vec<_> = locals
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, local)| local.queue.stealer())
                    .collect();
                fastrand::shuffle(&mut others);
                others
            })
            .collect();

        let executed = (0..cfg.workers).map(|_| AtomicUsize::new(0)).collect();

        StealingPolicy {
            cfg,
            registry: Registry::new(),
            counters: Arc::new(StateCounters::new()),
            express: Injector::new(),
            injector: Injector::new(),
            staged: Injector::new(),
            locals,
            stealers,
            terminated: Injector::new(),
            recycled: Mutex::new(Vec::new()),
            executed,
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        }
    }

    pub fn counters(&self) -> &StateCounters {
        &self.counters
    }

    /// Pop reclaimed storage or allocate fresh.
    fn alloc_record(&self, init: InitData, initial_state: TaskletState) -> Arc<Tasklet> {
        if let Some(storage) = self.recycled.lock().pop() {
            storage.reinit(init, initial_state);
            return Arc::new(storage);
        }
        Arc::new(Tasklet::new(
            init,
            initial_state,
            Arc::clone(&self.counters),
        ))
    }

    /// Turn one staged submission into a pending record ready to claim.
    fn reify_staged(&self, init: InitData) -> Arc<Tasklet> {
        self.counters.decr(TaskletState::Staged);
        let record = self.alloc_record(init, TaskletState::Pending);
        self.registry.insert(Arc::clone(&record));
        record
    }

    fn steal_from_others(&self, worker: usize) -> Option<Arc<Tasklet>> {
        // Repeatedly try the other workers' deques; the collect returns the
        // first Success so we are not walking every stealer each round.
        iter::repeat_with(|| {
            self.stealers[worker]
                .iter()
                .map(|s| s.steal())
                .collect::<Steal<_>>()
        })
        .take(self.cfg.max_steal_retries)
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    }

    fn steal_until_settled<T>(injector: &Injector<T>) -> Option<T> {
        loop {
            match injector.steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    fn has_shared_work(&self) -> bool {
        !self.express.is_empty() || !self.injector.is_empty() || !self.staged.is_empty()
    }
}

impl SchedulingPolicy for StealingPolicy {
    fn worker_count(&self) -> usize {
        self.cfg.workers
    }

    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn create(&self, init: InitData, initial_state: TaskletState) -> Arc<Tasklet> {
        let record = self.alloc_record(init, initial_state);
        self.registry.insert(Arc::clone(&record));
        record
    }

    fn stage(&self, init: InitData) {
        self.counters.incr(TaskletState::Staged);
        self.staged.push(init);
        self.notify_work_available(None);
    }

    fn enqueue(&self, record: Arc<Tasklet>, priority: Priority, worker_hint: Option<usize>) {
        match priority {
            Priority::High | Priority::Boost => self.express.push(record),
            Priority::Normal | Priority::Low => {
                // The hint is only honored when we are already on the hinted
                // worker's thread; a local deque must not be pushed from
                // anywhere else.
                match worker_hint {
                    Some(w)
                        if w < self.locals.len()
                            && self.locals[w].owner.get().copied()
                                == Some(thread::current().id()) =>
                    {
                        self.locals[w].queue.push(record)
                    }
                    _ => self.injector.push(record),
                }
            }
        }
        self.notify_work_available(worker_hint);
    }

    fn dequeue(&self, worker: usize) -> Option<Arc<Tasklet>> {
        // 1. Express lane first: boosted transitions (shims, timer wakes)
        //    should not sit behind a deep local deque.
        if let Some(record) = Self::steal_until_settled(&self.express) {
            return Some(record);
        }

        // 2. Our own deque, LIFO for cache warmth.
        if let Some(record) = self.locals[worker].queue.pop() {
            return Some(record);
        }

        // 3. Global queue, batched into the local deque.
        if let Some(record) = Self::steal_batch(&self.injector, &self.locals[worker].queue) {
            return Some(record);
        }

        // 4. Rob the neighbours.
        if let Some(record) = self.steal_from_others(worker) {
            return Some(record);
        }

        // 5. Nothing ready anywhere: reify one staged submission.
        Self::steal_until_settled(&self.staged).map(|init| self.reify_staged(init))
    }

    fn notify_work_available(&self, worker_hint: Option<usize>) {
        match worker_hint {
            Some(_) => {
                self.idle_cv.notify_one();
            }
            None => {
                self.idle_cv.notify_all();
            }
        }
    }

    fn idle_wait(&self, _worker: usize) {
        let mut guard = self.idle_lock.lock();
        // Last look before sleeping; the bounded timeout covers the window
        // between this check and the wait.
        if self.has_shared_work() {
            return;
        }
        self.idle_cv
            .wait_for(&mut guard, self.cfg.idle_park_timeout);
    }

    fn schedule_terminated(&self, record: Arc<Tasklet>) {
        self.terminated.push(record);
    }

    fn cleanup_terminated(&self) -> bool {
        let mut reclaimed = 0usize;
        while let Some(record) = Self::steal_until_settled(&self.terminated) {
            self.registry.erase(record.id());

            // Release the function body now: closures may hold strong
            // references (a timer wake pins its target) that must not wait
            // for the storage itself to die.
            record.clear_func();
            self.counters.decr(TaskletState::Terminated);
            reclaimed += 1;

            match Arc::try_unwrap(record) {
                Ok(storage) => {
                    let mut pool = self.recycled.lock();
                    if pool.len() < self.cfg.max_recycled {
                        pool.push(storage);
                    }
                }
                // Someone still holds a reference (a caller-side handle
                // lookup, a pending timer). The storage goes away with the
                // last of those; the handle already resolves to unknown.
                Err(_) => {}
            }
        }

        if reclaimed > 0 {
            tracing::trace!(reclaimed, "terminated records reclaimed");
        }
        self.terminated.is_empty()
    }

    fn count(&self, state: TaskletState) -> i64 {
        self.counters.count(state)
    }

    fn executed(&self, worker: usize) -> usize {
        self.executed[worker].load(Ordering::Relaxed)
    }

    fn note_executed(&self, worker: usize) {
        self.executed[worker].fetch_add(1, Ordering::Relaxed);
    }

    fn abort_all_suspended(&self) {
        // Collect first, enqueue after: enqueue wakes workers and we do not
        // want them racing the registry sweep.
        let mut woken: SmallVec<[Arc<Tasklet>; 16]> = SmallVec::new();

        self.registry.for_each(|record| loop {
            let status = record.status();
            if status.state != TaskletState::Suspended {
                break;
            }
            let retagged = Status::new(
                TaskletState::Pending,
                TaskletStateEx::Abort,
                status.priority,
            );
            if record.transition(status, retagged).is_ok() {
                woken.push(Arc::clone(record));
                break;
            }
        });

        for record in woken {
            let priority = record.status().priority;
            self.enqueue(record, priority, None);
        }
        self.notify_work_available(None);
    }

    fn do_some_work(&self, worker_hint: Option<usize>) {
        self.notify_work_available(worker_hint);
    }

    fn on_start_worker(&self, worker: usize) {
        let _ = self.locals[worker].owner.set(thread::current().id());
        tracing::debug!(worker, "scheduling worker online");
    }

    fn on_stop_worker(&self, worker: usize) {
        tracing::debug!(
            worker,
            executed = self.executed(worker),
            "scheduling worker offline"
        );
    }

    fn on_error(&self, worker: usize, error: &Error) {
        tracing::warn!(worker, label = error.as_label(), "scheduler notified of error");
    }
}

impl StealingPolicy {
    fn steal_batch(
        injector: &Injector<Arc<Tasklet>>,
        local: &WorkerQueue<Arc<Tasklet>>,
    ) -> Option<Arc<Tasklet>> {
        loop {
            match injector.steal_batch_and_pop(local) {
                Steal::Success(record) => return Some(record),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(StealingPolicy: Send, Sync);

    fn policy(workers: usize) -> StealingPolicy {
        StealingPolicy::new(StealingConfig::new(workers))
    }

    fn noop_init() -> InitData {
        InitData::new(|_| TaskletState::Terminated)
    }

    #[test]
    fn test_create_registers_record() {
        let policy = policy(2);
        let record = policy.create(noop_init(), TaskletState::Suspended);

        assert!(policy.registry().lookup(record.id()).is_some());
        assert_eq!(policy.count(TaskletState::Suspended), 1);
        assert_eq!(policy.count(TaskletState::Unknown), 1);
    }

    #[test]
    fn test_boost_work_dequeues_before_normal() {
        let policy = policy(1);
        let normal = policy.create(noop_init(), TaskletState::Pending);
        let boosted = policy.create(
            noop_init().with_priority(Priority::Boost),
            TaskletState::Pending,
        );

        policy.enqueue(Arc::clone(&normal), Priority::Normal, None);
        policy.enqueue(Arc::clone(&boosted), Priority::Boost, None);

        let first = policy.dequeue(0).expect("two records queued");
        assert_eq!(first.id(), boosted.id());
        let second = policy.dequeue(0).expect("one record left");
        assert_eq!(second.id(), normal.id());
        assert!(policy.dequeue(0).is_none());
    }

    #[test]
    fn test_staged_submission_reified_on_dequeue() {
        let policy = policy(1);
        policy.stage(noop_init().with_description("staged"));
        assert_eq!(policy.count(TaskletState::Staged), 1);
        assert_eq!(policy.registry().len(), 0);

        let record = policy.dequeue(0).expect("staged work reified");
        assert_eq!(record.status().state, TaskletState::Pending);
        assert_eq!(record.description(), "staged");
        assert_eq!(policy.count(TaskletState::Staged), 0);
        assert!(policy.registry().lookup(record.id()).is_some());
    }

    #[test]
    fn test_cleanup_reclaims_and_recycles() {
        let policy = policy(1);
        let record = policy.create(noop_init(), TaskletState::Pending);
        let id = record.id();

        record.set_status_atomic(Status::new(
            TaskletState::Terminated,
            TaskletStateEx::Signaled,
            Priority::Normal,
        ));
        policy.schedule_terminated(record);

        assert!(policy.cleanup_terminated());
        assert!(policy.registry().lookup(id).is_none());
        assert_eq!(policy.count(TaskletState::Terminated), 0);

        // The reclaimed storage backs the next registration with a new id.
        let reused = policy.create(noop_init(), TaskletState::Pending);
        assert_ne!(reused.id(), id);
    }

    #[test]
    fn test_cleanup_leaves_shared_records_to_their_refs() {
        let policy = policy(1);
        let record = policy.create(noop_init(), TaskletState::Pending);
        let pinned = Arc::clone(&record);

        record.set_status_atomic(Status::new(
            TaskletState::Terminated,
            TaskletStateEx::Signaled,
            Priority::Normal,
        ));
        policy.schedule_terminated(record);
        assert!(policy.cleanup_terminated());

        // Not recycled while pinned, but gone from the registry.
        assert!(policy.registry().lookup(pinned.id()).is_none());
        assert!(policy.recycled.lock().is_empty());
    }

    #[test]
    fn test_abort_all_suspended_retags_and_enqueues() {
        let policy = policy(1);
        let suspended = policy.create(noop_init(), TaskletState::Suspended);
        let pending = policy.create(noop_init(), TaskletState::Pending);

        policy.abort_all_suspended();

        let status = suspended.status();
        assert_eq!(status.state, TaskletState::Pending);
        assert_eq!(status.state_ex, TaskletStateEx::Abort);

        // Untouched: it was not suspended.
        assert_eq!(pending.status().state_ex, TaskletStateEx::Signaled);

        // The retagged record is actually queued.
        let dequeued = policy.dequeue(0).expect("aborted record queued");
        assert_eq!(dequeued.id(), suspended.id());
    }
}
