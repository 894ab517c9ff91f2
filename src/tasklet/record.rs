use crate::counters::StateCounters;
use crate::tasklet::id::{Gid, TaskletId};
use crate::tasklet::status::{AtomicStatus, Priority, Status, TaskletState, TaskletStateEx};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The function body of a tasklet.
///
/// Invoked with the extended state that caused the wakeup; yields the
/// desired next state, which must be one of pending, suspended, terminated
/// or depleted. `FnMut` because a tasklet is re-entered many times and may
/// carry state across invocations.
pub type TaskletFn = Box<dyn FnMut(TaskletStateEx) -> TaskletState + Send + 'static>;

/// Everything a submission carries before a record exists for it.
///
/// `register_work` keeps these staged until a worker reifies them;
/// `register_thread` materializes a record immediately.
pub struct InitData {
    pub(crate) func: TaskletFn,
    pub(crate) description: String,
    pub(crate) lco_description: String,
    pub(crate) priority: Priority,
    pub(crate) gid: Gid,
}

impl InitData {
    pub fn new<F>(func: F) -> Self
    where
        F: FnMut(TaskletStateEx) -> TaskletState + Send + 'static,
    {
        InitData {
            func: Box::new(func),
            description: String::new(),
            lco_description: String::new(),
            priority: Priority::Normal,
            gid: Gid::invalid(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_lco_description(mut self, description: impl Into<String>) -> Self {
        self.lco_description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_gid(mut self, gid: Gid) -> Self {
        self.gid = gid;
        self
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }
}

impl fmt::Debug for InitData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitData")
            .field("description", &self.description)
            .field("priority", &self.priority)
            .field("gid", &self.gid)
            .finish_non_exhaustive()
    }
}

/// Why an invocation did not produce a usable next state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InvokeFault {
    /// The function panicked; payload rendered best-effort.
    Panicked(String),
    /// The function slot was empty. Only possible for a record that was
    /// reclaimed out from under a stale queue entry, which the claim CAS
    /// already prevents; kept as a loud failure rather than a silent skip.
    MissingFunction,
}

impl fmt::Display for InvokeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeFault::Panicked(msg) => write!(f, "tasklet function panicked: {msg}"),
            InvokeFault::MissingFunction => write!(f, "tasklet has no function installed"),
        }
    }
}

/// One tasklet record.
///
/// All fields are interior-mutable so that reclaimed storage can be
/// reinitialized for a fresh registration without reallocating. The packed
/// status word is the single synchronization authority; everything else is
/// either owner-written (phase, function slot) or lock-protected metadata.
pub struct Tasklet {
    /// Reassigned on every (re)initialization, never reused.
    id: AtomicU64,

    status: AtomicStatus,

    /// Number of times the function has been entered. Monotone for the
    /// lifetime of one registration.
    phase: AtomicU64,

    /// Only the worker holding the record in Running/Active takes this
    /// lock, so it is never contended on the hot path.
    func: Mutex<Option<TaskletFn>>,

    description: Mutex<String>,
    lco_description: Mutex<String>,
    gid: Mutex<Gid>,

    /// Shared with the owning scheduling policy. Fusing counter updates
    /// into the transition helpers is what keeps invariant "counter ==
    /// records in state" true at every call site.
    counters: Arc<StateCounters>,
}

impl Tasklet {
    pub(crate) fn new(
        init: InitData,
        initial_state: TaskletState,
        counters: Arc<StateCounters>,
    ) -> Self {
        let record = Tasklet {
            id: AtomicU64::new(TaskletId::next().as_u64()),
            status: AtomicStatus::new(Status::new(
                initial_state,
                TaskletStateEx::Signaled,
                init.priority,
            )),
            phase: AtomicU64::new(0),
            func: Mutex::new(Some(init.func)),
            description: Mutex::new(init.description),
            lco_description: Mutex::new(init.lco_description),
            gid: Mutex::new(init.gid),
            counters,
        };
        record.counters.incr(initial_state);
        record
    }

    /// Reuse reclaimed storage for a fresh registration. The caller must
    /// hold the only reference (the recycle pool guarantees this).
    pub(crate) fn reinit(&self, init: InitData, initial_state: TaskletState) {
        self.id
            .store(TaskletId::next().as_u64(), Ordering::SeqCst);
        self.phase.store(0, Ordering::SeqCst);
        *self.func.lock() = Some(init.func);
        *self.description.lock() = init.description;
        *self.lco_description.lock() = init.lco_description;
        *self.gid.lock() = init.gid;
        self.status.store(Status::new(
            initial_state,
            TaskletStateEx::Signaled,
            init.priority,
        ));
        self.counters.incr(initial_state);
    }

    pub fn id(&self) -> TaskletId {
        TaskletId::from_raw(self.id.load(Ordering::SeqCst))
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    pub fn phase(&self) -> u64 {
        self.phase.load(Ordering::SeqCst)
    }

    pub fn gid(&self) -> Gid {
        *self.gid.lock()
    }

    pub fn description(&self) -> String {
        self.description.lock().clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self.description.lock() = description.into();
    }

    pub fn lco_description(&self) -> String {
        self.lco_description.lock().clone()
    }

    pub fn set_lco_description(&self, description: impl Into<String>) {
        *self.lco_description.lock() = description.into();
    }

    /// One CAS attempt on the packed word, with the per-state counters
    /// updated iff the CAS wins. Returns the previous status on success and
    /// the observed status on failure.
    pub(crate) fn transition(&self, expected: Status, new: Status) -> Result<Status, Status> {
        let prev = self.status.cas(expected, new)?;
        self.counters.transition(prev.state, new.state);
        Ok(prev)
    }

    /// Unconditional (state, ex, priority) replacement. Used only where the
    /// caller already owns the record exclusively.
    pub(crate) fn set_status_atomic(&self, new: Status) -> Status {
        let prev = self.status.swap(new);
        self.counters.transition(prev.state, new.state);
        prev
    }

    /// Enter the tasklet function once: bump the phase, run the body with
    /// `ex_in`, hand back the yielded next state. Panics are contained and
    /// reported as a fault; the caller owns the record in Active state for
    /// the whole call.
    pub(crate) fn invoke(&self, ex_in: TaskletStateEx) -> Result<TaskletState, InvokeFault> {
        self.phase.fetch_add(1, Ordering::SeqCst);

        let mut slot = self.func.lock();
        let func = match slot.as_mut() {
            Some(func) => func,
            None => return Err(InvokeFault::MissingFunction),
        };

        match panic::catch_unwind(AssertUnwindSafe(|| func(ex_in))) {
            Ok(next) => Ok(next),
            Err(payload) => Err(InvokeFault::Panicked(panic_message(payload))),
        }
    }

    /// Drop the function body early. Used when a record retires with
    /// outstanding external references so captured resources (e.g. the
    /// strong target reference inside a timer wake closure) are released
    /// without waiting for the storage itself to go away.
    pub(crate) fn clear_func(&self) {
        *self.func.lock() = None;
    }
}

impl fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasklet")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Tasklet: Send, Sync);

    fn pending_record(counters: &Arc<StateCounters>) -> Tasklet {
        Tasklet::new(
            InitData::new(|_| TaskletState::Terminated).with_description("test"),
            TaskletState::Pending,
            Arc::clone(counters),
        )
    }

    #[test]
    fn test_invoke_bumps_phase_and_yields() {
        let counters = Arc::new(StateCounters::new());
        let record = pending_record(&counters);

        assert_eq!(record.phase(), 0);
        let next = record.invoke(TaskletStateEx::Signaled);
        assert_eq!(next, Ok(TaskletState::Terminated));
        assert_eq!(record.phase(), 1);
    }

    #[test]
    fn test_invoke_contains_panics() {
        let counters = Arc::new(StateCounters::new());
        let record = Tasklet::new(
            InitData::new(|_| panic!("boom")),
            TaskletState::Pending,
            counters,
        );

        match record.invoke(TaskletStateEx::Signaled) {
            Err(InvokeFault::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected a contained panic, got {other:?}"),
        }
        // The phase still counts the entry.
        assert_eq!(record.phase(), 1);
    }

    #[test]
    fn test_transition_updates_counters() {
        let counters = Arc::new(StateCounters::new());
        let record = pending_record(&counters);
        assert_eq!(counters.count(TaskletState::Pending), 1);

        let prev = record
            .transition(
                record.status(),
                record.status().with_state(TaskletState::Suspended),
            )
            .expect("uncontended CAS");

        assert_eq!(prev.state, TaskletState::Pending);
        assert_eq!(counters.count(TaskletState::Pending), 0);
        assert_eq!(counters.count(TaskletState::Suspended), 1);
    }

    #[test]
    fn test_reinit_assigns_fresh_identity() {
        let counters = Arc::new(StateCounters::new());
        let record = pending_record(&counters);
        let first_id = record.id();

        record.set_status_atomic(Status::new(
            TaskletState::Terminated,
            TaskletStateEx::Signaled,
            Priority::Normal,
        ));
        counters.decr(TaskletState::Terminated); // simulate reclamation

        record.reinit(
            InitData::new(|_| TaskletState::Terminated),
            TaskletState::Suspended,
        );

        assert_ne!(record.id(), first_id);
        assert_eq!(record.phase(), 0);
        assert_eq!(record.status().state, TaskletState::Suspended);
        assert_eq!(counters.count(TaskletState::Suspended), 1);
    }
}
