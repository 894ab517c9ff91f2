use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle state of a tasklet.
///
/// `Running` is the claim step a worker takes when it pulls a record off a
/// queue; `Active` is published immediately afterwards and held for the
/// whole invocation. Both mean "a worker is inside this tasklet right now"
/// to every other thread, and external transitions against either are
/// deferred through a shim (see the transition engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskletState {
    Unknown = 0,
    Active = 1,
    Pending = 2,
    Suspended = 3,
    Depleted = 4,
    Terminated = 5,
    Staged = 6,
    Running = 7,
}

impl TaskletState {
    pub(crate) const COUNT: usize = 8;

    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => TaskletState::Active,
            2 => TaskletState::Pending,
            3 => TaskletState::Suspended,
            4 => TaskletState::Depleted,
            5 => TaskletState::Terminated,
            6 => TaskletState::Staged,
            7 => TaskletState::Running,
            _ => TaskletState::Unknown,
        }
    }

    /// A worker is inside the tasklet's function. External writers must not
    /// touch the status word while this holds.
    pub fn is_in_invocation(&self) -> bool {
        matches!(self, TaskletState::Active | TaskletState::Running)
    }

    /// Legal values for a tasklet function to yield.
    pub fn is_legal_yield(&self) -> bool {
        matches!(
            self,
            TaskletState::Pending
                | TaskletState::Suspended
                | TaskletState::Terminated
                | TaskletState::Depleted
        )
    }
}

/// The reason a tasklet was (re)awakened. Passed as the argument to the
/// tasklet function on its next invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskletStateEx {
    Unknown = 0,
    Signaled = 1,
    Timeout = 2,
    Terminate = 3,
    Abort = 4,
    Canceled = 5,
}

impl TaskletStateEx {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => TaskletStateEx::Signaled,
            2 => TaskletStateEx::Timeout,
            3 => TaskletStateEx::Terminate,
            4 => TaskletStateEx::Abort,
            5 => TaskletStateEx::Canceled,
            _ => TaskletStateEx::Unknown,
        }
    }
}

/// Scheduling hint. Higher priorities are preferred by the shipped policy;
/// no fairness beyond that is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Boost = 3,
}

impl Priority {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Priority::Low,
            2 => Priority::High,
            3 => Priority::Boost,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// One snapshot of the packed (state, extended state, priority) word.
///
/// Keeping all three in a single word is what lets a legal transition be
/// expressed as one compare-exchange: two successful external `set_state`
/// calls on the same record are totally ordered by their CASes and the
/// "previous state" each returns is consistent with that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: TaskletState,
    pub state_ex: TaskletStateEx,
    pub priority: Priority,
}

impl Status {
    pub fn new(state: TaskletState, state_ex: TaskletStateEx, priority: Priority) -> Self {
        Status {
            state,
            state_ex,
            priority,
        }
    }

    pub(crate) fn pack(&self) -> u32 {
        (self.state as u32) | ((self.state_ex as u32) << 8) | ((self.priority as u32) << 16)
    }

    pub(crate) fn unpack(bits: u32) -> Self {
        Status {
            state: TaskletState::from_bits(bits as u8),
            state_ex: TaskletStateEx::from_bits((bits >> 8) as u8),
            priority: Priority::from_bits((bits >> 16) as u8),
        }
    }

    pub(crate) fn with_state(self, state: TaskletState) -> Self {
        Status { state, ..self }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} ({:?})",
            self.state, self.state_ex, self.priority
        )
    }
}

/// The single atomic authority for a record's state, extended state and
/// priority. All mutation goes through [`AtomicStatus::cas`] or
/// [`AtomicStatus::swap`]; observers that only load may see any point in
/// the history.
#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU32);

impl AtomicStatus {
    pub(crate) fn new(status: Status) -> Self {
        AtomicStatus(AtomicU32::new(status.pack()))
    }

    pub(crate) fn load(&self) -> Status {
        Status::unpack(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, status: Status) {
        self.0.store(status.pack(), Ordering::SeqCst);
    }

    /// One attempt. Returns `Ok(current)` on success and `Err(observed)`
    /// when someone else won; the caller decides whether to retry.
    pub(crate) fn cas(&self, current: Status, new: Status) -> Result<Status, Status> {
        self.0
            .compare_exchange(
                current.pack(),
                new.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(Status::unpack)
            .map_err(Status::unpack)
    }

    pub(crate) fn swap(&self, new: Status) -> Status {
        Status::unpack(self.0.swap(new.pack(), Ordering::SeqCst))
    }
}
