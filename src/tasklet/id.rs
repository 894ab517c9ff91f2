use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque ID that uniquely identifies a tasklet relative to all other
/// tasklets ever registered with the manager.
///
/// Ids are never reused, even when the record storage behind them is
/// recycled: a reclaimed record gets a fresh id on its next registration.
/// This is what makes "the handle resolves to `unknown` after reclamation"
/// cheap to guarantee.
///
/// # Notes
///
/// - Tasklet IDs are sequential per process but carry no cross-process
///   meaning; use [`Gid`] for distributed naming.
/// - `TaskletId::INVALID` is reserved and returned wherever an operation
///   needs an "unknown tasklet" sentinel.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskletId(u64);

impl TaskletId {
    /// The reserved "no such tasklet" sentinel.
    pub const INVALID: TaskletId = TaskletId(0);

    pub(crate) fn next() -> Self {
        // Id 0 is reserved for INVALID.
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        // Safety margin: even at a billion registrations per second this
        // counter does not wrap within the lifetime of a process.
        TaskletId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        TaskletId(raw)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque external identity attached to a tasklet for distributed naming.
/// The manager only stores and returns it.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Gid(u128);

impl Gid {
    pub const fn new(raw: u128) -> Self {
        Gid(raw)
    }

    pub const fn invalid() -> Self {
        Gid(0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:032x}}}", self.0)
    }
}
