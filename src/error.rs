use crate::manager::ManagerState;
use crate::tasklet::{TaskletId, TaskletState};
use thiserror::Error;

/// Errors surfaced by the thread manager.
///
/// Handle-accepting *read* operations never produce `UnknownTasklet`; they
/// convert a miss into the benign sentinels (`TaskletState::Unknown`,
/// `u64::MAX` phase, `"<unknown>"`, invalid gid/handle) so callers need not
/// distinguish "not found" from "no state".
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// The handle does not resolve to a live record.
    #[error("tasklet {0} is not known to the thread manager")]
    UnknownTasklet(TaskletId),

    /// The requested transition is not legal from the record's current
    /// state. The record is left untouched.
    #[error("invalid transition of tasklet {id}: {from:?} -> {to:?}")]
    InvalidStatus {
        id: TaskletId,
        from: TaskletState,
        to: TaskletState,
    },

    /// A caller-supplied argument is outside its domain (e.g. an initial
    /// state other than pending or suspended).
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The operation requires a manager lifecycle state it is not in.
    #[error("operation not permitted while the thread manager is {0:?}")]
    InvalidState(ManagerState),

    /// A worker kernel thread could not be created.
    #[error("failed to create worker thread: {0}")]
    ThreadResource(#[from] std::io::Error),

    /// A tasklet function panicked or yielded an illegal next state.
    #[error("tasklet {id} faulted: {reason}")]
    TaskletFault { id: TaskletId, reason: String },
}

impl Error {
    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::UnknownTasklet(_) => "unknown_tasklet",
            Error::InvalidStatus { .. } => "invalid_status",
            Error::BadParameter(_) => "bad_parameter",
            Error::InvalidState(_) => "invalid_state",
            Error::ThreadResource(_) => "thread_resource_error",
            Error::TaskletFault { .. } => "tasklet_fault",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
