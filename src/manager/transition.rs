//! The state-transition engine (set_state and the active-rendezvous shim).

use crate::context;
use crate::error::{Error, Result};
use crate::manager::Core;
use crate::tasklet::{
    InitData, Priority, Status, Tasklet, TaskletId, TaskletState, TaskletStateEx,
};
use std::sync::Arc;

impl Core {
    /// Change the state of the tasklet behind `id`.
    ///
    /// Returns the previous state. A dead handle is benign (`Unknown`, no
    /// side effect). A record observed mid-invocation is never mutated in
    /// place: a boost-priority shim re-attempts the transition after the
    /// subject yields, and the observed state is returned to the caller.
    pub(crate) fn set_state(
        &self,
        id: TaskletId,
        new_state: TaskletState,
        new_ex: TaskletStateEx,
        priority: Priority,
    ) -> Result<TaskletState> {
        check_target_state(id, new_state)?;

        let record = match self.policy.registry().lookup(id) {
            Some(record) => record,
            None => return Ok(TaskletState::Unknown),
        };

        loop {
            let current = record.status();

            // Mid-invocation rendezvous: the owning worker is inside the
            // function body. Queue the retry and report what we saw.
            if current.state.is_in_invocation() {
                self.defer_set_state(id, new_state, new_ex, priority);
                return Ok(current.state);
            }

            // Terminated is terminal for execution; only the degenerate
            // same-state call is tolerated.
            if current.state == TaskletState::Terminated && new_state != TaskletState::Terminated
            {
                return Err(Error::InvalidStatus {
                    id,
                    from: current.state,
                    to: new_state,
                });
            }

            let new = Status::new(new_state, new_ex, priority);
            match record.transition(current, new) {
                Ok(prev) => {
                    self.apply_transition_effects(&record, prev, new, priority);
                    return Ok(prev.state);
                }
                // Lost the word to a concurrent transition; re-derive.
                Err(_observed) => continue,
            }
        }
    }

    fn apply_transition_effects(
        &self,
        record: &Arc<Tasklet>,
        prev: Status,
        new: Status,
        priority: Priority,
    ) {
        if new.state == TaskletState::Pending && prev.state != TaskletState::Pending {
            self.policy
                .enqueue(Arc::clone(record), priority, context::current_worker());
        }
        if new.state == TaskletState::Terminated && prev.state != TaskletState::Terminated {
            self.policy.schedule_terminated(Arc::clone(record));
        }
    }

    /// Register the shim tasklet that retries the transition once the
    /// target has yielded. Boost priority so the retry does not sit behind
    /// a deep queue; Weak manager reference so a parked shim never keeps
    /// the manager alive.
    fn defer_set_state(
        &self,
        target: TaskletId,
        new_state: TaskletState,
        new_ex: TaskletStateEx,
        priority: Priority,
    ) {
        let weak = self.weak_self.clone();
        let shim = InitData::new(move |_ex| {
            if let Some(core) = weak.upgrade() {
                // Still active: set_state queues the next shim. A target
                // that terminated or was reclaimed meanwhile makes this a
                // no-op.
                let _ = core.set_state(target, new_state, new_ex, priority);
            }
            TaskletState::Terminated
        })
        .with_description(format!("set_state({new_state:?}) retry for tasklet {target}"))
        .with_priority(Priority::Boost);

        let record = self.policy.create(shim, TaskletState::Pending);
        self.policy.enqueue(record, Priority::Boost, None);
    }
}

fn check_target_state(_id: TaskletId, new_state: TaskletState) -> Result<()> {
    match new_state {
        TaskletState::Pending
        | TaskletState::Suspended
        | TaskletState::Terminated
        | TaskletState::Depleted => Ok(()),
        other => Err(Error::BadParameter(format!(
            "cannot set a tasklet to {other:?}; only the owning worker produces that state"
        ))),
    }
}
