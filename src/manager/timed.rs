//! Timed state transitions (the timer service, C6).
//!
//! Arming registers a suspended *wake tasklet* that pins the target record
//! and carries the transition parameters. An atomic triggered flag decides,
//! race-free, whether the timer expiry or a cancellation gets to wake it:
//! the claim is `swap(true)`, and exactly one claimant transitions the wake
//! tasklet. Woken with `Timeout` it performs the real transition; woken
//! with `Canceled` it just retires. Either way it yields terminated and is
//! reclaimed like any other tasklet, releasing the pin on the target.

use crate::error::{Error, Result};
use crate::manager::Core;
use crate::tasklet::{InitData, Priority, Tasklet, TaskletId, TaskletState, TaskletStateEx};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

impl Core {
    pub(crate) fn set_state_at(
        &self,
        deadline: Instant,
        id: TaskletId,
        new_state: TaskletState,
        new_ex: TaskletStateEx,
        priority: Priority,
    ) -> Result<TaskletId> {
        // Same target-state domain as the immediate flavor; validate before
        // registering anything.
        let probe = self.set_state_probe(id, new_state)?;
        let target = match probe {
            Some(target) => target,
            // Dead handle: benign, nothing to arm.
            None => return Ok(TaskletId::INVALID),
        };

        let triggered = Arc::new(AtomicBool::new(false));

        // The closure holds the strong reference that keeps the target
        // alive until the timer fires or is canceled; the transition itself
        // still resolves through the registry so a target that terminated
        // meanwhile degrades to a no-op.
        let weak = self.weak_self.clone();
        let wake = InitData::new(move |ex| {
            if ex == TaskletStateEx::Timeout {
                if let Some(core) = weak.upgrade() {
                    let _ = core.set_state(target.id(), new_state, new_ex, priority);
                }
            }
            TaskletState::Terminated
        })
        .with_description(format!("timed set_state({new_state:?}) for tasklet {id}"))
        .with_priority(Priority::Boost);

        let wake_id = {
            let record = self.policy.create(wake, TaskletState::Suspended);
            record.id()
        };
        self.timers.insert(wake_id, Arc::clone(&triggered));

        let weak = self.weak_self.clone();
        self.timer_pool.arm(
            deadline,
            Box::new(move || {
                if triggered.swap(true, Ordering::SeqCst) {
                    // Canceled first; the flag handshake makes us a no-op.
                    return;
                }
                if let Some(core) = weak.upgrade() {
                    core.timers.remove(&wake_id);
                    let _ = core.set_state(
                        wake_id,
                        TaskletState::Pending,
                        TaskletStateEx::Timeout,
                        Priority::Boost,
                    );
                }
            }),
        );

        Ok(wake_id)
    }

    /// Revoke an armed timed transition. Returns whether the cancellation
    /// won the claim; losing (the timer already fired, or the handle is
    /// not an armed timer) is a no-op.
    pub(crate) fn cancel_timed(&self, timer: TaskletId) -> bool {
        let Some((_, triggered)) = self.timers.remove(&timer) else {
            return false;
        };
        if triggered.swap(true, Ordering::SeqCst) {
            return false;
        }

        let _ = self.set_state(
            timer,
            TaskletState::Pending,
            TaskletStateEx::Canceled,
            Priority::Boost,
        );
        true
    }

    /// Resolve and validate the target of a timed transition. `Ok(None)`
    /// is the benign unknown-handle result.
    fn set_state_probe(
        &self,
        id: TaskletId,
        new_state: TaskletState,
    ) -> Result<Option<Arc<Tasklet>>> {
        match new_state {
            TaskletState::Pending
            | TaskletState::Suspended
            | TaskletState::Terminated
            | TaskletState::Depleted => {}
            other => {
                return Err(Error::BadParameter(format!(
                    "cannot set a tasklet to {other:?}; only the owning worker produces that state"
                )))
            }
        }
        Ok(self.policy.registry().lookup(id))
    }
}
