use crate::context;
use crate::error::Error;
use crate::manager::ticker::{Ticker, TickerEvents};
use crate::manager::Core;
use crate::tasklet::{Status, Tasklet, TaskletState, TaskletStateEx};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

/// Startup coordination: workers arrive, the manager releases them into
/// their loops once every spawn succeeded, or turns them back if one did
/// not. A plain barrier cannot express the failure path (it would strand
/// the workers that did start).
pub(super) struct StartupGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    arrived: usize,
    verdict: Option<bool>,
}

impl StartupGate {
    pub(super) fn new() -> Self {
        StartupGate {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    /// Worker side: report arrival, wait for the verdict. `false` means
    /// startup was aborted and the worker must exit without running.
    fn arrive_and_wait(&self) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        self.cv.notify_all();
        while state.verdict.is_none() {
            self.cv.wait(&mut state);
        }
        state.verdict.unwrap()
    }

    /// Manager side: block until `n` workers have arrived.
    pub(super) fn wait_arrivals(&self, n: usize) {
        let mut state = self.state.lock();
        while state.arrived < n {
            self.cv.wait(&mut state);
        }
    }

    pub(super) fn release(&self, ok: bool) {
        let mut state = self.state.lock();
        state.verdict = Some(ok);
        self.cv.notify_all();
    }
}

/// The per-worker execution loop (C4).
pub(super) fn worker_main(core: Arc<Core>, index: usize, gate: Arc<StartupGate>) {
    // Identity first: everything below may ask "which worker am I?".
    context::init_worker(index, core.numa_sensitive());

    if !gate.arrive_and_wait() {
        return;
    }

    core.policy.on_start_worker(index);
    core.notifier.on_start_thread(index);

    let mut ticker = Ticker::new();
    loop {
        let loop_started = Instant::now();

        let events = ticker.tick(&core);
        if events.contains(TickerEvents::SHUTDOWN) {
            break;
        }
        if events.contains(TickerEvents::CLEANUP_TERMINATED) {
            core.policy.cleanup_terminated();
        }

        match core.policy.dequeue(index) {
            Some(record) => run_one(&core, index, record),
            None => {
                // Idle point: reclaim before parking so terminated records
                // do not sit out a quiet period.
                core.policy.cleanup_terminated();
                core.policy.idle_wait(index);
            }
        }

        core.note_loop_time(index, loop_started.elapsed());
    }

    core.policy.on_stop_worker(index);
    core.notifier.on_stop_thread(index);

    // Final drain so records that terminated late are still reclaimed.
    core.policy.cleanup_terminated();
}

/// Claim, publish, invoke, retire: one slice of one tasklet.
fn run_one(core: &Core, worker: usize, record: Arc<Tasklet>) {
    // Claim. The record may have been transitioned while it sat in a
    // queue; a failed claim means this queue entry is stale and the worker
    // simply re-dequeues.
    let current = record.status();
    if current.state != TaskletState::Pending {
        return;
    }
    let claimed = current.with_state(TaskletState::Running);
    if record.transition(current, claimed).is_err() {
        return;
    }

    // Publish. External set_state defers against Running as well, so only
    // this worker ever moves the record out of Running.
    let active = claimed.with_state(TaskletState::Active);
    if record.transition(claimed, active).is_err() {
        unreachable!("claimed record mutated by another thread");
    }

    let exec_started = Instant::now();
    let outcome = record.invoke(active.state_ex);
    core.note_exec_time(worker, exec_started.elapsed());

    match outcome {
        Ok(next) if next.is_legal_yield() => retire(core, worker, record, active, next),
        Ok(illegal) => retire_faulted(
            core,
            worker,
            record,
            active,
            format!("yielded illegal next state {illegal:?}"),
        ),
        Err(fault) => retire_faulted(core, worker, record, active, fault.to_string()),
    }

    core.policy.note_executed(worker);
}

/// Honor the yielded next state. The extended state resets to signaled as
/// part of the exit transition.
fn retire(core: &Core, worker: usize, record: Arc<Tasklet>, active: Status, next: TaskletState) {
    match next {
        TaskletState::Pending => {
            exit_invocation(&record, active, TaskletState::Pending);
            let priority = active.priority;
            core.policy.enqueue(record, priority, Some(worker));
        }
        TaskletState::Suspended => {
            exit_invocation(&record, active, TaskletState::Suspended);
        }
        TaskletState::Terminated | TaskletState::Depleted => {
            exit_invocation(&record, active, TaskletState::Terminated);
            core.policy.schedule_terminated(record);
        }
        _ => unreachable!("checked by is_legal_yield"),
    }
}

fn retire_faulted(
    core: &Core,
    worker: usize,
    record: Arc<Tasklet>,
    active: Status,
    reason: String,
) {
    let error = Error::TaskletFault {
        id: record.id(),
        reason,
    };
    core.report_error(worker, &error);

    let aborted = Status::new(
        TaskletState::Terminated,
        TaskletStateEx::Abort,
        active.priority,
    );
    if record.transition(active, aborted).is_err() {
        record.set_status_atomic(aborted);
    }
    core.policy.schedule_terminated(record);
}

fn exit_invocation(record: &Tasklet, active: Status, next: TaskletState) {
    let exit = Status::new(next, TaskletStateEx::Signaled, active.priority);
    if record.transition(active, exit).is_err() {
        // Nothing else mutates an Active record; keep the counters honest
        // even if that ever changes.
        record.set_status_atomic(exit);
    }
}
