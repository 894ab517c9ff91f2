//! Deadline thread pool backing timed state transitions.
//!
//! The pool is a constructor parameter of the manager and may be shared
//! with other subsystems, so the manager never shuts it down; the embedder
//! owns its lifetime. Dropping the pool joins its threads.

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    /// Tie-break so that two entries with the same deadline fire in arming
    /// order.
    seq: u64,
    callback: Callback,
}

// BinaryHeap is a max-heap; invert the comparison to pop the earliest
// deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

/// A small pool of deadline-driver threads. Callbacks run on pool threads
/// and must not block for long; the manager only uses them to flip a
/// triggered flag and re-schedule a wake tasklet.
pub struct TimerPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TimerPool {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "timer pool needs at least one thread");

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        });

        let threads = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("spindle-timer-{i}"))
                    .spawn(move || timer_loop(shared))
                    .expect("failed to spawn timer thread")
            })
            .collect();

        TimerPool {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Arm `callback` to run at `deadline`. Deadlines in the past fire on
    /// the next pool iteration.
    pub fn arm(&self, deadline: Instant, callback: Callback) {
        let mut queue = self.shared.queue.lock();
        assert!(!queue.shutdown, "arming a timer on a stopped pool");

        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Entry {
            deadline,
            seq,
            callback,
        });
        drop(queue);

        // A new earliest deadline may have arrived; let a driver re-check.
        self.shared.wakeup.notify_one();
    }

    pub fn arm_after(&self, delay: Duration, callback: Callback) {
        self.arm(Instant::now() + delay, callback);
    }

    /// Stop accepting work, fire nothing further, join the drivers.
    /// Entries still in the heap are dropped unfired.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.wakeup.notify_all();

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }
}

impl Drop for TimerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<Shared>) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }

        // Collect everything due, run it outside the lock.
        let now = Instant::now();
        let mut due: SmallVec<[Callback; 8]> = SmallVec::new();
        while queue
            .heap
            .peek()
            .is_some_and(|entry| entry.deadline <= now)
        {
            due.push(queue.heap.pop().unwrap().callback);
        }

        if !due.is_empty() {
            drop(queue);
            for callback in due {
                callback();
            }
            queue = shared.queue.lock();
            continue;
        }

        match queue.heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                let _ = shared.wakeup.wait_for(&mut queue, timeout);
            }
            None => shared.wakeup.wait(&mut queue),
        }
    }
}
