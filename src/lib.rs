//! # spindle
//!
//! A user-space lightweight-task thread manager: a population of
//! cooperatively scheduled tasklets multiplexed over a fixed pool of worker
//! kernel threads, with pluggable scheduling and notification policies.
//!
//! A tasklet is a function of its wakeup reason that yields its desired
//! next state. Workers pull runnable tasklets from the scheduling policy,
//! run one slice, and honor the yield; external state changes go through a
//! CAS-based transition engine that defers against currently-running
//! tasklets instead of blocking, and a timer service drives timed
//! transitions.
//!
//! ```no_run
//! use spindle::{
//!     InitData, NullNotifier, StealingConfig, StealingPolicy, TaskletState, ThreadManager,
//!     TimerPool,
//! };
//! use std::sync::Arc;
//!
//! let timer_pool = Arc::new(TimerPool::new(1));
//! let policy = Arc::new(StealingPolicy::new(StealingConfig::new(2)));
//! let manager = ThreadManager::new(timer_pool, policy, Arc::new(NullNotifier));
//!
//! manager.run(2).expect("worker startup");
//! manager
//!     .register_thread(
//!         InitData::new(|_| TaskletState::Terminated).with_description("hello"),
//!         TaskletState::Pending,
//!         true,
//!     )
//!     .expect("registration");
//! manager.stop(true);
//! ```

pub mod context;

mod counters;
pub use counters::{CounterRegistry, Gauge, StateCounters};

mod error;
pub use error::{Error, Result};

mod manager;
pub use manager::{ManagerConfig, ManagerState, ThreadManager};

mod policy;
pub use policy::{
    LogNotifier, NotificationPolicy, NullNotifier, SchedulingPolicy, StealingConfig,
    StealingPolicy,
};

mod registry;
pub use registry::Registry;

mod tasklet;
pub use tasklet::{
    Gid, InitData, Priority, Status, Tasklet, TaskletFn, TaskletId, TaskletState, TaskletStateEx,
};

mod timer;
pub use timer::TimerPool;
