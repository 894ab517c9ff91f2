use crate::manager::{Core, ManagerState};
use bitflags::bitflags;

/// How many loop iterations between termination-queue drains. Workers also
/// drain when idle, so this only bounds staleness under sustained load.
#[cfg(not(test))]
const CLEANUP_INTERVAL: u32 = 61;

#[cfg(test)]
const CLEANUP_INTERVAL: u32 = 4; // make tests tick faster

#[derive(Debug)]
pub(super) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(super) fn new() -> Self {
        Self { tick: 0 }
    }

    /// One worker-loop iteration: bump the tick, derive the maintenance
    /// events the worker should act on this round.
    pub(super) fn tick(&mut self, core: &Core) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);

        // Fast-path to enforce shutdown.
        if !matches!(
            core.state(),
            ManagerState::Running | ManagerState::Suspended
        ) {
            return TickerEvents::SHUTDOWN;
        }

        let mut events = TickerEvents::empty();
        if self.tick % CLEANUP_INTERVAL == 0 {
            events.insert(TickerEvents::CLEANUP_TERMINATED);
        }
        events
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct TickerEvents: u8 {
        /// The manager left the running states; exit the loop.
        const SHUTDOWN = 1;

        /// Drain the termination queue this round.
        const CLEANUP_TERMINATED = 1 << 1;
    }
}
