use crate::tasklet::TaskletState;
use std::sync::atomic::{AtomicI64, Ordering};

/// Per-state record counts, maintained by the scheduling policy.
///
/// Every successful status transition adjusts these through
/// [`StateCounters::transition`]; record creation and destruction go through
/// [`StateCounters::incr`] / [`StateCounters::decr`]. The invariant is that
/// under quiescence `count(s)` equals the number of records whose status
/// word carries state `s`.
#[derive(Debug, Default)]
pub struct StateCounters {
    counts: [AtomicI64; TaskletState::COUNT],
}

impl StateCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(&self, state: TaskletState) {
        self.counts[state as usize].fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decr(&self, state: TaskletState) {
        self.counts[state as usize].fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn transition(&self, from: TaskletState, to: TaskletState) {
        if from != to {
            self.decr(from);
            self.incr(to);
        }
    }

    /// Count of records in `state`. Asking for `Unknown` returns the total
    /// across all states, which is the count of all live records.
    pub fn count(&self, state: TaskletState) -> i64 {
        match state {
            TaskletState::Unknown => self
                .counts
                .iter()
                .map(|c| c.load(Ordering::SeqCst))
                .sum::<i64>(),
            s => self.counts[s as usize].load(Ordering::SeqCst),
        }
    }
}

/// A gauge readout registered by `install_counters`.
pub type Gauge = Box<dyn Fn() -> i64 + Send + Sync>;

/// Minimal registration surface for the embedder's performance-counter
/// plumbing. The manager registers named gauges here; sampling and export
/// stay with the embedder.
#[derive(Default)]
pub struct CounterRegistry {
    gauges: Vec<(String, Gauge)>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, gauge: Gauge) {
        self.gauges.push((name.into(), gauge));
    }

    pub fn sample(&self, name: &str) -> Option<i64> {
        self.gauges
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, g)| g())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.gauges.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.gauges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_moves_one_record_between_buckets() {
        let counters = StateCounters::new();
        counters.incr(TaskletState::Pending);
        counters.transition(TaskletState::Pending, TaskletState::Terminated);

        assert_eq!(counters.count(TaskletState::Pending), 0);
        assert_eq!(counters.count(TaskletState::Terminated), 1);
        assert_eq!(counters.count(TaskletState::Unknown), 1);
    }

    #[test]
    fn test_same_state_transition_is_a_noop() {
        let counters = StateCounters::new();
        counters.incr(TaskletState::Suspended);
        counters.transition(TaskletState::Suspended, TaskletState::Suspended);
        assert_eq!(counters.count(TaskletState::Suspended), 1);
    }

    #[test]
    fn test_registry_samples_by_name() {
        let mut registry = CounterRegistry::new();
        registry.register("threads/count/pending", Box::new(|| 3));

        assert_eq!(registry.sample("threads/count/pending"), Some(3));
        assert_eq!(registry.sample("threads/count/missing"), None);
        assert_eq!(registry.len(), 1);
    }
}
