use crate::tasklet::{Tasklet, TaskletId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Handle -> record map.
///
/// Records are owned by the scheduling policy; the registry loans shared
/// references out for lookup. A miss is not a failure: callers convert it
/// into the `unknown` sentinels of the read API.
///
/// Size is tracked separately because the map's own `len` iterates all
/// shards.
#[derive(Debug, Default)]
pub struct Registry {
    records: DashMap<TaskletId, Arc<Tasklet>>,
    size: AtomicUsize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: TaskletId) -> Option<Arc<Tasklet>> {
        self.records.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn insert(&self, record: Arc<Tasklet>) -> TaskletId {
        let id = record.id();
        if self.records.insert(id, record).is_none() {
            self.size.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    pub(crate) fn erase(&self, id: TaskletId) -> Option<Arc<Tasklet>> {
        self.records.remove(&id).map(|(_, record)| {
            self.size.fetch_sub(1, Ordering::Relaxed);
            record
        })
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every live record. Used by bulk operations such as
    /// abort-all-suspended; the closure must not re-enter the registry.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&Arc<Tasklet>)) {
        for entry in self.records.iter() {
            f(entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::StateCounters;
    use crate::tasklet::{InitData, TaskletState};

    fn record(counters: &Arc<StateCounters>) -> Arc<Tasklet> {
        Arc::new(Tasklet::new(
            InitData::new(|_| TaskletState::Terminated),
            TaskletState::Suspended,
            Arc::clone(counters),
        ))
    }

    #[test]
    fn test_insert_lookup_erase() {
        let counters = Arc::new(StateCounters::new());
        let registry = Registry::new();

        let id = registry.insert(record(&counters));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(id).is_some());

        assert!(registry.erase(id).is_some());
        assert_eq!(registry.len(), 0);
        assert!(registry.lookup(id).is_none());
        assert!(registry.erase(id).is_none());
    }

    #[test]
    fn test_unknown_handle_misses() {
        let registry = Registry::new();
        assert!(registry.lookup(TaskletId::INVALID).is_none());
    }
}
