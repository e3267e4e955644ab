use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use loom_core::ids::ThreadId;

/// Per-session critical sections. Threads never contend with each other;
/// all mutations of one thread's pointers run under that thread's mutex.
#[derive(Default)]
pub(crate) struct SessionLocks {
    locks: DashMap<ThreadId, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub(crate) fn get(&self, thread_id: &ThreadId) -> Arc<Mutex<()>> {
        self.locks
            .entry(thread_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(crate) fn forget(&self, thread_id: &ThreadId) {
        let _ = self.locks.remove(thread_id);
    }

    /// Drop the entry unless some caller still holds a handle to it.
    pub(crate) fn release_idle(&self, thread_id: &ThreadId) {
        let _ = self
            .locks
            .remove_if(thread_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}
