// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The run queue: an ordered multiset of runnable executors keyed by
//! accumulated virtual runtime.
//!
//! Unlike this codebase's work-stealing local/injector queues, there is
//! exactly one `RunQueue`, shared by every worker, and it is never locked
//! on its own — callers hold `scheduler_mutex` for the duration of any
//! operation (spec.md §5). Ordering is a strict weak order: primary key
//! `virtual_runtime` ascending, tiebroken by executor id so two distinct
//! executors are never considered equal. Keys are captured at insertion
//! time and never touched while an executor sits in the queue — it is
//! admitted once (fixing its key), and its virtual runtime only changes
//! again once a worker binds it and time starts accruing.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::executor::Executor;

/// Ordering key: `virtual_runtime` primary, `id` tiebreak.
type Key = (i64, u64);

/// The scheduler's single run queue.
#[derive(Default)]
pub struct RunQueue {
    entries: BTreeMap<Key, Arc<dyn Executor>>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert an executor, keyed by its virtual runtime at this instant.
    pub fn insert(&mut self, executor: Arc<dyn Executor>) {
        let key = (executor.scheduling().virtual_runtime(), executor.id());
        self.entries.insert(key, executor);
    }

    /// Remove and return the executor with the smallest virtual runtime.
    ///
    /// Clears `on_queue` — per spec.md §3 it is flipped true by admission
    /// and false exactly when popped, so it always agrees with RunQueue
    /// membership (invariant 2).
    pub fn pop_min(&mut self) -> Option<Arc<dyn Executor>> {
        self.entries.pop_first().map(|(_, v)| {
            v.scheduling().set_on_queue(false);
            v
        })
    }

    /// The smallest virtual runtime currently queued, if any.
    pub fn min(&self) -> Option<i64> {
        self.entries.keys().next().map(|(vr, _)| *vr)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every pending executor (spec.md §4.4 step 2: "pending
    /// executors will not run"). Clears `on_queue` on each for the same
    /// reason `pop_min` does.
    pub fn clear(&mut self) -> Vec<Arc<dyn Executor>> {
        let drained: Vec<_> = std::mem::take(&mut self.entries).into_values().collect();
        for executor in &drained {
            executor.scheduling().set_on_queue(false);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SchedulingCell;
    use crate::timeout::TimeoutState;
    use std::fmt;

    struct StubExecutor {
        id: u64,
        scheduling: SchedulingCell,
        timeout: TimeoutState,
    }

    impl StubExecutor {
        fn new(id: u64, virtual_runtime: i64) -> Arc<Self> {
            let s = Arc::new(Self {
                id,
                scheduling: SchedulingCell::new(),
                timeout: TimeoutState::new(),
            });
            s.scheduling.set_virtual_runtime(virtual_runtime);
            s
        }
    }

    impl Executor for StubExecutor {
        fn id(&self) -> u64 {
            self.id
        }
        fn scheduling(&self) -> &SchedulingCell {
            &self.scheduling
        }
        fn timeout(&self) -> &TimeoutState {
            &self.timeout
        }
        fn before_work(&self) {}
        fn work(&self) {}
        fn after_work(&self) -> bool {
            false
        }
        fn abort(&self) {}
        fn fast_fail(&self) {}
        fn print_state(&self, _sink: &mut dyn fmt::Write) {}
    }

    #[test]
    fn pop_min_returns_smallest_virtual_runtime() {
        let mut q = RunQueue::new();
        q.insert(StubExecutor::new(1, 300));
        q.insert(StubExecutor::new(2, 100));
        q.insert(StubExecutor::new(3, 200));

        assert_eq!(q.pop_min().unwrap().id(), 2);
        assert_eq!(q.pop_min().unwrap().id(), 3);
        assert_eq!(q.pop_min().unwrap().id(), 1);
        assert!(q.pop_min().is_none());
    }

    #[test]
    fn ties_break_on_id_not_lost() {
        let mut q = RunQueue::new();
        q.insert(StubExecutor::new(5, 100));
        q.insert(StubExecutor::new(1, 100));
        assert_eq!(q.size(), 2);
        assert_eq!(q.pop_min().unwrap().id(), 1);
        assert_eq!(q.pop_min().unwrap().id(), 5);
    }

    #[test]
    fn min_reflects_queue_without_removing() {
        let mut q = RunQueue::new();
        assert_eq!(q.min(), None);
        q.insert(StubExecutor::new(1, 50));
        assert_eq!(q.min(), Some(50));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn clear_drains_everything() {
        let mut q = RunQueue::new();
        q.insert(StubExecutor::new(1, 10));
        q.insert(StubExecutor::new(2, 20));
        let drained = q.clear();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
    }
}
