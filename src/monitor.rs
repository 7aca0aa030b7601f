// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The monitor: a single actor that escalates against a runaway
//! computer through soft abort, hard abort, interrupt, and finally
//! worker replacement (spec.md §4.3).
//!
//! Runs on its own thread, waking every `monitor_wakeup` or whenever
//! `queue()` transitions the pool from idle to busy. Reads every
//! worker's bound executor without taking `scheduler_mutex` — only the
//! escalation ladder's own bookkeeping (`escalations`) is private to
//! this thread.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::executor::{Executor, WorkerId};
use crate::scheduler::Inner;
use crate::worker::Worker;

/// Per-worker escalation state for the executor it currently has bound.
/// `over` (spec.md §4.3) is recomputed fresh from `TimeoutState` on every
/// pass, so there is nothing to track except which one-shot actions have
/// already fired — reaching a threshold again on the next poll must not
/// re-call `abort()` or re-emit a report.
struct Escalation {
    executor_id: u64,
    hard_aborted: bool,
    interrupted: bool,
}

pub(crate) fn monitor_loop(inner: Arc<Inner>) {
    let mut escalations: HashMap<WorkerId, Escalation> = HashMap::new();
    while inner.running.load(Ordering::Acquire) {
        check_runners(&inner, &mut escalations);
        // spec.md §4.3 step 1 / §4.1.2: poll tightly at scaled_period()
        // while the pool is busy, otherwise sleep the full wakeup
        // interval. A spurious wake here is harmless — the next
        // check_runners pass just runs a little early. The busy check and
        // the wait share `scheduler_mutex` (spec.md §5) so a `queue()`
        // call that flips the pool from idle to busy and notifies cannot
        // land in a gap between them.
        inner.monitor_wait();
    }
    tracing::debug!("monitor thread exiting");
}

/// One escalation pass over every worker (spec.md §4.3).
fn check_runners(inner: &Arc<Inner>, escalations: &mut HashMap<WorkerId, Escalation>) {
    for worker in &inner.workers {
        // Dead-worker replacement: independent of whether anything is
        // currently bound to this slot. A worker thread that has
        // terminated (panicked outside the `catch_unwind` in
        // `worker_loop`, or some other unexpected exit) while the pool
        // is still running leaves its slot permanently idle unless the
        // monitor notices and respawns it.
        if !worker.is_alive() {
            escalations.remove(&worker.id());
            if inner.running.load(Ordering::Acquire) {
                tracing::warn!(worker = %worker.id(), "worker thread is not alive, replacing");
                worker.replace(inner.clone());
            }
            continue;
        }

        let Some(executor) = worker.current_executor() else {
            escalations.remove(&worker.id());
            continue;
        };

        let timeout = executor.timeout();
        timeout.refresh(inner.config.soft_timeout);

        if escalations.get(&worker.id()).map(|e| e.executor_id) != Some(executor.id()) {
            escalations.remove(&worker.id());
        }

        // `over < 0`: still within the soft-abort grace window, waiting
        // for the guest to notice the flag `refresh()` just raised.
        let abort_ns = inner.config.abort_timeout.as_nanos() as i64;
        let over = timeout.nano_cumulative() - inner.config.soft_timeout.as_nanos() as i64 - abort_ns;
        if over < 0 {
            continue;
        }

        let entry = escalations.entry(worker.id()).or_insert(Escalation {
            executor_id: executor.id(),
            hard_aborted: false,
            interrupted: false,
        });

        if !entry.hard_aborted {
            tracing::warn!(
                computer = executor.id(),
                worker = %worker.id(),
                "hard abort: soft abort grace window elapsed"
            );
            timeout.hard_abort();
            executor.abort();
            entry.hard_aborted = true;
        }

        if over >= abort_ns && !entry.interrupted {
            tracing::warn!(
                computer = executor.id(),
                worker = %worker.id(),
                "interrupt: hard abort grace window elapsed without completion"
            );
            inner.report_timeout(worker, &executor, timeout.nano_cumulative());
            worker.request_interrupt();
            entry.interrupted = true;
        }

        if over >= 2 * abort_ns {
            tracing::error!(
                computer = executor.id(),
                worker = %worker.id(),
                "replacing worker: interrupt grace window elapsed without completion"
            );
            worker.request_interrupt();
            // Evict the slot's published binding and bump its generation
            // before draining the executor ourselves: if the abandoned
            // thread's blocked work() later returns, its stale generation
            // no longer matches and it will not call after_work a second
            // time on an executor we're concurrently completing here.
            worker.invalidate_generation();
            inner.after_work(worker, executor.clone());
            worker.replace(inner.clone());
            escalations.remove(&worker.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SchedulingCell;
    use crate::timeout::TimeoutState;
    use std::fmt;
    use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};
    use std::time::Duration;

    struct StuckExecutor {
        id: u64,
        scheduling: SchedulingCell,
        timeout: TimeoutState,
        aborted: AtomicBool,
        fast_failed: AtomicBool,
        work_duration: Duration,
    }

    impl StuckExecutor {
        fn new(id: u64, work_duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                id,
                scheduling: SchedulingCell::new(),
                timeout: TimeoutState::new(),
                aborted: AtomicBool::new(false),
                fast_failed: AtomicBool::new(false),
                work_duration,
            })
        }
    }

    impl Executor for StuckExecutor {
        fn id(&self) -> u64 {
            self.id
        }
        fn scheduling(&self) -> &SchedulingCell {
            &self.scheduling
        }
        fn timeout(&self) -> &TimeoutState {
            &self.timeout
        }
        fn before_work(&self) {
            self.timeout.reset();
        }
        fn work(&self) {
            std::thread::sleep(self.work_duration);
        }
        fn after_work(&self) -> bool {
            false
        }
        fn abort(&self) {
            self.aborted.store(true, StdOrdering::SeqCst);
        }
        fn fast_fail(&self) {
            self.fast_failed.store(true, StdOrdering::SeqCst);
        }
        fn print_state(&self, _sink: &mut dyn fmt::Write) {}
    }

    #[test]
    fn fresh_worker_with_no_binding_is_ignored() {
        let sched = crate::Scheduler::new(1);
        let mut escalations = HashMap::new();
        check_runners(&sched.inner, &mut escalations);
        assert!(escalations.is_empty());
    }

    #[test]
    fn worker_well_within_timeout_is_left_alone() {
        let sched = crate::Scheduler::new(1);
        sched.start();

        let executor = StuckExecutor::new(1, Duration::from_millis(80));
        sched.queue(executor.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut escalations = HashMap::new();
        check_runners(&sched.inner, &mut escalations);

        assert!(escalations.is_empty());
        assert!(!executor.aborted.load(StdOrdering::SeqCst));

        sched.stop().unwrap();
    }

    #[test]
    fn request_interrupt_is_idempotent() {
        let worker = Worker::new(WorkerId(0));
        assert!(!worker.interrupt_requested());
        worker.request_interrupt();
        worker.request_interrupt();
        assert!(worker.interrupt_requested());
    }
}
