// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The scheduler façade: admission, completion accounting, and lifecycle.
//!
//! `Scheduler` is a thin handle around an `Arc<Inner>` — the same shape
//! this codebase's other thread-pool primitives use to hand shared state
//! to worker closures without the façade itself needing to be `Arc`-only.
//! `Inner` holds everything workers, the monitor, and producer threads
//! touch: the run queue and virtual-time floor behind `scheduler_mutex`
//! (here, `core`), the `has_work` / `monitor_wakeup` condvars, the fixed
//! worker array, and a `thread_table` that serializes start/stop/replace
//! decisions independent of `core`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SchedulerError;
use crate::executor::{Executor, SchedulingCell, WorkerId};
use crate::queue::RunQueue;
use crate::worker::{JoinOutcome, Worker};

/// `50ms / 5ms` — the queue-depth threshold past which `scaled_period()`
/// floors out at `min_period` instead of shrinking further (spec.md
/// §4.1.1).
pub(crate) const LATENCY_MAX_TASKS: usize = 10;

/// Constants derived once from the worker count (spec.md §4.1), plus the
/// monitor's timing windows — normally left at their production
/// defaults, overridable so tests can run the soft/hard-abort escalation
/// ladder in milliseconds (spec.md §9: the exact grace-window length is
/// an undocumented heuristic in the original system, not a value this
/// crate should hardcode into the escalation logic itself).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub thread_count: u16,
    pub latency: Duration,
    pub min_period: Duration,
    pub monitor_wakeup: Duration,
    pub report_debounce: Duration,
    pub soft_timeout: Duration,
    pub abort_timeout: Duration,
}

impl SchedulerConfig {
    /// Cumulative slice time after which a computer is soft-aborted.
    pub const DEFAULT_SOFT_TIMEOUT: Duration = Duration::from_secs(7);

    /// Grace window between each escalation step (soft abort -> hard
    /// abort -> interrupt -> worker replacement).
    pub const DEFAULT_ABORT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Derive `latency` and `min_period` from `factor = 1 + floor(log2 N)`,
    /// per spec.md §4.1. `thread_count` of 0 is treated as 1.
    pub fn for_thread_count(thread_count: u16) -> Self {
        let n = thread_count.max(1);
        let factor = 1 + (n as u32).ilog2();
        Self {
            thread_count: n,
            latency: Duration::from_millis(50) * factor,
            min_period: Duration::from_millis(5) * factor,
            monitor_wakeup: Duration::from_millis(100),
            report_debounce: Duration::from_secs(1),
            soft_timeout: Self::DEFAULT_SOFT_TIMEOUT,
            abort_timeout: Self::DEFAULT_ABORT_TIMEOUT,
        }
    }

    /// Override the monitor's escalation timing. Intended for tests that
    /// want soft abort, hard abort, interrupt, and worker replacement to
    /// play out in milliseconds.
    pub fn with_timeouts(mut self, soft_timeout: Duration, abort_timeout: Duration) -> Self {
        self.soft_timeout = soft_timeout;
        self.abort_timeout = abort_timeout;
        self
    }
}

/// State protected by `scheduler_mutex`.
struct Core {
    run_queue: RunQueue,
    minimum_virtual_runtime: i64,
    idle_workers: i32,
}

/// State protected by `thread_table_lock`: the monitor's own handle.
/// Per-worker handles live on each `Worker` and are coordinated through
/// this same lock so replace/start/stop never race each other.
struct ThreadTable {
    monitor: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) config: SchedulerConfig,
    epoch: Instant,
    core: Mutex<Core>,
    pub(crate) has_work: Condvar,
    pub(crate) monitor_wakeup: Condvar,
    pub(crate) workers: Vec<Arc<Worker>>,
    pub(crate) thread_table: Mutex<ThreadTable>,
    pub(crate) running: AtomicBool,
    reports_enabled: AtomicBool,
    last_report: Mutex<HashMap<WorkerId, Instant>>,
}

impl Inner {
    fn now_nanos(&self) -> i64 {
        self.epoch.elapsed().as_nanos().min(i64::MAX as u128) as i64
    }

    pub(crate) fn scaled_period_locked(&self, core_size: usize) -> Duration {
        let count = 1 + core_size;
        if count < LATENCY_MAX_TASKS {
            self.config.latency / count as u32
        } else {
            self.config.min_period
        }
    }

    pub(crate) fn scaled_period(&self) -> Duration {
        let core = self.core.lock().unwrap();
        self.scaled_period_locked(core.run_queue.size())
    }

    fn is_busy_locked(core: &Core) -> bool {
        core.run_queue.size() as i32 > core.idle_workers
    }

    pub(crate) fn is_busy(&self) -> bool {
        let core = self.core.lock().unwrap();
        Self::is_busy_locked(&core)
    }

    /// Sleep on `monitor_wakeup` for up to `scaled_period()` (busy) or
    /// `monitor_wakeup` (idle), using the *same* `scheduler_mutex` as
    /// `has_work` (spec.md §5): deciding the wait duration and waiting on
    /// it happen under one lock acquisition, so a `queue()` call that
    /// flips the pool busy and notifies under that same lock (see
    /// `queue()` below) cannot land in between and be missed.
    pub(crate) fn monitor_wait(&self) {
        let core = self.core.lock().unwrap();
        let wait_for = if Self::is_busy_locked(&core) {
            self.scaled_period_locked(core.run_queue.size())
        } else {
            self.config.monitor_wakeup
        };
        let _ = self.monitor_wakeup.wait_timeout(core, wait_for).unwrap();
    }

    pub(crate) fn has_pending_work(&self) -> bool {
        !self.core.lock().unwrap().run_queue.is_empty()
    }

    /// CFS virtual-time accounting (spec.md §4.1.4). Credits every
    /// currently-bound executor (read lock-free via each worker's own
    /// `current` cell) plus `current`, the executor the caller is in the
    /// middle of unbinding, then advances the floor.
    fn update_runtimes_locked(&self, core: &mut Core, current: Option<&Arc<dyn Executor>>) {
        let now = self.now_nanos();
        let tasks = 1 + core.run_queue.size() as i64;
        let mut min_runtime = core.run_queue.min().unwrap_or(i64::MAX);

        let mut credit = |sched: &SchedulingCell| {
            let delta = (now - sched.v_runtime_start()) / tasks;
            sched.set_virtual_runtime(sched.virtual_runtime() + delta);
            sched.set_v_runtime_start(now);
            min_runtime = min_runtime.min(sched.virtual_runtime());
        };

        for worker in &self.workers {
            if let Some(bound) = worker.current_executor() {
                credit(bound.scheduling());
            }
        }
        if let Some(exec) = current {
            credit(exec.scheduling());
        }

        if min_runtime < i64::MAX && min_runtime > core.minimum_virtual_runtime {
            core.minimum_virtual_runtime = min_runtime;
        }
    }

    /// Admission (spec.md §4.1.3). Precondition: caller holds the
    /// executor's own enqueue lock and `!executor.on_queue`.
    pub(crate) fn queue(&self, executor: Arc<dyn Executor>) -> Result<(), SchedulerError> {
        if executor.scheduling().on_queue() {
            return Err(SchedulerError::AlreadyQueued { id: executor.id() });
        }
        executor.scheduling().set_on_queue(true);

        let mut core = self.core.lock().unwrap();
        self.update_runtimes_locked(&mut core, None);

        let scaled = self.scaled_period_locked(core.run_queue.size());
        let half_latency = self.config.latency.as_nanos() as i64 / 2;
        let candidate = if executor.scheduling().virtual_runtime() == 0 {
            core.minimum_virtual_runtime + scaled.as_nanos() as i64
        } else {
            core.minimum_virtual_runtime - half_latency
        };
        let assigned = candidate.max(executor.scheduling().virtual_runtime());
        executor.scheduling().set_virtual_runtime(assigned);

        let was_busy = Self::is_busy_locked(&core);
        core.run_queue.insert(executor.clone());
        self.has_work.notify_one();
        if !was_busy && Self::is_busy_locked(&core) {
            self.monitor_wakeup.notify_one();
        }

        tracing::trace!(
            computer = executor.id(),
            virtual_runtime = assigned,
            "admitted executor"
        );
        Ok(())
    }

    /// Block the calling worker until the run queue has something for
    /// it, tracking `idle_workers` for the duration (spec.md §4.2 step
    /// 1). Returns `None` once the scheduler (or this worker's own slot)
    /// has been told to stop.
    pub(crate) fn pop_next_or_wait(&self, worker: &Worker) -> Option<Arc<dyn Executor>> {
        let mut core = self.core.lock().unwrap();
        core.idle_workers += 1;
        loop {
            if let Some(executor) = core.run_queue.pop_min() {
                core.idle_workers -= 1;
                return Some(executor);
            }
            if !self.running.load(Ordering::Acquire) || !worker.should_run() {
                core.idle_workers -= 1;
                return None;
            }
            let (guard, _) = self
                .has_work
                .wait_timeout(core, Duration::from_millis(5))
                .unwrap();
            core = guard;
        }
    }

    /// Completion accounting (spec.md §4.1.5). Used both by the worker
    /// that ran the slice and by the monitor, on behalf of an abandoned
    /// worker, when it reclaims a dead executor.
    pub(crate) fn after_work(&self, worker: &Worker, executor: Arc<dyn Executor>) {
        match executor.scheduling().clear_executing_thread() {
            Some(w) if w == worker.id() => {}
            Some(other) => tracing::error!(
                computer = executor.id(),
                expected_worker = %worker.id(),
                actual_worker = %other,
                "serious bug: executor bound to unexpected worker at completion"
            ),
            None => tracing::error!(
                computer = executor.id(),
                worker = %worker.id(),
                "serious bug: executor had no bound worker at completion"
            ),
        }

        let mut core = self.core.lock().unwrap();
        self.update_runtimes_locked(&mut core, Some(&executor));

        if executor.after_work() {
            executor.scheduling().set_on_queue(true);
            core.run_queue.insert(executor.clone());
            self.has_work.notify_one();
        } else {
            executor.scheduling().set_on_queue(false);
        }
    }

    pub(crate) fn reports_enabled(&self) -> bool {
        self.reports_enabled.load(Ordering::Acquire)
    }

    /// Debounced timeout report (spec.md §4.2 `report_timeout`, §6).
    pub(crate) fn report_timeout(&self, worker: &Worker, executor: &Arc<dyn Executor>, elapsed_ns: i64) {
        if !self.reports_enabled() {
            return;
        }
        let now = Instant::now();
        {
            let mut last = self.last_report.lock().unwrap();
            if let Some(previous) = last.get(&worker.id()) {
                if now.duration_since(*previous) < self.config.report_debounce {
                    return;
                }
            }
            last.insert(worker.id(), now);
        }

        let mut state = String::new();
        executor.print_state(&mut state);
        tracing::warn!(
            computer = executor.id(),
            worker = %worker.id(),
            elapsed_secs = elapsed_ns as f64 / 1e9,
            state = %state,
            "computer exceeded its timeout budget"
        );
    }
}

/// Dispatches work for a fleet of computers onto a bounded worker pool.
///
/// A host typically owns one `Scheduler` per isolated pool of computers;
/// nothing here is a process-wide singleton (spec.md §9).
pub struct Scheduler {
    pub(crate) inner: Arc<Inner>,
}

impl Scheduler {
    /// Build a scheduler with `thread_count` workers and the default
    /// constants derived from it.
    pub fn new(thread_count: u16) -> Self {
        Self::with_config(SchedulerConfig::for_thread_count(thread_count))
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let workers = (0..config.thread_count)
            .map(|i| Worker::new(WorkerId(i as usize)))
            .collect();
        let inner = Arc::new(Inner {
            config,
            epoch: Instant::now(),
            core: Mutex::new(Core {
                run_queue: RunQueue::new(),
                minimum_virtual_runtime: 0,
                idle_workers: 0,
            }),
            has_work: Condvar::new(),
            monitor_wakeup: Condvar::new(),
            workers,
            thread_table: Mutex::new(ThreadTable { monitor: None }),
            running: AtomicBool::new(false),
            reports_enabled: AtomicBool::new(true),
            last_report: Mutex::new(HashMap::new()),
        });
        Self { inner }
    }

    /// Start the pool. A second call is a no-op past already-live
    /// workers and monitor (spec.md §4.4, §8 idempotence).
    pub fn start(&self) {
        self.inner.running.store(true, Ordering::Release);
        let mut table = self.inner.thread_table.lock().unwrap();
        for worker in &self.inner.workers {
            if !worker.is_alive() {
                worker.spawn(self.inner.clone());
            }
        }
        let monitor_alive = table
            .monitor
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if !monitor_alive {
            let inner = self.inner.clone();
            table.monitor = Some(
                thread::Builder::new()
                    .name("Computer-Monitor".to_string())
                    .spawn(move || crate::monitor::monitor_loop(inner))
                    .expect("failed to spawn monitor thread"),
            );
        }
        tracing::info!(workers = self.inner.workers.len(), "scheduler started");
    }

    /// Stop the pool (spec.md §4.4). Safe to call twice. Joins every
    /// worker and the monitor with a short deadline; a thread still
    /// alive afterwards is logged and shutdown proceeds regardless.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        self.inner.running.store(false, Ordering::Release);
        for worker in &self.inner.workers {
            worker.mark_stopped();
        }

        self.inner.core.lock().unwrap().run_queue.clear();

        self.inner.has_work.notify_all();
        self.inner.monitor_wakeup.notify_all();

        let mut table = self.inner.thread_table.lock().unwrap();
        const JOIN_DEADLINE: Duration = Duration::from_millis(100);

        let mut first_error = None;
        for worker in &self.inner.workers {
            match worker.join_with_deadline(JOIN_DEADLINE) {
                JoinOutcome::Finished => {}
                JoinOutcome::TimedOut => {
                    tracing::error!(worker = %worker.id(), "worker did not join within the shutdown deadline");
                    first_error.get_or_insert(SchedulerError::JoinTimedOut { worker: worker.id() });
                }
                JoinOutcome::Panicked => {
                    tracing::error!(worker = %worker.id(), "worker thread panicked; shutdown state unreliable");
                    first_error.get_or_insert(SchedulerError::ShutdownInterrupted);
                }
            }
        }

        if let Some(handle) = table.monitor.take() {
            if join_with_deadline(&handle, JOIN_DEADLINE) {
                if handle.join().is_err() {
                    tracing::error!("monitor thread panicked; shutdown state unreliable");
                    first_error.get_or_insert(SchedulerError::ShutdownInterrupted);
                }
            } else {
                tracing::error!("monitor thread did not join within the shutdown deadline");
            }
        }

        tracing::info!("scheduler stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Admit `executor`. Precondition: the caller holds the executor's
    /// own enqueue lock and it is not already queued.
    pub fn queue(&self, executor: Arc<dyn Executor>) -> Result<(), SchedulerError> {
        self.inner.queue(executor)
    }

    pub fn has_pending_work(&self) -> bool {
        self.inner.has_pending_work()
    }

    pub fn scaled_period(&self) -> Duration {
        self.inner.scaled_period()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }

    /// Global switch disabling timeout reports (spec.md §6).
    pub fn set_reports_enabled(&self, enabled: bool) {
        self.inner
            .reports_enabled
            .store(enabled, Ordering::Release);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.inner.running.load(Ordering::Acquire) {
            let _ = self.stop();
        }
    }
}

/// Poll `handle` until finished or `deadline` elapses. Does not join —
/// callers that only want a liveness check (e.g. `start()` deciding
/// whether to replace a worker) call this alone; callers that want the
/// thread's result call `handle.join()` afterwards.
pub(crate) fn join_with_deadline(handle: &JoinHandle<()>, deadline: Duration) -> bool {
    let start = Instant::now();
    while !handle.is_finished() && start.elapsed() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    handle.is_finished()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SchedulingCell;
    use crate::timeout::TimeoutState;
    use std::fmt;
    use std::sync::atomic::AtomicI32;

    struct CountingExecutor {
        id: u64,
        scheduling: SchedulingCell,
        timeout: TimeoutState,
        runs: AtomicI32,
        requeue_times: i32,
    }

    impl CountingExecutor {
        fn new(id: u64, requeue_times: i32) -> Arc<Self> {
            Arc::new(Self {
                id,
                scheduling: SchedulingCell::new(),
                timeout: TimeoutState::new(),
                runs: AtomicI32::new(0),
                requeue_times,
            })
        }
    }

    impl Executor for CountingExecutor {
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
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
        fn after_work(&self) -> bool {
            (self.runs.load(Ordering::SeqCst)) < self.requeue_times
        }
        fn abort(&self) {}
        fn fast_fail(&self) {}
        fn print_state(&self, sink: &mut dyn fmt::Write) {
            let _ = write!(sink, "runs={}", self.runs.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn scaled_period_shrinks_then_floors() {
        let sched = Scheduler::new(1);
        assert_eq!(sched.scaled_period(), sched.inner.config.latency);

        for i in 0..20 {
            let e = CountingExecutor::new(i, 1_000_000);
            sched.queue(e).unwrap();
        }
        // count = 1 + 20 = 21 >= LATENCY_MAX_TASKS(10) -> floors at min_period.
        assert_eq!(sched.scaled_period(), sched.inner.config.min_period);
    }

    #[test]
    fn queue_rejects_double_admission() {
        let sched = Scheduler::new(1);
        let e = CountingExecutor::new(1, 1);
        sched.queue(e.clone()).unwrap();
        match sched.queue(e) {
            Err(SchedulerError::AlreadyQueued { id }) => assert_eq!(id, 1),
            other => panic!("expected AlreadyQueued, got {:?}", other),
        }
    }

    #[test]
    fn minimum_virtual_runtime_never_decreases() {
        let sched = Scheduler::new(1);
        let a = CountingExecutor::new(1, 1);
        sched.queue(a).unwrap();
        let before = sched.inner.core.lock().unwrap().minimum_virtual_runtime;

        let b = CountingExecutor::new(2, 1);
        b.scheduling.set_virtual_runtime(-1_000_000_000);
        sched.queue(b).unwrap();
        let after = sched.inner.core.lock().unwrap().minimum_virtual_runtime;

        assert!(after >= before);
    }

    #[test]
    fn runs_to_completion_and_stops_cleanly() {
        let sched = Scheduler::new(2);
        sched.start();

        let a = CountingExecutor::new(1, 5);
        let b = CountingExecutor::new(2, 5);
        sched.queue(a.clone()).unwrap();
        sched.queue(b.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while (a.runs.load(Ordering::SeqCst) < 5 || b.runs.load(Ordering::SeqCst) < 5)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(a.runs.load(Ordering::SeqCst), 5);
        assert_eq!(b.runs.load(Ordering::SeqCst), 5);

        sched.stop().unwrap();
        assert!(!sched.has_pending_work());
    }

    #[test]
    fn start_twice_does_not_replace_live_workers() {
        let sched = Scheduler::new(2);
        sched.start();
        let first_ids: Vec<_> = sched
            .inner
            .workers
            .iter()
            .map(|w| w.thread_identity())
            .collect();
        sched.start();
        let second_ids: Vec<_> = sched
            .inner
            .workers
            .iter()
            .map(|w| w.thread_identity())
            .collect();
        assert_eq!(first_ids, second_ids);
        sched.stop().unwrap();
    }

    #[test]
    fn stop_twice_is_safe() {
        let sched = Scheduler::new(1);
        sched.start();
        sched.stop().unwrap();
        sched.stop().unwrap();
    }
}
