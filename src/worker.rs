// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The worker thread loop: pop, bind, run one slice, report.
//!
//! Each `Worker` is a fixed slot in the pool's array (spec.md §5: the
//! worker count never changes after construction). "Replacing" a worker
//! means respawning a fresh `JoinHandle` into the same `Worker`, not
//! allocating a new slot — that is what lets the monitor iterate
//! `Inner::workers` under only `core` without ever touching
//! `thread_table_lock`.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::executor::{Executor, WorkerId};
use crate::scheduler::{join_with_deadline, Inner};

/// A worker's slot: its identity, liveness bookkeeping, and a
/// lock-free-readable flag for whether it currently has anything bound.
///
/// `has_current` is read by the monitor without any lock held (spec.md
/// §5) so it can skip the `bound` mutex entirely for idle workers; it is
/// a plain bool rather than an encoded executor id so that no executor
/// id value (not even `u64::MAX`) can be mistaken for "nothing bound".
pub(crate) struct Worker {
    id: WorkerId,
    handle: Mutex<Option<JoinHandle<()>>>,
    should_run: AtomicBool,
    has_current: AtomicBool,
    bound: Mutex<Option<Arc<dyn Executor>>>,
    interrupt_requested: AtomicBool,
    /// Bumped every time this slot is (re)spawned. A thread abandoned by
    /// `replace()` (spec.md §4.3's worker-replacement step) keeps running
    /// — `work()` may block forever in guest code — but it captures its
    /// own generation at spawn time, so once it finally returns it can
    /// tell it is no longer the live occupant of this slot and must not
    /// touch the executor the monitor already reclaimed.
    generation: AtomicUsize,
}

impl Worker {
    pub(crate) fn new(id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            handle: Mutex::new(None),
            should_run: AtomicBool::new(true),
            has_current: AtomicBool::new(false),
            bound: Mutex::new(None),
            interrupt_requested: AtomicBool::new(false),
            generation: AtomicUsize::new(0),
        })
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn should_run(&self) -> bool {
        self.should_run.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stopped(&self) {
        self.should_run.store(false, Ordering::Release);
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self.handle.lock().unwrap().as_ref() {
            Some(h) => !h.is_finished(),
            None => false,
        }
    }

    /// A cheap per-spawn identity used only by tests to tell whether
    /// `start()` respawned this slot.
    #[cfg(test)]
    pub(crate) fn thread_identity(&self) -> Option<thread::ThreadId> {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.thread().id())
    }

    /// The executor currently bound to this worker, if any. Safe to call
    /// from any thread without locking `scheduler_mutex` — this is the
    /// monitor's window into what each worker is doing.
    pub(crate) fn current_executor(&self) -> Option<Arc<dyn Executor>> {
        if !self.has_current.load(Ordering::Acquire) {
            return None;
        }
        self.bound.lock().unwrap().clone()
    }

    fn publish_current(&self, executor: Option<&Arc<dyn Executor>>) {
        *self.bound.lock().unwrap() = executor.cloned();
        self.has_current.store(executor.is_some(), Ordering::Release);
    }

    /// Spawn (or respawn, for worker replacement) the OS thread backing
    /// this slot.
    pub(crate) fn spawn(self: &Arc<Self>, inner: Arc<Inner>) {
        self.should_run.store(true, Ordering::Release);
        self.interrupt_requested.store(false, Ordering::Release);
        let my_generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let worker = self.clone();
        let name = format!("{}", self.id);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(inner, worker, my_generation))
            .expect("failed to spawn worker thread");
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Whether `generation` is still this slot's live occupant. A
    /// mismatch means this thread was abandoned while it was blocked in
    /// guest code.
    fn is_current_generation(&self, generation: usize) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Evict whatever is published as bound to this slot and bump its
    /// generation, without spawning a replacement thread yet. Used by the
    /// monitor when it reclaims a stuck worker's executor itself (spec.md
    /// §4.3's worker-replacement step): calling this *before*
    /// `Inner::after_work` ensures that if the abandoned thread's blocked
    /// `work()` call later returns, its own captured generation no longer
    /// matches and it skips calling `after_work` a second time. `replace`
    /// bumps the generation again when it actually spawns, which is
    /// harmless — only inequality with the original generation matters.
    pub(crate) fn invalidate_generation(&self) -> usize {
        self.publish_current(None);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Emulated interrupt (spec.md §4.3, §9): std Rust has no way to
    /// forcibly dislodge a thread stuck inside guest code, so this is a
    /// flag the guest is expected to poll plus a diagnostic signal for
    /// the host. Idempotent.
    pub(crate) fn request_interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::Release);
    }

    pub(crate) fn interrupt_requested(&self) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
    }

    /// Replace this slot's thread: detach whatever is currently running
    /// (it may never return — the old `JoinHandle` is simply dropped,
    /// which does not join it) and spawn a fresh one. The slot — not
    /// the OS thread — is what gets reclaimed in bounded time.
    pub(crate) fn replace(self: &Arc<Self>, inner: Arc<Inner>) {
        let stale = self.handle.lock().unwrap().take();
        drop(stale);
        self.publish_current(None);
        self.spawn(inner);
    }

    /// Block until this worker's thread finishes or `deadline` elapses.
    pub(crate) fn join_with_deadline(&self, deadline: Duration) -> JoinOutcome {
        let handle = self.handle.lock().unwrap().take();
        match handle {
            Some(h) => {
                if join_with_deadline(&h, deadline) {
                    match h.join() {
                        Ok(()) => JoinOutcome::Finished,
                        Err(_) => JoinOutcome::Panicked,
                    }
                } else {
                    // Leave the stuck thread detached rather than block
                    // shutdown on it; the slot is reclaimed either way.
                    JoinOutcome::TimedOut
                }
            }
            None => JoinOutcome::Finished,
        }
    }
}

/// Result of joining a worker (or monitor) thread during shutdown.
pub(crate) enum JoinOutcome {
    /// The thread returned normally.
    Finished,
    /// The thread terminated via an uncaught panic — anything it was
    /// mutating outside a lock at the time is of unknown state.
    Panicked,
    /// Still running past the shutdown deadline; left detached.
    TimedOut,
}

/// One worker thread's lifetime (spec.md §4.2). `generation` is this
/// thread's own spawn generation (spec.md §4.3's worker-replacement
/// step): if the monitor calls `Worker::replace()` while this thread is
/// blocked inside `work()`, the slot moves on to a new generation and
/// this thread, whenever it eventually returns, must not touch shared
/// scheduler state again — the monitor already reclaimed its executor.
pub(crate) fn worker_loop(inner: Arc<Inner>, worker: Arc<Worker>, generation: usize) {
    while worker.should_run() && inner.running.load(Ordering::Acquire) {
        let executor = match inner.pop_next_or_wait(&worker) {
            Some(e) => e,
            None => break,
        };

        if !executor.scheduling().try_bind(worker.id()) {
            // Already bound elsewhere: refuse rather than run it twice
            // (see executor::SchedulingCell::try_bind).
            tracing::error!(
                computer = executor.id(),
                worker = %worker.id(),
                "refused double bind; executor already running elsewhere"
            );
            continue;
        }

        executor.before_work();
        worker.publish_current(Some(&executor));

        let result = panic::catch_unwind(AssertUnwindSafe(|| executor.work()));
        if let Err(payload) = result {
            let message = panic_message(&payload);
            tracing::error!(computer = executor.id(), panic = %message, "computer panicked during work()");
            executor.fast_fail();
        }

        if !worker.is_current_generation(generation) {
            // The monitor gave up on this thread and replaced the slot
            // while `work()` was blocked. The replacement already ran
            // `after_work` on our behalf (spec.md §4.3 step 5) — doing
            // it again here would double-process the executor and race
            // the new occupant of this slot.
            tracing::warn!(
                computer = executor.id(),
                worker = %worker.id(),
                "abandoned worker finally returned from work(); discarding stale slice"
            );
            return;
        }

        worker.publish_current(None);
        inner.after_work(&worker, executor);
    }

    worker.publish_current(None);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
