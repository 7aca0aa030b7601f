// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The executor capability interface.
//!
//! An `Executor` is owned by the host (the sandboxed computer and its
//! event queue live outside this crate) and shared with the scheduler by
//! stable `Arc` identity. The scheduler mutates only the fields grouped
//! in [`SchedulingCell`]; everything else — the guest callbacks and the
//! [`TimeoutState`](crate::timeout::TimeoutState) — belongs to the
//! executor.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use crate::timeout::TimeoutState;

/// Identifies a slot in the worker pool's fixed-size array, not an OS
/// thread id — slots are reused across worker replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Computer-Runner-{}", self.0)
    }
}

/// Sentinel stored in `executing_thread` when no worker is bound.
const NONE_SENTINEL: usize = usize::MAX;

/// The scheduling fields the scheduler owns on every executor.
///
/// `virtual_runtime` and `v_runtime_start` are plain atomics: only the
/// scheduler writes them, and always from under `scheduler_mutex`, so
/// atomics just buy lock-free reads for diagnostics. `executing_thread`
/// is the one field with real cross-actor contention — the monitor reads
/// it without holding any lock — so binding goes through a real CAS.
#[derive(Debug)]
pub struct SchedulingCell {
    virtual_runtime: AtomicI64,
    v_runtime_start: AtomicI64,
    on_queue: AtomicBool,
    executing_thread: AtomicUsize,
}

impl SchedulingCell {
    pub fn new() -> Self {
        Self {
            virtual_runtime: AtomicI64::new(0),
            v_runtime_start: AtomicI64::new(0),
            on_queue: AtomicBool::new(false),
            executing_thread: AtomicUsize::new(NONE_SENTINEL),
        }
    }

    pub fn virtual_runtime(&self) -> i64 {
        self.virtual_runtime.load(Ordering::Acquire)
    }

    pub fn set_virtual_runtime(&self, v: i64) {
        self.virtual_runtime.store(v, Ordering::Release);
    }

    pub fn v_runtime_start(&self) -> i64 {
        self.v_runtime_start.load(Ordering::Acquire)
    }

    pub fn set_v_runtime_start(&self, v: i64) {
        self.v_runtime_start.store(v, Ordering::Release);
    }

    pub fn on_queue(&self) -> bool {
        self.on_queue.load(Ordering::Acquire)
    }

    pub fn set_on_queue(&self, v: bool) {
        self.on_queue.store(v, Ordering::Release);
    }

    pub fn executing_thread(&self) -> Option<WorkerId> {
        match self.executing_thread.load(Ordering::Acquire) {
            NONE_SENTINEL => None,
            n => Some(WorkerId(n)),
        }
    }

    /// Bind this executor to `worker`. Returns `false` (and leaves the
    /// cell untouched) if it was already bound to someone else — the
    /// caller must refuse the bind rather than run the task twice
    /// (spec.md §9 Open Questions: the bind-twice path is a bug and must
    /// not silently proceed).
    pub fn try_bind(&self, worker: WorkerId) -> bool {
        self.executing_thread
            .compare_exchange(
                NONE_SENTINEL,
                worker.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Clear the binding, returning whoever was previously bound.
    pub fn clear_executing_thread(&self) -> Option<WorkerId> {
        match self.executing_thread.swap(NONE_SENTINEL, Ordering::AcqRel) {
            NONE_SENTINEL => None,
            n => Some(WorkerId(n)),
        }
    }
}

impl Default for SchedulingCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of schedulable guest work.
///
/// Implemented by the host on behalf of a sandboxed computer. All
/// methods may be called from any worker thread; `print_state` and the
/// `timeout`/`scheduling` accessors may additionally be called by the
/// monitor thread without the scheduler lock held.
pub trait Executor: Send + Sync {
    /// Stable identity used for diagnostics and as the run queue's
    /// tiebreak key.
    fn id(&self) -> u64;

    /// The fields the scheduler mutates. Must always return a reference
    /// to the same cell for the lifetime of the executor.
    fn scheduling(&self) -> &SchedulingCell;

    /// Per-executor cumulative-time accounting the monitor drives.
    fn timeout(&self) -> &TimeoutState;

    /// Reset the per-slice timer. Called by a worker immediately after
    /// binding, before the executor is published as the worker's
    /// current executor.
    fn before_work(&self);

    /// Run one slice of guest work. May block arbitrarily inside the
    /// guest VM — that is why the monitor exists. May panic; the worker
    /// catches this and treats it as an ordinary work failure.
    fn work(&self);

    /// Called after `work()` returns (or after a caught panic). Returns
    /// whether the executor should be requeued.
    fn after_work(&self) -> bool;

    /// Raise the guest's hard-abort flag. Idempotent.
    fn abort(&self);

    /// Tear the computer down after an unrecoverable error. Idempotent.
    fn fast_fail(&self);

    /// Dump executor-specific diagnostic state (stack, blocked-on
    /// object, etc.) into `sink` for a timeout report.
    fn print_state(&self, sink: &mut dyn fmt::Write);
}
