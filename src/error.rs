// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Errors surfaced across the scheduler boundary.
//!
//! Most failure modes in this scheduler (a guest raising inside `work()`,
//! a soft or hard timeout, a dead worker thread) are handled internally —
//! logged, and resolved by aborting or replacing the offending party —
//! and never reach the caller. Only programming-bug-shaped misuse of the
//! public API surfaces as a `Result`.

use thiserror::Error;

/// Errors a caller of the scheduler façade can observe.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `queue()` was called with an executor that is already on the run
    /// queue. This is a caller bug: the precondition is that the caller
    /// holds the executor's own enqueue lock and has not already queued
    /// it.
    #[error("executor {id} is already queued")]
    AlreadyQueued { id: u64 },

    /// A worker or the monitor thread was still alive after `stop()`'s
    /// join deadline elapsed. Shutdown proceeds regardless; this is
    /// reported so the host can decide whether to treat it as fatal.
    #[error("worker {worker} did not join within the shutdown deadline")]
    JoinTimedOut { worker: crate::executor::WorkerId },

    /// A worker or the monitor thread terminated via an uncaught panic
    /// (discovered when `stop()` joins it) rather than returning from its
    /// normal run loop. Whatever shared state that thread was mutating
    /// outside a lock at the moment it panicked is of unknown shape, so
    /// this is escalated to the caller rather than silently ignored.
    #[error("a thread panicked during shutdown; scheduler state is unreliable")]
    ShutdownInterrupted,
}
