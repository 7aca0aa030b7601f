// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-executor cumulative-time accounting and abort flags.
//!
//! Owned by the executor, driven by the monitor. `reset()` is called by
//! the executor's own `before_work()`; `refresh()` is polled by the
//! monitor once per `check_runners()` pass and is the only place soft
//! abort is raised. `hard_abort()` is an explicit monitor action once the
//! soft-abort grace window has elapsed.
//!
//! This type holds no opinion on how long is too long — the soft-abort
//! threshold is threaded in by the caller (the monitor, reading it from
//! `SchedulerConfig`) rather than hardcoded, so tests can run the
//! escalation ladder in milliseconds instead of the production
//! multi-second windows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cumulative per-slice timeout state for one executor.
#[derive(Debug)]
pub struct TimeoutState {
    slice_start: Mutex<Instant>,
    soft_aborted: AtomicBool,
    hard_aborted: AtomicBool,
    paused: AtomicBool,
}

impl TimeoutState {
    pub fn new() -> Self {
        Self {
            slice_start: Mutex::new(Instant::now()),
            soft_aborted: AtomicBool::new(false),
            hard_aborted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// Reset the per-slice timer and clear all flags. Called from
    /// `Executor::before_work()`, before the executor is published to
    /// the monitor.
    pub fn reset(&self) {
        *self.slice_start.lock().unwrap() = Instant::now();
        self.soft_aborted.store(false, Ordering::Release);
        self.hard_aborted.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
    }

    /// Nanoseconds elapsed since the slice started (or was last reset).
    pub fn nano_cumulative(&self) -> i64 {
        self.slice_start
            .lock()
            .unwrap()
            .elapsed()
            .as_nanos()
            .min(i64::MAX as u128) as i64
    }

    /// Advance the state machine: past `soft_timeout`, raise both the
    /// cooperative-pause and soft-abort flags so the guest can notice at
    /// its next safepoint. Idempotent — a spurious extra call is cheap.
    pub fn refresh(&self, soft_timeout: Duration) {
        if self.nano_cumulative() >= soft_timeout.as_nanos() as i64 {
            self.paused.store(true, Ordering::Release);
            self.soft_aborted.store(true, Ordering::Release);
        }
    }

    /// Raise the hard-abort flag. Called by the monitor once `refresh()`
    /// has had a full `ABORT_TIMEOUT` grace window to work.
    pub fn hard_abort(&self) {
        self.hard_aborted.store(true, Ordering::Release);
    }

    pub fn is_soft_aborted(&self) -> bool {
        self.soft_aborted.load(Ordering::Acquire)
    }

    pub fn is_hard_aborted(&self) -> bool {
        self.hard_aborted.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

impl Default for TimeoutState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_not_aborted() {
        let t = TimeoutState::new();
        assert!(!t.is_soft_aborted());
        assert!(!t.is_paused());
        assert!(!t.is_hard_aborted());
        assert!(t.nano_cumulative() >= 0);
    }

    #[test]
    fn refresh_before_timeout_is_noop() {
        let t = TimeoutState::new();
        t.refresh(Duration::from_secs(7));
        assert!(!t.is_soft_aborted());
    }

    #[test]
    fn refresh_past_timeout_raises_flags() {
        let t = TimeoutState::new();
        std::thread::sleep(Duration::from_millis(5));
        t.refresh(Duration::from_millis(1));
        assert!(t.is_soft_aborted());
        assert!(t.is_paused());
    }

    #[test]
    fn reset_clears_flags_and_timer() {
        let t = TimeoutState::new();
        t.hard_abort();
        assert!(t.is_hard_aborted());
        t.reset();
        assert!(!t.is_hard_aborted());
        assert!(!t.is_soft_aborted());
        assert!(!t.is_paused());
    }

    #[test]
    fn hard_abort_is_independent_of_soft_abort() {
        let t = TimeoutState::new();
        t.hard_abort();
        assert!(t.is_hard_aborted());
        assert!(!t.is_soft_aborted());
    }
}
