// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fair-share task scheduler for a fleet of sandboxed in-process computers.
//!
//! A bounded pool of worker threads drains a single run queue ordered by
//! accumulated virtual runtime (CFS-style fair share). A monitor thread
//! polls each worker's bound executor and escalates through a soft abort,
//! a hard abort, an interrupt, and finally worker replacement so that one
//! runaway computer cannot starve or permanently wedge the pool.
//!
//! Components, leaves-first:
//! - `executor`  — the capability interface the scheduler dispatches against
//! - `timeout`   — per-executor cumulative-time accounting and abort flags
//! - `queue`     — the virtual-runtime-ordered run queue
//! - `worker`    — worker thread loop (pop, bind, run one slice, report)
//! - `monitor`   — soft/hard abort escalation and dead-worker replacement
//! - `scheduler` — admission, completion accounting, lifecycle

mod error;
mod executor;
mod monitor;
mod queue;
mod scheduler;
mod timeout;
mod worker;

pub use error::SchedulerError;
pub use executor::{Executor, SchedulingCell, WorkerId};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use timeout::TimeoutState;
