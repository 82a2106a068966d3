//! Strand tasklet scheduler
//!
//! This crate lets independent logical execution contexts ("tasklets")
//! multiplex timers, fd readiness, Unix signals and queued work onto a
//! small number of OS threads, and layers a pseudo-synchronous
//! "block until this source or timeout" primitive on top of the inherently
//! asynchronous loop underneath:
//! - [`Scheduler`]: process-wide root holding the global queues, tasklet
//!   registry and latency diagnostics
//! - [`Tasklet`]: one execution context owning a loop, its queues, sources
//!   and timers
//! - [`DispatchQueue`] / [`DispatchSource`] / [`Timer`]: the monitored
//!   object model
//! - [`Tasklet::block_on`]: the blocking-mode controller; exactly one
//!   active callout per tasklet, nothing lost, nothing duplicated
//!
//! Programming-contract violations (double release, suspend-count
//! underflow, reentrant blocking entry, static-thread use before subsystem
//! initialization) abort rather than return errors; the only non-fatal
//! failure in the core is an out-of-range signal number.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod blocking;
mod counters;
mod deferred;
mod instance;
mod queue;
mod signal;
mod source;
mod tasklet;
mod timer;

pub use counters::{global_counters, CounterSnapshot, ResourceCounters, ResourceKind};
pub use instance::{Scheduler, SchedulerStats, DEFAULT_LATENCY_CHECK};
pub use queue::{DispatchQueue, QueueId, QueueKind, ServiceMode, StaticWorker};
pub use signal::{SignalDestructor, SignalError, SignalHandler, MAX_SIGNUM};
pub use source::{DispatchSource, SourceId, SourceKind};
pub use tasklet::{Tasklet, TaskletId};
pub use timer::{Timer, TimerId, TimerSchedule, TimerState};

pub use strand_runloop::{Priority, RunOutcome};
