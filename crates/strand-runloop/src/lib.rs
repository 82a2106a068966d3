//! Underlying event-notification primitive for the strand scheduler
//!
//! This crate provides the two low-level execution substrates the scheduler
//! builds on:
//! - [`RunLoop`]: a single-threaded, poll(2)-backed readiness loop with
//!   timers, fd watches, cross-thread job submission and a
//!   "run for duration" call whose outcome distinguishes stop-by-request
//!   from timeout
//! - [`LanePool`]: fan-out FIFO execution lanes (default plus priority
//!   classes) backed by a small worker-thread pool
//!
//! Opaque per-registration context is carried by the registered closures;
//! there is no separate context slot.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod lanes;
mod runloop;

pub use lanes::{global_lanes, LanePool, Priority};
pub use runloop::{
    Interest, IoToken, LoopHandle, ObserverToken, RunLoop, RunOutcome, TimerToken,
};

/// A unit of work submitted to a loop or a lane.
pub type Job = Box<dyn FnOnce() + Send + 'static>;
