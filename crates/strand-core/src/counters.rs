//! Per-tasklet and process-wide resource accounting
//!
//! Pure bookkeeping: every create/release of a scheduler object adjusts a
//! live counter and a cumulative counter, both on the owning tasklet and on
//! the process-wide aggregate. The binding contract is the leak invariant:
//! after every create has seen its matching release, all live counts and
//! the byte count are back to zero.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Classes of tracked resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Standalone timers.
    Timer,
    /// File-descriptor sources (readable/writable).
    Socket,
    /// Generic sources (timer-kind, signal-kind, counter-kind).
    Source,
    /// Dispatch queues, including the per-tasklet main queue.
    Queue,
    /// Dedicated static-thread queue workers.
    StaticThread,
    /// Captured deferred work items.
    Deferred,
}

impl ResourceKind {
    fn index(self) -> usize {
        match self {
            ResourceKind::Timer => 0,
            ResourceKind::Socket => 1,
            ResourceKind::Source => 2,
            ResourceKind::Queue => 3,
            ResourceKind::StaticThread => 4,
            ResourceKind::Deferred => 5,
        }
    }
}

const KINDS: usize = 6;

/// Live and cumulative counts for one owner (a tasklet, or the process).
#[derive(Debug, Default)]
pub struct ResourceCounters {
    live: [AtomicUsize; KINDS],
    cumulative: [AtomicUsize; KINDS],
    bytes: AtomicUsize,
}

impl ResourceCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a create of `kind` occupying `bytes`.
    pub fn add(&self, kind: ResourceKind, bytes: usize) {
        self.live[kind.index()].fetch_add(1, Ordering::Relaxed);
        self.cumulative[kind.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record the matching release.
    pub fn remove(&self, kind: ResourceKind, bytes: usize) {
        let prev = self.live[kind.index()].fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "resource counter underflow for {:?}", kind);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Current live count for one kind.
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.live[kind.index()].load(Ordering::Relaxed)
    }

    /// Cumulative create count for one kind.
    pub fn cumulative(&self, kind: ResourceKind) -> usize {
        self.cumulative[kind.index()].load(Ordering::Relaxed)
    }

    /// Read-only snapshot. Idempotent: never mutates state.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            timers: self.live(ResourceKind::Timer),
            sockets: self.live(ResourceKind::Socket),
            sources: self.live(ResourceKind::Source),
            queues: self.live(ResourceKind::Queue),
            static_threads: self.live(ResourceKind::StaticThread),
            deferred_items: self.live(ResourceKind::Deferred),
            bytes: self.bytes.load(Ordering::Relaxed),
            cumulative_timers: self.cumulative(ResourceKind::Timer),
            cumulative_sockets: self.cumulative(ResourceKind::Socket),
            cumulative_sources: self.cumulative(ResourceKind::Source),
            cumulative_queues: self.cumulative(ResourceKind::Queue),
            cumulative_static_threads: self.cumulative(ResourceKind::StaticThread),
            cumulative_deferred_items: self.cumulative(ResourceKind::Deferred),
        }
    }

    /// Whether every live count and the byte count is zero.
    pub fn is_drained(&self) -> bool {
        self.live.iter().all(|count| count.load(Ordering::Relaxed) == 0)
            && self.bytes.load(Ordering::Relaxed) == 0
    }
}

/// Point-in-time view of one owner's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Live standalone timers.
    pub timers: usize,
    /// Live fd sources.
    pub sockets: usize,
    /// Live generic sources.
    pub sources: usize,
    /// Live queues.
    pub queues: usize,
    /// Live dedicated worker threads.
    pub static_threads: usize,
    /// Deferred work items awaiting replay.
    pub deferred_items: usize,
    /// Approximate bytes held by live objects.
    pub bytes: usize,
    /// Timers ever created.
    pub cumulative_timers: usize,
    /// Fd sources ever created.
    pub cumulative_sockets: usize,
    /// Generic sources ever created.
    pub cumulative_sources: usize,
    /// Queues ever created.
    pub cumulative_queues: usize,
    /// Dedicated workers ever created.
    pub cumulative_static_threads: usize,
    /// Deferred items ever captured.
    pub cumulative_deferred_items: usize,
}

static GLOBAL: Lazy<ResourceCounters> = Lazy::new(ResourceCounters::new);

/// The process-wide aggregate counters.
pub fn global_counters() -> &'static ResourceCounters {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_round_trip() {
        let counters = ResourceCounters::new();
        assert!(counters.is_drained());

        counters.add(ResourceKind::Timer, 64);
        counters.add(ResourceKind::Socket, 128);
        assert_eq!(counters.live(ResourceKind::Timer), 1);
        assert_eq!(counters.live(ResourceKind::Socket), 1);
        assert!(!counters.is_drained());

        counters.remove(ResourceKind::Timer, 64);
        counters.remove(ResourceKind::Socket, 128);
        assert!(counters.is_drained());

        // Cumulative counts survive the releases.
        assert_eq!(counters.cumulative(ResourceKind::Timer), 1);
        assert_eq!(counters.cumulative(ResourceKind::Socket), 1);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let counters = ResourceCounters::new();
        counters.add(ResourceKind::Queue, 256);

        let first = counters.snapshot();
        let second = counters.snapshot();
        assert_eq!(first, second);
        assert_eq!(first.queues, 1);
        assert_eq!(first.bytes, 256);
    }

    #[test]
    #[should_panic(expected = "resource counter underflow")]
    fn test_underflow_is_fatal() {
        let counters = ResourceCounters::new();
        counters.remove(ResourceKind::Timer, 0);
    }
}
