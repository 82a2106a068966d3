//! Scheduler instance: the process-wide root of the object graph
//!
//! An instance wraps the global lanes behind implicit queue handles, keeps
//! the tasklet registry, and carries the latency-check threshold, a pure
//! observability feature: callbacks running longer than the threshold emit
//! a warning naming the callout and its elapsed time, and never alter
//! control flow.

use crate::queue::DispatchQueue;
use crate::tasklet::{Tasklet, TaskletId};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_runloop::Priority;

/// Default latency-check threshold.
pub const DEFAULT_LATENCY_CHECK: Duration = Duration::from_millis(2000);

struct StaticPool {
    capacity: usize,
    live: AtomicUsize,
}

#[derive(Default)]
struct Stats {
    tasklets_created: AtomicU64,
    callbacks_dispatched: AtomicU64,
    latency_violations: AtomicU64,
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasklets ever created against this instance.
    pub tasklets_created: u64,
    /// Tasklets currently registered.
    pub tasklets_live: usize,
    /// Callbacks dispatched through the instance's timing wrapper.
    pub callbacks_dispatched: u64,
    /// Callbacks that exceeded the latency threshold.
    pub latency_violations: u64,
}

/// The process-wide scheduler root.
pub struct Scheduler {
    tasklets: DashMap<u64, Arc<Tasklet>>,
    latency_check_ms: AtomicU64,
    stats: Stats,
    globals: OnceCell<[Arc<DispatchQueue>; 4]>,
    static_pool: OnceCell<StaticPool>,
}

impl Scheduler {
    /// Create an instance and wrap the global lanes.
    pub fn new() -> Arc<Scheduler> {
        let scheduler = Arc::new(Scheduler {
            tasklets: DashMap::new(),
            latency_check_ms: AtomicU64::new(DEFAULT_LATENCY_CHECK.as_millis() as u64),
            stats: Stats::default(),
            globals: OnceCell::new(),
            static_pool: OnceCell::new(),
        });
        let globals = [
            DispatchQueue::global(&scheduler, Priority::High),
            DispatchQueue::global(&scheduler, Priority::Default),
            DispatchQueue::global(&scheduler, Priority::Low),
            DispatchQueue::global(&scheduler, Priority::Background),
        ];
        scheduler
            .globals
            .set(globals)
            .unwrap_or_else(|_| unreachable!("global queues initialized twice"));
        scheduler
    }

    /// The implicit default queue (the default-priority global lane).
    pub fn default_queue(&self) -> Arc<DispatchQueue> {
        self.global_queue(Priority::Default)
    }

    /// The implicit shared queue for one priority class.
    pub fn global_queue(&self, priority: Priority) -> Arc<DispatchQueue> {
        let globals = self.globals.get().expect("global queues not initialized");
        let index = match priority {
            Priority::High => 0,
            Priority::Default => 1,
            Priority::Low => 2,
            Priority::Background => 3,
        };
        globals[index].clone()
    }

    /// Set the latency-check threshold. Zero disables the diagnostics.
    pub fn set_latency_check(&self, threshold: Duration) {
        self.latency_check_ms
            .store(threshold.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current latency-check threshold.
    pub fn latency_check(&self) -> Duration {
        Duration::from_millis(self.latency_check_ms.load(Ordering::Relaxed))
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasklets_created: self.stats.tasklets_created.load(Ordering::Relaxed),
            tasklets_live: self.tasklets.len(),
            callbacks_dispatched: self.stats.callbacks_dispatched.load(Ordering::Relaxed),
            latency_violations: self.stats.latency_violations.load(Ordering::Relaxed),
        }
    }

    /// Number of registered tasklets.
    pub fn tasklet_count(&self) -> usize {
        self.tasklets.len()
    }

    /// Initialize the static-thread subsystem. One-time, capacity-bounded;
    /// creating a static-thread queue without it is fatal, as is a second
    /// initialization.
    pub fn init_static_pool(&self, capacity: usize) {
        assert!(capacity > 0, "static-thread pool capacity must be positive");
        let pool = StaticPool {
            capacity,
            live: AtomicUsize::new(0),
        };
        assert!(
            self.static_pool.set(pool).is_ok(),
            "static-thread subsystem initialized twice"
        );
    }

    pub(crate) fn static_reserve(&self) {
        let pool = self
            .static_pool
            .get()
            .expect("static-thread subsystem is not initialized");
        let prev = pool.live.fetch_add(1, Ordering::SeqCst);
        assert!(
            prev < pool.capacity,
            "static-thread queue capacity ({}) exhausted",
            pool.capacity
        );
    }

    pub(crate) fn static_release(&self) {
        if let Some(pool) = self.static_pool.get() {
            pool.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn register_tasklet(&self, tasklet: &Arc<Tasklet>) {
        self.stats.tasklets_created.fetch_add(1, Ordering::Relaxed);
        self.tasklets
            .insert(tasklet.id().as_u64(), tasklet.clone());
    }

    pub(crate) fn deregister_tasklet(&self, id: TaskletId) {
        self.tasklets.remove(&id.as_u64());
    }

    /// Run a callout under the latency check: time it, count it, and warn
    /// when it overruns the threshold. Observability only: the result and
    /// control flow are untouched.
    pub(crate) fn timed_callout<R>(&self, label: &str, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        self.stats.callbacks_dispatched.fetch_add(1, Ordering::Relaxed);
        let threshold = self.latency_check();
        if !threshold.is_zero() && elapsed > threshold {
            self.stats.latency_violations.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "{} ran for {:?}, over the {:?} latency threshold",
                label,
                elapsed,
                threshold
            );
        }
        result
    }
}
