//! Global fan-out execution lanes
//!
//! The scheduler's implicit global queues wrap these lanes: one FIFO
//! injector per priority class, drained high-to-low by a small pool of
//! worker threads. Items on one lane have no cross-item ordering guarantee.

use crate::Job;
use crossbeam_deque::{Injector, Steal};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Priority class of a global lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Serviced before every other class.
    High,
    /// The default class.
    Default,
    /// Serviced after the default class.
    Low,
    /// Serviced only when every other class is empty.
    Background,
}

impl Priority {
    const ALL: [Priority; 4] = [
        Priority::High,
        Priority::Default,
        Priority::Low,
        Priority::Background,
    ];

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Default => 1,
            Priority::Low => 2,
            Priority::Background => 3,
        }
    }
}

struct PoolShared {
    lanes: [Injector<Job>; 4],
    idle: Mutex<()>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// A pool of worker threads draining the priority lanes.
pub struct LanePool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl LanePool {
    /// Spawn a pool with `width` workers.
    pub fn new(width: usize) -> LanePool {
        let shared = Arc::new(PoolShared {
            lanes: [
                Injector::new(),
                Injector::new(),
                Injector::new(),
                Injector::new(),
            ],
            idle: Mutex::new(()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let workers = (0..width.max(1))
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("strand-lane-{}", index))
                    .spawn(move || LanePool::worker_loop(shared))
                    .expect("Failed to spawn lane worker thread")
            })
            .collect();

        LanePool { shared, workers }
    }

    /// Submit a job to a lane. FIFO per lane, fan-out across workers.
    pub fn submit(&self, priority: Priority, job: Job) {
        self.shared.lanes[priority.index()].push(job);
        self.shared.available.notify_one();
    }

    /// Number of worker threads.
    pub fn width(&self) -> usize {
        self.workers.len()
    }

    fn worker_loop(shared: Arc<PoolShared>) {
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            match Self::find_work(&shared) {
                Some(job) => job(),
                None => {
                    let mut idle = shared.idle.lock();
                    shared
                        .available
                        .wait_for(&mut idle, Duration::from_millis(50));
                }
            }
        }
    }

    /// Scan lanes high-to-low; retry on concurrent steals.
    fn find_work(shared: &PoolShared) -> Option<Job> {
        for priority in Priority::ALL {
            loop {
                match shared.lanes[priority.index()].steal() {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }
}

impl Drop for LanePool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            worker.join().expect("Failed to join lane worker thread");
        }
    }
}

static GLOBAL: Lazy<LanePool> = Lazy::new(|| {
    let width = num_cpus::get().clamp(2, 8);
    LanePool::new(width)
});

/// The process-wide lane pool, spawned on first use.
pub fn global_lanes() -> &'static LanePool {
    &GLOBAL
}
