//! Tasklets: logical execution contexts over one loop
//!
//! A tasklet owns a reactor loop, the timers, sources and queues created
//! against it, its deferred-work list and its blocking-mode state. The
//! calling code chooses which OS thread drives the loop; per-tasklet
//! registries are only ever mutated by that thread, so they sit behind
//! plain mutexes with no contention in the steady state.
//!
//! Tearing a tasklet down force-releases everything it tracks and leaves
//! the resource counters at zero.

use crate::blocking::BlockState;
use crate::counters::{global_counters, CounterSnapshot, ResourceCounters, ResourceKind};
use crate::deferred::DeferredWork;
use crate::instance::Scheduler;
use crate::queue::DispatchQueue;
use crate::signal::{self, SignalDestructor, SignalError};
use crate::source::DispatchSource;
use crate::timer::Timer;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strand_runloop::{LoopHandle, RunLoop, RunOutcome};

/// Unique identifier for a tasklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskletId(u64);

static NEXT_TASKLET_ID: AtomicU64 = AtomicU64::new(1);

impl TaskletId {
    pub(crate) fn new() -> Self {
        TaskletId(NEXT_TASKLET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// One logical execution context.
pub struct Tasklet {
    id: TaskletId,
    sched: Arc<Scheduler>,
    rl: RunLoop,
    weak_self: Weak<Tasklet>,
    counters: ResourceCounters,
    main_queue: Arc<DispatchQueue>,
    timers: Mutex<FxHashMap<u64, Arc<Timer>>>,
    sources: Mutex<FxHashMap<u64, Arc<DispatchSource>>>,
    queues: Mutex<FxHashMap<u64, Arc<DispatchQueue>>>,
    deferred: Mutex<VecDeque<DeferredWork>>,
    block: Mutex<BlockState>,
    signals: Mutex<Vec<i32>>,
    shut: AtomicBool,
}

impl Tasklet {
    /// Create a tasklet registered with `scheduler`.
    pub fn new(scheduler: &Arc<Scheduler>) -> Arc<Tasklet> {
        let tasklet = Arc::new_cyclic(|weak: &Weak<Tasklet>| {
            let id = TaskletId::new();
            Tasklet {
                id,
                sched: scheduler.clone(),
                rl: RunLoop::new().expect("Failed to allocate a reactor loop"),
                weak_self: weak.clone(),
                counters: ResourceCounters::new(),
                main_queue: DispatchQueue::main(id, weak.clone(), Arc::downgrade(scheduler)),
                timers: Mutex::new(FxHashMap::default()),
                sources: Mutex::new(FxHashMap::default()),
                queues: Mutex::new(FxHashMap::default()),
                deferred: Mutex::new(VecDeque::new()),
                block: Mutex::new(BlockState::default()),
                signals: Mutex::new(Vec::new()),
                shut: AtomicBool::new(false),
            }
        });
        tasklet.track_add(ResourceKind::Queue, size_of::<DispatchQueue>());
        scheduler.register_tasklet(&tasklet);
        tasklet
    }

    /// The tasklet's identifier.
    pub fn id(&self) -> TaskletId {
        self.id
    }

    /// The owning scheduler instance.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// The queue driven synchronously by this tasklet's own loop.
    pub fn main_queue(&self) -> Arc<DispatchQueue> {
        self.main_queue.clone()
    }

    /// Drive the loop for at most `max` on the calling thread.
    pub fn run(&self, max: Duration) -> RunOutcome {
        self.rl.run(max)
    }

    /// Read-only snapshot of this tasklet's resource counters. Idempotent.
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Register a handler for `signum` on this tasklet.
    ///
    /// The handler runs synchronously inside the OS signal-delivery
    /// context and must restrict itself to async-signal-safe operations;
    /// use a signal-kind [`DispatchSource`] for anything heavier.
    /// Re-registering replaces the handler and invokes the prior
    /// destructor. Out-of-range signal numbers fail without aborting.
    pub fn register_signal(
        &self,
        signum: i32,
        handler: impl Fn(i32) + Send + Sync + 'static,
        destructor: Option<SignalDestructor>,
    ) -> Result<(), SignalError> {
        signal::register(self.id, signum, Arc::new(handler), destructor)?;
        let mut signals = self.signals.lock();
        if !signals.contains(&signum) {
            signals.push(signum);
        }
        Ok(())
    }

    /// Remove this tasklet's registration for `signum`, invoking its
    /// destructor.
    pub fn deregister_signal(&self, signum: i32) -> Result<(), SignalError> {
        signal::deregister(self.id, signum)?;
        self.signals.lock().retain(|registered| *registered != signum);
        Ok(())
    }

    /// Tear the tasklet down: run signal destructors, leave the instance
    /// registry, force-release every tracked timer, source and queue, and
    /// discard still-queued deferred work without executing it. Idempotent.
    pub fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        signal::deregister_tasklet(self.id);
        self.signals.lock().clear();
        self.sched.deregister_tasklet(self.id);

        let timers: Vec<Arc<Timer>> = self.timers.lock().drain().map(|(_, t)| t).collect();
        for timer in timers {
            timer.force_invalidate();
            self.track_remove(ResourceKind::Timer, size_of::<Timer>());
        }

        let sources: Vec<Arc<DispatchSource>> =
            self.sources.lock().drain().map(|(_, s)| s).collect();
        for source in sources {
            let kind = source.counter_kind();
            source.force_invalidate();
            self.track_remove(kind, size_of::<DispatchSource>());
        }

        let queues: Vec<Arc<DispatchQueue>> = self.queues.lock().drain().map(|(_, q)| q).collect();
        for queue in queues {
            let static_kind = queue.kind() == crate::queue::QueueKind::StaticThread;
            queue.force_shutdown();
            self.track_remove(ResourceKind::Queue, size_of::<DispatchQueue>());
            if static_kind {
                self.track_remove(ResourceKind::StaticThread, 0);
            }
        }
        self.track_remove(ResourceKind::Queue, size_of::<DispatchQueue>());

        while self.pop_deferred().is_some() {
            // Dropped without executing.
        }
    }

    // ---- crate-internal plumbing ----------------------------------------

    pub(crate) fn runloop(&self) -> &RunLoop {
        &self.rl
    }

    pub(crate) fn loop_handle(&self) -> LoopHandle {
        self.rl.handle()
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<Tasklet>> {
        self.weak_self.upgrade()
    }

    pub(crate) fn block_state(&self) -> &Mutex<BlockState> {
        &self.block
    }

    pub(crate) fn push_deferred(&self, work: DeferredWork) {
        self.track_add(ResourceKind::Deferred, size_of::<DeferredWork>());
        self.deferred.lock().push_back(work);
    }

    pub(crate) fn pop_deferred(&self) -> Option<DeferredWork> {
        let work = self.deferred.lock().pop_front();
        if work.is_some() {
            self.track_remove(ResourceKind::Deferred, size_of::<DeferredWork>());
        }
        work
    }

    pub(crate) fn register_timer(&self, timer: &Arc<Timer>) {
        assert!(
            !self.shut.load(Ordering::SeqCst),
            "resource created on a torn-down tasklet"
        );
        self.timers.lock().insert(timer.id().as_u64(), timer.clone());
        self.track_add(timer.counter_kind(), size_of::<Timer>());
    }

    pub(crate) fn unregister_timer(&self, timer: &Timer) {
        if self.timers.lock().remove(&timer.id().as_u64()).is_some() {
            self.track_remove(timer.counter_kind(), size_of::<Timer>());
        }
    }

    pub(crate) fn register_source(&self, source: &Arc<DispatchSource>) {
        assert!(
            !self.shut.load(Ordering::SeqCst),
            "resource created on a torn-down tasklet"
        );
        self.sources
            .lock()
            .insert(source.id().as_u64(), source.clone());
        self.track_add(source.counter_kind(), size_of::<DispatchSource>());
    }

    pub(crate) fn unregister_source(&self, source: &DispatchSource) {
        if self.sources.lock().remove(&source.id().as_u64()).is_some() {
            self.track_remove(source.counter_kind(), size_of::<DispatchSource>());
        }
    }

    pub(crate) fn register_queue(&self, queue: &Arc<DispatchQueue>) {
        assert!(
            !self.shut.load(Ordering::SeqCst),
            "resource created on a torn-down tasklet"
        );
        self.queues.lock().insert(queue.id().as_u64(), queue.clone());
        self.track_add(ResourceKind::Queue, size_of::<DispatchQueue>());
    }

    pub(crate) fn unregister_queue(&self, queue: &DispatchQueue) {
        if self.queues.lock().remove(&queue.id().as_u64()).is_some() {
            self.track_remove(ResourceKind::Queue, size_of::<DispatchQueue>());
        }
    }

    pub(crate) fn register_static_queue(&self, queue: &Arc<DispatchQueue>) {
        self.register_queue(queue);
        self.track_add(ResourceKind::StaticThread, 0);
    }

    pub(crate) fn unregister_static_queue(&self, queue: &DispatchQueue) {
        if self.queues.lock().remove(&queue.id().as_u64()).is_some() {
            self.track_remove(ResourceKind::Queue, size_of::<DispatchQueue>());
            self.track_remove(ResourceKind::StaticThread, 0);
        }
    }

    fn track_add(&self, kind: ResourceKind, bytes: usize) {
        self.counters.add(kind, bytes);
        global_counters().add(kind, bytes);
    }

    fn track_remove(&self, kind: ResourceKind, bytes: usize) {
        self.counters.remove(kind, bytes);
        global_counters().remove(kind, bytes);
    }
}

impl Drop for Tasklet {
    fn drop(&mut self) {
        self.shutdown();
    }
}
