//! Dispatch queues: FIFO and fan-out execution targets
//!
//! Serial queues run one item at a time in submission order; concurrent
//! queues fan out through their target with no cross-item ordering. The
//! per-tasklet main queue is driven synchronously by the tasklet's own
//! loop, which is what makes it subject to the blocking-mode deferral rule:
//! an `async`/`after` submission landing on the main queue of a blocked
//! tasklet is captured and replayed after the blocking call returns, never
//! run from inside the nested wait. Static-thread queues own a dedicated
//! worker, spawned by the scheduler or driven by the caller.

use crate::instance::Scheduler;
use crate::tasklet::{Tasklet, TaskletId};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use strand_runloop::{global_lanes, Job, Priority};

/// Unique identifier for a dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

impl QueueId {
    fn new() -> Self {
        QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Execution discipline of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Strict FIFO, one item at a time.
    Serial,
    /// Fan-out through the target; no cross-item ordering.
    Concurrent,
    /// The per-tasklet queue driven by the tasklet's own loop.
    Main,
    /// Wrapper over one of the process-global lanes.
    Global(Priority),
    /// Backed by a dedicated worker thread.
    StaticThread,
}

/// How a static-thread queue's worker is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// The scheduler spawns and drives the worker thread.
    Spawned,
    /// The caller drives the worker through a [`StaticWorker`] handle.
    CallerDriven,
}

enum StaticMsg {
    Work(Job),
    Stop,
}

struct StaticState {
    tx: Sender<StaticMsg>,
    worker: Option<thread::JoinHandle<()>>,
    mode: ServiceMode,
}

/// Caller-driven servicing handle for a static-thread queue.
///
/// Drive it from the thread of your choice until it reports stop.
pub struct StaticWorker {
    rx: Receiver<StaticMsg>,
}

impl StaticWorker {
    /// Block for one item and run it. Returns false once the queue has
    /// been released and the caller must stop the loop.
    pub fn service_one(&self) -> bool {
        match self.rx.recv() {
            Ok(StaticMsg::Work(job)) => {
                job();
                true
            }
            Ok(StaticMsg::Stop) | Err(_) => false,
        }
    }

    /// Service items until told to stop.
    pub fn run_until_stopped(&self) {
        while self.service_one() {}
    }
}

/// A FIFO or fan-out execution queue.
pub struct DispatchQueue {
    id: QueueId,
    label: String,
    kind: QueueKind,
    sched: Weak<Scheduler>,
    owner: Option<(TaskletId, Weak<Tasklet>)>,
    weak_self: Weak<DispatchQueue>,
    target: Mutex<Option<Arc<DispatchQueue>>>,
    pending: Mutex<VecDeque<Job>>,
    draining: AtomicBool,
    static_state: Mutex<Option<StaticState>>,
}

impl DispatchQueue {
    /// Create a serial queue owned by `tasklet`.
    pub fn serial(tasklet: &Arc<Tasklet>, label: &str) -> Arc<DispatchQueue> {
        Self::build(tasklet, label, QueueKind::Serial)
    }

    /// Create a concurrent queue owned by `tasklet`.
    pub fn concurrent(tasklet: &Arc<Tasklet>, label: &str) -> Arc<DispatchQueue> {
        Self::build(tasklet, label, QueueKind::Concurrent)
    }

    fn construct(
        label: String,
        kind: QueueKind,
        sched: Weak<Scheduler>,
        owner: Option<(TaskletId, Weak<Tasklet>)>,
    ) -> Arc<DispatchQueue> {
        Arc::new_cyclic(|weak: &Weak<DispatchQueue>| DispatchQueue {
            id: QueueId::new(),
            label,
            kind,
            sched,
            owner,
            weak_self: weak.clone(),
            target: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            static_state: Mutex::new(None),
        })
    }

    fn build(tasklet: &Arc<Tasklet>, label: &str, kind: QueueKind) -> Arc<DispatchQueue> {
        let queue = Self::construct(
            label.to_string(),
            kind,
            Arc::downgrade(tasklet.scheduler()),
            Some((tasklet.id(), Arc::downgrade(tasklet))),
        );
        tasklet.register_queue(&queue);
        queue
    }

    /// The per-tasklet main queue; built once in `Tasklet::new`.
    pub(crate) fn main(
        tasklet_id: TaskletId,
        tasklet: Weak<Tasklet>,
        sched: Weak<Scheduler>,
    ) -> Arc<DispatchQueue> {
        Self::construct(
            "main".to_string(),
            QueueKind::Main,
            sched,
            Some((tasklet_id, tasklet)),
        )
    }

    /// Wrapper over one process-global lane; built once in `Scheduler::new`.
    pub(crate) fn global(sched: &Arc<Scheduler>, priority: Priority) -> Arc<DispatchQueue> {
        Self::construct(
            format!("global-{:?}", priority).to_lowercase(),
            QueueKind::Global(priority),
            Arc::downgrade(sched),
            None,
        )
    }

    /// Create a static-thread queue.
    ///
    /// Requires [`Scheduler::init_static_pool`] to have run for this
    /// instance; skipping it, or exhausting the configured capacity, is a
    /// fatal contract violation. With [`ServiceMode::Spawned`] the worker
    /// thread is spawned and driven here; with
    /// [`ServiceMode::CallerDriven`] the returned [`StaticWorker`] must be
    /// driven by the caller until it reports stop.
    pub fn with_static_thread(
        tasklet: &Arc<Tasklet>,
        label: &str,
        mode: ServiceMode,
    ) -> (Arc<DispatchQueue>, Option<StaticWorker>) {
        let scheduler = tasklet.scheduler();
        scheduler.static_reserve();

        let (tx, rx) = channel::unbounded();
        let queue = Self::construct(
            label.to_string(),
            QueueKind::StaticThread,
            Arc::downgrade(scheduler),
            Some((tasklet.id(), Arc::downgrade(tasklet))),
        );

        let worker = match mode {
            ServiceMode::Spawned => {
                let handle = thread::Builder::new()
                    .name(format!("strand-static-{}", label))
                    .spawn(move || {
                        while let Ok(msg) = rx.recv() {
                            match msg {
                                StaticMsg::Work(job) => job(),
                                StaticMsg::Stop => break,
                            }
                        }
                    })
                    .expect("Failed to spawn static-thread queue worker");
                *queue.static_state.lock() = Some(StaticState {
                    tx,
                    worker: Some(handle),
                    mode,
                });
                None
            }
            ServiceMode::CallerDriven => {
                *queue.static_state.lock() = Some(StaticState {
                    tx,
                    worker: None,
                    mode,
                });
                Some(StaticWorker { rx })
            }
        };

        tasklet.register_static_queue(&queue);
        (queue, worker)
    }

    fn self_arc(&self) -> Option<Arc<DispatchQueue>> {
        self.weak_self.upgrade()
    }

    /// The queue's identifier.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Informational label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Execution discipline.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub(crate) fn is_main_of(&self, tasklet: TaskletId) -> bool {
        self.kind == QueueKind::Main
            && self.owner.as_ref().map(|(id, _)| *id) == Some(tasklet)
    }

    /// Re-parent the queue's execution target. Objects sharing a serial
    /// target never run concurrently.
    pub fn set_target(&self, target: &Arc<DispatchQueue>) {
        assert!(
            matches!(self.kind, QueueKind::Serial | QueueKind::Concurrent),
            "set_target on a {:?} queue",
            self.kind
        );
        *self.target.lock() = Some(target.clone());
    }

    /// Schedule `f` for later execution. FIFO per queue, non-blocking.
    ///
    /// A submission to the main queue of a tasklet that is inside a
    /// blocking call is captured and replayed, in arrival order, after the
    /// blocking call returns.
    pub fn async_fn(&self, f: impl FnOnce() + Send + 'static) {
        let sched = self.sched.clone();
        let timed: Job = Box::new(move || match sched.upgrade() {
            Some(scheduler) => scheduler.timed_callout("async dispatch", f),
            None => f(),
        });
        self.async_job(timed);
    }

    pub(crate) fn async_job(&self, job: Job) {
        if self.kind == QueueKind::Main {
            if let Some((_, weak)) = &self.owner {
                if let Some(tasklet) = weak.upgrade() {
                    if tasklet.is_blocked() {
                        tasklet
                            .push_deferred(crate::deferred::DeferredWork::AsyncDispatch { job });
                        return;
                    }
                }
            }
        }
        self.execute(job);
    }

    /// Like [`DispatchQueue::async_fn`], but not before `delay` has
    /// elapsed on `tasklet`'s loop. Subject to the same main-queue deferral
    /// rule if the deadline falls inside a blocking call.
    pub fn after(&self, tasklet: &Arc<Tasklet>, delay: Duration, f: impl FnOnce() + Send + 'static) {
        let queue = match self.self_arc() {
            Some(queue) => queue,
            None => return,
        };
        let sched = self.sched.clone();
        let mut slot = Some(f);
        tasklet
            .runloop()
            .add_timer(Instant::now() + delay, None, move |_| {
                if let Some(f) = slot.take() {
                    let sched = sched.clone();
                    queue.async_job(Box::new(move || match sched.upgrade() {
                        Some(scheduler) => scheduler.timed_callout("delayed dispatch", f),
                        None => f(),
                    }));
                }
            });
    }

    /// Run `f` on the queue and return only once it has executed.
    ///
    /// Direct pass-through: not subject to the main-queue deferral rule.
    /// Queues that execute elsewhere (static-thread, global lanes) hand the
    /// work over and wait for completion.
    pub fn sync_fn(&self, f: impl FnOnce() + Send + 'static) {
        match self.kind {
            QueueKind::StaticThread => {
                let (done_tx, done_rx) = channel::bounded(1);
                let sched = self.sched.clone();
                let sent = {
                    let state = self.static_state.lock();
                    match state.as_ref() {
                        Some(state) => state
                            .tx
                            .send(StaticMsg::Work(Box::new(move || {
                                match sched.upgrade() {
                                    Some(scheduler) => {
                                        scheduler.timed_callout("sync dispatch", f)
                                    }
                                    None => f(),
                                }
                                let _ = done_tx.send(());
                            })))
                            .is_ok(),
                        None => false,
                    }
                };
                assert!(sent, "sync dispatch to a released static-thread queue");
                done_rx
                    .recv()
                    .expect("static-thread queue stopped with sync dispatch in flight");
            }
            QueueKind::Global(priority) => {
                let (done_tx, done_rx) = channel::bounded(1);
                let sched = self.sched.clone();
                global_lanes().submit(
                    priority,
                    Box::new(move || {
                        match sched.upgrade() {
                            Some(scheduler) => scheduler.timed_callout("sync dispatch", f),
                            None => f(),
                        }
                        let _ = done_tx.send(());
                    }),
                );
                done_rx.recv().expect("global lane worker pool went away");
            }
            _ => match self.sched.upgrade() {
                Some(scheduler) => scheduler.timed_callout("sync dispatch", f),
                None => f(),
            },
        }
    }

    /// Raw execution primitive: run `job` with this queue's discipline.
    pub(crate) fn execute(&self, job: Job) {
        match self.kind {
            QueueKind::Main => {
                let tasklet = self.owner.as_ref().and_then(|(_, weak)| weak.upgrade());
                let tasklet = match tasklet {
                    Some(tasklet) => tasklet,
                    None => return,
                };
                // The blocked check repeats at execution time so work that
                // was already in flight when the blocking call began is
                // captured rather than run inside the nested wait.
                let weak = Arc::downgrade(&tasklet);
                let wrapped: Job = Box::new(move || {
                    if let Some(tasklet) = weak.upgrade() {
                        if tasklet.is_blocked() {
                            tasklet
                                .push_deferred(crate::deferred::DeferredWork::AsyncDispatch { job });
                        } else {
                            job();
                        }
                    }
                });
                tasklet.loop_handle().submit(wrapped);
            }
            QueueKind::Global(priority) => global_lanes().submit(priority, job),
            QueueKind::Serial => {
                self.pending.lock().push_back(job);
                self.schedule_drain();
            }
            QueueKind::Concurrent => match self.target_queue() {
                Some(target) => target.execute(job),
                None => job(),
            },
            QueueKind::StaticThread => {
                let state = self.static_state.lock();
                if let Some(state) = state.as_ref() {
                    let _ = state.tx.send(StaticMsg::Work(job));
                }
            }
        }
    }

    fn target_queue(&self) -> Option<Arc<DispatchQueue>> {
        if let Some(target) = self.target.lock().clone() {
            return Some(target);
        }
        self.sched.upgrade().map(|scheduler| scheduler.default_queue())
    }

    fn schedule_drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = match self.self_arc() {
            Some(queue) => queue,
            None => {
                self.drain();
                return;
            }
        };
        match self.target_queue() {
            Some(target) => target.execute(Box::new(move || queue.drain())),
            None => self.drain(),
        }
    }

    /// Serial drain: run queued items one at a time, then hand the lane
    /// back. A racing submission re-schedules the drain.
    fn drain(&self) {
        loop {
            let job = self.pending.lock().pop_front();
            match job {
                Some(job) => job(),
                None => break,
            }
        }
        self.draining.store(false, Ordering::SeqCst);
        if !self.pending.lock().is_empty() {
            self.schedule_drain();
        }
    }

    /// Release the queue from its owning tasklet.
    ///
    /// For static-thread queues only the creating tasklet may do this
    /// (checked, fatal); the dedicated worker is stopped and joined and the
    /// dedicated-thread counters drop. Implicit queues (main, global) are
    /// released with their owner, never explicitly.
    pub fn release(&self, tasklet: &Arc<Tasklet>) {
        match self.kind {
            QueueKind::Serial | QueueKind::Concurrent => tasklet.unregister_queue(self),
            QueueKind::StaticThread => {
                let creator = self.owner.as_ref().map(|(id, _)| *id);
                assert!(
                    creator == Some(tasklet.id()),
                    "only the creating tasklet may release a static-thread queue"
                );
                self.stop_worker();
                if let Some(scheduler) = self.sched.upgrade() {
                    scheduler.static_release();
                }
                tasklet.unregister_static_queue(self);
            }
            QueueKind::Main | QueueKind::Global(_) => {
                panic!("implicit queues are released with their owner")
            }
        }
    }

    /// Stop and join the dedicated worker, if any. Idempotent.
    pub(crate) fn stop_worker(&self) {
        let state = self.static_state.lock().take();
        if let Some(state) = state {
            let _ = state.tx.send(StaticMsg::Stop);
            if let Some(handle) = state.worker {
                if state.mode == ServiceMode::Spawned
                    && handle.thread().id() != thread::current().id()
                {
                    handle.join().expect("Failed to join static queue worker");
                }
            }
        }
    }

    /// Teardown path used by the owning tasklet: stop the worker and drop
    /// the pool reservation without the creator check.
    pub(crate) fn force_shutdown(&self) {
        if self.kind == QueueKind::StaticThread {
            self.stop_worker();
            if let Some(scheduler) = self.sched.upgrade() {
                scheduler.static_release();
            }
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        // Backstop for a static queue that was never released explicitly.
        let state = self.static_state.get_mut().take();
        if let Some(state) = state {
            let _ = state.tx.send(StaticMsg::Stop);
            if let Some(handle) = state.worker {
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Scheduler;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_queue_accessors() {
        let scheduler = Scheduler::new();
        let tasklet = Tasklet::new(&scheduler);
        let queue = DispatchQueue::serial(&tasklet, "work");

        assert_eq!(queue.kind(), QueueKind::Serial);
        assert_eq!(queue.label(), "work");
        tasklet.shutdown();
    }

    #[test]
    #[should_panic(expected = "static-thread subsystem is not initialized")]
    fn test_static_queue_requires_pool_init() {
        let scheduler = Scheduler::new();
        let tasklet = Tasklet::new(&scheduler);
        let _ = DispatchQueue::with_static_thread(&tasklet, "boom", ServiceMode::Spawned);
    }

    #[test]
    fn test_caller_driven_worker_services_items() {
        let scheduler = Scheduler::new();
        scheduler.init_static_pool(4);
        let tasklet = Tasklet::new(&scheduler);
        let (queue, worker) =
            DispatchQueue::with_static_thread(&tasklet, "manual", ServiceMode::CallerDriven);
        let worker = worker.expect("caller-driven mode returns a worker");

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            queue.async_fn(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.release(&tasklet);

        // Three items, then the stop message ends the loop.
        worker.run_until_stopped();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        tasklet.shutdown();
    }

    #[test]
    fn test_spawned_static_queue_runs_and_releases() {
        let scheduler = Scheduler::new();
        scheduler.init_static_pool(2);
        let tasklet = Tasklet::new(&scheduler);
        let (queue, worker) =
            DispatchQueue::with_static_thread(&tasklet, "auto", ServiceMode::Spawned);
        assert!(worker.is_none());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        queue.sync_fn(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        queue.release(&tasklet);
        tasklet.shutdown();
    }

    #[test]
    fn test_global_queue_sync_round_trip() {
        let scheduler = Scheduler::new();
        let queue = scheduler.default_queue();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        queue.sync_fn(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
