//! Dispatch sources: monitored conditions bound to a tasklet and a queue
//!
//! A source is created suspended (count = 1) and delivers nothing until
//! resumed. Occurrences of the same kind are coalesced between handler
//! invocations; `get_data` reports how much, per kind:
//!
//! | kind          | data                                   |
//! |---------------|----------------------------------------|
//! | readable fd   | estimated bytes available              |
//! | writable fd   | estimated free buffer space            |
//! | timer         | firings coalesced since last delivery  |
//! | signal        | occurrences coalesced since last       |
//! | counter       | merged application value               |
//!
//! Cancellation is asynchronous and the cancel handler runs exactly once,
//! strictly after the last event-handler invocation has returned; it is the
//! only safe point to close the monitored resource.

use crate::counters::ResourceKind;
use crate::queue::DispatchQueue;
use crate::signal::{self, SignalError};
use crate::tasklet::Tasklet;
use parking_lot::{Mutex, ReentrantMutex};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strand_runloop::{Interest, IoToken, ObserverToken, TimerToken};

/// Unique identifier for a dispatch source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl SourceId {
    fn new() -> Self {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// What a source monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// An fd becoming readable.
    Readable(RawFd),
    /// An fd becoming writable.
    Writable(RawFd),
    /// A timer configured with [`DispatchSource::set_timer`].
    Timer,
    /// Occurrences of one signal number.
    Signal(i32),
    /// An application-merged counter.
    Counter,
}

/// Timer configuration for timer-kind sources. A zero interval is one-shot.
#[derive(Debug, Clone, Copy)]
struct TimerSpec {
    delay: Duration,
    interval: Duration,
    #[allow(dead_code)]
    leeway: Duration,
}

struct Handlers {
    event: Option<Box<dyn FnMut(u64) + Send>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct Registration {
    io: Option<IoToken>,
    timer: Option<TimerToken>,
    observer: Option<ObserverToken>,
    hooked: bool,
}

/// A monitored condition with event and cancel handlers.
pub struct DispatchSource {
    id: SourceId,
    kind: SourceKind,
    tasklet: Weak<Tasklet>,
    weak_self: Weak<DispatchSource>,
    target: Mutex<Arc<DispatchQueue>>,
    suspend_count: AtomicUsize,
    cancelled: AtomicBool,
    cancel_delivered: AtomicBool,
    pending: Arc<AtomicU64>,
    last_data: AtomicU64,
    handlers: Mutex<Handlers>,
    // Serializes handler invocations; reentrant so a handler may run the
    // loop (and thus other callouts) on its own thread.
    gate: ReentrantMutex<()>,
    registration: Mutex<Registration>,
    timer_spec: Mutex<Option<TimerSpec>>,
}

impl DispatchSource {
    /// Create a readable-fd source, suspended.
    pub fn readable(
        tasklet: &Arc<Tasklet>,
        fd: RawFd,
        queue: &Arc<DispatchQueue>,
    ) -> Arc<DispatchSource> {
        Self::build(tasklet, SourceKind::Readable(fd), queue)
    }

    /// Create a writable-fd source, suspended.
    pub fn writable(
        tasklet: &Arc<Tasklet>,
        fd: RawFd,
        queue: &Arc<DispatchQueue>,
    ) -> Arc<DispatchSource> {
        Self::build(tasklet, SourceKind::Writable(fd), queue)
    }

    /// Create a timer-kind source, suspended. Configure with
    /// [`DispatchSource::set_timer`].
    pub fn timer(tasklet: &Arc<Tasklet>, queue: &Arc<DispatchQueue>) -> Arc<DispatchSource> {
        Self::build(tasklet, SourceKind::Timer, queue)
    }

    /// Create a signal-kind source, suspended. Delivery goes through the
    /// owning tasklet's loop (self-pipe), not the signal context.
    pub fn signal(
        tasklet: &Arc<Tasklet>,
        signum: i32,
        queue: &Arc<DispatchQueue>,
    ) -> Result<Arc<DispatchSource>, SignalError> {
        signal::validate_signum(signum)?;
        Ok(Self::build(tasklet, SourceKind::Signal(signum), queue))
    }

    /// Create a coalesced-counter source, suspended. Feed it with
    /// [`DispatchSource::merge_data`].
    pub fn counter(tasklet: &Arc<Tasklet>, queue: &Arc<DispatchQueue>) -> Arc<DispatchSource> {
        Self::build(tasklet, SourceKind::Counter, queue)
    }

    fn build(
        tasklet: &Arc<Tasklet>,
        kind: SourceKind,
        queue: &Arc<DispatchQueue>,
    ) -> Arc<DispatchSource> {
        let source = Arc::new_cyclic(|weak: &Weak<DispatchSource>| DispatchSource {
            id: SourceId::new(),
            kind,
            tasklet: Arc::downgrade(tasklet),
            weak_self: weak.clone(),
            target: Mutex::new(queue.clone()),
            suspend_count: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
            cancel_delivered: AtomicBool::new(false),
            pending: Arc::new(AtomicU64::new(0)),
            last_data: AtomicU64::new(0),
            handlers: Mutex::new(Handlers {
                event: None,
                cancel: None,
            }),
            gate: ReentrantMutex::new(()),
            registration: Mutex::new(Registration::default()),
            timer_spec: Mutex::new(None),
        });
        tasklet.register_source(&source);
        source
    }

    fn self_arc(&self) -> Option<Arc<DispatchSource>> {
        self.weak_self.upgrade()
    }

    /// The source's identifier.
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// What the source monitors.
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub(crate) fn counter_kind(&self) -> ResourceKind {
        match self.kind {
            SourceKind::Readable(_) | SourceKind::Writable(_) => ResourceKind::Socket,
            _ => ResourceKind::Source,
        }
    }

    /// Set the event handler. The argument is the coalesced data for the
    /// delivery, also readable via [`DispatchSource::get_data`].
    pub fn set_event_handler(&self, handler: impl FnMut(u64) + Send + 'static) {
        self.handlers.lock().event = Some(Box::new(handler));
    }

    /// Set the cancel handler.
    pub fn set_cancel_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.handlers.lock().cancel = Some(Box::new(handler));
    }

    /// Re-parent the source's delivery onto another queue.
    pub fn set_target_queue(&self, queue: &Arc<DispatchQueue>) {
        *self.target.lock() = queue.clone();
    }

    /// Coalesced data of the latest delivery.
    pub fn get_data(&self) -> u64 {
        self.last_data.load(Ordering::Relaxed)
    }

    /// Current suspend count.
    pub fn suspend_count(&self) -> usize {
        self.suspend_count.load(Ordering::Relaxed)
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Increment the suspend count; no event handler runs while it is
    /// above zero. Occurrences keep coalescing.
    pub fn suspend(&self) {
        let prev = self.suspend_count.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            self.deactivate();
        }
    }

    /// Decrement the suspend count, arming the source at zero.
    ///
    /// Resuming a source whose count is already zero is a fatal usage
    /// error: the underlying reactor exposes no count query, so this layer
    /// is the only place the balance can be enforced.
    pub fn resume(&self) {
        let mut count = self.suspend_count.load(Ordering::SeqCst);
        loop {
            assert!(count > 0, "suspend-count underflow: source resumed past zero");
            match self.suspend_count.compare_exchange(
                count,
                count - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => count = current,
            }
        }
        if count == 1 && !self.cancelled.load(Ordering::SeqCst) {
            self.activate();
        }
    }

    /// Merge an application value into a counter-kind source and schedule
    /// delivery. Fatal on any other kind.
    pub fn merge_data(&self, value: u64) {
        assert!(
            matches!(self.kind, SourceKind::Counter),
            "merge_data on a non-counter source"
        );
        if value == 0 {
            return;
        }
        self.pending.fetch_add(value, Ordering::Relaxed);
        if let Some(tasklet) = self.tasklet.upgrade() {
            tasklet.loop_handle().wake();
        }
    }

    /// Configure a timer-kind source. A zero `interval` is one-shot.
    /// Fatal on any other kind.
    pub fn set_timer(&self, delay: Duration, interval: Duration, leeway: Duration) {
        assert!(
            matches!(self.kind, SourceKind::Timer),
            "set_timer on a non-timer source"
        );
        *self.timer_spec.lock() = Some(TimerSpec {
            delay,
            interval,
            leeway,
        });
        if self.suspend_count.load(Ordering::SeqCst) == 0 && !self.cancelled.load(Ordering::SeqCst)
        {
            if let Some(tasklet) = self.tasklet.upgrade() {
                self.disarm_timer(&tasklet);
                self.arm_timer(&tasklet, None);
            }
        }
    }

    /// Request cancellation. Asynchronous: the cancel handler is delivered
    /// through the target queue, or captured for replay if the owning
    /// tasklet is blocked on a different source.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.deactivate();
        let tasklet = match self.tasklet.upgrade() {
            Some(tasklet) => tasklet,
            None => return,
        };
        let this = match self.self_arc() {
            Some(this) => this,
            None => return,
        };
        if tasklet.is_blocked_on_other(self.id) {
            tasklet.push_deferred(crate::deferred::DeferredWork::SourceCancel { source: this });
            return;
        }
        let queue = self.target.lock().clone();
        queue.execute(Box::new(move || this.deliver_cancel()));
    }

    // ---- activation ------------------------------------------------------

    fn activate(&self) {
        let tasklet = match self.tasklet.upgrade() {
            Some(tasklet) => tasklet,
            None => return,
        };
        match self.kind {
            SourceKind::Readable(_) | SourceKind::Writable(_) => self.arm_io(&tasklet),
            SourceKind::Timer => {
                if self.timer_spec.lock().is_some() {
                    self.arm_timer(&tasklet, None);
                }
            }
            SourceKind::Signal(signum) => {
                let hook = signal::SourceHook {
                    source: self.id.as_u64(),
                    pending: self.pending.clone(),
                    wake: tasklet.loop_handle(),
                };
                // Range was validated at construction.
                signal::add_source_hook(signum, hook).expect("signal number went out of range");
                self.registration.lock().hooked = true;
                self.arm_observer(&tasklet);
            }
            SourceKind::Counter => self.arm_observer(&tasklet),
        }
    }

    fn deactivate(&self) {
        let (io, timer, observer, hooked) = {
            let mut registration = self.registration.lock();
            (
                registration.io.take(),
                registration.timer.take(),
                registration.observer.take(),
                std::mem::take(&mut registration.hooked),
            )
        };
        if let Some(tasklet) = self.tasklet.upgrade() {
            let runloop = tasklet.runloop();
            if let Some(token) = io {
                runloop.remove_io(token);
            }
            if let Some(token) = timer {
                runloop.remove_timer(token);
            }
            if let Some(token) = observer {
                runloop.remove_wake_observer(token);
            }
        }
        if hooked {
            if let SourceKind::Signal(signum) = self.kind {
                signal::remove_source_hook(signum, self.id.as_u64());
            }
        }
    }

    fn arm_io(&self, tasklet: &Arc<Tasklet>) {
        let (fd, interest) = match self.kind {
            SourceKind::Readable(fd) => (fd, Interest::Readable),
            SourceKind::Writable(fd) => (fd, Interest::Writable),
            _ => return,
        };
        let weak = self.weak_self.clone();
        let token = tasklet.runloop().add_io(fd, interest, move |_| {
            if let Some(source) = weak.upgrade() {
                source.on_readiness();
            }
        });
        self.registration.lock().io = Some(token);
    }

    /// Remove the fd watch without touching any other state. Used both by
    /// blocking-mode relocation and by the disarm-around-delivery window
    /// for cross-thread targets.
    pub(crate) fn disarm_io(&self, tasklet: &Arc<Tasklet>) {
        let token = self.registration.lock().io.take();
        if let Some(token) = token {
            tasklet.runloop().remove_io(token);
        }
    }

    /// Put the fd watch back if the source is still eligible for delivery.
    pub(crate) fn rearm_io(&self, tasklet: &Arc<Tasklet>) {
        if self.cancelled.load(Ordering::SeqCst)
            || self.suspend_count.load(Ordering::SeqCst) > 0
            || self.registration.lock().io.is_some()
        {
            return;
        }
        self.arm_io(tasklet);
    }

    fn arm_timer(&self, tasklet: &Arc<Tasklet>, override_delay: Option<Duration>) {
        let spec = match *self.timer_spec.lock() {
            Some(spec) => spec,
            None => return,
        };
        let delay = override_delay.unwrap_or(spec.delay);
        let interval = if spec.interval.is_zero() {
            None
        } else {
            Some(spec.interval)
        };
        let weak = self.weak_self.clone();
        let token = tasklet
            .runloop()
            .add_timer(Instant::now() + delay, interval, move |periods| {
                if let Some(source) = weak.upgrade() {
                    source.on_timer_fire(periods);
                }
            });
        self.registration.lock().timer = Some(token);
    }

    fn disarm_timer(&self, tasklet: &Arc<Tasklet>) {
        let token = self.registration.lock().timer.take();
        if let Some(token) = token {
            tasklet.runloop().remove_timer(token);
        }
    }

    fn arm_observer(&self, tasklet: &Arc<Tasklet>) {
        let weak = self.weak_self.clone();
        let token = tasklet.runloop().add_wake_observer(move || {
            if let Some(source) = weak.upgrade() {
                source.on_wake_check();
            }
        });
        self.registration.lock().observer = Some(token);
    }

    /// Whether the source is one-shot (timer kind with a zero interval).
    pub(crate) fn is_one_shot_timer(&self) -> bool {
        matches!(self.kind, SourceKind::Timer)
            && self
                .timer_spec
                .lock()
                .map(|spec| spec.interval.is_zero())
                .unwrap_or(false)
    }

    /// Drop the stale one-shot registration token after the loop removed it.
    pub(crate) fn clear_timer_token(&self) {
        self.registration.lock().timer = None;
    }

    /// Re-arm a relocated one-shot timer source with an epsilon delay.
    pub(crate) fn rearm_after_relocation(&self, tasklet: &Arc<Tasklet>, epsilon: Duration) {
        if self.cancelled.load(Ordering::SeqCst) || self.suspend_count.load(Ordering::SeqCst) > 0 {
            return;
        }
        self.arm_timer(tasklet, Some(epsilon));
    }

    /// Whether the source still has any live reactor registration. Feeds
    /// the timeout-vs-wakeup disambiguation of a blocking call.
    pub(crate) fn is_armed(&self) -> bool {
        let registration = self.registration.lock();
        registration.io.is_some()
            || registration.timer.is_some()
            || registration.observer.is_some()
            || registration.hooked
    }

    pub(crate) fn take_pending(&self) -> u64 {
        self.pending.swap(0, Ordering::Relaxed)
    }

    // ---- delivery --------------------------------------------------------

    /// Readiness callout from the loop; runs on the driving thread.
    fn on_readiness(&self) {
        let tasklet = match self.tasklet.upgrade() {
            Some(tasklet) => tasklet,
            None => return,
        };
        let this = match self.self_arc() {
            Some(this) => this,
            None => return,
        };
        if tasklet.intercept_readiness(&this) {
            return;
        }
        if self.cancelled.load(Ordering::SeqCst) || self.suspend_count.load(Ordering::SeqCst) > 0 {
            return;
        }
        let data = self.estimate_data();
        self.deliver_on_queue(&tasklet, data);
    }

    /// Timer callout from the loop.
    fn on_timer_fire(&self, periods: u64) {
        let tasklet = match self.tasklet.upgrade() {
            Some(tasklet) => tasklet,
            None => return,
        };
        let this = match self.self_arc() {
            Some(this) => this,
            None => return,
        };
        if tasklet.intercept_timer_source(&this) {
            return;
        }
        if self.is_one_shot_timer() {
            self.clear_timer_token();
        }
        if self.cancelled.load(Ordering::SeqCst) || self.suspend_count.load(Ordering::SeqCst) > 0 {
            return;
        }
        self.deliver_on_queue(&tasklet, periods);
    }

    /// Wake-observer callout for signal-kind and counter-kind sources.
    fn on_wake_check(&self) {
        if self.pending.load(Ordering::Relaxed) == 0 {
            return;
        }
        let tasklet = match self.tasklet.upgrade() {
            Some(tasklet) => tasklet,
            None => return,
        };
        if self.cancelled.load(Ordering::SeqCst) {
            self.pending.store(0, Ordering::Relaxed);
            return;
        }
        if self.suspend_count.load(Ordering::SeqCst) > 0 {
            // Keep coalescing until resumed.
            return;
        }
        let this = match self.self_arc() {
            Some(this) => this,
            None => return,
        };
        if tasklet.intercept_wake_source(&this) {
            return;
        }
        let data = self.take_pending();
        if data == 0 {
            return;
        }
        self.deliver_on_queue(&tasklet, data);
    }

    /// Route a delivery through the target queue. Main-queue targets run
    /// inline (the callout already executes on the driving thread); other
    /// targets get the fd watch disarmed for the delivery window so a
    /// level-triggered readiness cannot double-fire before the handler
    /// drains it.
    fn deliver_on_queue(&self, tasklet: &Arc<Tasklet>, data: u64) {
        let queue = self.target.lock().clone();
        if queue.is_main_of(tasklet.id()) {
            self.deliver(data);
            return;
        }
        let this = match self.self_arc() {
            Some(this) => this,
            None => return,
        };
        let fd_kind = matches!(self.kind, SourceKind::Readable(_) | SourceKind::Writable(_));
        if fd_kind {
            self.disarm_io(tasklet);
        }
        queue.execute(Box::new(move || {
            this.deliver(data);
            if fd_kind {
                if let Some(tasklet) = this.tasklet.upgrade() {
                    this.rearm_io(&tasklet);
                }
            }
        }));
    }

    /// Invoke the event handler once with `data`. Exactly-once and
    /// never-while-suspended are enforced here, under the delivery gate.
    pub(crate) fn deliver(&self, data: u64) {
        let _gate = self.gate.lock();
        if self.cancelled.load(Ordering::SeqCst)
            || self.cancel_delivered.load(Ordering::SeqCst)
            || self.suspend_count.load(Ordering::SeqCst) > 0
        {
            return;
        }
        self.last_data.store(data, Ordering::Relaxed);
        let handler = self.handlers.lock().event.take();
        let mut handler = match handler {
            Some(handler) => handler,
            None => return,
        };
        if let Some(tasklet) = self.tasklet.upgrade() {
            tasklet
                .scheduler()
                .timed_callout("source event handler", || handler(data));
        } else {
            handler(data);
        }
        let mut handlers = self.handlers.lock();
        if handlers.event.is_none() {
            handlers.event = Some(handler);
        }
    }

    /// Invoke the cancel handler, once, and drop the source from its
    /// tasklet's registry.
    pub(crate) fn deliver_cancel(&self) {
        let _gate = self.gate.lock();
        if self.cancel_delivered.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = self.handlers.lock().cancel.take();
        let tasklet = self.tasklet.upgrade();
        if let Some(handler) = handler {
            match &tasklet {
                Some(tasklet) => tasklet
                    .scheduler()
                    .timed_callout("source cancel handler", handler),
                None => handler(),
            }
        }
        if let Some(tasklet) = tasklet {
            tasklet.unregister_source(self);
        }
    }

    /// Teardown path: invalidate without running any handler.
    pub(crate) fn force_invalidate(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_delivered.store(true, Ordering::SeqCst);
        self.deactivate();
        let mut handlers = self.handlers.lock();
        handlers.event = None;
        handlers.cancel = None;
    }

    fn estimate_data(&self) -> u64 {
        match self.kind {
            SourceKind::Readable(fd) => readable_bytes(fd),
            SourceKind::Writable(fd) => writable_space(fd),
            _ => 1,
        }
    }
}

/// Estimated bytes available for reading on `fd`.
fn readable_bytes(fd: RawFd) -> u64 {
    let mut available: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
    if rc == 0 && available >= 0 {
        (available as u64).max(1)
    } else {
        1
    }
}

/// Estimated free buffer space for writing on `fd`.
fn writable_space(fd: RawFd) -> u64 {
    // TIOCOUTQ reports unsent bytes for sockets; anything else gets a
    // conservative page-sized estimate.
    let mut queued: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut queued) };
    if rc == 0 && queued >= 0 {
        const SEND_BUFFER_GUESS: u64 = 64 * 1024;
        SEND_BUFFER_GUESS.saturating_sub(queued as u64).max(1)
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Scheduler;

    fn fixture() -> (Arc<Scheduler>, Arc<Tasklet>) {
        let scheduler = Scheduler::new();
        let tasklet = Tasklet::new(&scheduler);
        (scheduler, tasklet)
    }

    #[test]
    fn test_source_starts_suspended() {
        let (_scheduler, tasklet) = fixture();
        let queue = tasklet.main_queue();
        let source = DispatchSource::counter(&tasklet, &queue);

        assert_eq!(source.suspend_count(), 1);
        assert!(!source.is_cancelled());
        assert!(!source.is_armed());
        tasklet.shutdown();
    }

    #[test]
    fn test_suspend_resume_balance() {
        let (_scheduler, tasklet) = fixture();
        let queue = tasklet.main_queue();
        let source = DispatchSource::counter(&tasklet, &queue);

        source.suspend();
        assert_eq!(source.suspend_count(), 2);
        source.resume();
        source.resume();
        assert_eq!(source.suspend_count(), 0);
        assert!(source.is_armed());
        tasklet.shutdown();
    }

    #[test]
    #[should_panic(expected = "suspend-count underflow")]
    fn test_resume_past_zero_is_fatal() {
        let (_scheduler, tasklet) = fixture();
        let queue = tasklet.main_queue();
        let source = DispatchSource::counter(&tasklet, &queue);

        source.resume();
        source.resume();
    }

    #[test]
    #[should_panic(expected = "merge_data on a non-counter source")]
    fn test_merge_data_requires_counter_kind() {
        let (_scheduler, tasklet) = fixture();
        let queue = tasklet.main_queue();
        let source = DispatchSource::timer(&tasklet, &queue);
        source.merge_data(1);
    }

    #[test]
    #[should_panic(expected = "set_timer on a non-timer source")]
    fn test_set_timer_requires_timer_kind() {
        let (_scheduler, tasklet) = fixture();
        let queue = tasklet.main_queue();
        let source = DispatchSource::counter(&tasklet, &queue);
        source.set_timer(Duration::from_millis(1), Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn test_signal_source_rejects_out_of_range() {
        let (_scheduler, tasklet) = fixture();
        let queue = tasklet.main_queue();
        let result = DispatchSource::signal(&tasklet, 99, &queue);
        assert!(result.is_err());
        tasklet.shutdown();
    }
}
