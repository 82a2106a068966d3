//! Poll-backed single-threaded readiness loop
//!
//! One `RunLoop` exists per logical execution context. Whichever OS thread
//! calls [`RunLoop::run`] drives it; nested `run` calls from inside a
//! callback on the same thread are allowed, and [`RunLoop::stop`] always
//! stops the innermost run. Registration tables are never borrowed across a
//! callback invocation, so callbacks may freely add and remove registrations.

use crate::Job;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Readiness condition an fd watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Ready for reading.
    Readable,
    /// Ready for writing.
    Writable,
}

/// Why a [`RunLoop::run`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// [`RunLoop::stop`] was called from inside a callout.
    Stopped,
    /// The requested duration elapsed.
    TimedOut,
}

/// Handle to a registered fd watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(u64);

/// Handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Handle to a registered wake observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

type IoCallback = Box<dyn FnMut(Interest) + Send>;
type TimerCallback = Box<dyn FnMut(u64) + Send>;
type WakeObserver = Box<dyn FnMut() + Send>;

struct IoWatch {
    fd: RawFd,
    interest: Interest,
    callback: Arc<Mutex<IoCallback>>,
}

struct TimerEntry {
    fire_at: Instant,
    interval: Option<Duration>,
    callback: Arc<Mutex<TimerCallback>>,
}

struct LoopShared {
    wake_read: RawFd,
    wake_write: RawFd,
    ios: Mutex<FxHashMap<u64, IoWatch>>,
    timers: Mutex<FxHashMap<u64, TimerEntry>>,
    observers: Mutex<Vec<(u64, Arc<Mutex<WakeObserver>>)>>,
    jobs: Mutex<VecDeque<Job>>,
    next_token: AtomicU64,
    stop: AtomicBool,
    driver: Mutex<Option<(ThreadId, usize)>>,
}

impl Drop for LoopShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// Cross-thread handle to a [`RunLoop`].
///
/// Cheap to clone; keeps the loop's wake pipe alive. [`LoopHandle::wake`]
/// performs a single `write(2)` and is async-signal-safe.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Enqueue a job for the next loop iteration and wake the loop.
    ///
    /// Jobs run in submission order, before timers and readiness dispatch.
    pub fn submit(&self, job: Job) {
        self.shared.jobs.lock().push_back(job);
        self.wake();
    }

    /// Wake the loop out of its poll without submitting work.
    pub fn wake(&self) {
        let byte = [1u8];
        // EAGAIN means the pipe is already full of wakeups, which is fine.
        unsafe {
            libc::write(self.shared.wake_write, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// The single-threaded readiness loop.
pub struct RunLoop {
    shared: Arc<LoopShared>,
}

impl RunLoop {
    /// Create a loop and its wake pipe.
    pub fn new() -> io::Result<RunLoop> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(RunLoop {
            shared: Arc::new(LoopShared {
                wake_read: fds[0],
                wake_write: fds[1],
                ios: Mutex::new(FxHashMap::default()),
                timers: Mutex::new(FxHashMap::default()),
                observers: Mutex::new(Vec::new()),
                jobs: Mutex::new(VecDeque::new()),
                next_token: AtomicU64::new(1),
                stop: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Get a clonable cross-thread handle.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    fn token(&self) -> u64 {
        self.shared.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a level-triggered fd watch.
    pub fn add_io(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(Interest) + Send + 'static,
    ) -> IoToken {
        let token = self.token();
        self.shared.ios.lock().insert(
            token,
            IoWatch {
                fd,
                interest,
                callback: Arc::new(Mutex::new(Box::new(callback))),
            },
        );
        // A watch added from off-loop must reach the next poll set.
        self.handle().wake();
        IoToken(token)
    }

    /// Remove an fd watch. Removing an already-removed token is a no-op.
    pub fn remove_io(&self, token: IoToken) {
        self.shared.ios.lock().remove(&token.0);
    }

    /// Whether an fd watch is still registered.
    pub fn has_io(&self, token: IoToken) -> bool {
        self.shared.ios.lock().contains_key(&token.0)
    }

    /// Register a timer.
    ///
    /// `interval == None` is one-shot: the registration is removed before
    /// the callback is invoked, so a re-arm requires a new `add_timer`.
    /// Repeating timers are retained and rescheduled; the callback receives
    /// the number of whole periods it coalesces.
    pub fn add_timer(
        &self,
        fire_at: Instant,
        interval: Option<Duration>,
        callback: impl FnMut(u64) + Send + 'static,
    ) -> TimerToken {
        let token = self.token();
        self.shared.timers.lock().insert(
            token,
            TimerEntry {
                fire_at,
                interval,
                callback: Arc::new(Mutex::new(Box::new(callback))),
            },
        );
        // A timer added from off-loop must be able to shorten the poll.
        self.handle().wake();
        TimerToken(token)
    }

    /// Remove a timer. Removing an already-fired one-shot is a no-op.
    pub fn remove_timer(&self, token: TimerToken) {
        self.shared.timers.lock().remove(&token.0);
    }

    /// Whether a timer is still registered.
    pub fn has_timer(&self, token: TimerToken) -> bool {
        self.shared.timers.lock().contains_key(&token.0)
    }

    /// Register an observer invoked once per loop iteration, after
    /// readiness dispatch.
    pub fn add_wake_observer(&self, callback: impl FnMut() + Send + 'static) -> ObserverToken {
        let token = self.token();
        self.shared
            .observers
            .lock()
            .push((token, Arc::new(Mutex::new(Box::new(callback)))));
        ObserverToken(token)
    }

    /// Remove a wake observer.
    pub fn remove_wake_observer(&self, token: ObserverToken) {
        self.shared.observers.lock().retain(|(t, _)| *t != token.0);
    }

    /// Stop the innermost `run` after the current callout returns.
    ///
    /// Callable from any thread; a stop with no run in progress applies to
    /// the next one.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.handle().wake();
    }

    /// Drive the loop for at most `max`.
    ///
    /// Processes submitted jobs, due timers, fd readiness and wake
    /// observers until [`RunLoop::stop`] is called or `max` elapses. Exactly
    /// one thread may drive a given loop; nested calls from callbacks on the
    /// driving thread are allowed.
    pub fn run(&self, max: Duration) -> RunOutcome {
        let _driver = DriverGuard::enter(&self.shared);
        let deadline = Instant::now() + max;
        loop {
            if self.shared.stop.swap(false, Ordering::SeqCst) {
                return RunOutcome::Stopped;
            }
            if self.drain_jobs() {
                return RunOutcome::Stopped;
            }
            if self.fire_due_timers() {
                return RunOutcome::Stopped;
            }

            let now = Instant::now();
            if now >= deadline {
                return RunOutcome::TimedOut;
            }
            let timeout = self.poll_timeout(now, deadline);
            let ready = self.poll(timeout);

            for (token, interest) in ready {
                // The watch may have been removed by an earlier callback.
                let callback = match self.shared.ios.lock().get(&token) {
                    Some(watch) => watch.callback.clone(),
                    None => continue,
                };
                (callback.lock())(interest);
                if self.shared.stop.swap(false, Ordering::SeqCst) {
                    return RunOutcome::Stopped;
                }
            }

            if self.run_observers() {
                return RunOutcome::Stopped;
            }
        }
    }

    /// Run jobs in submission order. Returns true if a stop was requested.
    fn drain_jobs(&self) -> bool {
        loop {
            let job = self.shared.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    if self.shared.stop.swap(false, Ordering::SeqCst) {
                        return true;
                    }
                }
                None => return false,
            }
        }
    }

    /// Fire every due timer. Returns true if a stop was requested.
    fn fire_due_timers(&self) -> bool {
        let now = Instant::now();
        let mut due: Vec<(Arc<Mutex<TimerCallback>>, u64)> = Vec::new();
        {
            let mut timers = self.shared.timers.lock();
            let expired: Vec<u64> = timers
                .iter()
                .filter(|(_, entry)| entry.fire_at <= now)
                .map(|(token, _)| *token)
                .collect();
            for token in expired {
                let interval = match timers.get(&token) {
                    Some(entry) => entry.interval,
                    None => continue,
                };
                match interval {
                    None => {
                        // One-shot registrations self-invalidate on fire.
                        let entry = timers.remove(&token).unwrap();
                        due.push((entry.callback, 1));
                    }
                    Some(interval) => {
                        let entry = timers.get_mut(&token).unwrap();
                        let behind = now.duration_since(entry.fire_at);
                        let periods = (behind.as_nanos() / interval.as_nanos().max(1)) as u64 + 1;
                        entry.fire_at += interval * periods as u32;
                        due.push((entry.callback.clone(), periods));
                    }
                }
            }
        }
        for (callback, periods) in due {
            (callback.lock())(periods);
            if self.shared.stop.swap(false, Ordering::SeqCst) {
                return true;
            }
        }
        false
    }

    fn poll_timeout(&self, now: Instant, deadline: Instant) -> Duration {
        let mut timeout = deadline.duration_since(now);
        let timers = self.shared.timers.lock();
        for entry in timers.values() {
            let until = entry.fire_at.saturating_duration_since(now);
            if until < timeout {
                timeout = until;
            }
        }
        timeout
    }

    /// Block in poll(2) for at most `timeout`; return ready watch tokens.
    fn poll(&self, timeout: Duration) -> Vec<(u64, Interest)> {
        let mut fds: Vec<libc::pollfd> = vec![libc::pollfd {
            fd: self.shared.wake_read,
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut tokens: Vec<u64> = vec![0];
        {
            let ios = self.shared.ios.lock();
            for (token, watch) in ios.iter() {
                let events = match watch.interest {
                    Interest::Readable => libc::POLLIN,
                    Interest::Writable => libc::POLLOUT,
                };
                fds.push(libc::pollfd {
                    fd: watch.fd,
                    events,
                    revents: 0,
                });
                tokens.push(*token);
            }
        }

        // Round up so a sub-millisecond wait does not busy-spin.
        let millis = timeout
            .as_millis()
            .saturating_add(u128::from(timeout.subsec_nanos() % 1_000_000 != 0))
            .min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::warn!("runloop poll failed: {}", err);
            }
            return Vec::new();
        }

        let mut ready = Vec::new();
        for (index, pollfd) in fds.iter().enumerate() {
            if pollfd.revents == 0 {
                continue;
            }
            if index == 0 {
                self.drain_wake_pipe();
                continue;
            }
            let interest = if pollfd.revents & libc::POLLOUT != 0 {
                Interest::Writable
            } else {
                // POLLHUP/POLLERR surface through the read interest.
                Interest::Readable
            };
            ready.push((tokens[index], interest));
        }
        ready
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.shared.wake_read,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Invoke wake observers. Returns true if a stop was requested.
    fn run_observers(&self) -> bool {
        let observers: Vec<Arc<Mutex<WakeObserver>>> = self
            .shared
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            (observer.lock())();
            if self.shared.stop.swap(false, Ordering::SeqCst) {
                return true;
            }
        }
        false
    }
}

/// Tracks which thread drives the loop; nested entries on the driving
/// thread are counted, entry from a second thread is a contract violation.
struct DriverGuard<'a> {
    shared: &'a Arc<LoopShared>,
}

impl<'a> DriverGuard<'a> {
    fn enter(shared: &'a Arc<LoopShared>) -> Self {
        let me = std::thread::current().id();
        let mut driver = shared.driver.lock();
        match driver.as_mut() {
            Some((thread, depth)) => {
                assert!(
                    *thread == me,
                    "runloop is already driven by another thread"
                );
                *depth += 1;
            }
            None => *driver = Some((me, 1)),
        }
        DriverGuard { shared }
    }
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        let mut driver = self.shared.driver.lock();
        if let Some((_, depth)) = driver.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                *driver = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_times_out() {
        let rl = RunLoop::new().unwrap();
        let started = Instant::now();
        let outcome = rl.run(Duration::from_millis(20));
        assert_eq!(outcome, RunOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_submitted_jobs_run_in_order() {
        let rl = RunLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for value in 0..4 {
            let order = order.clone();
            rl.handle().submit(Box::new(move || order.lock().push(value)));
        }
        rl.run(Duration::from_millis(10));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_one_shot_timer_self_invalidates() {
        let rl = RunLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let token = rl.add_timer(Instant::now() + Duration::from_millis(5), None, move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        rl.run(Duration::from_millis(40));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!rl.has_timer(token));
    }

    #[test]
    fn test_repeating_timer_coalesces_periods() {
        let rl = RunLoop::new().unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let total2 = total.clone();
        let token = rl.add_timer(
            Instant::now() + Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            move |periods| {
                total2.fetch_add(periods as usize, Ordering::SeqCst);
            },
        );
        rl.run(Duration::from_millis(40));
        assert!(total.load(Ordering::SeqCst) >= 3);
        assert!(rl.has_timer(token));
        rl.remove_timer(token);
        assert!(!rl.has_timer(token));
    }

    #[test]
    fn test_stop_from_callback_reports_stopped() {
        let rl = RunLoop::new().unwrap();
        let shared = rl.shared.clone();
        rl.handle().submit(Box::new(move || {
            shared.stop.store(true, Ordering::SeqCst);
        }));
        let outcome = rl.run(Duration::from_millis(200));
        assert_eq!(outcome, RunOutcome::Stopped);
    }

    #[test]
    fn test_io_watch_fires_on_readable_pipe() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let rl = RunLoop::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let read_end = fds[0];
        rl.add_io(read_end, Interest::Readable, move |interest| {
            assert_eq!(interest, Interest::Readable);
            hits2.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 8];
            unsafe { libc::read(read_end, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        });
        unsafe { libc::write(fds[1], b"ab".as_ptr() as *const libc::c_void, 2) };
        rl.run(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_wake_observer_runs_each_iteration() {
        let rl = RunLoop::new().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let token = rl.add_wake_observer(move || {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        rl.run(Duration::from_millis(15));
        assert!(seen.load(Ordering::SeqCst) >= 1);
        rl.remove_wake_observer(token);
    }
}
