//! Standalone tasklet timers and the relocation state machine
//!
//! A timer moves through `Suspended → Armed → {Armed (repeat) |
//! FiredPendingRelocation (one-shot fired while blocked)} → Armed (after
//! relocation) → Released`. The underlying loop registration of a one-shot
//! self-invalidates on fire, so a one-shot whose deadline elapses while its
//! tasklet is inside a blocking call is recorded and recreated with the
//! same callback and an epsilon fire time when the tasklet unblocks. The callback
//! fires exactly once, slightly delayed, never lost or duplicated.
//! Repeating timers are simply not delivered while blocked; their loop
//! registration is retained unchanged.

use crate::counters::ResourceKind;
use crate::tasklet::Tasklet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strand_runloop::TimerToken;

/// Unique identifier for a standalone timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    fn new() -> Self {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Lifecycle state of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not scheduled for delivery.
    Suspended,
    /// Scheduled with the loop.
    Armed,
    /// A one-shot that fired while its tasklet was blocked; awaiting
    /// re-creation on unblock.
    FiredPendingRelocation,
    /// Released; terminal.
    Released,
}

/// Fire-time configuration. A zero interval is one-shot.
#[derive(Debug, Clone, Copy)]
pub struct TimerSchedule {
    /// Delay from arm time to first fire.
    pub delay: Duration,
    /// Repeat interval; zero means one-shot.
    pub interval: Duration,
    /// Advisory slack the loop may add to the deadline.
    pub leeway: Duration,
}

/// A timer owned by one tasklet.
pub struct Timer {
    id: TimerId,
    tasklet: Weak<Tasklet>,
    weak_self: Weak<Timer>,
    state: Mutex<TimerState>,
    schedule: Mutex<TimerSchedule>,
    callback: Mutex<Option<Box<dyn FnMut(u64) + Send>>>,
    token: Mutex<Option<TimerToken>>,
}

impl Timer {
    /// Create a timer in the `Suspended` state. The callback receives the
    /// number of firings it coalesces (always 1 for one-shots).
    pub fn new(
        tasklet: &Arc<Tasklet>,
        schedule: TimerSchedule,
        callback: impl FnMut(u64) + Send + 'static,
    ) -> Arc<Timer> {
        let timer = Arc::new_cyclic(|weak: &Weak<Timer>| Timer {
            id: TimerId::new(),
            tasklet: Arc::downgrade(tasklet),
            weak_self: weak.clone(),
            state: Mutex::new(TimerState::Suspended),
            schedule: Mutex::new(schedule),
            callback: Mutex::new(Some(Box::new(callback))),
            token: Mutex::new(None),
        });
        tasklet.register_timer(&timer);
        timer
    }

    /// The timer's identifier.
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TimerState {
        *self.state.lock()
    }

    /// Whether the timer is one-shot.
    pub fn is_one_shot(&self) -> bool {
        self.schedule.lock().interval.is_zero()
    }

    /// Schedule the timer with the loop. Arming an armed or released timer
    /// is a fatal usage error.
    pub fn arm(&self) {
        {
            let mut state = self.state.lock();
            assert!(
                *state == TimerState::Suspended,
                "timer armed from state {:?}",
                *state
            );
            *state = TimerState::Armed;
        }
        let tasklet = match self.tasklet.upgrade() {
            Some(tasklet) => tasklet,
            None => return,
        };
        let schedule = *self.schedule.lock();
        self.register(&tasklet, schedule.delay, schedule.interval);
    }

    /// Take the timer out of delivery without releasing it.
    pub fn disarm(&self) {
        {
            let mut state = self.state.lock();
            if *state != TimerState::Armed && *state != TimerState::FiredPendingRelocation {
                return;
            }
            *state = TimerState::Suspended;
        }
        self.drop_registration();
    }

    /// Release the timer: remove it from the loop and its tasklet.
    pub fn release(&self) {
        {
            let mut state = self.state.lock();
            if *state == TimerState::Released {
                return;
            }
            *state = TimerState::Released;
        }
        self.drop_registration();
        if let Some(tasklet) = self.tasklet.upgrade() {
            tasklet.unregister_timer(self);
        }
    }

    /// Replace the schedule; re-arms in place when currently armed.
    pub fn reschedule(&self, schedule: TimerSchedule) {
        *self.schedule.lock() = schedule;
        if self.state() == TimerState::Armed {
            self.drop_registration();
            if let Some(tasklet) = self.tasklet.upgrade() {
                self.register(&tasklet, schedule.delay, schedule.interval);
            }
        }
    }

    fn register(&self, tasklet: &Arc<Tasklet>, delay: Duration, interval: Duration) {
        let weak = self.weak_self.clone();
        let repeat = if interval.is_zero() {
            None
        } else {
            Some(interval)
        };
        let token = tasklet
            .runloop()
            .add_timer(Instant::now() + delay, repeat, move |periods| {
                if let Some(timer) = weak.upgrade() {
                    timer.on_fire(periods);
                }
            });
        *self.token.lock() = Some(token);
    }

    fn drop_registration(&self) {
        let token = self.token.lock().take();
        if let (Some(token), Some(tasklet)) = (token, self.tasklet.upgrade()) {
            tasklet.runloop().remove_timer(token);
        }
    }

    /// Loop callout. Interception happens first: a blocked tasklet turns a
    /// one-shot fire into `FiredPendingRelocation` and swallows repeats.
    fn on_fire(&self, periods: u64) {
        let tasklet = match self.tasklet.upgrade() {
            Some(tasklet) => tasklet,
            None => return,
        };
        let this = match self.weak_self.upgrade() {
            Some(this) => this,
            None => return,
        };
        if tasklet.intercept_timer(&this) {
            return;
        }
        if self.state() != TimerState::Armed {
            return;
        }
        if self.is_one_shot() {
            // The loop registration self-invalidated on fire.
            *self.token.lock() = None;
            *self.state.lock() = TimerState::Suspended;
        }
        let callback = self.callback.lock().take();
        let mut callback = match callback {
            Some(callback) => callback,
            None => return,
        };
        tasklet
            .scheduler()
            .timed_callout("timer callback", || callback(periods));
        let mut slot = self.callback.lock();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }

    /// Blocking-mode interception for a fired one-shot: record the state
    /// and drop the stale registration token.
    pub(crate) fn mark_fired_pending_relocation(&self) {
        *self.state.lock() = TimerState::FiredPendingRelocation;
        *self.token.lock() = None;
    }

    /// Recreate a relocated one-shot with an epsilon fire time.
    pub(crate) fn relocate(&self, tasklet: &Arc<Tasklet>, epsilon: Duration) {
        {
            let mut state = self.state.lock();
            if *state != TimerState::FiredPendingRelocation {
                return;
            }
            *state = TimerState::Armed;
        }
        self.register(tasklet, epsilon, Duration::ZERO);
    }

    /// Teardown path: invalidate without running the callback.
    pub(crate) fn force_invalidate(&self) {
        *self.state.lock() = TimerState::Released;
        self.drop_registration();
        *self.callback.lock() = None;
    }

    pub(crate) fn counter_kind(&self) -> ResourceKind {
        ResourceKind::Timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Scheduler;
    use std::sync::atomic::AtomicUsize;

    fn one_shot(delay: Duration) -> TimerSchedule {
        TimerSchedule {
            delay,
            interval: Duration::ZERO,
            leeway: Duration::ZERO,
        }
    }

    #[test]
    fn test_timer_state_transitions() {
        let scheduler = Scheduler::new();
        let tasklet = Tasklet::new(&scheduler);
        let timer = Timer::new(&tasklet, one_shot(Duration::from_secs(10)), |_| {});

        assert_eq!(timer.state(), TimerState::Suspended);
        timer.arm();
        assert_eq!(timer.state(), TimerState::Armed);
        timer.disarm();
        assert_eq!(timer.state(), TimerState::Suspended);
        timer.release();
        assert_eq!(timer.state(), TimerState::Released);
        tasklet.shutdown();
    }

    #[test]
    #[should_panic(expected = "timer armed from state")]
    fn test_double_arm_is_fatal() {
        let scheduler = Scheduler::new();
        let tasklet = Tasklet::new(&scheduler);
        let timer = Timer::new(&tasklet, one_shot(Duration::from_secs(10)), |_| {});
        timer.arm();
        timer.arm();
    }

    #[test]
    fn test_one_shot_fires_once_and_suspends() {
        let scheduler = Scheduler::new();
        let tasklet = Tasklet::new(&scheduler);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timer = Timer::new(&tasklet, one_shot(Duration::from_millis(5)), move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        timer.arm();
        tasklet.run(Duration::from_millis(40));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.state(), TimerState::Suspended);
        tasklet.shutdown();
    }

    #[test]
    fn test_repeating_timer_keeps_firing() {
        let scheduler = Scheduler::new();
        let tasklet = Tasklet::new(&scheduler);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let timer = Timer::new(
            &tasklet,
            TimerSchedule {
                delay: Duration::from_millis(5),
                interval: Duration::from_millis(5),
                leeway: Duration::ZERO,
            },
            move |periods| {
                fired2.fetch_add(periods as usize, Ordering::SeqCst);
            },
        );

        timer.arm();
        tasklet.run(Duration::from_millis(40));
        assert!(fired.load(Ordering::SeqCst) >= 3);
        assert_eq!(timer.state(), TimerState::Armed);
        tasklet.shutdown();
    }
}
