//! Pseudo-synchronous blocking: wait for one source without losing work
//!
//! `Tasklet::block_on` lets a caller wait synchronously for a designated
//! wakeup source while the underlying loop keeps running. The loop is happy
//! to invoke any ready callout from inside the nested wait, so every
//! scheduler-registered callout path checks the blocking state first:
//!
//! - the wakeup source firing stops the run, the sole path that proceeds
//! - any other timer is marked fired-pending-relocation (one-shot) or
//!   swallowed (repeating) instead of running its handler
//! - any other fd source is removed from active delivery and recorded for
//!   reinsertion
//! - main-queue submissions and signal/counter events are captured as
//!   deferred work at the queue and observer layers
//!
//! On return the relocated objects are re-armed, the blocking state clears,
//! and the deferred list replays in FIFO order, each item exactly once.
//! Cooperative mutual exclusion by interception, not locks: exactly one OS
//! thread drives a given tasklet's callouts at a time.

use crate::deferred::DeferredWork;
use crate::source::{DispatchSource, SourceId};
use crate::tasklet::Tasklet;
use crate::timer::Timer;
use std::sync::Arc;
use std::time::Duration;
use strand_runloop::RunOutcome;

/// Fire time applied when a relocated one-shot is recreated.
pub(crate) const RELOCATION_EPSILON: Duration = Duration::from_millis(1);

/// Per-tasklet blocking-mode state.
#[derive(Default)]
pub(crate) struct BlockState {
    pub(crate) blocked: bool,
    pub(crate) wakeup: Option<SourceId>,
    pub(crate) fired: bool,
    pub(crate) relocated: Vec<Relocation>,
}

/// A callout removed from active delivery during the blocked window.
pub(crate) enum Relocation {
    /// An fd source whose watch was removed; reinserted on unblock.
    Io(Arc<DispatchSource>),
    /// A one-shot timer-kind source whose registration self-invalidated on
    /// fire; re-armed with an epsilon delay on unblock.
    SourceTimer(Arc<DispatchSource>),
    /// A one-shot standalone timer; recreated likewise.
    Timer(Arc<Timer>),
}

enum Intercept {
    /// Not blocked; proceed with normal dispatch.
    Pass,
    /// The wakeup source fired; stop the run.
    Stop,
    /// Swallowed: relocated or simply not delivered.
    Swallow,
}

impl Tasklet {
    /// Block the calling control flow until `wakeup` fires or `timeout`
    /// elapses, without breaking the one-active-callout-per-tasklet
    /// guarantee.
    ///
    /// Returns the fired wakeup source, or `None` on timeout. Every other
    /// source, timer and main-queue submission that becomes ready during
    /// the call is delivered exactly once, afterwards, in original order.
    /// Re-entering while already blocked is a fatal usage error.
    pub fn block_on(
        &self,
        wakeup: &Arc<DispatchSource>,
        timeout: Duration,
    ) -> Option<Arc<DispatchSource>> {
        {
            let mut block = self.block_state().lock();
            assert!(
                !block.blocked,
                "reentrant blocking-mode entry on tasklet {:?}",
                self.id()
            );
            block.blocked = true;
            block.wakeup = Some(wakeup.id());
            block.fired = false;
        }

        let outcome = self.runloop().run(timeout);

        let (fired, relocated) = {
            let mut block = self.block_state().lock();
            (block.fired, std::mem::take(&mut block.relocated))
        };

        // The loop's own return code is too coarse: a fire racing the
        // deadline still reports a timeout. A genuine timeout leaves the
        // wakeup source registered in the active mode.
        if !fired && outcome == RunOutcome::TimedOut && !wakeup.is_armed() {
            log::trace!(
                "blocking wait on tasklet {:?} timed out with its wakeup source unregistered",
                self.id()
            );
        }

        self.reinsert_relocated(relocated);

        {
            let mut block = self.block_state().lock();
            block.blocked = false;
            block.wakeup = None;
        }

        self.replay_deferred();

        if fired {
            Some(wakeup.clone())
        } else {
            None
        }
    }

    /// Whether the tasklet is currently inside a blocking call.
    pub fn is_blocked(&self) -> bool {
        self.block_state().lock().blocked
    }

    pub(crate) fn is_blocked_on_other(&self, source: SourceId) -> bool {
        let block = self.block_state().lock();
        block.blocked && block.wakeup != Some(source)
    }

    /// Interception for fd readiness callouts. Returns true when the
    /// callout was consumed by blocking mode.
    pub(crate) fn intercept_readiness(&self, source: &Arc<DispatchSource>) -> bool {
        let verdict = {
            let mut block = self.block_state().lock();
            if !block.blocked {
                Intercept::Pass
            } else if block.wakeup == Some(source.id()) {
                block.fired = true;
                Intercept::Stop
            } else {
                block.relocated.push(Relocation::Io(source.clone()));
                Intercept::Swallow
            }
        };
        match verdict {
            Intercept::Pass => false,
            Intercept::Stop => {
                self.runloop().stop();
                true
            }
            Intercept::Swallow => {
                // Out of the active mode until the blocking call returns.
                if let Some(tasklet) = self.self_arc() {
                    source.disarm_io(&tasklet);
                }
                true
            }
        }
    }

    /// Interception for timer-kind source callouts.
    pub(crate) fn intercept_timer_source(&self, source: &Arc<DispatchSource>) -> bool {
        let verdict = {
            let mut block = self.block_state().lock();
            if !block.blocked {
                Intercept::Pass
            } else if block.wakeup == Some(source.id()) {
                block.fired = true;
                Intercept::Stop
            } else {
                if source.is_one_shot_timer() {
                    block.relocated.push(Relocation::SourceTimer(source.clone()));
                }
                // Repeating timers stay registered and resume afterwards.
                Intercept::Swallow
            }
        };
        match verdict {
            Intercept::Pass => false,
            Intercept::Stop => {
                // A one-shot registration already self-invalidated on fire.
                if source.is_one_shot_timer() {
                    source.clear_timer_token();
                }
                self.runloop().stop();
                true
            }
            Intercept::Swallow => {
                if source.is_one_shot_timer() {
                    source.clear_timer_token();
                }
                true
            }
        }
    }

    /// Interception for standalone timer callouts.
    pub(crate) fn intercept_timer(&self, timer: &Arc<Timer>) -> bool {
        let one_shot = timer.is_one_shot();
        {
            let mut block = self.block_state().lock();
            if !block.blocked {
                return false;
            }
            if one_shot {
                block.relocated.push(Relocation::Timer(timer.clone()));
            }
        }
        if one_shot {
            timer.mark_fired_pending_relocation();
        }
        true
    }

    /// Interception for signal-kind and counter-kind observer callouts.
    /// These carry coalesced data that would be lost by relocation, so a
    /// blocked window captures them as deferred events instead.
    pub(crate) fn intercept_wake_source(&self, source: &Arc<DispatchSource>) -> bool {
        let verdict = {
            let mut block = self.block_state().lock();
            if !block.blocked {
                Intercept::Pass
            } else if block.wakeup == Some(source.id()) {
                block.fired = true;
                Intercept::Stop
            } else {
                Intercept::Swallow
            }
        };
        match verdict {
            Intercept::Pass => false,
            Intercept::Stop => {
                // The occurrence is consumed by the blocking call's return
                // value; leaving it pending would deliver it twice.
                source.take_pending();
                self.runloop().stop();
                true
            }
            Intercept::Swallow => {
                let data = source.take_pending();
                if data > 0 {
                    self.push_deferred(DeferredWork::SourceEvent {
                        source: source.clone(),
                        data,
                    });
                }
                true
            }
        }
    }

    /// Step 5: put every relocated object back into the active mode.
    fn reinsert_relocated(&self, relocated: Vec<Relocation>) {
        if relocated.is_empty() {
            return;
        }
        let tasklet = match self.self_arc() {
            Some(tasklet) => tasklet,
            None => return,
        };
        for entry in relocated {
            match entry {
                Relocation::Io(source) => source.rearm_io(&tasklet),
                Relocation::SourceTimer(source) => {
                    source.rearm_after_relocation(&tasklet, RELOCATION_EPSILON)
                }
                Relocation::Timer(timer) => timer.relocate(&tasklet, RELOCATION_EPSILON),
            }
        }
    }

    /// Step 7: drain the deferred list in FIFO order, consuming each item
    /// exactly once.
    pub(crate) fn replay_deferred(&self) {
        loop {
            let item = self.pop_deferred();
            let item = match item {
                Some(item) => item,
                None => break,
            };
            log::trace!("replaying {}", item.label());
            match item {
                DeferredWork::SourceEvent { source, data } => source.deliver(data),
                DeferredWork::SourceCancel { source } => source.deliver_cancel(),
                DeferredWork::AsyncDispatch { job } => job(),
            }
        }
    }
}
