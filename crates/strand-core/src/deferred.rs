//! Work captured while a tasklet is inside a blocking call
//!
//! A deferred item is created only by blocking-mode interception and is
//! consumed exactly once, in FIFO order, when the blocking call returns.
//! Items still queued when a tasklet is torn down are discarded without
//! being executed.

use crate::source::DispatchSource;
use std::sync::Arc;
use strand_runloop::Job;

/// One captured action awaiting replay.
pub(crate) enum DeferredWork {
    /// A coalesced event for a signal-kind or counter-kind source that
    /// became ready during the blocked window.
    SourceEvent {
        /// The source whose event was captured.
        source: Arc<DispatchSource>,
        /// The coalesced data taken at capture time.
        data: u64,
    },
    /// A cancel-handler invocation requested while the tasklet was blocked
    /// on a different source.
    SourceCancel {
        /// The cancelled source.
        source: Arc<DispatchSource>,
    },
    /// A main-queue `async`/`after` submission that landed while blocked.
    AsyncDispatch {
        /// The submitted work, replayed verbatim.
        job: Job,
    },
}

impl DeferredWork {
    /// Stable label for diagnostics.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            DeferredWork::SourceEvent { .. } => "deferred source event",
            DeferredWork::SourceCancel { .. } => "deferred source cancel",
            DeferredWork::AsyncDispatch { .. } => "deferred async dispatch",
        }
    }
}
