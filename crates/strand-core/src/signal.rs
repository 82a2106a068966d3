//! Process-wide signal multiplexing
//!
//! At most one OS-level handler is installed per signal number; every
//! tasklet interested in that number gets a table entry. On receipt, the
//! single process handler walks the entries in registration order and
//! invokes each matching handler synchronously, inside the signal-delivery
//! context, so registered handlers must restrict themselves to
//! async-signal-safe operations. Signal-kind dispatch sources take the
//! other route: the process handler only bumps their pending count and
//! wakes the owning loop with a single `write(2)`.

use crate::tasklet::TaskletId;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strand_runloop::LoopHandle;

/// Highest signal number accepted by [`register`].
pub const MAX_SIGNUM: i32 = 31;

/// Non-fatal signal registration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// Signal number outside the supported `1..=MAX_SIGNUM` range.
    #[error("signal number {0} outside supported range 1..={MAX_SIGNUM}")]
    OutOfRange(i32),
}

/// Handler invoked in signal-delivery context. Receives the signal number.
pub type SignalHandler = Arc<dyn Fn(i32) + Send + Sync>;

/// Destructor invoked when a registration is replaced or removed.
pub type SignalDestructor = Box<dyn FnOnce() + Send>;

struct Entry {
    tasklet: TaskletId,
    handler: SignalHandler,
    // Mutex-wrapped so the table stays shareable; only registration paths
    // ever take it.
    destructor: Mutex<Option<SignalDestructor>>,
}

/// Self-pipe hook for a signal-kind dispatch source.
pub(crate) struct SourceHook {
    pub(crate) source: u64,
    pub(crate) pending: Arc<AtomicU64>,
    pub(crate) wake: LoopHandle,
}

struct Table {
    entries: Vec<Vec<Entry>>,
    hooks: Vec<Vec<SourceHook>>,
    installed: Vec<bool>,
}

impl Table {
    fn new() -> Self {
        let slots = (MAX_SIGNUM + 1) as usize;
        Table {
            entries: (0..slots).map(|_| Vec::new()).collect(),
            hooks: (0..slots).map(|_| Vec::new()).collect(),
            installed: vec![false; slots],
        }
    }
}

static TABLE: Lazy<RwLock<Table>> = Lazy::new(|| RwLock::new(Table::new()));

extern "C" fn process_handler(signum: libc::c_int) {
    // Read lock only: the write side is confined to registration calls,
    // which must not run concurrently with delivery on the same thread.
    let table = TABLE.read();
    let slot = signum as usize;
    if slot >= table.entries.len() {
        return;
    }
    for entry in &table.entries[slot] {
        (entry.handler)(signum);
    }
    for hook in &table.hooks[slot] {
        hook.pending.fetch_add(1, Ordering::Relaxed);
        hook.wake.wake();
    }
}

/// Check a signal number against the supported range.
pub(crate) fn validate_signum(signum: i32) -> Result<(), SignalError> {
    check_range(signum)
}

fn check_range(signum: i32) -> Result<(), SignalError> {
    if (1..=MAX_SIGNUM).contains(&signum) {
        Ok(())
    } else {
        Err(SignalError::OutOfRange(signum))
    }
}

fn install_os_handler(table: &mut Table, signum: i32) {
    let slot = signum as usize;
    if table.installed[slot] {
        return;
    }
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = process_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        let rc = libc::sigaction(signum, &action, std::ptr::null_mut());
        assert!(rc == 0, "sigaction({}) failed", signum);
    }
    table.installed[slot] = true;
}

/// Register `handler` for `signum` on behalf of one tasklet.
///
/// Replacing an existing registration for the same tasklet first invokes
/// the prior destructor. The table entry keeps its registration-order
/// position across replacement.
pub(crate) fn register(
    tasklet: TaskletId,
    signum: i32,
    handler: SignalHandler,
    destructor: Option<SignalDestructor>,
) -> Result<(), SignalError> {
    check_range(signum)?;
    let displaced = {
        let mut table = TABLE.write();
        install_os_handler(&mut table, signum);
        let entries = &mut table.entries[signum as usize];
        let replaced = entries.iter_mut().find(|entry| entry.tasklet == tasklet);
        match replaced {
            Some(entry) => {
                let old = entry.destructor.lock().take();
                entry.handler = handler;
                *entry.destructor.lock() = destructor;
                old
            }
            None => {
                entries.push(Entry {
                    tasklet,
                    handler,
                    destructor: Mutex::new(destructor),
                });
                None
            }
        }
    };
    if let Some(destructor) = displaced {
        destructor();
    }
    Ok(())
}

/// Remove one tasklet's registration for `signum`, invoking its destructor.
pub(crate) fn deregister(tasklet: TaskletId, signum: i32) -> Result<(), SignalError> {
    check_range(signum)?;
    let removed = {
        let mut table = TABLE.write();
        let entries = &mut table.entries[signum as usize];
        match entries.iter().position(|entry| entry.tasklet == tasklet) {
            Some(index) => Some(entries.remove(index)),
            None => None,
        }
    };
    if let Some(entry) = removed {
        if let Some(destructor) = entry.destructor.into_inner() {
            destructor();
        }
    }
    Ok(())
}

/// Remove every registration owned by a tasklet, invoking each destructor.
/// Used at tasklet teardown.
pub(crate) fn deregister_tasklet(tasklet: TaskletId) {
    let mut displaced = Vec::new();
    {
        let mut table = TABLE.write();
        for entries in table.entries.iter_mut() {
            let mut index = 0;
            while index < entries.len() {
                if entries[index].tasklet == tasklet {
                    displaced.push(entries.remove(index));
                } else {
                    index += 1;
                }
            }
        }
    }
    for entry in displaced {
        if let Some(destructor) = entry.destructor.into_inner() {
            destructor();
        }
    }
}

/// Install a self-pipe hook for a signal-kind source.
pub(crate) fn add_source_hook(signum: i32, hook: SourceHook) -> Result<(), SignalError> {
    check_range(signum)?;
    let mut table = TABLE.write();
    install_os_handler(&mut table, signum);
    table.hooks[signum as usize].push(hook);
    Ok(())
}

/// Remove a signal-kind source's hook.
pub(crate) fn remove_source_hook(signum: i32, source: u64) {
    if check_range(signum).is_err() {
        return;
    }
    let mut table = TABLE.write();
    table.hooks[signum as usize].retain(|hook| hook.source != source);
}
