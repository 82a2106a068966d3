//! Integration tests for the blocking-mode controller
//!
//! Covers wakeup-vs-timeout results, one-shot timer relocation across a
//! blocking call, swallowed repeating timers, fd-source relocation,
//! main-queue deferral with FIFO replay, deferred cancellation and the
//! reentrancy contract.

use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strand_core::{DispatchSource, Scheduler, Tasklet, Timer, TimerSchedule, TimerState};

fn fixture() -> (Arc<Scheduler>, Arc<Tasklet>) {
    let scheduler = Scheduler::new();
    let tasklet = Tasklet::new(&scheduler);
    (scheduler, tasklet)
}

fn one_shot(delay: Duration) -> TimerSchedule {
    TimerSchedule {
        delay,
        interval: Duration::ZERO,
        leeway: Duration::ZERO,
    }
}

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

// ===== wakeup vs timeout =====

#[test]
fn test_block_on_returns_the_fired_wakeup_source() {
    let (_scheduler, tasklet) = fixture();
    let wakeup = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    wakeup.resume();

    let remote = wakeup.clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        remote.merge_data(1);
    });

    let started = Instant::now();
    let fired = tasklet.block_on(&wakeup, Duration::from_millis(500));
    feeder.join().unwrap();

    let fired = fired.expect("wakeup fired well before the timeout");
    assert_eq!(fired.id(), wakeup.id());
    assert!(started.elapsed() < Duration::from_millis(400));
    tasklet.shutdown();
}

#[test]
fn test_block_on_timeout_returns_none() {
    let (_scheduler, tasklet) = fixture();
    let wakeup = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    wakeup.resume();

    let started = Instant::now();
    let fired = tasklet.block_on(&wakeup, Duration::from_millis(15));
    assert!(fired.is_none());
    assert!(started.elapsed() >= Duration::from_millis(15));
    tasklet.shutdown();
}

// ===== timer relocation =====

#[test]
fn test_one_shot_timer_relocates_across_a_blocking_call() {
    let (_scheduler, tasklet) = fixture();
    let wakeup = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    wakeup.resume();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    let timer = Timer::new(&tasklet, one_shot(Duration::from_millis(5)), move |_| {
        fired2.fetch_add(1, Ordering::SeqCst);
    });
    timer.arm();

    // Deadline falls inside the blocked window: the callback must not run.
    let result = tasklet.block_on(&wakeup, Duration::from_millis(30));
    assert!(result.is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(timer.state(), TimerState::Armed);

    // One delivery shortly after unblocking, never a second.
    tasklet.run(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    tasklet.run(Duration::from_millis(20));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    tasklet.shutdown();
}

#[test]
fn test_repeating_timer_is_swallowed_while_blocked_and_resumes() {
    let (_scheduler, tasklet) = fixture();
    let wakeup = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    wakeup.resume();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    let timer = Timer::new(
        &tasklet,
        TimerSchedule {
            delay: Duration::from_millis(5),
            interval: Duration::from_millis(5),
            leeway: Duration::ZERO,
        },
        move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        },
    );
    timer.arm();

    let result = tasklet.block_on(&wakeup, Duration::from_millis(25));
    assert!(result.is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(timer.state(), TimerState::Armed);

    tasklet.run(Duration::from_millis(30));
    assert!(fired.load(Ordering::SeqCst) >= 1);
    tasklet.shutdown();
}

// ===== fd-source relocation =====

#[test]
fn test_fd_source_is_relocated_not_lost() {
    let (_scheduler, tasklet) = fixture();
    let wakeup = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    wakeup.resume();

    let (read_end, write_end) = make_pipe();
    let hits = Arc::new(AtomicUsize::new(0));
    let source = DispatchSource::readable(&tasklet, read_end, &tasklet.main_queue());
    let hits2 = hits.clone();
    source.set_event_handler(move |_| {
        hits2.fetch_add(1, Ordering::SeqCst);
        let mut buf = [0u8; 8];
        unsafe { libc::read(read_end, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    });
    source.resume();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        unsafe { libc::write(write_end, b"abc".as_ptr() as *const libc::c_void, 3) };
    });

    // Becomes readable inside the blocked window; the handler must wait.
    let result = tasklet.block_on(&wakeup, Duration::from_millis(30));
    writer.join().unwrap();
    assert!(result.is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Reinserted into the active mode: exactly one delivery afterwards.
    tasklet.run(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    tasklet.shutdown();
    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
}

// ===== main-queue deferral =====

#[test]
fn test_async_to_blocked_main_queue_is_deferred() {
    let (_scheduler, tasklet) = fixture();
    let wakeup = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    wakeup.resume();

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_while_blocked = Arc::new(AtomicBool::new(false));
    let main_queue = tasklet.main_queue();
    let observer = tasklet.clone();
    let ran2 = ran.clone();
    let ran_while_blocked2 = ran_while_blocked.clone();
    let submitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(8));
        main_queue.async_fn(move || {
            ran_while_blocked2.store(observer.is_blocked(), Ordering::SeqCst);
            ran2.fetch_add(1, Ordering::SeqCst);
        });
    });

    let result = tasklet.block_on(&wakeup, Duration::from_millis(40));
    submitter.join().unwrap();
    assert!(result.is_none());

    // Replayed during the blocking call's tail, after the state cleared.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(!ran_while_blocked.load(Ordering::SeqCst));

    // Exactly once: nothing left for later spins.
    tasklet.run(Duration::from_millis(20));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    tasklet.shutdown();
}

#[test]
fn test_deferred_work_replays_in_arrival_order() {
    let (_scheduler, tasklet) = fixture();
    let wakeup = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    wakeup.resume();

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let main_queue = tasklet.main_queue();
    let order2 = order.clone();
    let submitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        for value in 0..5 {
            let order = order2.clone();
            main_queue.async_fn(move || {
                order.lock().push(value);
            });
        }
    });

    let result = tasklet.block_on(&wakeup, Duration::from_millis(40));
    submitter.join().unwrap();
    assert!(result.is_none());
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    tasklet.shutdown();
}

// ===== deferred cancellation =====

#[test]
fn test_cancel_during_block_is_deferred_and_runs_once() {
    let (_scheduler, tasklet) = fixture();
    let wakeup = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    wakeup.resume();

    let cancels = Arc::new(AtomicUsize::new(0));
    let victim = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    let cancels2 = cancels.clone();
    victim.set_cancel_handler(move || {
        cancels2.fetch_add(1, Ordering::SeqCst);
    });
    victim.resume();

    let remote = victim.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        remote.cancel();
    });

    let result = tasklet.block_on(&wakeup, Duration::from_millis(30));
    canceller.join().unwrap();
    assert!(result.is_none());

    // Replayed after unblocking, exactly once, and the source is gone.
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    assert_eq!(tasklet.counters().sources, 1); // only the wakeup remains
    tasklet.run(Duration::from_millis(20));
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    tasklet.shutdown();
}

// ===== contracts =====

#[test]
#[should_panic(expected = "reentrant blocking-mode entry")]
fn test_reentrant_blocking_entry_is_fatal() {
    let (_scheduler, tasklet) = fixture();
    let first = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    first.resume();
    let second = DispatchSource::counter(&tasklet, &tasklet.main_queue());
    second.resume();

    let remote = tasklet.clone();
    let holder = thread::spawn(move || {
        let wakeup = first;
        let _ = remote.block_on(&wakeup, Duration::from_millis(200));
    });
    thread::sleep(Duration::from_millis(30));

    // The tasklet is already blocked; entering again must abort.
    let _ = tasklet.block_on(&second, Duration::from_millis(10));
    holder.join().unwrap();
}
