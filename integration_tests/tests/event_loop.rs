//! Timing behaviour of the event loop: wake-up coalescing and the one-shot
//! timer retune.

use std::time::{Duration, Instant};

use ferrocan_linux::EventLoop;

/// Let the initial 1 ns expiration fire so later waits see the real period.
fn settle(ep: &mut EventLoop) {
    ep.wait();
    assert!(ep.timer_event());
    ep.finish_iteration();
}

#[test]
fn wakeups_between_waits_coalesce_to_one() {
    let mut ep = EventLoop::new(100_000).unwrap();
    settle(&mut ep);

    let wakeup = ep.wakeup_handle();
    let trigger_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(2));
        wakeup.trigger();
        wakeup.trigger();
        wakeup.trigger();
    });
    trigger_thread.join().unwrap();

    // all three triggers are already pending: the wait returns immediately,
    // classified as a wake-up, and drains the whole counter
    let start = Instant::now();
    ep.wait();
    assert!(start.elapsed() < Duration::from_millis(20));
    assert!(!ep.timer_event());
    assert!(ep.pending_event().is_none());
    ep.finish_iteration();

    // nothing left: the next wait must come from the periodic timer
    ep.wait();
    assert!(ep.timer_event());
    ep.finish_iteration();
}

#[test]
fn wakeup_from_other_thread_interrupts_wait() {
    let mut ep = EventLoop::new(100_000).unwrap();
    settle(&mut ep);

    let wakeup = ep.wakeup_handle();
    let t = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(5));
        wakeup.trigger();
    });

    let start = Instant::now();
    ep.wait();
    let elapsed = start.elapsed();
    t.join().unwrap();

    assert!(!ep.timer_event());
    assert!(elapsed >= Duration::from_millis(4));
    assert!(elapsed < Duration::from_millis(50));
    // delta-t tracks the actual wait duration
    let dt = ep.time_difference_us();
    assert!(dt >= 4_000, "dt = {dt}");
    assert!(dt < 50_000, "dt = {dt}");
    ep.finish_iteration();
}

#[test]
fn lowered_timer_next_accelerates_one_tick_then_reverts() {
    let mut ep = EventLoop::new(100_000).unwrap();
    settle(&mut ep);

    // request a 2 ms wake-up for the next tick only
    ep.wait();
    assert!(ep.timer_event());
    ep.lower_timer_next(2_000);
    let start = Instant::now();
    ep.finish_iteration();

    ep.wait();
    let accelerated = start.elapsed();
    assert!(ep.timer_event());
    assert!(
        accelerated < Duration::from_millis(50),
        "accelerated tick took {accelerated:?}"
    );

    // no override this time: the interval snaps back to 100 ms
    let start = Instant::now();
    ep.finish_iteration();
    ep.wait();
    let full = start.elapsed();
    assert!(ep.timer_event());
    assert!(full >= Duration::from_millis(60), "full tick took {full:?}");
    ep.finish_iteration();
}

#[test]
fn timer_next_at_interval_leaves_timer_untouched() {
    let mut ep = EventLoop::new(20_000).unwrap();
    settle(&mut ep);

    ep.wait();
    // lowering to exactly the interval is a no-op
    ep.lower_timer_next(ep.interval_us());
    ep.finish_iteration();

    let start = Instant::now();
    ep.wait();
    assert!(ep.timer_event());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(5), "elapsed {elapsed:?}");
    ep.finish_iteration();
}
