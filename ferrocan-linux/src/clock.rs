//! Monotonic time base.

use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};

/// Current monotonic time in microseconds.
///
/// This is the single time source for Δt computation and the gateway idle
/// timeout. It is not related to the wall clock; see
/// [`TimeOfDay::from_wall_clock`](ferrocan_common::time_types::TimeOfDay::from_wall_clock)
/// for the one startup wall-clock read.
pub fn now_us() -> u64 {
    // CLOCK_MONOTONIC cannot fail with a valid clock id
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).unwrap_or(TimeSpec::new(0, 0));
    timespec_to_us(&ts)
}

/// Convert a timespec to microseconds.
pub fn timespec_to_us(ts: &TimeSpec) -> u64 {
    ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1000
}

/// Convert microseconds to a timespec.
pub fn us_to_timespec(us: u64) -> TimeSpec {
    TimeSpec::new((us / 1_000_000) as i64, ((us % 1_000_000) * 1000) as i64)
}
