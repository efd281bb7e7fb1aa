//! The 48-bit TIME-of-day representation used by the CANopen TIME object.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveDate, TimeDelta};

/// Days between the Unix epoch (1970-01-01) and the CANopen epoch
/// (1984-01-01).
const EPOCH_OFFSET_DAYS: u64 = 5113;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// A point in time as carried by TIME-stamp objects: days since 1984-01-01
/// plus milliseconds after midnight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeOfDay {
    days: u16,
    millis: u32,
}

impl TimeOfDay {
    /// Build from a day count and milliseconds after midnight.
    pub const fn new(days: u16, millis: u32) -> Self {
        Self { days, millis }
    }

    /// Days since 1984-01-01.
    pub const fn days(&self) -> u16 {
        self.days
    }

    /// Milliseconds since midnight.
    pub const fn millis(&self) -> u32 {
        self.millis
    }

    /// Read the wall clock and convert it to the CANopen epoch.
    ///
    /// Used exactly once, at startup, to seed the TIME producer. A clock set
    /// before 1984 saturates to the epoch.
    pub fn from_wall_clock() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let unix_days = unix.as_secs() / 86_400;
        let days = unix_days.saturating_sub(EPOCH_OFFSET_DAYS);
        let millis = (unix.as_secs() % 86_400) * 1000 + u64::from(unix.subsec_millis());
        Self {
            days: days.min(u16::MAX as u64) as u16,
            millis: millis as u32,
        }
    }

    /// Total milliseconds since the CANopen epoch.
    pub fn total_millis(&self) -> u64 {
        self.days as u64 * MILLIS_PER_DAY + self.millis as u64
    }

    /// The calendar date, as (year, month, day).
    pub fn date_ymd(&self) -> (i32, u32, u32) {
        use chrono::Datelike;
        let epoch = NaiveDate::from_ymd_opt(1984, 1, 1).unwrap();
        let date = epoch + TimeDelta::days(self.days as i64);
        (date.year(), date.month(), date.day())
    }
}
