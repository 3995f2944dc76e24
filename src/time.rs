//! Timestamps used throughout the provider chain
//!
//! A [`Time`] is a `(sec, nsec)` pair ordered lexicographically. Every
//! constructor and arithmetic operation normalizes `nsec` into `[0, 1e9)`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point in time (or a duration) with nanosecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Time {
    /// Whole seconds
    pub sec: i64,
    /// Nanoseconds, always in `[0, 1e9)`
    pub nsec: u32,
}

impl Time {
    /// The zero time
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };

    /// One nanosecond, the smallest step between adjacent read windows
    pub const ONE_NANOSECOND: Time = Time { sec: 0, nsec: 1 };

    /// Create a time, normalizing an out-of-range nanosecond part
    pub fn new(sec: i64, nsec: i64) -> Self {
        let sec = sec + nsec.div_euclid(NANOS_PER_SEC);
        let nsec = nsec.rem_euclid(NANOS_PER_SEC) as u32;
        Self { sec, nsec }
    }

    /// Create a time from whole seconds
    pub fn from_sec(sec: i64) -> Self {
        Self { sec, nsec: 0 }
    }

    /// Create a time from milliseconds
    pub fn from_millis(millis: i64) -> Self {
        Self::new(0, millis * 1_000_000)
    }

    /// Create a time from nanoseconds since epoch (the storage representation)
    pub fn from_nanos(nanos: u64) -> Self {
        Self {
            sec: (nanos / NANOS_PER_SEC as u64) as i64,
            nsec: (nanos % NANOS_PER_SEC as u64) as u32,
        }
    }

    /// Nanoseconds since epoch, saturating at zero for negative times
    pub fn to_nanos(self) -> u64 {
        if self.sec < 0 {
            return 0;
        }
        (self.sec as u64)
            .saturating_mul(NANOS_PER_SEC as u64)
            .saturating_add(self.nsec as u64)
    }

    /// Create a time from floating point seconds
    pub fn from_sec_f64(value: f64) -> Self {
        let sec = value.trunc();
        let nsec = ((value - sec) * 1e9).round();
        Self::new(sec as i64, nsec as i64)
    }

    /// Floating point seconds (lossy for large values)
    pub fn to_sec_f64(self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }

    /// Sum of two times
    pub fn add(self, other: Time) -> Time {
        Time::new(self.sec + other.sec, self.nsec as i64 + other.nsec as i64)
    }

    /// Difference `self - other`
    pub fn subtract(self, other: Time) -> Time {
        Time::new(self.sec - other.sec, self.nsec as i64 - other.nsec as i64)
    }

    /// Clamp into `[start, end]`
    pub fn clamp_to(self, start: Time, end: Time) -> Time {
        if self < start {
            start
        } else if self > end {
            end
        } else {
            self
        }
    }

    /// Whether the time lies in the inclusive range `[start, end]`
    pub fn is_within(self, start: Time, end: Time) -> bool {
        start <= self && self <= end
    }

    /// Convert to a UTC date, if representable
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.sec, self.nsec).single()
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_nanoseconds() {
        assert_eq!(Time::new(1, 1_500_000_000), Time { sec: 2, nsec: 500_000_000 });
        assert_eq!(Time::new(2, -1), Time { sec: 1, nsec: 999_999_999 });
    }

    #[test]
    fn orders_by_seconds_then_nanoseconds() {
        assert!(Time::new(1, 999_999_999) < Time::new(2, 0));
        assert!(Time::new(2, 1) > Time::new(2, 0));
    }

    #[test]
    fn arithmetic_carries_and_borrows() {
        let a = Time::new(1, 600_000_000);
        let b = Time::new(0, 700_000_000);
        assert_eq!(a.add(b), Time::new(2, 300_000_000));
        assert_eq!(a.subtract(b), Time::new(0, 900_000_000));
        assert_eq!(b.subtract(a), Time::new(-1, 100_000_000));
    }

    #[test]
    fn nanosecond_conversion() {
        let time = Time::from_nanos(1_234_567_890_123_456_789);
        assert_eq!(time, Time { sec: 1_234_567_890, nsec: 123_456_789 });
        assert_eq!(time.to_nanos(), 1_234_567_890_123_456_789);
        assert_eq!(Time::new(-1, 0).to_nanos(), 0);
    }

    #[test]
    fn clamps_into_range() {
        let start = Time::from_sec(10);
        let end = Time::from_sec(20);
        assert_eq!(Time::from_sec(5).clamp_to(start, end), start);
        assert_eq!(Time::from_sec(25).clamp_to(start, end), end);
        assert_eq!(Time::from_sec(15).clamp_to(start, end), Time::from_sec(15));
    }

    #[test]
    fn formats_with_padded_nanoseconds() {
        assert_eq!(Time::new(3, 5).to_string(), "3.000000005");
        assert_eq!(Time::from_sec_f64(1.25), Time::new(1, 250_000_000));
    }
}
