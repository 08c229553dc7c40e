// Copyright 2018-2025 the Deno authors. MIT license.

//! Monotonic time values with millisecond scheduling granularity.

use std::ops::Add;
use std::time::Duration;
use std::time::Instant;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MS: i64 = 1_000_000;
const MS_PER_SEC: u64 = 1_000;

/// A monotonic `(seconds, nanoseconds)` sample.
///
/// Timers are scheduled at millisecond granularity. Two timers whose targets
/// are equal after [`Time::truncated_to_ms`] land in the same store bucket
/// and fire in insertion order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time {
  sec: i64,
  nsec: i32, // invariant: 0 <= nsec < 1_000_000_000
}

impl Time {
  pub const ZERO: Time = Time { sec: 0, nsec: 0 };

  pub fn new(sec: i64, nsec: i32) -> Time {
    debug_assert!((0..NANOS_PER_SEC as i32).contains(&nsec));
    Time { sec, nsec }
  }

  pub fn sec(self) -> i64 {
    self.sec
  }

  pub fn nsec(self) -> i32 {
    self.nsec
  }

  /// Milliseconds into the current second, rounded down.
  pub fn subsec_ms(self) -> i32 {
    (self.nsec as i64 / NANOS_PER_MS) as i32
  }

  /// This instant with sub-millisecond precision dropped.
  pub fn truncated_to_ms(self) -> Time {
    let nsec = self.nsec as i64;
    Time {
      sec: self.sec,
      nsec: (nsec - nsec % NANOS_PER_MS) as i32,
    }
  }

  /// The target of a timer due `ms` milliseconds after `self`.
  pub fn add_ms(self, ms: u64) -> Time {
    let mut sec = self.sec + (ms / MS_PER_SEC) as i64;
    let mut nsec = self.nsec as i64 + (ms % MS_PER_SEC) as i64 * NANOS_PER_MS;
    if nsec >= NANOS_PER_SEC {
      sec += 1;
      nsec -= NANOS_PER_SEC;
    }
    Time {
      sec,
      nsec: nsec as i32,
    }
  }

  /// Elapsed time from `earlier` to `self`; zero if `earlier` is not earlier.
  pub fn duration_since(self, earlier: Time) -> Duration {
    if self <= earlier {
      return Duration::ZERO;
    }
    let mut sec = self.sec - earlier.sec;
    let mut nsec = self.nsec - earlier.nsec;
    if nsec < 0 {
      sec -= 1;
      nsec += NANOS_PER_SEC as i32;
    }
    Duration::new(sec as u64, nsec as u32)
  }

  pub(crate) fn from_duration(d: Duration) -> Time {
    Time {
      sec: d.as_secs() as i64,
      nsec: d.subsec_nanos() as i32,
    }
  }
}

impl Add<Duration> for Time {
  type Output = Time;

  fn add(self, rhs: Duration) -> Time {
    let mut sec = self.sec + rhs.as_secs() as i64;
    let mut nsec = self.nsec as i64 + rhs.subsec_nanos() as i64;
    if nsec >= NANOS_PER_SEC {
      sec += 1;
      nsec -= NANOS_PER_SEC;
    }
    Time {
      sec,
      nsec: nsec as i32,
    }
  }
}

/// Source of the monotonic samples the scheduler runs on. A seam rather than
/// a direct `Instant::now()` so drains are drivable from tests without
/// sleeping.
pub trait Clock: Send + Sync {
  fn now(&self) -> Time;
}

/// Wall clock anchored at construction.
#[derive(Debug)]
pub struct MonotonicClock {
  origin: Instant,
}

impl Default for MonotonicClock {
  fn default() -> Self {
    MonotonicClock {
      origin: Instant::now(),
    }
  }
}

impl Clock for MonotonicClock {
  fn now(&self) -> Time {
    Time::from_duration(self.origin.elapsed())
  }
}
