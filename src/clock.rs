//! The clock capability used to stamp log records.
//!
//! The clock is injected rather than read from a global so that tests can force
//! a deterministic ordering between records that would otherwise race on the
//! wall clock's resolution.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A monotonically-non-decreasing source of nanosecond timestamps.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Returns the current time as nanoseconds. Implementations are only
    /// required to be non-decreasing with respect to their own prior calls;
    /// they need not be steady across process restarts.
    fn now_nanos(&self) -> i64;
}

/// The default clock: wall-clock time at nanosecond resolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_nanos() as i64
    }
}

/// A deterministic clock for tests that need to control tie-breaking between
/// records. Each call to `now_nanos` advances the internal counter by `step`.
#[derive(Debug)]
pub struct ManualClock {
    counter: AtomicI64,
    step: i64,
}

impl ManualClock {
    /// Creates a clock starting at `start`, advancing by `step` on every read.
    pub fn new(start: i64, step: i64) -> Self {
        Self {
            counter: AtomicI64::new(start),
            step,
        }
    }

    /// Sets the next value that will be returned, bypassing the step.
    pub fn set(&self, value: i64) {
        self.counter.store(value, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.counter.fetch_add(self.step, Ordering::SeqCst)
    }
}
