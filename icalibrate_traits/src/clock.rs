use chrono::{Duration, Local, NaiveDateTime, Timelike};
use std::sync::{Arc, Mutex};

/// Wall-clock abstraction used to stamp calibration datasets and file names.
///
/// - now(): local date/time at the moment of the call
/// - minute(): helper truncating to whole minutes (the resolution stored in files)
pub trait Clock {
    fn now(&self) -> NaiveDateTime;

    /// Local time truncated to the minute.
    fn minute(&self) -> NaiveDateTime {
        let t = self.now();
        t.with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t)
    }
}

/// Default clock backed by the host's local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Deterministic clock whose time is set and advanced manually.
#[derive(Debug, Clone)]
pub struct FixedClock {
    at: Arc<Mutex<NaiveDateTime>>,
}

impl FixedClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self {
            at: Arc::new(Mutex::new(at)),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut at) = self.at.lock() {
            *at += d;
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, t: NaiveDateTime) {
        if let Ok(mut at) = self.at.lock() {
            *at = t;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.at
            .lock()
            .map(|g| *g)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}
