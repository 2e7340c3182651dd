//! Cancellation, resume and connection signalling for one run.
//!
//! Every blocking wait in the sequencer (settle, dwell, interlock resume,
//! monitor connection) parks on the same condition variable so that
//! `cancel()` wakes it promptly.
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Returned from a wait interrupted by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Default)]
struct Signals {
    cancelled: bool,
    resume_gen: u64,
    connected: bool,
}

#[derive(Debug, Default)]
pub struct RunControl {
    signals: Mutex<Signals>,
    cv: Condvar,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let mut s = self.lock();
        if !s.cancelled {
            s.cancelled = true;
            tracing::info!("cancellation requested");
        }
        self.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Operator acknowledgement of an interlock trip.
    pub fn resume(&self) {
        let mut s = self.lock();
        s.resume_gen = s.resume_gen.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Snapshot to pass to [`wait_for_resume`](Self::wait_for_resume); resumes
    /// requested before the snapshot do not count.
    pub fn resume_generation(&self) -> u64 {
        self.lock().resume_gen
    }

    pub fn mark_connected(&self) {
        let mut s = self.lock();
        s.connected = true;
        self.cv.notify_all();
    }

    /// Sleep for `d` unless cancelled first.
    pub fn sleep(&self, d: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + d;
        let mut s = self.lock();
        loop {
            if s.cancelled {
                return Err(Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            s = self
                .cv
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Block until a resume newer than `seen` arrives, or cancellation.
    pub fn wait_for_resume(&self, seen: u64) -> Result<(), Cancelled> {
        let s = self.lock();
        let s = self
            .cv
            .wait_while(s, |s| !s.cancelled && s.resume_gen == seen)
            .unwrap_or_else(PoisonError::into_inner);
        if s.cancelled { Err(Cancelled) } else { Ok(()) }
    }

    /// Wait up to `timeout` for [`mark_connected`](Self::mark_connected).
    /// `Ok(false)` on timeout.
    pub fn wait_connected(&self, timeout: Duration) -> Result<bool, Cancelled> {
        let s = self.lock();
        let (s, _) = self
            .cv
            .wait_timeout_while(s, timeout, |s| !s.cancelled && !s.connected)
            .unwrap_or_else(PoisonError::into_inner);
        if s.cancelled {
            Err(Cancelled)
        } else {
            Ok(s.connected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cancel_interrupts_sleep_promptly() {
        let c = Arc::new(RunControl::new());
        let c2 = Arc::clone(&c);
        let t = std::thread::spawn(move || {
            let start = Instant::now();
            let r = c2.sleep(Duration::from_secs(10));
            (r, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        c.cancel();
        let (r, waited) = t.join().unwrap();
        assert_eq!(r, Err(Cancelled));
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn sleep_completes_without_cancel() {
        let c = RunControl::new();
        assert_eq!(c.sleep(Duration::from_millis(5)), Ok(()));
    }

    #[test]
    fn cancel_is_idempotent() {
        let c = RunControl::new();
        c.cancel();
        c.cancel();
        assert!(c.is_cancelled());
        assert_eq!(c.sleep(Duration::ZERO), Err(Cancelled));
    }

    #[test]
    fn resume_after_snapshot_releases_waiter() {
        let c = Arc::new(RunControl::new());
        c.resume(); // stale, before the snapshot
        let seen = c.resume_generation();
        let c2 = Arc::clone(&c);
        let t = std::thread::spawn(move || c2.wait_for_resume(seen));
        std::thread::sleep(Duration::from_millis(10));
        c.resume();
        assert_eq!(t.join().unwrap(), Ok(()));
    }

    #[test]
    fn connection_wait_times_out_or_succeeds() {
        let c = RunControl::new();
        assert_eq!(c.wait_connected(Duration::from_millis(5)), Ok(false));
        c.mark_connected();
        assert_eq!(c.wait_connected(Duration::from_millis(5)), Ok(true));
    }
}
