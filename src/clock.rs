//! Time source for the reader loop.
//!
//! Everything that sleeps or stamps time in the reader goes through a [`Clock`],
//! so tests can swap the wall clock for a [`ManualClock`] and run backoff
//! schedules and rate sampling without real waiting.

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Wall-clock time matching [`Clock::now`].
    fn wall(&self) -> SystemTime;

    /// Uninterruptible pause, used for source pacing.
    fn sleep(&self, duration: Duration);

    /// Waits up to `timeout` for the stop channel to fire.
    /// Returns `true` if a stop was requested (a message or a dropped sender).
    fn wait(&self, timeout: Duration, stop: &Receiver<()>) -> bool;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }

    fn wait(&self, timeout: Duration, stop: &Receiver<()>) -> bool {
        !matches!(stop.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

/// Virtual clock. Sleeping and waiting advance it instantly.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: SystemTime,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: SystemTime::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    /// Virtual time passed since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall(&self) -> SystemTime {
        self.wall_origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn wait(&self, timeout: Duration, stop: &Receiver<()>) -> bool {
        if stop_requested(stop) {
            return true;
        }
        self.advance(timeout);
        false
    }
}

/// Non-blocking check of a stop channel.
pub(crate) fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}
