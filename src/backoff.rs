//! Reconnection schedule.
//!
//! Pure bookkeeping: the reader loop asks for the next delay before every reopen
//! attempt and reports successes. Delays step through the configured sequence and
//! then hold at its last entry.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Backoff {
    steps: Vec<Duration>,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Backoff {
    /// `steps` must be non-empty; [`crate::ReaderConfig::validate`] guarantees it.
    pub fn new(steps: Vec<Duration>, max_attempts: Option<u32>) -> Self {
        Self {
            steps,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay to sleep before the next reopen attempt, counting that attempt.
    /// `None` once `max_attempts` attempts have been made.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let last = self.steps.len().saturating_sub(1);
        let index = (self.attempts as usize).min(last);
        let delay = self.steps.get(index).copied().unwrap_or_default();
        self.attempts += 1;
        Some(delay)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts
            .is_some_and(|max_attempts| self.attempts >= max_attempts)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
