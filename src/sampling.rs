use std::time::{Duration, Instant};

/// Decimates decoded frames down to a target rate.
///
/// A frame is kept when at least `1 / target_fps` has passed since the last
/// kept frame. Frames are still decoded before being dropped, since most
/// decoders cannot skip ahead without losing codec state.
#[derive(Clone, Debug)]
pub struct RateSampler {
    min_interval: Duration,
    last_kept: Option<Instant>,
}

impl RateSampler {
    /// Rates too low for a [`Duration`] interval keep only the first frame.
    pub fn new(target_fps: f64) -> Self {
        Self {
            min_interval: Duration::try_from_secs_f64(1.0 / target_fps)
                .unwrap_or(Duration::MAX),
            last_kept: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns `true` and records `now` if the frame should be published.
    pub fn admit(&mut self, now: Instant) -> bool {
        let due = match self.last_kept {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        };
        if due {
            self.last_kept = Some(now);
        }
        due
    }
}
