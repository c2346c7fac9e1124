//! Synthetic test-pattern source.
//!
//! Produces solid-colour frames at a native rate, paced by the injected
//! [`Clock`]. Opens can be scripted to fail and each connection can be given a
//! finite length, which is how reconnection and file looping are exercised
//! without a camera or a decoder.

use image::{Rgb, RgbImage};
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{Capture, SourceDescriptor, SourceOpener};
use crate::clock::Clock;
use crate::error::{OpenError, ReadError};

#[derive(Clone, Debug)]
pub struct Pattern {
    pub width: u32,
    pub height: u32,
    pub native_fps: u32,
    /// Colours cycled through, each shown for `color_period`.
    pub colors: Vec<[u8; 3]>,
    pub color_period: Duration,
    /// Frames delivered per connection before end of stream. `None` never ends.
    pub frames_per_connection: Option<u64>,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            native_fps: 30,
            colors: vec![[255, 0, 0], [0, 0, 255]],
            color_period: Duration::from_secs(1),
            frames_per_connection: None,
        }
    }
}

impl Pattern {
    fn frame_offset(&self, index: u64) -> Duration {
        Duration::from_nanos(index * 1_000_000_000 / u64::from(self.native_fps.max(1)))
    }

    fn color_at(&self, offset: Duration) -> [u8; 3] {
        if self.colors.is_empty() {
            return [0, 0, 0];
        }
        let period = self.color_period.as_nanos().max(1);
        let slot = (offset.as_nanos() / period) as usize % self.colors.len();
        self.colors[slot]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenStep {
    Succeed,
    Fail,
}

#[derive(Debug, Default)]
struct Counters {
    open_attempts: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

pub struct SyntheticOpener {
    pattern: Pattern,
    clock: Arc<dyn Clock>,
    script: Mutex<VecDeque<OpenStep>>,
    otherwise: OpenStep,
    opened_sources: Mutex<Vec<SourceDescriptor>>,
    counters: Arc<Counters>,
}

impl SyntheticOpener {
    pub fn new(pattern: Pattern, clock: Arc<dyn Clock>) -> Self {
        Self {
            pattern,
            clock,
            script: Mutex::new(VecDeque::new()),
            otherwise: OpenStep::Succeed,
            opened_sources: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Outcomes for the next opens, in order.
    pub fn with_script(self, steps: impl IntoIterator<Item = OpenStep>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(steps);
        self
    }

    /// Outcome once the script has run out.
    pub fn then_always(mut self, step: OpenStep) -> Self {
        self.otherwise = step;
        self
    }

    pub fn open_attempts(&self) -> usize {
        self.counters.open_attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Captures opened and not yet closed.
    pub fn live_captures(&self) -> usize {
        self.opened() - self.counters.closed.load(Ordering::SeqCst)
    }

    /// Descriptors of successful opens, in order.
    pub fn opened_sources(&self) -> Vec<SourceDescriptor> {
        self.opened_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SourceOpener for SyntheticOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn Capture>, OpenError> {
        self.counters.open_attempts.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(self.otherwise);

        if step == OpenStep::Fail {
            debug!("synthetic open of {descriptor} scripted to fail");
            return Err(OpenError::Unreachable {
                location: descriptor.to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.opened_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(descriptor.clone());
        Ok(Box::new(SyntheticCapture {
            pattern: self.pattern.clone(),
            clock: Arc::clone(&self.clock),
            counters: Arc::clone(&self.counters),
            opened_at: self.clock.now(),
            index: 0,
            closed: false,
        }))
    }
}

struct SyntheticCapture {
    pattern: Pattern,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    opened_at: Instant,
    index: u64,
    closed: bool,
}

impl Capture for SyntheticCapture {
    fn read_frame(&mut self, timeout: Duration) -> Result<RgbImage, ReadError> {
        if self.closed {
            return Err(ReadError::Decode("capture is closed".to_string()));
        }
        if self
            .pattern
            .frames_per_connection
            .is_some_and(|limit| self.index >= limit)
        {
            return Err(ReadError::EndOfStream);
        }

        let offset = self.pattern.frame_offset(self.index);
        let due = self.opened_at + offset;
        let wait = due.saturating_duration_since(self.clock.now());
        if wait > timeout {
            self.clock.sleep(timeout);
            return Err(ReadError::Timeout(timeout));
        }
        self.clock.sleep(wait);

        self.index += 1;
        let color = self.pattern.color_at(offset);
        Ok(RgbImage::from_pixel(
            self.pattern.width,
            self.pattern.height,
            Rgb(color),
        ))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.close();
    }
}
