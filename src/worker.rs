//! Frame reader loop.
//!
//! Runs on a dedicated thread and is the only owner of the [`Capture`]. Each
//! step either decodes one frame (publishing it when the sampler admits it) or,
//! while disconnected, makes one reopen attempt after its backoff delay.

use crossbeam::channel::Receiver;
use image::RgbImage;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

use crate::backoff::Backoff;
use crate::clock::{Clock, stop_requested};
use crate::config::ReaderConfig;
use crate::error::{OpenError, ReadError, ReaderError};
use crate::frame::resize_to;
use crate::sampling::RateSampler;
use crate::source::{Capture, SourceDescriptor, SourceOpener};
use crate::state::{ReaderCounters, ReaderState, Shared};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Worker {
    name: String,
    active: SourceDescriptor,
    config: ReaderConfig,
    opener: Arc<dyn SourceOpener>,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    capture: Option<Box<dyn Capture>>,
    sampler: RateSampler,
    backoff: Backoff,
    /// Frames decoded from the current capture.
    decoded_since_open: u64,
    stop: Receiver<()>,
}

impl Worker {
    pub fn new(
        name: String,
        source: SourceDescriptor,
        config: ReaderConfig,
        opener: Arc<dyn SourceOpener>,
        clock: Arc<dyn Clock>,
        shared: Arc<Shared>,
        stop: Receiver<()>,
    ) -> Self {
        let sampler = RateSampler::new(config.target_fps);
        let backoff = Backoff::new(
            config.reconnect_backoff.clone(),
            config.max_reconnect_attempts,
        );
        Self {
            name,
            active: source,
            config,
            opener,
            clock,
            shared,
            capture: None,
            sampler,
            backoff,
            decoded_since_open: 0,
            stop,
        }
    }

    /// First open, done on the caller's thread so `start()` can report it.
    pub fn connect(&mut self) -> Result<(), OpenError> {
        self.shared.set_active_source(self.active.clone());
        self.shared
            .set_state(ReaderState::Connecting, self.clock.now());
        info!("[{}] connecting to {}", self.name, self.active);

        match self.opener.open(&self.active) {
            Ok(capture) => {
                self.attach(capture);
                self.shared.set_error(None);
                self.shared
                    .set_state(ReaderState::Streaming, self.clock.now());
                info!("[{}] streaming from {}", self.name, self.active);
                Ok(())
            }
            Err(e) => {
                error!("[{}] could not open {}: {e}", self.name, self.active);
                self.shared.set_error(Some(e.to_string()));
                self.shared.set_state(ReaderState::Stopped, self.clock.now());
                Err(e)
            }
        }
    }

    pub fn run(mut self) {
        debug!("[{}] reader loop running", self.name);
        while !stop_requested(&self.stop) {
            if self.step() == Flow::Exit {
                break;
            }
        }
        self.close_capture();
        debug!("[{}] reader loop exited", self.name);
    }

    pub fn step(&mut self) -> Flow {
        let Some(capture) = self.capture.as_mut() else {
            return self.reconnect();
        };

        match capture.read_frame(self.config.read_timeout) {
            Ok(image) => self.publish(image),
            // An empty file goes through backoff instead of reopening in a tight loop.
            Err(ReadError::EndOfStream)
                if self.active.loops_at_end() && self.decoded_since_open > 0 =>
            {
                self.restart_file()
            }
            Err(e) => self.begin_reconnect(e),
        }
        Flow::Continue
    }

    fn attach(&mut self, capture: Box<dyn Capture>) {
        self.capture = Some(capture);
        self.decoded_since_open = 0;
    }

    fn publish(&mut self, image: RgbImage) {
        self.decoded_since_open += 1;
        let counters = &self.shared.counters;
        ReaderCounters::bump(&counters.decoded);

        let now = self.clock.now();
        if !self.sampler.admit(now) {
            ReaderCounters::bump(&counters.sampled_out);
            return;
        }

        let image = resize_to(image, self.config.output_width, self.config.output_height);
        let sequence = self.shared.slot.publish(image, self.clock.wall(), now);
        ReaderCounters::bump(&counters.published);
        trace!("[{}] published frame {sequence}", self.name);
    }

    fn restart_file(&mut self) {
        self.close_capture();
        ReaderCounters::bump(&self.shared.counters.file_loops);
        info!("[{}] end of {}, looping", self.name, self.active);

        match self.opener.open(&self.active) {
            Ok(capture) => self.attach(capture),
            Err(e) => self.begin_reconnect(e),
        }
    }

    fn begin_reconnect(&mut self, cause: impl std::fmt::Display) {
        warn!("[{}] lost {}: {cause}", self.name, self.active);
        self.close_capture();
        self.backoff.reset();
        self.shared.set_error(Some(cause.to_string()));
        self.shared
            .set_state(ReaderState::Reconnecting, self.clock.now());
    }

    /// One reopen attempt, preceded by its backoff delay.
    fn reconnect(&mut self) -> Flow {
        self.maybe_switch_to_fallback();

        let Some(delay) = self.backoff.next_delay() else {
            let e = ReaderError::ReconnectExhausted {
                attempts: self.backoff.attempts(),
            };
            error!("[{}] {e}, giving up on {}", self.name, self.active);
            self.shared.set_error(Some(e.to_string()));
            self.shared.set_state(ReaderState::Failed, self.clock.now());
            return Flow::Exit;
        };

        debug!(
            "[{}] reopening {} in {delay:?} (attempt {})",
            self.name,
            self.active,
            self.backoff.attempts()
        );
        if self.clock.wait(delay, &self.stop) {
            return Flow::Exit;
        }

        ReaderCounters::bump(&self.shared.counters.reconnect_attempts);
        match self.opener.open(&self.active) {
            Ok(capture) => {
                info!(
                    "[{}] reconnected to {} after {} attempt(s)",
                    self.name,
                    self.active,
                    self.backoff.attempts()
                );
                self.attach(capture);
                self.backoff.reset();
                self.shared.set_error(None);
                self.shared
                    .set_state(ReaderState::Streaming, self.clock.now());
            }
            Err(e) => {
                warn!("[{}] reopen of {} failed: {e}", self.name, self.active);
                self.shared.set_error(Some(e.to_string()));
            }
        }
        Flow::Continue
    }

    fn maybe_switch_to_fallback(&mut self) {
        let Some(fallback) = &self.config.fallback else {
            return;
        };
        if self.active == *fallback || self.backoff.attempts() < self.config.fallback_after {
            return;
        }

        warn!(
            "[{}] {} failed {} reopen attempts, switching to {}",
            self.name,
            self.active,
            self.backoff.attempts(),
            fallback
        );
        self.active = fallback.clone();
        self.shared.set_active_source(self.active.clone());
        self.backoff.reset();
    }

    fn close_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::source::synthetic::{OpenStep, Pattern, SyntheticOpener};
    use crossbeam::channel::{self, Sender};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn rtsp() -> SourceDescriptor {
        SourceDescriptor::Rtsp("rtsp://synthetic/cam".to_string())
    }

    fn clip() -> SourceDescriptor {
        SourceDescriptor::File(PathBuf::from("clip.mp4"))
    }

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    struct Harness {
        worker: Worker,
        opener: Arc<SyntheticOpener>,
        clock: Arc<ManualClock>,
        shared: Arc<Shared>,
        stop: Sender<()>,
    }

    /// Builds a connected worker whose opener paces frames on the worker's clock.
    fn harness(
        source: SourceDescriptor,
        config: ReaderConfig,
        pattern: Pattern,
        script: impl FnOnce(SyntheticOpener) -> SyntheticOpener,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let opener = Arc::new(script(SyntheticOpener::new(pattern, clock.clone())));
        let shared = Arc::new(Shared::new(source.clone(), Instant::now()));
        let (stop, stop_rx) = channel::bounded(1);
        let mut worker = Worker::new(
            "test".to_string(),
            source,
            config,
            opener.clone(),
            clock.clone(),
            shared.clone(),
            stop_rx,
        );
        worker.connect().unwrap();
        Harness {
            worker,
            opener,
            clock,
            shared,
            stop,
        }
    }

    fn ends_after(frames: u64) -> Pattern {
        Pattern {
            frames_per_connection: Some(frames),
            ..Pattern::default()
        }
    }

    #[test]
    fn decodes_everything_but_publishes_at_target_rate() {
        let config = ReaderConfig {
            output_width: 32,
            output_height: 24,
            ..ReaderConfig::default()
        };
        let mut h = harness(rtsp(), config, Pattern::default(), |o| o);

        for _ in 0..30 {
            assert_eq!(h.worker.step(), Flow::Continue);
        }

        let stats = h.shared.counters.snapshot();
        assert_eq!(stats.decoded, 30);
        assert_eq!(stats.published, 2);
        assert_eq!(stats.sampled_out, 28);
        let frame = h.shared.slot.latest().unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 24));
        assert_eq!(frame.sequence, 2);
    }

    #[test]
    fn end_of_live_stream_reconnects_after_first_delay() {
        let config = ReaderConfig {
            reconnect_backoff: millis(&[100, 200]),
            ..ReaderConfig::default()
        };
        let mut h = harness(rtsp(), config, ends_after(1), |o| o);
        let before = h.clock.elapsed();

        h.worker.step();
        h.worker.step();
        assert_eq!(h.shared.state(), ReaderState::Reconnecting);
        assert_eq!(h.opener.live_captures(), 0);
        assert_eq!(h.shared.status().last_error.as_deref(), Some("end of stream"));

        h.worker.step();
        assert_eq!(h.shared.state(), ReaderState::Streaming);
        assert_eq!(h.clock.elapsed() - before, Duration::from_millis(100));
        assert_eq!(h.shared.status().last_error, None);
        assert_eq!(h.shared.counters.snapshot().reconnect_attempts, 1);
    }

    #[test]
    fn exhausted_attempts_fail_the_reader() {
        let config = ReaderConfig {
            reconnect_backoff: millis(&[100, 200, 400]),
            max_reconnect_attempts: Some(3),
            ..ReaderConfig::default()
        };
        let mut h = harness(rtsp(), config, ends_after(1), |o| {
            o.with_script([OpenStep::Succeed])
                .then_always(OpenStep::Fail)
        });

        h.worker.step();
        h.worker.step();
        let reconnect_started = h.clock.elapsed();
        let mut flows = Vec::new();
        for _ in 0..4 {
            flows.push(h.worker.step());
        }

        assert_eq!(flows.last(), Some(&Flow::Exit));
        assert_eq!(h.shared.state(), ReaderState::Failed);
        assert_eq!(h.clock.elapsed() - reconnect_started, Duration::from_millis(700));
        assert_eq!(h.opener.open_attempts(), 4);
        assert!(h.shared.slot.latest().is_some());
        assert!(
            h.shared
                .status()
                .last_error
                .unwrap()
                .contains("after 3 reconnect attempts")
        );
    }

    #[test]
    fn file_end_restarts_without_backoff() {
        let mut h = harness(clip(), ReaderConfig::default(), ends_after(2), |o| o);

        for _ in 0..3 {
            h.worker.step();
        }

        assert_eq!(h.shared.state(), ReaderState::Streaming);
        assert_eq!(h.shared.counters.snapshot().file_loops, 1);
        assert_eq!(h.shared.counters.snapshot().reconnect_attempts, 0);
        assert_eq!(h.opener.opened(), 2);
        assert_eq!(h.opener.live_captures(), 1);
    }

    #[test]
    fn looped_file_shows_its_first_frames_again() {
        let (red, blue) = ([255, 0, 0], [0, 0, 255]);
        let config = ReaderConfig {
            target_fps: 1_000.0,
            output_width: 64,
            output_height: 48,
            ..ReaderConfig::default()
        };
        let pattern = Pattern {
            colors: vec![red, blue],
            color_period: Duration::from_millis(100),
            frames_per_connection: Some(6),
            ..Pattern::default()
        };
        let mut h = harness(clip(), config, pattern, |o| o);
        let color = |h: &Harness| h.shared.slot.latest().unwrap().image.get_pixel(0, 0).0;

        for _ in 0..6 {
            h.worker.step();
        }
        assert_eq!(color(&h), blue);

        h.worker.step();
        assert_eq!(h.shared.counters.snapshot().file_loops, 1);
        let published = h.shared.counters.snapshot().published;
        while h.shared.counters.snapshot().published == published {
            h.worker.step();
        }
        assert_eq!(color(&h), red);
    }

    #[test]
    fn empty_file_backs_off_instead_of_spinning() {
        let config = ReaderConfig {
            reconnect_backoff: millis(&[100]),
            ..ReaderConfig::default()
        };
        let mut h = harness(clip(), config, ends_after(0), |o| o);
        let before = h.clock.elapsed();

        h.worker.step();
        assert_eq!(h.shared.state(), ReaderState::Reconnecting);
        assert_eq!(h.shared.counters.snapshot().file_loops, 0);

        h.worker.step();
        assert_eq!(h.clock.elapsed() - before, Duration::from_millis(100));
        assert_eq!(h.opener.opened(), 2);
    }

    #[test]
    fn frame_timestamps_share_the_worker_clock() {
        let config = ReaderConfig {
            target_fps: 1_000.0,
            ..ReaderConfig::default()
        };
        let mut h = harness(rtsp(), config, Pattern::default(), |o| o);

        h.worker.step();
        let first = h.shared.slot.latest().unwrap();
        h.clock.advance(Duration::from_secs(5));
        h.worker.step();
        let second = h.shared.slot.latest().unwrap();

        let by_instant = second.captured_instant - first.captured_instant;
        let by_wall = second.captured_at.duration_since(first.captured_at).unwrap();
        assert_eq!(by_instant, by_wall);
        assert!(by_wall >= Duration::from_secs(5));
    }

    #[test]
    fn switches_to_fallback_after_repeated_failures() {
        let config = ReaderConfig {
            reconnect_backoff: millis(&[10]),
            fallback: Some(clip()),
            fallback_after: 2,
            ..ReaderConfig::default()
        };
        let mut h = harness(rtsp(), config, ends_after(1), |o| {
            o.with_script([OpenStep::Succeed, OpenStep::Fail, OpenStep::Fail])
        });

        for _ in 0..5 {
            h.worker.step();
        }

        assert_eq!(h.shared.state(), ReaderState::Streaming);
        assert_eq!(h.opener.opened_sources(), vec![rtsp(), clip()]);
        assert_eq!(h.shared.status().active_source, clip());
    }

    #[test]
    fn stop_interrupts_backoff_wait() {
        let mut h = harness(rtsp(), ReaderConfig::default(), ends_after(1), |o| o);

        h.worker.step();
        h.worker.step();
        drop(h.stop);

        assert_eq!(h.worker.step(), Flow::Exit);
        assert_eq!(h.opener.open_attempts(), 1);
    }

    #[test]
    fn run_releases_capture_on_stop() {
        let h = harness(rtsp(), ReaderConfig::default(), Pattern::default(), |o| o);
        assert_eq!(h.opener.live_captures(), 1);

        h.stop.send(()).unwrap();
        h.worker.run();
        assert_eq!(h.opener.live_captures(), 0);
    }

    #[test]
    fn failed_connect_reports_and_stays_stopped() {
        let clock = Arc::new(ManualClock::new());
        let opener = SyntheticOpener::new(Pattern::default(), clock.clone()).then_always(OpenStep::Fail);
        let shared = Arc::new(Shared::new(rtsp(), Instant::now()));
        let (_stop, stop_rx) = channel::bounded(1);
        let mut worker = Worker::new(
            "test".to_string(),
            rtsp(),
            ReaderConfig::default(),
            Arc::new(opener),
            clock,
            shared.clone(),
            stop_rx,
        );

        assert!(matches!(worker.connect(), Err(OpenError::Unreachable { .. })));
        assert_eq!(shared.state(), ReaderState::Stopped);
        assert!(shared.status().last_error.is_some());
    }
}
