#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stream_sampler::source::synthetic::{Pattern, SyntheticOpener};
use stream_sampler::{FrameReader, ManualClock, ReaderConfig, SourceDescriptor};

pub struct Rig {
    pub reader: FrameReader,
    pub opener: Arc<SyntheticOpener>,
    pub clock: Arc<ManualClock>,
}

/// A reader over a synthetic source, both driven by the same manual clock.
pub fn rig(
    source: SourceDescriptor,
    config: ReaderConfig,
    pattern: Pattern,
    script: impl FnOnce(SyntheticOpener) -> SyntheticOpener,
) -> Rig {
    let clock = Arc::new(ManualClock::new());
    let opener = Arc::new(script(SyntheticOpener::new(pattern, clock.clone())));
    let reader = FrameReader::with_opener(source, config, opener.clone(), clock.clone())
        .expect("valid config")
        .with_name("test");
    Rig {
        reader,
        opener,
        clock,
    }
}

pub fn rtsp() -> SourceDescriptor {
    SourceDescriptor::Rtsp("rtsp://synthetic/cam".to_string())
}

pub fn clip() -> SourceDescriptor {
    SourceDescriptor::File("clip.mp4".into())
}

pub fn millis(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_millis).collect()
}

pub fn ends_after(frames: u64) -> Pattern {
    Pattern {
        frames_per_connection: Some(frames),
        ..Pattern::default()
    }
}

/// Polls `done` in real time until it holds, failing after a generous deadline.
pub fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}
