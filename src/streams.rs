use crossbeam::channel::{self, Sender};
use log::{debug, error, info};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::ReaderConfig;
use crate::consumer::{AsyncFrameStream, FrameStream};
use crate::error::ReaderError;
use crate::frame::Frame;
use crate::source::{SourceDescriptor, SourceOpener, default_opener};
use crate::state::{ReaderState, ReaderStats, ReaderStatus, Shared};
use crate::worker::Worker;

/// Interface for anything that serves the latest frame of a video source.
///
/// Consumers never block the producer and never see a frame older than one
/// they already saw.
pub trait FrameSource {
    /// Opens the source and launches the background reader.
    /// Calling it on a running (or failed, not yet stopped) reader does nothing.
    fn start(&self) -> Result<(), ReaderError>;

    /// Stops the background reader and releases the source before returning.
    fn stop(&self);

    /// Most recent frame, without waiting. `None` before the first frame.
    fn read(&self) -> Option<Arc<Frame>>;

    /// Blocking iterator over frames newer than the last one it yielded.
    fn read_stream(&self, poll_interval: Duration) -> FrameStream;

    fn is_healthy(&self) -> bool;
}

struct WorkerHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// A [`FrameSource`] backed by one reader thread.
pub struct FrameReader {
    name: String,
    source: SourceDescriptor,
    config: ReaderConfig,
    opener: Arc<dyn SourceOpener>,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl FrameReader {
    /// A reader using the default opener for this build and the wall clock.
    pub fn new(source: SourceDescriptor, config: ReaderConfig) -> Result<Self, ReaderError> {
        Self::with_opener(source, config, default_opener(), Arc::new(SystemClock))
    }

    pub fn with_opener(
        source: SourceDescriptor,
        config: ReaderConfig,
        opener: Arc<dyn SourceOpener>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ReaderError> {
        config.validate()?;
        let shared = Arc::new(Shared::new(source.clone(), clock.now()));
        Ok(Self {
            name: source.to_string(),
            source,
            config,
            opener,
            clock,
            shared,
            worker: Mutex::new(None),
        })
    }

    /// Name used as the `[name]` prefix of log lines and in the thread name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn status(&self) -> ReaderStatus {
        self.shared.status()
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    pub fn stats(&self) -> ReaderStats {
        self.shared.counters.snapshot()
    }

    /// Async counterpart of [`FrameSource::read_stream`].
    pub fn read_stream_async(&self, poll_interval: Duration) -> AsyncFrameStream {
        AsyncFrameStream::new(Arc::clone(&self.shared), poll_interval)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FrameSource for FrameReader {
    fn start(&self) -> Result<(), ReaderError> {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            debug!("[{}] start ignored, reader already running", self.name);
            return Ok(());
        }

        info!(
            "[{}] starting reader for {} at {} fps, {}x{}",
            self.name,
            self.source,
            self.config.target_fps,
            self.config.output_width,
            self.config.output_height
        );
        let (stop, stop_rx) = channel::bounded::<()>(1);
        let mut reader_loop = Worker::new(
            self.name.clone(),
            self.source.clone(),
            self.config.clone(),
            Arc::clone(&self.opener),
            Arc::clone(&self.clock),
            Arc::clone(&self.shared),
            stop_rx,
        );
        reader_loop.connect()?;

        let thread = thread::Builder::new()
            .name(format!("frame-reader-{}", self.name))
            .spawn(move || reader_loop.run());
        match thread {
            Ok(thread) => {
                *worker = Some(WorkerHandle { stop, thread });
                Ok(())
            }
            Err(e) => {
                error!("[{}] could not spawn reader thread: {e}", self.name);
                self.shared.set_state(ReaderState::Stopped, self.clock.now());
                Err(e.into())
            }
        }
    }

    fn stop(&self) {
        let mut worker = self.lock_worker();
        let Some(handle) = worker.take() else {
            return;
        };

        drop(handle.stop);
        if handle.thread.join().is_err() {
            error!("[{}] reader thread panicked", self.name);
        }
        self.shared.set_state(ReaderState::Stopped, self.clock.now());
        info!("[{}] reader stopped", self.name);
    }

    fn read(&self) -> Option<Arc<Frame>> {
        self.shared.slot.latest()
    }

    fn read_stream(&self, poll_interval: Duration) -> FrameStream {
        FrameStream::new(Arc::clone(&self.shared), poll_interval)
    }

    fn is_healthy(&self) -> bool {
        self.shared
            .status()
            .is_healthy(self.clock.now(), self.config.health_grace)
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.stop();
    }
}
