use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};

use crate::slot::FrameSlot;
use crate::source::SourceDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ReaderState {
    Stopped,
    Connecting,
    Streaming,
    Reconnecting,
    /// Reconnect attempts exhausted. Only `stop()` followed by `start()` recovers.
    Failed,
}

impl ReaderState {
    /// No further frames will be published without a restart.
    pub fn is_terminal(self) -> bool {
        matches!(self, ReaderState::Stopped | ReaderState::Failed)
    }
}

/// Point-in-time view of a reader.
#[derive(Clone, Debug)]
pub struct ReaderStatus {
    pub state: ReaderState,
    /// When `state` was entered, on the reader's clock.
    pub since: Instant,
    /// Source currently being read. Differs from the configured one after a
    /// switch to the fallback file.
    pub active_source: SourceDescriptor,
    pub last_error: Option<String>,
}

impl ReaderStatus {
    /// Streaming is healthy; connecting and reconnecting are healthy for `grace`.
    pub fn is_healthy(&self, now: Instant, grace: Duration) -> bool {
        match self.state {
            ReaderState::Streaming => true,
            ReaderState::Connecting | ReaderState::Reconnecting => {
                now.saturating_duration_since(self.since) <= grace
            }
            ReaderState::Stopped | ReaderState::Failed => false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReaderCounters {
    pub decoded: AtomicU64,
    pub published: AtomicU64,
    pub sampled_out: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub file_loops: AtomicU64,
}

impl ReaderCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReaderStats {
        ReaderStats {
            decoded: self.decoded.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            file_loops: self.file_loops.load(Ordering::Relaxed),
        }
    }
}

/// Cumulative counters over the reader's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub decoded: u64,
    pub published: u64,
    /// Decoded but dropped by rate sampling.
    pub sampled_out: u64,
    pub reconnect_attempts: u64,
    pub file_loops: u64,
}

/// State shared between a reader loop and its consumers. Only the loop (and the
/// owning `FrameReader` around start/stop) writes to it.
#[derive(Debug)]
pub(crate) struct Shared {
    pub slot: FrameSlot,
    pub counters: ReaderCounters,
    status: Mutex<ReaderStatus>,
}

impl Shared {
    pub fn new(source: SourceDescriptor, now: Instant) -> Self {
        Self {
            slot: FrameSlot::new(),
            counters: ReaderCounters::default(),
            status: Mutex::new(ReaderStatus {
                state: ReaderState::Stopped,
                since: now,
                active_source: source,
                last_error: None,
            }),
        }
    }

    pub fn status(&self) -> ReaderStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> ReaderState {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Moves to `state`. `since` only changes on an actual transition.
    pub fn set_state(&self, state: ReaderState, now: Instant) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.state != state {
            status.state = state;
            status.since = now;
        }
    }

    pub fn set_error(&self, error: Option<String>) {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).last_error = error;
    }

    pub fn set_active_source(&self, source: SourceDescriptor) {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active_source = source;
    }
}
