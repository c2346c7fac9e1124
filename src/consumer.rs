//! Pull-based frame streams over a reader's latest-frame slot.
//!
//! Both streams poll the slot and yield a frame only when its sequence number
//! is newer than the last one yielded, so a slow consumer skips frames instead
//! of queueing them. Consecutive yields are at least one poll interval apart,
//! whatever rate the reader publishes at. A stream ends once the reader is
//! stopped or failed and no newer frame is left.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::state::Shared;

struct Cursor {
    shared: Arc<Shared>,
    poll_interval: Duration,
    last_sequence: u64,
    last_yield: Option<Instant>,
}

enum Poll {
    Ready(Arc<Frame>),
    Pending,
    Finished,
}

impl Cursor {
    fn new(shared: Arc<Shared>, poll_interval: Duration) -> Self {
        Self {
            shared,
            poll_interval,
            last_sequence: 0,
            last_yield: None,
        }
    }

    /// Time left before the next frame may be yielded.
    fn cooldown(&self) -> Duration {
        self.last_yield.map_or(Duration::ZERO, |at| {
            (at + self.poll_interval).saturating_duration_since(Instant::now())
        })
    }

    fn poll(&mut self) -> Poll {
        // State first: a frame published just before the reader stopped is
        // still seen by the slot check below.
        let finished = self.shared.state().is_terminal();
        match self.shared.slot.latest() {
            Some(frame) if frame.sequence > self.last_sequence => {
                self.last_sequence = frame.sequence;
                self.last_yield = Some(Instant::now());
                Poll::Ready(frame)
            }
            _ if finished => Poll::Finished,
            _ => Poll::Pending,
        }
    }
}

/// Blocking stream of fresh frames.
pub struct FrameStream {
    cursor: Cursor,
}

impl FrameStream {
    pub(crate) fn new(shared: Arc<Shared>, poll_interval: Duration) -> Self {
        Self {
            cursor: Cursor::new(shared, poll_interval),
        }
    }
}

impl Iterator for FrameStream {
    type Item = Arc<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let cooldown = self.cursor.cooldown();
        if !cooldown.is_zero() {
            thread::sleep(cooldown);
        }
        loop {
            match self.cursor.poll() {
                Poll::Ready(frame) => return Some(frame),
                Poll::Finished => return None,
                Poll::Pending => thread::sleep(self.cursor.poll_interval),
            }
        }
    }
}

/// Same as [`FrameStream`], but waits with `tokio::time::sleep` so it can be
/// polled from an async task.
pub struct AsyncFrameStream {
    cursor: Cursor,
}

impl AsyncFrameStream {
    pub(crate) fn new(shared: Arc<Shared>, poll_interval: Duration) -> Self {
        Self {
            cursor: Cursor::new(shared, poll_interval),
        }
    }

    /// Next fresh frame, or `None` once the reader has stopped for good.
    pub async fn next(&mut self) -> Option<Arc<Frame>> {
        let cooldown = self.cursor.cooldown();
        if !cooldown.is_zero() {
            tokio::time::sleep(cooldown).await;
        }
        loop {
            match self.cursor.poll() {
                Poll::Ready(frame) => return Some(frame),
                Poll::Finished => return None,
                Poll::Pending => tokio::time::sleep(self.cursor.poll_interval).await,
            }
        }
    }
}
