//! Single-slot latest-frame buffer.
//!
//! Not a queue: publishing overwrites. Readers get an `Arc` to an immutable
//! frame, so the critical section on either side is a pointer swap.

use crossbeam::sync::ShardedLock;
use image::RgbImage;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::frame::Frame;

#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: ShardedLock<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent frame, or `None` if nothing was published yet.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sequence number of the current frame, 0 when empty.
    pub fn sequence(&self) -> u64 {
        self.latest().map_or(0, |frame| frame.sequence)
    }

    /// Replaces the slot contents and returns the new sequence number.
    ///
    /// Sequence numbers start at 1 and are assigned under the write lock, so
    /// they grow by exactly one per publish for the life of the slot.
    pub(crate) fn publish(
        &self,
        image: RgbImage,
        captured_at: SystemTime,
        captured_instant: Instant,
    ) -> u64 {
        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        let sequence = latest.as_ref().map_or(0, |frame| frame.sequence) + 1;
        *latest = Some(Arc::new(Frame {
            sequence,
            captured_at,
            captured_instant,
            image,
        }));
        sequence
    }
}
