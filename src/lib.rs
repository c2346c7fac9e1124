//! Latest-frame sampling for video sources.
//!
//! A [`FrameReader`] decodes an RTSP stream, a video file or a local camera on a
//! background thread, samples it down to a target rate and keeps only the most
//! recent frame. Consumers read that frame without ever waiting on the decoder.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod error;
pub mod frame;
pub mod predict;
pub mod sampling;
pub mod slot;
pub mod source;
pub mod state;
pub mod streams;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReaderConfig, Settings, parse_configuration};
pub use consumer::{AsyncFrameStream, FrameStream};
pub use error::{OpenError, ReadError, ReaderError};
pub use frame::Frame;
pub use source::{Capture, SourceDescriptor, SourceOpener};
pub use state::{ReaderState, ReaderStats, ReaderStatus};
pub use streams::{FrameReader, FrameSource};
