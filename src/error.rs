use std::time::Duration;
use thiserror::Error;

/// Errors raised while turning a source descriptor into an open capture.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid source descriptor `{0}`")]
    InvalidDescriptor(String),
    #[error("no camera delivered frames (probed indices 0..{probed})")]
    NoCameraFound { probed: u32 },
    #[error("capture backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend {backend} cannot open camera {selector}")]
    UnsupportedSelector { backend: String, selector: String },
    #[error("cannot open {location}: {reason}")]
    Unreachable { location: String, reason: String },
    #[error("{location} opened but delivered no frame within {timeout:?}")]
    NoFrames { location: String, timeout: Duration },
}

/// Mid-stream failures. These never reach consumers; the reader recovers from them.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("end of stream")]
    EndOfStream,
    #[error("decode failure: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("invalid reader configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("failed to spawn reader thread: {0}")]
    Spawn(#[from] std::io::Error),
}
