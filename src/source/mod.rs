//! Source Opener.
//!
//! A [`SourceDescriptor`] names where frames come from. A [`SourceOpener`] turns
//! it into a [`Capture`], the exclusively-owned connection handle that the
//! reader loop pulls decoded frames from.

pub mod backend;
#[cfg(feature = "gstreamer")]
pub mod pipeline;
pub mod synthetic;

use image::RgbImage;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OpenError, ReadError};

pub use backend::{BackendOpener, BackendPolicy, CameraBackend, CameraSelector, PolicyOpener};
#[cfg(feature = "gstreamer")]
pub use pipeline::GstreamerOpener;
pub use synthetic::{Pattern, SyntheticOpener};

/// Where frames come from. Fixed for the life of a running reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    Rtsp(String),
    File(PathBuf),
    CameraIndex(u32),
    /// Probe camera indices in order and take the first one that delivers frames.
    Auto,
    NamedCamera(String),
}

impl SourceDescriptor {
    /// Parses the textual form used in configuration.
    ///
    /// `auto` and `camera:auto` select probing, digits select a camera index,
    /// `video=<name>` and `camera:<name>` select a named camera, `rtsp://` and
    /// `rtsps://` URLs are streamed, and anything without a scheme (or with
    /// `file://`) is a local file.
    pub fn parse(raw: &str) -> Result<Self, OpenError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(OpenError::InvalidDescriptor(raw.to_string()));
        }
        if value.eq_ignore_ascii_case("auto") || value.eq_ignore_ascii_case("camera:auto") {
            return Ok(Self::Auto);
        }
        if value.bytes().all(|b| b.is_ascii_digit()) {
            return value
                .parse()
                .map(Self::CameraIndex)
                .map_err(|_| OpenError::InvalidDescriptor(raw.to_string()));
        }
        if let Some(name) = value
            .strip_prefix("video=")
            .or_else(|| value.strip_prefix("camera:"))
        {
            return match name.trim() {
                "" => Err(OpenError::InvalidDescriptor(raw.to_string())),
                name => Ok(Self::NamedCamera(name.to_string())),
            };
        }
        if let Some(path) = value.strip_prefix("file://") {
            return Ok(Self::File(PathBuf::from(path)));
        }
        match value.split_once("://") {
            Some((scheme, rest))
                if scheme.eq_ignore_ascii_case("rtsp") || scheme.eq_ignore_ascii_case("rtsps") =>
            {
                let host = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
                if host.is_empty() || host.starts_with('/') {
                    return Err(OpenError::InvalidDescriptor(raw.to_string()));
                }
                Ok(Self::Rtsp(value.to_string()))
            }
            Some(_) => Err(OpenError::InvalidDescriptor(raw.to_string())),
            None => Ok(Self::File(PathBuf::from(value))),
        }
    }

    /// File sources restart from the beginning at end of stream instead of
    /// counting it as a failure.
    pub fn loops_at_end(&self) -> bool {
        matches!(self, Self::File(_))
    }

    pub fn is_camera(&self) -> bool {
        matches!(self, Self::CameraIndex(_) | Self::Auto | Self::NamedCamera(_))
    }
}

impl fmt::Display for SourceDescriptor {
    /// Renders the descriptor for logs, with any RTSP password masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rtsp(url) => f.write_str(&mask_credentials(url)),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::CameraIndex(index) => write!(f, "camera:{index}"),
            Self::Auto => f.write_str("camera:auto"),
            Self::NamedCamera(name) => write!(f, "camera:{name}"),
        }
    }
}

fn mask_credentials(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let (authority, path) = rest.split_at(authority_end);
    match authority.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
            format!("{scheme}://{user}:***@{host}{path}")
        }
        None => url.to_string(),
    }
}

/// An open, decodable video handle. Owned by exactly one reader loop.
pub trait Capture: Send {
    /// Decodes the next frame, waiting at most `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> Result<RgbImage, ReadError>;

    /// Releases the underlying OS resource. Safe to call more than once.
    fn close(&mut self);
}

pub trait SourceOpener: Send + Sync {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn Capture>, OpenError>;
}

/// Opener used when the crate is built without a decoding backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableOpener;

impl SourceOpener for UnavailableOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn Capture>, OpenError> {
        Err(OpenError::BackendUnavailable(format!(
            "{descriptor} needs the `gstreamer` feature"
        )))
    }
}

/// GStreamer behind the platform camera policy when built with the
/// `gstreamer` feature, otherwise [`UnavailableOpener`].
pub fn default_opener() -> std::sync::Arc<dyn SourceOpener> {
    #[cfg(feature = "gstreamer")]
    {
        std::sync::Arc::new(PolicyOpener::new(
            GstreamerOpener::default(),
            BackendPolicy::platform_default(),
        ))
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        std::sync::Arc::new(UnavailableOpener)
    }
}
