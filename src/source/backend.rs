//! Camera backend selection.
//!
//! Camera backends are tried in a fixed, per-platform priority order. Some
//! backends open a device without ever delivering a frame, so the order is a
//! contract and lives in one explicit list rather than in branching.

use log::{info, warn};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

use super::{Capture, SourceDescriptor, SourceOpener};
use crate::error::OpenError;

/// Number of camera indices probed for `auto` when not configured otherwise.
pub const DEFAULT_PROBE_LIMIT: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum CameraBackend {
    V4l2,
    AvFoundation,
    MediaFoundation,
    DirectShow,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CameraSelector {
    Index(u32),
    Name(String),
}

impl fmt::Display for CameraSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSelector::Index(index) => write!(f, "index {index}"),
            CameraSelector::Name(name) => write!(f, "name {name:?}"),
        }
    }
}

/// Ordered list of camera backends, consulted front to back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendPolicy {
    order: Vec<CameraBackend>,
}

impl BackendPolicy {
    pub fn new(order: Vec<CameraBackend>) -> Self {
        Self { order }
    }

    /// Media Foundation then DirectShow on Windows, AVFoundation on macOS,
    /// V4L2 elsewhere.
    pub fn platform_default() -> Self {
        let order = if cfg!(target_os = "windows") {
            vec![CameraBackend::MediaFoundation, CameraBackend::DirectShow]
        } else if cfg!(target_os = "macos") {
            vec![CameraBackend::AvFoundation]
        } else {
            vec![CameraBackend::V4l2]
        };
        Self { order }
    }

    pub fn backends(&self) -> &[CameraBackend] {
        &self.order
    }
}

impl Default for BackendPolicy {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Backend-specific opening primitives. [`PolicyOpener`] decides which to call
/// and in what order.
pub trait BackendOpener: Send + Sync {
    /// Opens an RTSP URL or a file.
    fn open_stream(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn Capture>, OpenError>;

    /// Opens one camera through one backend. Success means a frame was delivered.
    fn open_camera(
        &self,
        selector: &CameraSelector,
        backend: CameraBackend,
    ) -> Result<Box<dyn Capture>, OpenError>;
}

/// A [`SourceOpener`] that applies a [`BackendPolicy`] and `auto` probing on top
/// of a [`BackendOpener`].
pub struct PolicyOpener<B> {
    backend: B,
    policy: BackendPolicy,
    probe_limit: u32,
    preferred_camera: Option<String>,
}

impl<B: BackendOpener> PolicyOpener<B> {
    pub fn new(backend: B, policy: BackendPolicy) -> Self {
        Self {
            backend,
            policy,
            probe_limit: DEFAULT_PROBE_LIMIT,
            preferred_camera: None,
        }
    }

    pub fn with_probe_limit(mut self, probe_limit: u32) -> Self {
        self.probe_limit = probe_limit;
        self
    }

    /// Camera name tried before index probing when the source is `auto`.
    pub fn with_preferred_camera(mut self, name: Option<String>) -> Self {
        self.preferred_camera = name.filter(|name| !name.trim().is_empty());
        self
    }

    pub fn policy(&self) -> &BackendPolicy {
        &self.policy
    }

    fn open_camera(&self, selector: &CameraSelector) -> Result<Box<dyn Capture>, OpenError> {
        let mut last_error = None;
        for &backend in self.policy.backends() {
            info!("camera_open {selector} backend={backend}");
            match self.backend.open_camera(selector, backend) {
                Ok(capture) => return Ok(capture),
                Err(e) => {
                    warn!("camera_open_failed {selector} backend={backend}: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            OpenError::BackendUnavailable("camera backend policy is empty".to_string())
        }))
    }

    fn probe_auto(&self) -> Result<Box<dyn Capture>, OpenError> {
        info!(
            "camera_auto_start backends={:?} max_index={}",
            self.policy.backends(),
            self.probe_limit
        );
        if let Some(name) = &self.preferred_camera {
            match self.open_camera(&CameraSelector::Name(name.clone())) {
                Ok(capture) => {
                    info!("camera_found name={name:?}");
                    return Ok(capture);
                }
                Err(_) => warn!("camera_preferred_failed name={name:?}"),
            }
        }
        for index in 0..self.probe_limit {
            if let Ok(capture) = self.open_camera(&CameraSelector::Index(index)) {
                info!("camera_found index={index}");
                return Ok(capture);
            }
        }
        warn!("camera_auto_failed max_index={}", self.probe_limit);
        Err(OpenError::NoCameraFound {
            probed: self.probe_limit,
        })
    }
}

impl<B: BackendOpener> SourceOpener for PolicyOpener<B> {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn Capture>, OpenError> {
        match descriptor {
            SourceDescriptor::Rtsp(_) | SourceDescriptor::File(_) => {
                self.backend.open_stream(descriptor)
            }
            SourceDescriptor::CameraIndex(index) => self.open_camera(&CameraSelector::Index(*index)),
            SourceDescriptor::NamedCamera(name) => {
                self.open_camera(&CameraSelector::Name(name.clone()))
            }
            SourceDescriptor::Auto => self.probe_auto(),
        }
    }
}
