use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{OpenError, ReaderError};
use crate::source::backend::DEFAULT_PROBE_LIMIT;
use crate::source::{SourceDescriptor, SourceOpener};

/// Settings file read when no path is given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
/// Environment overrides look like `APP_SOURCE` or `APP_READER__TARGET_FPS`.
pub const ENV_PREFIX: &str = "APP";

const DEFAULT_SOURCE: &str = "rtsp://wowzaec2demo.streamlock.net/vod/mp4:BigBuckBunny_115k.mov";

/// Validated parameters of a frame reader.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Upper bound on the average publish rate.
    pub target_fps: f64,
    pub output_width: u32,
    pub output_height: u32,
    /// Delays before successive reopen attempts. The last entry repeats.
    pub reconnect_backoff: Vec<Duration>,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Longest a single decode may block.
    pub read_timeout: Duration,
    /// How long `Connecting`/`Reconnecting` still count as healthy.
    pub health_grace: Duration,
    /// Local file switched to after `fallback_after` failed reopen attempts.
    pub fallback: Option<SourceDescriptor>,
    pub fallback_after: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            target_fps: 2.0,
            output_width: 640,
            output_height: 360,
            reconnect_backoff: [500, 1_000, 2_000, 4_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            max_reconnect_attempts: None,
            read_timeout: Duration::from_secs(2),
            health_grace: Duration::from_secs(3),
            fallback: None,
            fallback_after: 3,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<(), ReaderError> {
        let invalid = |msg: &str| Err(ReaderError::InvalidConfig(msg.to_string()));

        if !self.target_fps.is_finite() || self.target_fps <= 0.0 {
            return invalid("target_fps must be a positive number");
        }
        if Duration::try_from_secs_f64(1.0 / self.target_fps).is_err() {
            return invalid("target_fps is too small to form a frame interval");
        }
        if self.output_width == 0 || self.output_height == 0 {
            return invalid("output width and height must be positive");
        }
        if self.reconnect_backoff.is_empty() {
            return invalid("reconnect_backoff needs at least one delay");
        }
        if self.reconnect_backoff.contains(&Duration::ZERO) {
            return invalid("reconnect_backoff delays must be non-zero");
        }
        if self.reconnect_backoff.windows(2).any(|pair| pair[1] < pair[0]) {
            return invalid("reconnect_backoff must be non-decreasing");
        }
        if self.read_timeout.is_zero() {
            return invalid("read_timeout must be positive");
        }
        if let Some(fallback) = &self.fallback {
            if !fallback.loops_at_end() {
                return invalid("fallback source must be a local file");
            }
            if self.fallback_after == 0 {
                return invalid("fallback_after must be at least 1");
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ReaderSettings {
    pub target_fps: f64,
    pub width: u32,
    pub height: u32,
    pub reconnect_backoff_ms: Vec<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub read_timeout_ms: u64,
    pub open_timeout_ms: u64,
    /// `rtspsrc` jitter buffer. 0 favours freshness.
    pub rtsp_latency_ms: u32,
    pub health_grace_ms: u64,
    pub fallback_after: u32,
    pub auto_probe_limit: u32,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        let reader = ReaderConfig::default();
        Self {
            target_fps: reader.target_fps,
            width: reader.output_width,
            height: reader.output_height,
            reconnect_backoff_ms: reader
                .reconnect_backoff
                .iter()
                .map(|delay| delay.as_millis() as u64)
                .collect(),
            max_reconnect_attempts: reader.max_reconnect_attempts,
            read_timeout_ms: reader.read_timeout.as_millis() as u64,
            open_timeout_ms: 5_000,
            rtsp_latency_ms: 0,
            health_grace_ms: reader.health_grace.as_millis() as u64,
            fallback_after: reader.fallback_after,
            auto_probe_limit: DEFAULT_PROBE_LIMIT,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ConsumerSettings {
    pub poll_interval_ms: u64,
    /// 0 streams until interrupted.
    pub max_frames: u64,
    pub class_topk: usize,
    pub metrics_log_every: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_frames: 0,
            class_topk: 5,
            metrics_log_every: 50,
        }
    }
}

impl ConsumerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    pub source: String,
    /// Camera tried first when `source` is `auto`.
    pub camera_name: Option<String>,
    pub fallback_path: Option<PathBuf>,
    pub reader: ReaderSettings,
    pub consumer: ConsumerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            camera_name: None,
            fallback_path: None,
            reader: ReaderSettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

impl Settings {
    pub fn descriptor(&self) -> Result<SourceDescriptor, OpenError> {
        SourceDescriptor::parse(&self.source)
    }

    /// Builds and validates the reader parameters.
    pub fn reader_config(&self) -> Result<ReaderConfig, ReaderError> {
        let reader = &self.reader;
        let config = ReaderConfig {
            target_fps: reader.target_fps,
            output_width: reader.width,
            output_height: reader.height,
            reconnect_backoff: reader
                .reconnect_backoff_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            max_reconnect_attempts: reader.max_reconnect_attempts,
            read_timeout: Duration::from_millis(reader.read_timeout_ms),
            health_grace: Duration::from_millis(reader.health_grace_ms),
            fallback: self.fallback_path.clone().map(SourceDescriptor::File),
            fallback_after: reader.fallback_after,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.reader.open_timeout_ms)
    }

    /// The opener for this build: GStreamer behind the platform camera policy,
    /// or an opener that always reports the missing backend.
    #[cfg(feature = "gstreamer")]
    pub fn opener(&self) -> Arc<dyn SourceOpener> {
        use crate::source::{BackendPolicy, GstreamerOpener, PolicyOpener};

        Arc::new(
            PolicyOpener::new(
                GstreamerOpener::new(self.open_timeout())
                    .with_rtsp_latency(self.reader.rtsp_latency_ms),
                BackendPolicy::platform_default(),
            )
            .with_probe_limit(self.reader.auto_probe_limit)
            .with_preferred_camera(self.camera_name.clone()),
        )
    }

    #[cfg(not(feature = "gstreamer"))]
    pub fn opener(&self) -> Arc<dyn SourceOpener> {
        Arc::new(crate::source::UnavailableOpener)
    }
}

/// Parses settings from an optional YAML file layered under `APP_*` environment
/// variables. An explicit path must exist; the default path is optional.
pub fn parse_configuration(file_path: Option<&str>) -> Result<Settings, ConfigError> {
    let file = match file_path {
        Some(path) => config::File::with_name(path),
        None => config::File::with_name(DEFAULT_CONFIG_PATH).required(false),
    };
    load(Config::builder().add_source(file).add_source(environment()))
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn load(builder: ConfigBuilder<DefaultState>) -> Result<Settings, ConfigError> {
    builder.build()?.try_deserialize::<Settings>()
}
