pub mod capture;
pub mod error;
pub mod pipeline;
pub mod status;
pub mod storage;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use error::{ConfigError, DeviceError, PipelineError, StorageError};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Deterministic in-process frame generator
    Simulated,
    /// V4L2 capture device
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Empty means auto-detect
    pub device_path: String,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// 0 runs the simulated device unthrottled
    pub fps: u32,
    pub buffer_count: u32,
    /// Upper bound on a single blocking frame request
    pub timeout_ms: u64,
    // Simulated device only
    pub drop_every: Option<u64>,
    pub swap_every: Option<u64>,
    pub frame_limit: Option<u64>,
}

/// What the source does when the sink falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Halt the run once queue depth reaches `pool_capacity - overrun_margin`
    Abort,
    /// Wait for the sink to release a slot; frames dropped meanwhile show up as loss
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pool_capacity: usize,
    pub slot_bytes: usize,
    pub overrun_margin: usize,
    pub overrun_policy: OverrunPolicy,
    pub poll_interval_ms: u64,
    pub settle_ms: u64,
    pub shutdown_grace_ms: u64,
    /// `[producer, consumer]` core ids
    pub pin_cores: Option<[usize; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Frames per ring file before the write cursor wraps to the start
    pub max_images: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Simulated,
            device_path: "/dev/video0".into(),
            format: PixelFormat::Mono8,
            width: 640,
            height: 480,
            fps: 60,
            buffer_count: 4,
            timeout_ms: 2000,
            drop_every: None,
            swap_every: None,
            frame_limit: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 16,
            slot_bytes: 25 * 1024 * 1024,
            overrun_margin: 3,
            overrun_policy: OverrunPolicy::Abort,
            poll_interval_ms: 50,
            settle_ms: 500,
            shutdown_grace_ms: 1000,
            pin_cores: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./imageData.bin"),
            max_images: 32,
        }
    }
}

impl Config {
    /// Layer an optional TOML file and `SHUTTER_*` environment variables over the defaults.
    ///
    /// Without an explicit path, `./shutter.toml` is read when present.
    /// Nested keys use a double underscore: `SHUTTER_PIPELINE__POOL_CAPACITY=32`.
    /// The result is not validated; apply any overrides, then call [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("shutter").required(false)),
        };
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("SHUTTER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.pool_capacity < 4 || !p.pool_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "pool_capacity must be a power of two of at least 4, got {}",
                p.pool_capacity
            )));
        }
        if p.overrun_margin == 0 || p.overrun_margin >= p.pool_capacity {
            return Err(ConfigError::Invalid(format!(
                "overrun_margin must be in 1..{}, got {}",
                p.pool_capacity, p.overrun_margin
            )));
        }
        if p.slot_bytes == 0 {
            return Err(ConfigError::Invalid("slot_bytes must be non-zero".into()));
        }
        if p.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be non-zero".into()));
        }
        if self.storage.max_images == 0 {
            return Err(ConfigError::Invalid("max_images must be at least 1".into()));
        }

        let c = &self.capture;
        let frame_bytes = c.width as usize * c.height as usize * c.format.bytes_per_pixel();
        if frame_bytes == 0 {
            return Err(ConfigError::Invalid("frame dimensions must be non-zero".into()));
        }
        if frame_bytes > p.slot_bytes {
            return Err(ConfigError::Invalid(format!(
                "{}x{} frames need {frame_bytes} bytes but slots hold {}",
                c.width, c.height, p.slot_bytes
            )));
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
