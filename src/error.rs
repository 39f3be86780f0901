//! Error taxonomy for the acquisition pipeline

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by a [`Device`](crate::capture::Device)
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("stream not started")]
    NotStreaming,

    #[error("stream stopped")]
    Stopped,

    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("frame of {needed} bytes does not fit a {capacity} byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("device failure: {0}")]
    Failure(String),

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// A transient error costs one acquisition attempt and nothing more.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Failure(_) | Self::Io(_))
    }
}

/// Failures of the persistence side (ring file writer and reader)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("{len} byte file is not a whole number of {frame_size} byte frames")]
    Misaligned { len: usize, frame_size: usize },

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything that can end a pipeline run other than the operator
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("the sink cannot keep up with the source (queue depth {depth} of {capacity})")]
    Overrun { depth: usize, capacity: usize },

    #[error("frame of {size} bytes exceeds slot capacity of {capacity} bytes")]
    FrameTooLarge { size: usize, capacity: usize },

    #[error("{0} worker exited unexpectedly")]
    WorkerPanicked(&'static str),

    #[error("failed to spawn {name} worker: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    /// Process exit code for a run that ended with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Overrun { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
