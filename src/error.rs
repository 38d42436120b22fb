//! Error taxonomy for the capture pipeline

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while setting up or running the pipeline.
///
/// Everything here is fatal for the run. Per-frame device hiccups are
/// reported through [`crate::capture::FetchError`] instead and never
/// surface as an `Error` unless the device declares them unrecoverable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no suitable capture device found")]
    DeviceNotFound,

    #[error("device {path}: {source}")]
    Device {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device does not support video capture: {0}")]
    NotACaptureDevice(String),

    #[error("unsupported native pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid frame dimensions {width}x{height}: both must be positive and even")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("source delivers {source_dims} frames but outputs were sized for {output_dims}")]
    DimensionMismatch {
        source_dims: String,
        output_dims: String,
    },

    #[error("shared region {path}: {source}")]
    SharedRegion {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stream control: {0}")]
    Stream(String),

    #[error("feature control: {0}")]
    Feature(String),

    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device failed while streaming: {0}")]
    DeviceFatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
