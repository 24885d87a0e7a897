//! Error types shared across the capture pipeline

use std::path::PathBuf;

use thiserror::Error;

use crate::device::{DeviceError, PullError};

/// A request or persisted setting that can't be turned into a device configuration.
/// Always raised before any device I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("No platform selected, run `set-platform` first")]
    NoPlatformSelected,

    #[error("Unknown platform `{0}`")]
    UnknownPlatform(String),

    #[error("Invalid value `{value}` for `{key}` in [{section}]: {reason}")]
    InvalidSetting {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("Decimation {decimation} is outside the supported range {min}..={max}")]
    DecimationOutOfRange { decimation: u32, min: u32, max: u32 },

    #[error("Decimation {0} must be a power of two")]
    DecimationNotPowerOfTwo(u32),

    #[error("Center frequency {center_hz} Hz is outside the tunable range {min_hz}..={max_hz} Hz")]
    FrequencyOutOfRange {
        center_hz: f64,
        min_hz: f64,
        max_hz: f64,
    },

    #[error("Bandwidth must be positive, got {0} Hz")]
    NonPositiveBandwidth(f64),
}

/// Failures reading or writing the persisted settings file
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not determine the home directory")]
    NoHomeDir,
}

/// Raised by a quantization hook; the device is still released
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Quantization failed: {0}")]
pub struct QuantizeError(pub String);

/// Every way a capture session can end up `Faulted`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("{platform} unavailable: {reason}")]
    DeviceUnavailable { platform: String, reason: String },

    #[error("{count} {platform} devices found, select one in the platform settings or connect only one")]
    AmbiguousDevice { platform: String, count: usize },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("{0}")]
    Device(DeviceError),

    #[error("Stream fault on unit {unit}: {source}")]
    StreamFault { unit: usize, source: PullError },

    #[error(transparent)]
    Quantization(#[from] QuantizeError),
}

impl From<DeviceError> for CaptureError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::NotFound { platform } => CaptureError::DeviceUnavailable {
                platform,
                reason: "no devices found".to_owned(),
            },
            e @ DeviceError::NotCompiled { platform, .. } => CaptureError::DeviceUnavailable {
                platform: platform.to_owned(),
                reason: e.to_string(),
            },
            DeviceError::Ambiguous { platform, count } => {
                CaptureError::AmbiguousDevice { platform, count }
            }
            other => CaptureError::Device(other),
        }
    }
}
