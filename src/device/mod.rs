//! The device capability every radio platform implements, and the static table of
//! platforms this build knows about.
//!
//! A [`Platform`] is cheap to build from persisted settings and performs no I/O until
//! [`Platform::open`]. The returned [`Device`] is the exclusive handle for one capture
//! session; [`Device::close`] consumes it so a handle can only be released once.

use thiserror::Error;
use tracing::warn;

use crate::buffers::Timestamp;
use crate::complex::ComplexFloat;
use crate::config::ConfigStore;
use crate::error::{CaptureError, ConfigurationError};

pub mod bb60;
pub mod file;
#[cfg(test)]
pub mod mock;
pub mod sim;
pub mod x310;

/// How gain staging is chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainPolicy {
    /// Let the hardware pick gain and attenuation
    Auto,
    /// Expected maximum input power in dBm
    RefLevel(f64),
    /// Fixed overall gain in dB
    Gain(f64),
}

/// Static capabilities of a platform, known without touching hardware
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    /// Widest instantaneous bandwidth with no decimation
    pub native_max_bandwidth_hz: f64,
    pub min_center_hz: f64,
    pub max_center_hz: f64,
    pub min_decimation: u32,
    pub max_decimation: u32,
    pub decimation_power_of_two: bool,
    pub default_gain: GainPolicy,
    pub default_samples_per_unit: usize,
    /// Streaming granularity handed to the driver, if the platform has one
    pub samples_per_packet: Option<usize>,
}

/// Validated parameters for one session. Never changed once the stream starts.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfiguration {
    pub center_hz: f64,
    pub bandwidth_hz: f64,
    pub decimation: u32,
    pub gain: GainPolicy,
    pub samples_per_unit: usize,
    pub samples_per_packet: Option<usize>,
}

/// A single setting the driver refused; the device keeps its previous value
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWarning {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("No {platform} devices found")]
    NotFound { platform: String },

    #[error("{count} {platform} devices found")]
    Ambiguous { platform: String, count: usize },

    #[error("{call} failed ({code}): {message}")]
    Driver {
        call: &'static str,
        code: i32,
        message: String,
    },

    #[error("Lost connection to the device: {0}")]
    LinkLost(String),

    #[error("{platform} support is not compiled in, rebuild with `--features {feature}`")]
    NotCompiled {
        platform: &'static str,
        feature: &'static str,
    },

    #[error("{0}")]
    Io(String),
}

/// Why a pull produced no usable samples
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PullError {
    /// The driver's bounded wait elapsed with nothing to deliver
    #[error("timed out waiting for samples")]
    Timeout,

    /// The driver reported dropped samples; the partial unit can't be trusted
    #[error("sample loss: {0}")]
    SampleLoss(String),

    /// Anything the stream can't recover from
    #[error(transparent)]
    Fatal(DeviceError),
}

/// Result of one successful pull
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pulled {
    /// Samples written to the front of the buffer, may be fewer than asked for
    pub samples: usize,
    /// Device clock at the first sample of this pull
    pub timestamp: Timestamp,
}

/// One radio platform, built from its persisted settings
pub trait Platform {
    fn name(&self) -> &str;

    fn limits(&self) -> DeviceLimits;

    /// Acquire exclusive ownership of exactly one physical unit
    fn open(&self) -> Result<Box<dyn Device>, DeviceError>;
}

/// An open device handle. Calls block for bounded, sub-second durations.
pub trait Device {
    /// Apply `config`. Rejected fields come back as warnings; `Err` is reserved for
    /// failures that leave the device unusable.
    fn configure(&mut self, config: &DeviceConfiguration)
        -> Result<Vec<FieldWarning>, DeviceError>;

    fn start_stream(&mut self) -> Result<(), DeviceError>;

    /// Fill the front of `buf` with up to `buf.len()` samples
    fn pull(&mut self, buf: &mut [ComplexFloat]) -> Result<Pulled, PullError>;

    fn stop_stream(&mut self) -> Result<(), DeviceError>;

    fn close(self: Box<Self>) -> Result<(), DeviceError>;
}

/// Record the outcome of one configuration call, downgrading a driver error to a warning
pub(crate) fn apply_field(
    warnings: &mut Vec<FieldWarning>,
    field: &'static str,
    result: Result<(), DeviceError>,
) -> Result<(), DeviceError> {
    match result {
        Ok(()) => Ok(()),
        Err(e @ DeviceError::LinkLost(_)) => Err(e),
        Err(e) => {
            let w = FieldWarning {
                field,
                message: e.to_string(),
            };
            warn!("{w}");
            warnings.push(w);
            Ok(())
        }
    }
}

pub type PlatformFactory = fn(&ConfigStore) -> Result<Box<dyn Platform>, CaptureError>;

pub struct PlatformEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub build: PlatformFactory,
}

/// Every platform this binary can drive
pub static PLATFORMS: &[PlatformEntry] = &[
    PlatformEntry {
        name: bb60::NAME,
        description: "Signal Hound BB60 spectrum analyzer",
        build: bb60::build,
    },
    PlatformEntry {
        name: x310::NAME,
        description: "Ettus USRP X310 software radio",
        build: x310::build,
    },
    PlatformEntry {
        name: sim::NAME,
        description: "Synthetic tone with a simulated hardware clock",
        build: sim::build,
    },
    PlatformEntry {
        name: file::NAME,
        description: "Replay of a raw interleaved f32 IQ recording",
        build: file::build,
    },
];

pub fn lookup(name: &str) -> Result<&'static PlatformEntry, ConfigurationError> {
    PLATFORMS
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| ConfigurationError::UnknownPlatform(name.to_owned()))
}

pub fn platform_names() -> impl Iterator<Item = &'static str> {
    PLATFORMS.iter().map(|p| p.name)
}

/// Build whichever platform `set-platform` selected
pub fn build_selected(store: &ConfigStore) -> Result<Box<dyn Platform>, CaptureError> {
    let entry = lookup(store.selected_platform()?)?;
    (entry.build)(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_are_unique() {
        let mut names: Vec<_> = platform_names().collect();
        let n = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(n, names.len());
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(matches!(
            lookup("hackrf"),
            Err(ConfigurationError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn test_build_selected_requires_platform() {
        let store = ConfigStore::in_memory();
        assert!(matches!(
            build_selected(&store),
            Err(CaptureError::Configuration(
                ConfigurationError::NoPlatformSelected
            ))
        ));
    }

    #[test]
    fn test_apply_field_downgrades_driver_errors() {
        let mut warnings = Vec::new();
        let driver = DeviceError::Driver {
            call: "bbConfigureRefLevel",
            code: -4,
            message: "parameter out of range".into(),
        };
        assert!(apply_field(&mut warnings, "Reference level", Err(driver)).is_ok());
        assert_eq!(1, warnings.len());
        assert_eq!("Reference level", warnings[0].field);

        let lost = DeviceError::LinkLost("usb".into());
        assert!(apply_field(&mut warnings, "Center frequency", Err(lost)).is_err());
        assert_eq!(1, warnings.len());
    }
}
