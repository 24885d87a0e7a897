//! Timestamped IQ capture from software radios and spectrum analyzers
//!
//! A [`device::Platform`] is built from the persisted [`config::ConfigStore`], handed to a
//! [`capture::CaptureEngine`], and each call to [`capture::CaptureEngine::run_capture`]
//! produces one [`capture::CaptureSession`] holding preallocated, timestamped units.

pub mod args;
pub mod buffers;
pub mod capture;
pub mod complex;
pub mod config;
pub mod device;
pub mod error;
pub mod monitoring;
pub mod quantize;
pub mod resolve;

pub use buffers::{CaptureUnit, Timestamp};
pub use capture::{CancelToken, CaptureEngine, CaptureSession, SessionState, SessionWarning};
pub use complex::ComplexFloat;
pub use config::{ConfigStore, Section};
pub use device::{Device, DeviceConfiguration, DeviceLimits, GainPolicy, Platform};
pub use error::{CaptureError, ConfigurationError};
