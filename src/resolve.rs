//! Turns a capture request plus persisted platform settings into a validated
//! [`DeviceConfiguration`].
//!
//! Everything here runs before a device is opened, so a bad request never touches hardware.

use tracing::warn;

use crate::config::Section;
use crate::device::{DeviceConfiguration, DeviceLimits, GainPolicy};
use crate::error::ConfigurationError;

/// Settings keys understood by every platform
pub mod keys {
    pub const DECIMATION: &str = "decimation";
    pub const REF_LEVEL: &str = "ref-level";
    pub const GAIN: &str = "gain";
    pub const SAMPLES_PER_UNIT: &str = "spc";
}

/// Non-fatal adjustments made while resolving
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolveWarning {
    BandwidthClamped { requested_hz: f64, effective_hz: f64 },
}

impl std::fmt::Display for ResolveWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveWarning::BandwidthClamped {
                requested_hz,
                effective_hz,
            } => write!(
                f,
                "Unable to set the bandwidth to {} MHz. Setting to {} MHz",
                requested_hz / 1e6,
                effective_hz / 1e6
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub config: DeviceConfiguration,
    pub warnings: Vec<ResolveWarning>,
}

/// Resolve a request against a platform's limits and its settings section
pub fn resolve(
    center_hz: f64,
    bandwidth_hz: f64,
    settings: &Section,
    limits: &DeviceLimits,
) -> Result<Resolved, ConfigurationError> {
    if !(bandwidth_hz > 0.0) {
        return Err(ConfigurationError::NonPositiveBandwidth(bandwidth_hz));
    }
    if !(limits.min_center_hz..=limits.max_center_hz).contains(&center_hz) {
        return Err(ConfigurationError::FrequencyOutOfRange {
            center_hz,
            min_hz: limits.min_center_hz,
            max_hz: limits.max_center_hz,
        });
    }

    let decimation = settings.get_or(keys::DECIMATION, limits.min_decimation)?;
    check_decimation(decimation, limits)?;

    let gain = match (
        settings.get_parsed::<f64>(keys::REF_LEVEL)?,
        settings.get_parsed::<f64>(keys::GAIN)?,
    ) {
        (Some(dbm), _) => GainPolicy::RefLevel(dbm),
        (None, Some(db)) => GainPolicy::Gain(db),
        (None, None) => limits.default_gain,
    };

    let samples_per_unit =
        settings.get_or(keys::SAMPLES_PER_UNIT, limits.default_samples_per_unit)?;
    if samples_per_unit == 0 {
        return Err(ConfigurationError::InvalidSetting {
            section: settings.name().to_owned(),
            key: keys::SAMPLES_PER_UNIT.to_owned(),
            value: "0".to_owned(),
            reason: "must be a non-zero positive integer".to_owned(),
        });
    }

    let mut warnings = Vec::new();
    let effective_max = limits.native_max_bandwidth_hz / decimation as f64;
    let bandwidth_hz = if bandwidth_hz > effective_max {
        let w = ResolveWarning::BandwidthClamped {
            requested_hz: bandwidth_hz,
            effective_hz: effective_max,
        };
        warn!("{w}");
        warnings.push(w);
        effective_max
    } else {
        bandwidth_hz
    };

    Ok(Resolved {
        config: DeviceConfiguration {
            center_hz,
            bandwidth_hz,
            decimation,
            gain,
            samples_per_unit,
            samples_per_packet: limits.samples_per_packet,
        },
        warnings,
    })
}

fn check_decimation(decimation: u32, limits: &DeviceLimits) -> Result<(), ConfigurationError> {
    if !(limits.min_decimation..=limits.max_decimation).contains(&decimation) {
        return Err(ConfigurationError::DecimationOutOfRange {
            decimation,
            min: limits.min_decimation,
            max: limits.max_decimation,
        });
    }
    if limits.decimation_power_of_two && !decimation.is_power_of_two() {
        return Err(ConfigurationError::DecimationNotPowerOfTwo(decimation));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            native_max_bandwidth_hz: 20e6,
            min_center_hz: 9e3,
            max_center_hz: 6.4e9,
            min_decimation: 1,
            max_decimation: 8192,
            decimation_power_of_two: true,
            default_gain: GainPolicy::Auto,
            default_samples_per_unit: 262_144,
            samples_per_packet: None,
        }
    }

    fn section() -> Section {
        Section::new("bb60-configs")
    }

    #[test]
    fn test_bandwidth_clamped_with_one_warning() {
        let resolved = resolve(2.45e9, 25e6, &section().with("decimation", 1), &limits()).unwrap();
        assert_eq!(20e6, resolved.config.bandwidth_hz);
        assert_eq!(
            vec![ResolveWarning::BandwidthClamped {
                requested_hz: 25e6,
                effective_hz: 20e6
            }],
            resolved.warnings
        );
    }

    #[test]
    fn test_clamp_is_idempotent() {
        let s = section().with("decimation", 4);
        let first = resolve(1e9, 25e6, &s, &limits()).unwrap();
        assert_eq!(5e6, first.config.bandwidth_hz);
        let second = resolve(1e9, first.config.bandwidth_hz, &s, &limits()).unwrap();
        assert_eq!(first.config, second.config);
        assert!(second.warnings.is_empty());
    }

    #[test]
    fn test_defaults() {
        let resolved = resolve(1e9, 1e6, &section(), &limits()).unwrap();
        assert_eq!(1, resolved.config.decimation);
        assert_eq!(GainPolicy::Auto, resolved.config.gain);
        assert_eq!(262_144, resolved.config.samples_per_unit);
        assert!(resolved.warnings.is_empty());
    }

    #[test]
    fn test_ref_level_wins_over_gain() {
        let s = section().with("ref-level", -30).with("gain", 10);
        let resolved = resolve(1e9, 1e6, &s, &limits()).unwrap();
        assert_eq!(GainPolicy::RefLevel(-30.0), resolved.config.gain);
        let s = section().with("gain", 10);
        let resolved = resolve(1e9, 1e6, &s, &limits()).unwrap();
        assert_eq!(GainPolicy::Gain(10.0), resolved.config.gain);
    }

    #[test]
    fn test_decimation_errors() {
        let err = resolve(1e9, 1e6, &section().with("decimation", 0), &limits()).unwrap_err();
        assert!(matches!(err, ConfigurationError::DecimationOutOfRange { decimation: 0, .. }));
        let err = resolve(1e9, 1e6, &section().with("decimation", 16384), &limits()).unwrap_err();
        assert!(matches!(err, ConfigurationError::DecimationOutOfRange { .. }));
        let err = resolve(1e9, 1e6, &section().with("decimation", 3), &limits()).unwrap_err();
        assert_eq!(ConfigurationError::DecimationNotPowerOfTwo(3), err);
    }

    #[test]
    fn test_center_out_of_range() {
        let err = resolve(7e9, 1e6, &section(), &limits()).unwrap_err();
        assert!(matches!(err, ConfigurationError::FrequencyOutOfRange { .. }));
    }

    #[test]
    fn test_zero_samples_per_unit_rejected() {
        let err = resolve(1e9, 1e6, &section().with("spc", 0), &limits()).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidSetting { .. }));
    }

    #[test]
    fn test_non_positive_bandwidth_rejected() {
        assert_eq!(
            Err(ConfigurationError::NonPositiveBandwidth(0.0)),
            resolve(1e9, 0.0, &section(), &limits())
        );
    }
}
