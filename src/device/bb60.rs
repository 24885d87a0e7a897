//! Signal Hound BB60 spectrum analyzers, driven through the vendor's `bb_api` C library.
//!
//! The driver bindings are only compiled with the `bb60` feature. Without it the platform
//! still resolves its limits but reports itself unavailable when built.

use std::str::FromStr;

use super::{DeviceError, DeviceLimits, GainPolicy, Platform};
use crate::config::{platform_section, ConfigStore};
use crate::error::CaptureError;

pub const NAME: &str = "bb60";

pub const SAMPLES_PER_UNIT: usize = 262_144;
pub const MIN_FREQ_HZ: f64 = 9.0e3;
pub const MAX_FREQ_HZ: f64 = 6.4e9;
pub const BB60A_MAX_RT_SPAN_HZ: f64 = 20.0e6;
pub const BB60C_MAX_RT_SPAN_HZ: f64 = 27.0e6;
pub const MIN_DECIMATION: u32 = 1;
pub const MAX_DECIMATION: u32 = 8192;
pub const DEFAULT_REF_LEVEL_DBM: f64 = -20.0;

/// Hardware revisions, which differ in real-time span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Bb60a,
    Bb60c,
    Bb60d,
}

impl Model {
    pub fn as_str(self) -> &'static str {
        match self {
            Model::Bb60a => "bb60a",
            Model::Bb60c => "bb60c",
            Model::Bb60d => "bb60d",
        }
    }

    pub fn max_span_hz(self) -> f64 {
        match self {
            Model::Bb60a => BB60A_MAX_RT_SPAN_HZ,
            Model::Bb60c | Model::Bb60d => BB60C_MAX_RT_SPAN_HZ,
        }
    }

    /// Map the driver's `BB_DEVICE_*` constant
    pub fn from_device_type(t: i32) -> Option<Self> {
        match t {
            1 => Some(Model::Bb60a),
            2 => Some(Model::Bb60c),
            3 => Some(Model::Bb60d),
            _ => None,
        }
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bb60a" => Ok(Model::Bb60a),
            "bb60c" => Ok(Model::Bb60c),
            "bb60d" => Ok(Model::Bb60d),
            _ => Err("must be one of `bb60a`, `bb60c`, `bb60d`".to_owned()),
        }
    }
}

pub fn limits(model: Model) -> DeviceLimits {
    DeviceLimits {
        native_max_bandwidth_hz: model.max_span_hz(),
        min_center_hz: MIN_FREQ_HZ,
        max_center_hz: MAX_FREQ_HZ,
        min_decimation: MIN_DECIMATION,
        max_decimation: MAX_DECIMATION,
        decimation_power_of_two: true,
        default_gain: GainPolicy::RefLevel(DEFAULT_REF_LEVEL_DBM),
        default_samples_per_unit: SAMPLES_PER_UNIT,
        samples_per_packet: None,
    }
}

/// What a `bbStatus` means for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    Warning,
    Error,
    /// The USB link is gone
    Disconnected,
    Timeout,
}

pub fn classify(status: i32) -> StatusClass {
    match status {
        0 => StatusClass::Ok,
        s if s > 0 => StatusClass::Warning,
        // bbDeviceConnectionErr, bbLibusbError
        -14 | -18 => StatusClass::Disconnected,
        // bbUSBTimeoutErr
        -15 => StatusClass::Timeout,
        _ => StatusClass::Error,
    }
}

/// `bbDataBreak`, a discontinuity in the IQ stream
pub const STATUS_DATA_BREAK: i32 = 7;

pub fn build(store: &ConfigStore) -> Result<Box<dyn Platform>, CaptureError> {
    let section = store.section(&platform_section(NAME));
    let model = section.get_or("model", Model::Bb60c)?;
    let serial: Option<i32> = section.get_parsed("serial")?;
    open_platform(model, serial)
}

#[cfg(feature = "bb60")]
fn open_platform(model: Model, serial: Option<i32>) -> Result<Box<dyn Platform>, CaptureError> {
    Ok(Box::new(driver::Bb60Platform { model, serial }))
}

#[cfg(not(feature = "bb60"))]
fn open_platform(_model: Model, _serial: Option<i32>) -> Result<Box<dyn Platform>, CaptureError> {
    Err(DeviceError::NotCompiled {
        platform: NAME,
        feature: "bb60",
    }
    .into())
}

#[cfg(feature = "bb60")]
mod driver {
    use std::ffi::CStr;
    use std::os::raw::{c_char, c_double, c_int};

    use tracing::{debug, info, warn};

    use super::*;
    use crate::buffers::Timestamp;
    use crate::complex::ComplexFloat;
    use crate::device::{
        apply_field, Device, DeviceConfiguration, FieldWarning, PullError, Pulled,
    };

    const BB_MAX_DEVICES: usize = 8;
    const BB_FALSE: c_int = 0;
    const BB_AUTO_ATTEN: c_int = -1;
    const BB_AUTO_GAIN: c_int = -1;
    const BB_MAX_GAIN: c_int = 3;
    const BB_STREAMING: u32 = 4;
    const BB_STREAM_IQ: u32 = 0x0;

    #[link(name = "bb_api")]
    extern "C" {
        fn bbGetSerialNumberList2(
            serial_numbers: *mut c_int,
            device_types: *mut c_int,
            device_count: *mut c_int,
        ) -> c_int;
        fn bbOpenDevice(device: *mut c_int) -> c_int;
        fn bbOpenDeviceBySerialNumber(device: *mut c_int, serial_number: c_int) -> c_int;
        fn bbCloseDevice(device: c_int) -> c_int;
        fn bbConfigureRefLevel(device: c_int, ref_level: c_double) -> c_int;
        fn bbConfigureGainAtten(device: c_int, gain: c_int, atten: c_int) -> c_int;
        fn bbConfigureIQCenter(device: c_int, center_freq: c_double) -> c_int;
        fn bbConfigureIQ(device: c_int, downsample_factor: c_int, bandwidth: c_double) -> c_int;
        fn bbInitiate(device: c_int, mode: u32, flag: u32) -> c_int;
        fn bbAbort(device: c_int) -> c_int;
        fn bbGetIQUnpacked(
            device: c_int,
            iq_data: *mut f32,
            iq_count: c_int,
            triggers: *mut u32,
            trigger_count: c_int,
            purge: c_int,
            data_remaining: *mut c_int,
            sample_loss: *mut c_int,
            sec: *mut u32,
            nano: *mut u32,
        ) -> c_int;
        fn bbGetErrorString(status: c_int) -> *const c_char;
    }

    fn error_string(status: c_int) -> String {
        // SAFETY: the driver returns a pointer to a static, NUL terminated string
        unsafe {
            let p = bbGetErrorString(status);
            if p.is_null() {
                format!("status {status}")
            } else {
                CStr::from_ptr(p).to_string_lossy().into_owned()
            }
        }
    }

    fn check(call: &'static str, status: c_int) -> Result<(), DeviceError> {
        match classify(status) {
            StatusClass::Ok => Ok(()),
            StatusClass::Warning => {
                warn!("{call}: {}", error_string(status));
                Ok(())
            }
            StatusClass::Disconnected => Err(DeviceError::LinkLost(error_string(status))),
            StatusClass::Error | StatusClass::Timeout => Err(DeviceError::Driver {
                call,
                code: status,
                message: error_string(status),
            }),
        }
    }

    pub struct Bb60Platform {
        pub model: Model,
        pub serial: Option<i32>,
    }

    impl Platform for Bb60Platform {
        fn name(&self) -> &str {
            NAME
        }

        fn limits(&self) -> DeviceLimits {
            limits(self.model)
        }

        fn open(&self) -> Result<Box<dyn Device>, DeviceError> {
            let mut serials = [0 as c_int; BB_MAX_DEVICES];
            let mut types = [0 as c_int; BB_MAX_DEVICES];
            let mut count: c_int = -1;
            // SAFETY: both arrays hold BB_MAX_DEVICES entries as the API requires
            check("bbGetSerialNumberList2", unsafe {
                bbGetSerialNumberList2(serials.as_mut_ptr(), types.as_mut_ptr(), &mut count)
            })?;
            let count = count.clamp(0, BB_MAX_DEVICES as c_int) as usize;
            let index = match (count, self.serial) {
                (0, _) => {
                    return Err(DeviceError::NotFound {
                        platform: NAME.to_owned(),
                    })
                }
                (_, Some(serial)) => serials[..count]
                    .iter()
                    .position(|&s| s == serial)
                    .ok_or_else(|| DeviceError::NotFound {
                        platform: format!("{NAME} (serial {serial})"),
                    })?,
                (1, None) => 0,
                (n, None) => {
                    return Err(DeviceError::Ambiguous {
                        platform: NAME.to_owned(),
                        count: n,
                    })
                }
            };
            match Model::from_device_type(types[index]) {
                Some(m) if m != self.model => warn!(
                    "Connected device is a {m:?} but settings say {:?}, set `model` to match",
                    self.model
                ),
                _ => {}
            }

            let mut handle: c_int = -1;
            // SAFETY: `handle` is a valid out pointer
            let status = unsafe {
                match self.serial {
                    Some(serial) => bbOpenDeviceBySerialNumber(&mut handle, serial),
                    None => bbOpenDevice(&mut handle),
                }
            };
            check("bbOpenDevice", status)?;
            info!(serial = serials[index], "Opened BB60");
            Ok(Box::new(Bb60Device { handle }))
        }
    }

    pub struct Bb60Device {
        handle: c_int,
    }

    impl Device for Bb60Device {
        fn configure(
            &mut self,
            config: &DeviceConfiguration,
        ) -> Result<Vec<FieldWarning>, DeviceError> {
            let h = self.handle;
            let mut warnings = Vec::new();
            // SAFETY (all calls below): `h` is an open device handle owned by this struct
            let (gain, atten) = match config.gain {
                GainPolicy::RefLevel(dbm) => {
                    apply_field(&mut warnings, "Reference level", {
                        check("bbConfigureRefLevel", unsafe { bbConfigureRefLevel(h, dbm) })
                    })?;
                    (BB_AUTO_GAIN, BB_AUTO_ATTEN)
                }
                GainPolicy::Gain(g) => ((g.round() as c_int).clamp(0, BB_MAX_GAIN), BB_AUTO_ATTEN),
                GainPolicy::Auto => (BB_AUTO_GAIN, BB_AUTO_ATTEN),
            };
            apply_field(&mut warnings, "Gain and attenuation", {
                check("bbConfigureGainAtten", unsafe {
                    bbConfigureGainAtten(h, gain, atten)
                })
            })?;
            apply_field(&mut warnings, "Center frequency", {
                check("bbConfigureIQCenter", unsafe {
                    bbConfigureIQCenter(h, config.center_hz)
                })
            })?;
            apply_field(&mut warnings, "Bandwidth", {
                check("bbConfigureIQ", unsafe {
                    bbConfigureIQ(h, config.decimation as c_int, config.bandwidth_hz)
                })
            })?;
            Ok(warnings)
        }

        fn start_stream(&mut self) -> Result<(), DeviceError> {
            // SAFETY: valid handle
            check("bbInitiate", unsafe {
                bbInitiate(self.handle, BB_STREAMING, BB_STREAM_IQ)
            })
        }

        fn pull(&mut self, buf: &mut [ComplexFloat]) -> Result<Pulled, PullError> {
            let mut remaining: c_int = 0;
            let mut loss: c_int = 0;
            let mut sec: u32 = 0;
            let mut nano: u32 = 0;
            // SAFETY: ComplexFloat is repr(C) {re, im}, so `buf` is `2 * len` interleaved
            // floats, exactly what bbGetIQUnpacked writes for `len` samples
            let status = unsafe {
                bbGetIQUnpacked(
                    self.handle,
                    buf.as_mut_ptr() as *mut f32,
                    buf.len() as c_int,
                    std::ptr::null_mut(),
                    0,
                    BB_FALSE,
                    &mut remaining,
                    &mut loss,
                    &mut sec,
                    &mut nano,
                )
            };
            match classify(status) {
                StatusClass::Ok => {}
                StatusClass::Warning if status == STATUS_DATA_BREAK => {
                    return Err(PullError::SampleLoss(error_string(status)))
                }
                StatusClass::Warning => debug!("bbGetIQUnpacked: {}", error_string(status)),
                StatusClass::Timeout => return Err(PullError::Timeout),
                StatusClass::Disconnected => {
                    return Err(PullError::Fatal(DeviceError::LinkLost(error_string(status))))
                }
                StatusClass::Error => {
                    return Err(PullError::Fatal(DeviceError::Driver {
                        call: "bbGetIQUnpacked",
                        code: status,
                        message: error_string(status),
                    }))
                }
            }
            if loss != 0 {
                return Err(PullError::SampleLoss(format!(
                    "driver dropped samples ({remaining} still buffered)"
                )));
            }
            Ok(Pulled {
                samples: buf.len(),
                timestamp: Timestamp::new(sec as i64, nano),
            })
        }

        fn stop_stream(&mut self) -> Result<(), DeviceError> {
            // SAFETY: valid handle
            check("bbAbort", unsafe { bbAbort(self.handle) })
        }

        fn close(self: Box<Self>) -> Result<(), DeviceError> {
            // SAFETY: valid handle, consumed here so it is never used again
            check("bbCloseDevice", unsafe { bbCloseDevice(self.handle) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_limits() {
        assert_eq!(20e6, limits(Model::Bb60a).native_max_bandwidth_hz);
        assert_eq!(27e6, limits(Model::Bb60d).native_max_bandwidth_hz);
        assert_eq!(Ok(Model::Bb60a), "BB60A".parse());
        assert!("bb70".parse::<Model>().is_err());
        assert_eq!(Some(Model::Bb60c), Model::from_device_type(2));
        assert_eq!(None, Model::from_device_type(0));
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(StatusClass::Ok, classify(0));
        assert_eq!(StatusClass::Warning, classify(STATUS_DATA_BREAK));
        assert_eq!(StatusClass::Disconnected, classify(-14));
        assert_eq!(StatusClass::Timeout, classify(-15));
        assert_eq!(StatusClass::Error, classify(-4));
    }

    #[cfg(not(feature = "bb60"))]
    #[test]
    fn test_unavailable_without_driver() {
        let store = ConfigStore::in_memory();
        assert!(matches!(
            build(&store),
            Err(CaptureError::DeviceUnavailable { .. })
        ));
    }

    #[test]
    fn test_bad_model_setting() {
        let mut store = ConfigStore::in_memory();
        store.set("bb60-configs", "model", "bb70");
        assert!(matches!(build(&store), Err(CaptureError::Configuration(_))));
    }
}
