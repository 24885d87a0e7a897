//! Ettus USRP X310 through the UHD C API. Driver bindings need the `uhd` feature.

use std::str::FromStr;

use super::{DeviceError, DeviceLimits, GainPolicy, Platform};
use crate::config::{platform_section, ConfigStore, Section};
use crate::error::{CaptureError, ConfigurationError};

pub const NAME: &str = "x310";
pub const STREAM_SECTION: &str = "x310-stream-configs";

pub const DEFAULT_ARGS: &str = "type=x300";
pub const DEFAULT_SUBDEV: &str = "A:0";
pub const DEFAULT_RATE: f64 = 25e6;
pub const DEFAULT_SAMPLES_PER_PACKET: usize = 200;
pub const SAMPLES_PER_UNIT: usize = 200_000;
pub const MAX_BANDWIDTH_HZ: f64 = 160e6;
pub const MIN_FREQ_HZ: f64 = 10e6;
pub const MAX_FREQ_HZ: f64 = 6e9;
pub const ANTENNA: &str = "RX";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRef {
    Internal,
    External,
    Gpsdo,
}

impl ClockRef {
    pub fn as_str(self) -> &'static str {
        match self {
            ClockRef::Internal => "internal",
            ClockRef::External => "external",
            ClockRef::Gpsdo => "gpsdo",
        }
    }
}

impl FromStr for ClockRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(ClockRef::Internal),
            "external" => Ok(ClockRef::External),
            "gpsdo" => Ok(ClockRef::Gpsdo),
            _ => Err("ref must be `internal`, `external`, or `gpsdo`".to_owned()),
        }
    }
}

/// Everything needed to open and tune the radio
#[derive(Debug, Clone, PartialEq)]
pub struct X310Settings {
    pub args: String,
    pub subdev: String,
    pub clock: ClockRef,
    pub rate: f64,
    pub samples_per_packet: usize,
}

impl X310Settings {
    pub fn from_sections(device: &Section, stream: &Section) -> Result<Self, ConfigurationError> {
        let rate: f64 = device.get_or("rate", DEFAULT_RATE)?;
        if !(rate > 0.0) {
            return Err(invalid(device, "rate", "must be positive"));
        }
        let samples_per_packet: usize = stream.get_or("spp", DEFAULT_SAMPLES_PER_PACKET)?;
        if samples_per_packet == 0 {
            return Err(invalid(stream, "spp", "must be a non-zero positive integer"));
        }
        Ok(Self {
            args: device.get("args").unwrap_or(DEFAULT_ARGS).to_owned(),
            subdev: device.get("subdev").unwrap_or(DEFAULT_SUBDEV).to_owned(),
            clock: device.get_or("ref", ClockRef::Internal)?,
            rate,
            samples_per_packet,
        })
    }

    pub fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            native_max_bandwidth_hz: MAX_BANDWIDTH_HZ,
            min_center_hz: MIN_FREQ_HZ,
            max_center_hz: MAX_FREQ_HZ,
            min_decimation: 1,
            max_decimation: 1,
            decimation_power_of_two: false,
            default_gain: GainPolicy::Gain(0.0),
            default_samples_per_unit: SAMPLES_PER_UNIT,
            samples_per_packet: Some(self.samples_per_packet),
        }
    }
}

fn invalid(section: &Section, key: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        section: section.name().to_owned(),
        key: key.to_owned(),
        value: section.get(key).unwrap_or_default().to_owned(),
        reason: reason.to_owned(),
    }
}

/// `rx_metadata` error codes
pub mod rx_error {
    pub const NONE: u32 = 0x0;
    pub const TIMEOUT: u32 = 0x1;
    pub const LATE_COMMAND: u32 = 0x2;
    pub const BROKEN_CHAIN: u32 = 0x4;
    pub const OVERFLOW: u32 = 0x8;
    pub const ALIGNMENT: u32 = 0xc;
    pub const BAD_PACKET: u32 = 0xf;
}

/// Map a receive error code onto the pull contract
pub fn classify_rx(code: u32) -> Result<(), super::PullError> {
    use super::PullError;
    match code {
        rx_error::NONE => Ok(()),
        rx_error::TIMEOUT => Err(PullError::Timeout),
        rx_error::OVERFLOW => Err(PullError::SampleLoss("overflow".to_owned())),
        rx_error::BROKEN_CHAIN => Err(PullError::SampleLoss("broken chain".to_owned())),
        other => Err(PullError::Fatal(DeviceError::Driver {
            call: "uhd_rx_streamer_recv",
            code: other as i32,
            message: match other {
                rx_error::LATE_COMMAND => "late command",
                rx_error::ALIGNMENT => "multi-channel alignment failed",
                rx_error::BAD_PACKET => "bad packet",
                _ => "unknown receive error",
            }
            .to_owned(),
        })),
    }
}

pub fn build(store: &ConfigStore) -> Result<Box<dyn Platform>, CaptureError> {
    let settings = X310Settings::from_sections(
        &store.section(&platform_section(NAME)),
        &store.section(STREAM_SECTION),
    )?;
    open_platform(settings)
}

#[cfg(feature = "uhd")]
fn open_platform(settings: X310Settings) -> Result<Box<dyn Platform>, CaptureError> {
    Ok(Box::new(driver::X310Platform { settings }))
}

#[cfg(not(feature = "uhd"))]
fn open_platform(_settings: X310Settings) -> Result<Box<dyn Platform>, CaptureError> {
    Err(DeviceError::NotCompiled {
        platform: NAME,
        feature: "uhd",
    }
    .into())
}

#[cfg(feature = "uhd")]
mod driver {
    use std::ffi::{c_void, CStr, CString};
    use std::os::raw::{c_char, c_int};
    use std::ptr;

    use tracing::{debug, info, warn};

    use super::*;
    use crate::buffers::Timestamp;
    use crate::complex::ComplexFloat;
    use crate::device::{
        apply_field, Device, DeviceConfiguration, FieldWarning, PullError, Pulled,
    };

    type UsrpHandle = *mut c_void;
    type RxStreamerHandle = *mut c_void;
    type RxMetadataHandle = *mut c_void;
    type StringVectorHandle = *mut c_void;
    type SubdevSpecHandle = *mut c_void;

    const UHD_ERROR_NONE: c_int = 0;
    const TUNE_POLICY_AUTO: c_int = b'A' as c_int;
    const STREAM_MODE_START_CONTINUOUS: c_int = b'a' as c_int;
    const STREAM_MODE_STOP_CONTINUOUS: c_int = b'o' as c_int;
    const RECV_TIMEOUT_S: f64 = 0.1;
    const ERROR_BUF_LEN: usize = 512;

    #[repr(C)]
    struct TuneRequest {
        target_freq: f64,
        rf_freq_policy: c_int,
        rf_freq: f64,
        dsp_freq_policy: c_int,
        dsp_freq: f64,
        args: *mut c_char,
    }

    #[repr(C)]
    #[derive(Default)]
    struct TuneResult {
        clipped_rf_freq: f64,
        target_rf_freq: f64,
        actual_rf_freq: f64,
        target_dsp_freq: f64,
        actual_dsp_freq: f64,
    }

    #[repr(C)]
    struct StreamArgs {
        cpu_format: *mut c_char,
        otw_format: *mut c_char,
        args: *mut c_char,
        channel_list: *mut usize,
        n_channels: c_int,
    }

    #[repr(C)]
    struct StreamCmd {
        stream_mode: c_int,
        num_samps: usize,
        stream_now: bool,
        time_spec_full_secs: i64,
        time_spec_frac_secs: f64,
    }

    #[link(name = "uhd")]
    extern "C" {
        fn uhd_get_last_error(error_out: *mut c_char, strbuffer_len: usize) -> c_int;
        fn uhd_string_vector_make(h: *mut StringVectorHandle) -> c_int;
        fn uhd_string_vector_size(h: StringVectorHandle, size_out: *mut usize) -> c_int;
        fn uhd_string_vector_free(h: *mut StringVectorHandle) -> c_int;
        fn uhd_usrp_find(args: *const c_char, strings_out: *mut StringVectorHandle) -> c_int;
        fn uhd_usrp_make(h: *mut UsrpHandle, args: *const c_char) -> c_int;
        fn uhd_usrp_free(h: *mut UsrpHandle) -> c_int;
        fn uhd_usrp_set_clock_source(h: UsrpHandle, source: *const c_char, mboard: usize)
            -> c_int;
        fn uhd_subdev_spec_make(h: *mut SubdevSpecHandle, markup: *const c_char) -> c_int;
        fn uhd_subdev_spec_free(h: *mut SubdevSpecHandle) -> c_int;
        fn uhd_usrp_set_rx_subdev_spec(
            h: UsrpHandle,
            subdev_spec: SubdevSpecHandle,
            mboard: usize,
        ) -> c_int;
        fn uhd_usrp_set_rx_rate(h: UsrpHandle, rate: f64, chan: usize) -> c_int;
        fn uhd_usrp_set_rx_freq(
            h: UsrpHandle,
            tune_request: *mut TuneRequest,
            chan: usize,
            tune_result: *mut TuneResult,
        ) -> c_int;
        fn uhd_usrp_set_rx_gain(
            h: UsrpHandle,
            gain: f64,
            chan: usize,
            gain_name: *const c_char,
        ) -> c_int;
        fn uhd_usrp_set_rx_agc(h: UsrpHandle, enable: bool, chan: usize) -> c_int;
        fn uhd_usrp_set_rx_bandwidth(h: UsrpHandle, bandwidth: f64, chan: usize) -> c_int;
        fn uhd_usrp_set_rx_antenna(h: UsrpHandle, ant: *const c_char, chan: usize) -> c_int;
        fn uhd_rx_streamer_make(h: *mut RxStreamerHandle) -> c_int;
        fn uhd_rx_streamer_free(h: *mut RxStreamerHandle) -> c_int;
        fn uhd_usrp_get_rx_stream(
            h: UsrpHandle,
            stream_args: *mut StreamArgs,
            h_out: RxStreamerHandle,
        ) -> c_int;
        fn uhd_rx_metadata_make(h: *mut RxMetadataHandle) -> c_int;
        fn uhd_rx_metadata_free(h: *mut RxMetadataHandle) -> c_int;
        fn uhd_rx_metadata_time_spec(
            h: RxMetadataHandle,
            full_secs_out: *mut i64,
            frac_secs_out: *mut f64,
        ) -> c_int;
        fn uhd_rx_metadata_error_code(h: RxMetadataHandle, error_code_out: *mut u32) -> c_int;
        fn uhd_rx_streamer_issue_stream_cmd(h: RxStreamerHandle, cmd: *const StreamCmd) -> c_int;
        fn uhd_rx_streamer_recv(
            h: RxStreamerHandle,
            buffs: *mut *mut c_void,
            samps_per_buff: usize,
            md: *mut RxMetadataHandle,
            timeout: f64,
            one_packet: bool,
            items_recvd: *mut usize,
        ) -> c_int;
    }

    fn last_error() -> String {
        let mut buf = [0 as c_char; ERROR_BUF_LEN];
        // SAFETY: the buffer length is passed along and UHD NUL terminates
        unsafe {
            uhd_get_last_error(buf.as_mut_ptr(), ERROR_BUF_LEN);
            CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
        }
    }

    fn check(call: &'static str, code: c_int) -> Result<(), DeviceError> {
        if code == UHD_ERROR_NONE {
            return Ok(());
        }
        let message = last_error();
        // UHD_ERROR_USB and UHD_ERROR_IO
        if code == 21 || code == 30 {
            Err(DeviceError::LinkLost(message))
        } else {
            Err(DeviceError::Driver {
                call,
                code,
                message,
            })
        }
    }

    fn cstring(s: &str) -> Result<CString, DeviceError> {
        CString::new(s).map_err(|_| DeviceError::Io(format!("`{s}` contains a NUL byte")))
    }

    pub struct X310Platform {
        pub settings: X310Settings,
    }

    impl X310Platform {
        fn count_devices(&self) -> Result<usize, DeviceError> {
            let args = cstring(&self.settings.args)?;
            let mut found: StringVectorHandle = ptr::null_mut();
            let mut n = 0usize;
            // SAFETY: the vector is made, filled and freed here
            unsafe {
                check("uhd_string_vector_make", uhd_string_vector_make(&mut found))?;
                let res = check("uhd_usrp_find", uhd_usrp_find(args.as_ptr(), &mut found))
                    .and_then(|_| {
                        check(
                            "uhd_string_vector_size",
                            uhd_string_vector_size(found, &mut n),
                        )
                    });
                uhd_string_vector_free(&mut found);
                res?;
            }
            Ok(n)
        }
    }

    impl Platform for X310Platform {
        fn name(&self) -> &str {
            NAME
        }

        fn limits(&self) -> DeviceLimits {
            self.settings.limits()
        }

        fn open(&self) -> Result<Box<dyn Device>, DeviceError> {
            match self.count_devices()? {
                0 => {
                    return Err(DeviceError::NotFound {
                        platform: NAME.to_owned(),
                    })
                }
                1 => {}
                count => {
                    return Err(DeviceError::Ambiguous {
                        platform: NAME.to_owned(),
                        count,
                    })
                }
            }
            let args = cstring(&self.settings.args)?;
            let mut usrp: UsrpHandle = ptr::null_mut();
            // SAFETY: `usrp` is a valid out pointer
            check("uhd_usrp_make", unsafe { uhd_usrp_make(&mut usrp, args.as_ptr()) })?;
            info!(args = %self.settings.args, "Opened USRP");
            Ok(Box::new(X310Device {
                settings: self.settings.clone(),
                usrp,
                streamer: ptr::null_mut(),
                metadata: ptr::null_mut(),
            }))
        }
    }

    pub struct X310Device {
        settings: X310Settings,
        usrp: UsrpHandle,
        streamer: RxStreamerHandle,
        metadata: RxMetadataHandle,
    }

    impl X310Device {
        fn make_streamer(&mut self, spp: usize) -> Result<(), DeviceError> {
            let cpu = cstring("fc32")?;
            let otw = cstring("sc16")?;
            let args = cstring(&format!("spp={spp}"))?;
            let mut channel = 0usize;
            let mut stream_args = StreamArgs {
                cpu_format: cpu.as_ptr() as *mut c_char,
                otw_format: otw.as_ptr() as *mut c_char,
                args: args.as_ptr() as *mut c_char,
                channel_list: &mut channel,
                n_channels: 1,
            };
            // SAFETY: every string outlives the call and the handles belong to self
            unsafe {
                check("uhd_rx_streamer_make", uhd_rx_streamer_make(&mut self.streamer))?;
                check("uhd_rx_metadata_make", uhd_rx_metadata_make(&mut self.metadata))?;
                check(
                    "uhd_usrp_get_rx_stream",
                    uhd_usrp_get_rx_stream(self.usrp, &mut stream_args, self.streamer),
                )
            }
        }

        fn stream_cmd(&mut self, mode: c_int) -> Result<(), DeviceError> {
            let cmd = StreamCmd {
                stream_mode: mode,
                num_samps: 0,
                stream_now: true,
                time_spec_full_secs: 0,
                time_spec_frac_secs: 0.0,
            };
            // SAFETY: the streamer was made in configure
            check("uhd_rx_streamer_issue_stream_cmd", unsafe {
                uhd_rx_streamer_issue_stream_cmd(self.streamer, &cmd)
            })
        }
    }

    impl Device for X310Device {
        fn configure(
            &mut self,
            config: &DeviceConfiguration,
        ) -> Result<Vec<FieldWarning>, DeviceError> {
            let h = self.usrp;
            let mut warnings = Vec::new();
            let clock = cstring(self.settings.clock.as_str())?;
            let subdev = cstring(&self.settings.subdev)?;
            let antenna = cstring(ANTENNA)?;
            let empty = cstring("")?;
            // SAFETY (all calls below): `h` is the open USRP owned by this struct and every
            // CString lives until the end of this function
            apply_field(&mut warnings, "Clock reference", {
                check("uhd_usrp_set_clock_source", unsafe {
                    uhd_usrp_set_clock_source(h, clock.as_ptr(), 0)
                })
            })?;
            apply_field(&mut warnings, "RX subdevice", unsafe {
                let mut spec: SubdevSpecHandle = ptr::null_mut();
                check(
                    "uhd_subdev_spec_make",
                    uhd_subdev_spec_make(&mut spec, subdev.as_ptr()),
                )
                .and_then(|_| {
                    let res = check(
                        "uhd_usrp_set_rx_subdev_spec",
                        uhd_usrp_set_rx_subdev_spec(h, spec, 0),
                    );
                    uhd_subdev_spec_free(&mut spec);
                    res
                })
            })?;
            apply_field(&mut warnings, "Sample rate", {
                check("uhd_usrp_set_rx_rate", unsafe {
                    uhd_usrp_set_rx_rate(h, self.settings.rate, 0)
                })
            })?;
            let mut tune = TuneRequest {
                target_freq: config.center_hz,
                rf_freq_policy: TUNE_POLICY_AUTO,
                rf_freq: 0.0,
                dsp_freq_policy: TUNE_POLICY_AUTO,
                dsp_freq: 0.0,
                args: empty.as_ptr() as *mut c_char,
            };
            let mut tuned = TuneResult::default();
            apply_field(&mut warnings, "Center frequency", {
                check("uhd_usrp_set_rx_freq", unsafe {
                    uhd_usrp_set_rx_freq(h, &mut tune, 0, &mut tuned)
                })
            })?;
            debug!(actual_rf_hz = tuned.actual_rf_freq, "Tuned");
            let gain = match config.gain {
                GainPolicy::Gain(db) => check("uhd_usrp_set_rx_gain", unsafe {
                    uhd_usrp_set_rx_gain(h, db, 0, empty.as_ptr())
                }),
                GainPolicy::Auto => check("uhd_usrp_set_rx_agc", unsafe {
                    uhd_usrp_set_rx_agc(h, true, 0)
                }),
                GainPolicy::RefLevel(_) => {
                    warn!("The X310 has no reference level, using automatic gain");
                    check("uhd_usrp_set_rx_agc", unsafe { uhd_usrp_set_rx_agc(h, true, 0) })
                }
            };
            apply_field(&mut warnings, "Gain", gain)?;
            apply_field(&mut warnings, "Bandwidth", {
                check("uhd_usrp_set_rx_bandwidth", unsafe {
                    uhd_usrp_set_rx_bandwidth(h, config.bandwidth_hz, 0)
                })
            })?;
            apply_field(&mut warnings, "Antenna", {
                check("uhd_usrp_set_rx_antenna", unsafe {
                    uhd_usrp_set_rx_antenna(h, antenna.as_ptr(), 0)
                })
            })?;
            let spp = config
                .samples_per_packet
                .unwrap_or(self.settings.samples_per_packet);
            self.make_streamer(spp)?;
            Ok(warnings)
        }

        fn start_stream(&mut self) -> Result<(), DeviceError> {
            self.stream_cmd(STREAM_MODE_START_CONTINUOUS)
        }

        fn pull(&mut self, buf: &mut [ComplexFloat]) -> Result<Pulled, PullError> {
            let mut received = 0usize;
            let mut code = 0u32;
            let mut full_secs = 0i64;
            let mut frac_secs = 0.0f64;
            let mut buffs = [buf.as_mut_ptr() as *mut c_void];
            // SAFETY: ComplexFloat is layout compatible with fc32 and `buf` holds
            // `buf.len()` of them
            unsafe {
                check(
                    "uhd_rx_streamer_recv",
                    uhd_rx_streamer_recv(
                        self.streamer,
                        buffs.as_mut_ptr(),
                        buf.len(),
                        &mut self.metadata,
                        RECV_TIMEOUT_S,
                        false,
                        &mut received,
                    ),
                )
                .map_err(PullError::Fatal)?;
                uhd_rx_metadata_error_code(self.metadata, &mut code);
                uhd_rx_metadata_time_spec(self.metadata, &mut full_secs, &mut frac_secs);
            }
            classify_rx(code)?;
            Ok(Pulled {
                samples: received,
                timestamp: Timestamp::from_parts(full_secs, frac_secs),
            })
        }

        fn stop_stream(&mut self) -> Result<(), DeviceError> {
            self.stream_cmd(STREAM_MODE_STOP_CONTINUOUS)
        }

        fn close(mut self: Box<Self>) -> Result<(), DeviceError> {
            // SAFETY: each handle is freed once and nulled by UHD
            unsafe {
                if !self.metadata.is_null() {
                    uhd_rx_metadata_free(&mut self.metadata);
                }
                if !self.streamer.is_null() {
                    uhd_rx_streamer_free(&mut self.streamer);
                }
                check("uhd_usrp_free", uhd_usrp_free(&mut self.usrp))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PullError;

    #[test]
    fn test_defaults() {
        let s = X310Settings::from_sections(&Section::new("x310-configs"), &Section::new(STREAM_SECTION))
            .unwrap();
        assert_eq!(DEFAULT_ARGS, s.args);
        assert_eq!(ClockRef::Internal, s.clock);
        assert_eq!(Some(200), s.limits().samples_per_packet);
        assert_eq!(GainPolicy::Gain(0.0), s.limits().default_gain);
    }

    #[test]
    fn test_settings_are_validated() {
        let stream = Section::new(STREAM_SECTION);
        let bad_ref = Section::new("x310-configs").with("ref", "rubidium");
        assert!(X310Settings::from_sections(&bad_ref, &stream).is_err());
        let bad_rate = Section::new("x310-configs").with("rate", 0);
        assert!(X310Settings::from_sections(&bad_rate, &stream).is_err());
        let zero_spp = Section::new(STREAM_SECTION).with("spp", 0);
        assert!(X310Settings::from_sections(&Section::new("x310-configs"), &zero_spp).is_err());

        let good = Section::new("x310-configs")
            .with("ref", "gpsdo")
            .with("subdev", "B:0");
        let s = X310Settings::from_sections(&good, &Section::new(STREAM_SECTION).with("spp", 1000))
            .unwrap();
        assert_eq!(ClockRef::Gpsdo, s.clock);
        assert_eq!("B:0", s.subdev);
        assert_eq!(1000, s.samples_per_packet);
    }

    #[test]
    fn test_classify_rx() {
        assert_eq!(Ok(()), classify_rx(rx_error::NONE));
        assert_eq!(Err(PullError::Timeout), classify_rx(rx_error::TIMEOUT));
        assert!(matches!(
            classify_rx(rx_error::OVERFLOW),
            Err(PullError::SampleLoss(_))
        ));
        assert!(matches!(
            classify_rx(rx_error::BAD_PACKET),
            Err(PullError::Fatal(_))
        ));
    }

    #[cfg(not(feature = "uhd"))]
    #[test]
    fn test_unavailable_without_driver() {
        let store = ConfigStore::in_memory();
        assert!(matches!(
            build(&store),
            Err(CaptureError::DeviceUnavailable { .. })
        ));
    }
}
