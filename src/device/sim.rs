//! A software-only platform that streams a complex tone stamped by a simulated clock.
//!
//! Useful for connectivity checks of the whole pipeline without hardware. Setting
//! `max-pull` makes every pull return at most that many samples, which exercises the
//! short-read path.

use std::f64::consts::TAU;

use tracing::debug;

use super::{
    Device, DeviceConfiguration, DeviceError, DeviceLimits, FieldWarning, GainPolicy, Platform,
    Pulled, PullError,
};
use crate::buffers::Timestamp;
use crate::complex::{Complex, ComplexFloat};
use crate::config::{platform_section, ConfigStore};
use crate::error::CaptureError;

pub const NAME: &str = "sim";

/// IQ rate before decimation
pub const BASE_SAMPLE_RATE: f64 = 40e6;

pub const LIMITS: DeviceLimits = DeviceLimits {
    native_max_bandwidth_hz: 20e6,
    min_center_hz: 9e3,
    max_center_hz: 6.4e9,
    min_decimation: 1,
    max_decimation: 8192,
    decimation_power_of_two: true,
    default_gain: GainPolicy::RefLevel(-20.0),
    default_samples_per_unit: 262_144,
    samples_per_packet: None,
};

pub fn build(store: &ConfigStore) -> Result<Box<dyn Platform>, CaptureError> {
    let section = store.section(&platform_section(NAME));
    Ok(Box::new(SimPlatform {
        max_pull: section.get_parsed("max-pull")?,
        tone_offset_hz: section.get_or("tone-offset", 1e6)?,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct SimPlatform {
    pub max_pull: Option<usize>,
    pub tone_offset_hz: f64,
}

impl Platform for SimPlatform {
    fn name(&self) -> &str {
        NAME
    }

    fn limits(&self) -> DeviceLimits {
        LIMITS
    }

    fn open(&self) -> Result<Box<dyn Device>, DeviceError> {
        debug!("Opening simulated device");
        Ok(Box::new(SimDevice {
            max_pull: self.max_pull.filter(|&n| n > 0),
            tone_offset_hz: self.tone_offset_hz,
            sample_rate: BASE_SAMPLE_RATE,
            epoch: Timestamp::default(),
            emitted: 0,
            streaming: false,
        }))
    }
}

pub struct SimDevice {
    max_pull: Option<usize>,
    tone_offset_hz: f64,
    sample_rate: f64,
    epoch: Timestamp,
    emitted: u64,
    streaming: bool,
}

impl SimDevice {
    fn clock(&self) -> Timestamp {
        let elapsed_ns = (self.emitted as f64 / self.sample_rate * 1e9).round() as u64;
        let nanos = self.epoch.nanos as u64 + elapsed_ns;
        Timestamp::new(
            self.epoch.secs + (nanos / 1_000_000_000) as i64,
            (nanos % 1_000_000_000) as u32,
        )
    }
}

impl Device for SimDevice {
    fn configure(
        &mut self,
        config: &DeviceConfiguration,
    ) -> Result<Vec<FieldWarning>, DeviceError> {
        self.sample_rate = BASE_SAMPLE_RATE / config.decimation as f64;
        // Keep the tone inside the captured band
        self.tone_offset_hz = self
            .tone_offset_hz
            .clamp(-config.bandwidth_hz / 2.0, config.bandwidth_hz / 2.0);
        debug!(
            sample_rate = self.sample_rate,
            tone_offset_hz = self.tone_offset_hz,
            "Simulated device configured"
        );
        Ok(Vec::new())
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        let now = chrono::Utc::now();
        self.epoch = Timestamp::new(now.timestamp(), now.timestamp_subsec_nanos());
        self.emitted = 0;
        self.streaming = true;
        Ok(())
    }

    fn pull(&mut self, buf: &mut [ComplexFloat]) -> Result<Pulled, PullError> {
        if !self.streaming {
            return Err(PullError::Fatal(DeviceError::Io(
                "stream was not started".to_owned(),
            )));
        }
        let n = self.max_pull.map_or(buf.len(), |m| m.min(buf.len()));
        let timestamp = self.clock();
        let step = TAU * self.tone_offset_hz / self.sample_rate;
        for (i, sample) in buf[..n].iter_mut().enumerate() {
            let phase = step * (self.emitted + i as u64) as f64;
            *sample = Complex::new(phase.cos() as f32, phase.sin() as f32);
        }
        self.emitted += n as u64;
        Ok(Pulled {
            samples: n,
            timestamp,
        })
    }

    fn stop_stream(&mut self) -> Result<(), DeviceError> {
        self.streaming = false;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), DeviceError> {
        debug!(samples = self.emitted, "Closing simulated device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(decimation: u32) -> DeviceConfiguration {
        DeviceConfiguration {
            center_hz: 1e9,
            bandwidth_hz: 5e6,
            decimation,
            gain: GainPolicy::Auto,
            samples_per_unit: 16,
            samples_per_packet: None,
        }
    }

    #[test]
    fn test_short_reads_and_clock() {
        let platform = SimPlatform {
            max_pull: Some(10),
            tone_offset_hz: 1e6,
        };
        let mut dev = platform.open().unwrap();
        dev.configure(&config(4)).unwrap();
        dev.start_stream().unwrap();
        let mut buf = [ComplexFloat::default(); 16];
        let first = dev.pull(&mut buf).unwrap();
        assert_eq!(10, first.samples);
        let second = dev.pull(&mut buf[10..]).unwrap();
        assert_eq!(6, second.samples);
        assert!(second.timestamp > first.timestamp);
        // Unit amplitude tone
        assert!(buf.iter().all(|s| (s.norm_sqr() - 1.0).abs() < 1e-4));
        dev.stop_stream().unwrap();
        dev.close().unwrap();
    }

    #[test]
    fn test_pull_before_start_is_fatal() {
        let mut dev = SimPlatform::default().open().unwrap();
        let mut buf = [ComplexFloat::default(); 4];
        assert!(matches!(dev.pull(&mut buf), Err(PullError::Fatal(_))));
    }

    #[test]
    fn test_build_reads_section() {
        let mut store = ConfigStore::in_memory();
        store.set("sim-configs", "max-pull", 100);
        assert!(build(&store).is_ok());
        store.set("sim-configs", "max-pull", "lots");
        assert!(matches!(build(&store), Err(CaptureError::Configuration(_))));
    }
}
