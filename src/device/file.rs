//! Replays a raw recording of interleaved native-endian `f32` I/Q pairs as if it were a
//! live device. Timestamps are derived from the configured sample rate, starting at the
//! moment the stream is started.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;

use byte_slice_cast::AsMutByteSlice;
use tracing::{debug, info, warn};

use super::{
    Device, DeviceConfiguration, DeviceError, DeviceLimits, FieldWarning, GainPolicy, Platform,
    Pulled, PullError,
};
use crate::buffers::Timestamp;
use crate::complex::{deinterleave, ComplexFloat};
use crate::config::{platform_section, ConfigStore};
use crate::error::{CaptureError, ConfigurationError};

pub const NAME: &str = "file";

const BYTES_PER_SAMPLE: usize = 2 * std::mem::size_of::<f32>();

pub fn build(store: &ConfigStore) -> Result<Box<dyn Platform>, CaptureError> {
    let section = store.section(&platform_section(NAME));
    let path = section
        .get("path")
        .map(PathBuf::from)
        .ok_or_else(|| ConfigurationError::InvalidSetting {
            section: section.name().to_owned(),
            key: "path".to_owned(),
            value: String::new(),
            reason: "a recording path is required".to_owned(),
        })?;
    let sample_rate: f64 = section.get_or("rate", 40e6)?;
    if !(sample_rate > 0.0) {
        return Err(ConfigurationError::InvalidSetting {
            section: section.name().to_owned(),
            key: "rate".to_owned(),
            value: sample_rate.to_string(),
            reason: "must be positive".to_owned(),
        }
        .into());
    }
    Ok(Box::new(FilePlatform {
        path,
        sample_rate,
        repeat: section.get_or("repeat", false)?,
    }))
}

#[derive(Debug, Clone)]
pub struct FilePlatform {
    pub path: PathBuf,
    pub sample_rate: f64,
    pub repeat: bool,
}

impl Platform for FilePlatform {
    fn name(&self) -> &str {
        NAME
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            native_max_bandwidth_hz: self.sample_rate,
            min_center_hz: 0.0,
            max_center_hz: f64::MAX,
            min_decimation: 1,
            max_decimation: 1,
            decimation_power_of_two: false,
            default_gain: GainPolicy::Auto,
            default_samples_per_unit: 262_144,
            samples_per_packet: None,
        }
    }

    fn open(&self) -> Result<Box<dyn Device>, DeviceError> {
        let file = File::open(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => DeviceError::NotFound {
                platform: format!("{NAME} ({})", self.path.display()),
            },
            _ => DeviceError::Io(format!("{}: {e}", self.path.display())),
        })?;
        info!(path = %self.path.display(), "Replaying recording");
        Ok(Box::new(FileDevice {
            reader: BufReader::new(file),
            repeat: self.repeat,
            sample_rate: self.sample_rate,
            scratch: Vec::new(),
            epoch: Timestamp::default(),
            emitted: 0,
        }))
    }
}

pub struct FileDevice {
    reader: BufReader<File>,
    repeat: bool,
    sample_rate: f64,
    scratch: Vec<f32>,
    epoch: Timestamp,
    emitted: u64,
}

impl FileDevice {
    /// Read as many whole samples as fit in `scratch[..2 * n]`, returns bytes read
    fn fill_scratch(&mut self, n: usize) -> std::io::Result<usize> {
        let bytes = self.scratch[..2 * n].as_mut_byte_slice();
        let mut read = 0;
        while read < bytes.len() {
            match self.reader.read(&mut bytes[read..]) {
                Ok(0) => break,
                Ok(k) => read += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }
}

impl Device for FileDevice {
    fn configure(
        &mut self,
        config: &DeviceConfiguration,
    ) -> Result<Vec<FieldWarning>, DeviceError> {
        self.scratch = vec![0f32; 2 * config.samples_per_unit];
        Ok(Vec::new())
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        let now = chrono::Utc::now();
        self.epoch = Timestamp::new(now.timestamp(), now.timestamp_subsec_nanos());
        Ok(())
    }

    fn pull(&mut self, buf: &mut [ComplexFloat]) -> Result<Pulled, PullError> {
        let n = buf.len().min(self.scratch.len() / 2);
        let io = |e: std::io::Error| PullError::Fatal(DeviceError::Io(e.to_string()));
        let mut read = self.fill_scratch(n).map_err(io)?;
        if read == 0 && self.repeat {
            debug!("Rewinding recording");
            self.reader.seek(SeekFrom::Start(0)).map_err(io)?;
            read = self.fill_scratch(n).map_err(io)?;
        }
        if read % BYTES_PER_SAMPLE != 0 {
            warn!(
                bytes = read % BYTES_PER_SAMPLE,
                "Recording ends with a truncated sample"
            );
        }
        let samples = deinterleave(&self.scratch[..read / BYTES_PER_SAMPLE * 2], buf);
        if samples == 0 {
            return Err(PullError::Fatal(DeviceError::Io(
                "end of recording".to_owned(),
            )));
        }
        let nanos =
            (self.emitted as f64 / self.sample_rate * 1e9).round() as u64 + self.epoch.nanos as u64;
        let timestamp = Timestamp::new(
            self.epoch.secs + (nanos / 1_000_000_000) as i64,
            (nanos % 1_000_000_000) as u32,
        );
        self.emitted += samples as u64;
        Ok(Pulled { samples, timestamp })
    }

    fn stop_stream(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), DeviceError> {
        debug!(samples = self.emitted, "Closing recording");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byte_slice_cast::AsByteSlice;
    use std::io::Write;

    fn recording(pairs: &[f32]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(pairs.as_byte_slice()).unwrap();
        f.flush().unwrap();
        f
    }

    fn config(spu: usize) -> DeviceConfiguration {
        DeviceConfiguration {
            center_hz: 0.0,
            bandwidth_hz: 1e6,
            decimation: 1,
            gain: GainPolicy::Auto,
            samples_per_unit: spu,
            samples_per_packet: None,
        }
    }

    #[test]
    fn test_replay_then_end_of_recording() {
        let f = recording(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let platform = FilePlatform {
            path: f.path().to_path_buf(),
            sample_rate: 1e6,
            repeat: false,
        };
        let mut dev = platform.open().unwrap();
        dev.configure(&config(2)).unwrap();
        dev.start_stream().unwrap();
        let mut buf = [ComplexFloat::default(); 2];
        assert_eq!(2, dev.pull(&mut buf).unwrap().samples);
        assert_eq!(ComplexFloat::new(3.0, 4.0), buf[1]);
        // Only one sample left
        assert_eq!(1, dev.pull(&mut buf).unwrap().samples);
        assert_eq!(ComplexFloat::new(5.0, 6.0), buf[0]);
        assert!(matches!(dev.pull(&mut buf), Err(PullError::Fatal(_))));
    }

    #[test]
    fn test_repeat_rewinds() {
        let f = recording(&[1.0, 2.0]);
        let platform = FilePlatform {
            path: f.path().to_path_buf(),
            sample_rate: 1e6,
            repeat: true,
        };
        let mut dev = platform.open().unwrap();
        dev.configure(&config(1)).unwrap();
        dev.start_stream().unwrap();
        let mut buf = [ComplexFloat::default(); 1];
        let a = dev.pull(&mut buf).unwrap();
        let b = dev.pull(&mut buf).unwrap();
        assert_eq!(ComplexFloat::new(1.0, 2.0), buf[0]);
        assert_eq!(1_000, b.timestamp.nanos_since(a.timestamp));
    }

    #[test]
    fn test_missing_recording_is_unavailable() {
        let platform = FilePlatform {
            path: PathBuf::from("/nonexistent/recording.iq"),
            sample_rate: 1e6,
            repeat: false,
        };
        assert!(matches!(platform.open(), Err(DeviceError::NotFound { .. })));
    }

    #[test]
    fn test_build_requires_path() {
        let store = ConfigStore::in_memory();
        assert!(matches!(build(&store), Err(CaptureError::Configuration(_))));
    }
}
