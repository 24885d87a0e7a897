//! Scripted device for exercising the capture engine in tests

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::{
    apply_field, Device, DeviceConfiguration, DeviceError, DeviceLimits, FieldWarning, GainPolicy,
    Platform, Pulled, PullError,
};
use crate::buffers::Timestamp;
use crate::complex::{Complex, ComplexFloat};

/// What the next pull does. Once the script runs out every pull fills the buffer.
#[derive(Debug, Clone)]
pub enum Step {
    Full,
    Short(usize),
    Timeout,
    Loss,
    Fatal,
}

#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub open: usize,
    pub configure: usize,
    pub start: usize,
    pub pulls: usize,
    pub stop: usize,
    pub close: usize,
}

#[derive(Clone)]
pub struct MockPlatform {
    pub limits: DeviceLimits,
    pub open_error: Option<DeviceError>,
    pub configure_error: Option<DeviceError>,
    /// Field name whose configuration the driver rejects
    pub reject_field: Option<&'static str>,
    pub script: Rc<RefCell<VecDeque<Step>>>,
    pub calls: Rc<RefCell<Calls>>,
}

impl MockPlatform {
    pub fn new(samples_per_unit: usize) -> Self {
        Self {
            limits: DeviceLimits {
                native_max_bandwidth_hz: 20e6,
                min_center_hz: 9e3,
                max_center_hz: 6.4e9,
                min_decimation: 1,
                max_decimation: 8192,
                decimation_power_of_two: true,
                default_gain: GainPolicy::RefLevel(-20.0),
                default_samples_per_unit: samples_per_unit,
                samples_per_packet: None,
            },
            open_error: None,
            configure_error: None,
            reject_field: None,
            script: Rc::default(),
            calls: Rc::default(),
        }
    }

    pub fn script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.borrow_mut().extend(steps);
        self
    }

    pub fn calls(&self) -> Calls {
        self.calls.borrow().clone()
    }
}

impl Platform for MockPlatform {
    fn name(&self) -> &str {
        "mock"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn open(&self) -> Result<Box<dyn Device>, DeviceError> {
        self.calls.borrow_mut().open += 1;
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        Ok(Box::new(MockDevice {
            platform: self.clone(),
            counter: 0,
            clock_us: 1_000_000_000,
        }))
    }
}

pub struct MockDevice {
    platform: MockPlatform,
    counter: u64,
    clock_us: i64,
}

impl Device for MockDevice {
    fn configure(
        &mut self,
        _config: &DeviceConfiguration,
    ) -> Result<Vec<FieldWarning>, DeviceError> {
        self.platform.calls.borrow_mut().configure += 1;
        if let Some(e) = &self.platform.configure_error {
            return Err(e.clone());
        }
        let mut warnings = Vec::new();
        for field in ["Reference level", "Center frequency", "Bandwidth"] {
            let result = match self.platform.reject_field {
                Some(rejected) if rejected == field => Err(DeviceError::Driver {
                    call: "configure",
                    code: -1,
                    message: "rejected by mock".to_owned(),
                }),
                _ => Ok(()),
            };
            apply_field(&mut warnings, field, result)?;
        }
        Ok(warnings)
    }

    fn start_stream(&mut self) -> Result<(), DeviceError> {
        self.platform.calls.borrow_mut().start += 1;
        Ok(())
    }

    fn pull(&mut self, buf: &mut [ComplexFloat]) -> Result<Pulled, PullError> {
        self.platform.calls.borrow_mut().pulls += 1;
        let step = self
            .platform
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or(Step::Full);
        let n = match step {
            Step::Full => buf.len(),
            Step::Short(n) => n.min(buf.len()),
            Step::Timeout => return Err(PullError::Timeout),
            Step::Loss => return Err(PullError::SampleLoss("mock overflow".to_owned())),
            Step::Fatal => {
                return Err(PullError::Fatal(DeviceError::LinkLost(
                    "mock unplugged".to_owned(),
                )))
            }
        };
        for s in &mut buf[..n] {
            self.counter += 1;
            *s = Complex::new(self.counter as f32, 0.0);
        }
        let timestamp = Timestamp::new(
            self.clock_us / 1_000_000,
            (self.clock_us % 1_000_000) as u32 * 1_000,
        );
        self.clock_us += n as i64;
        Ok(Pulled {
            samples: n,
            timestamp,
        })
    }

    fn stop_stream(&mut self) -> Result<(), DeviceError> {
        self.platform.calls.borrow_mut().stop += 1;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), DeviceError> {
        self.platform.calls.borrow_mut().close += 1;
        Ok(())
    }
}
