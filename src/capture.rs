//! This module contains all the capture logic
//!
//! A capture session walks `Idle -> Opening -> Configuring -> Streaming -> Draining ->
//! Closed`, or ends in `Faulted`. The open device lives in a [`DeviceGuard`] so it is
//! closed exactly once on every path out of [`CaptureEngine::run_capture`], including
//! panics in a hook or reporter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::buffers::{bytes_per_unit, plan, preallocate, CaptureUnit, Timestamp};
use crate::config::Section;
use crate::device::{Device, DeviceConfiguration, FieldWarning, Platform, PullError};
use crate::error::CaptureError;
use crate::monitoring::{NoReporter, ProgressReporter};
use crate::quantize::{Identity, QuantizationHook};
use crate::resolve::{resolve, ResolveWarning};

/// Consecutive pulls allowed to make no progress before the stream is declared faulted
pub const DEFAULT_MAX_STALLED_PULLS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Configuring,
    Streaming,
    Draining,
    Closed,
    Faulted,
}

/// Operator interrupt, observed between pulls. A cancellation applies to the session in
/// progress, or to the next one if none is running, and is cleared when that session ends.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a cancellation once the session it stopped has ended
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRequest {
    pub center_hz: f64,
    pub bandwidth_hz: f64,
    pub byte_budget: i64,
}

/// Anything the operator was warned about during a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionWarning {
    Resolve(ResolveWarning),
    Field(FieldWarning),
}

/// The state and output of one capture
#[derive(Debug)]
pub struct CaptureSession {
    state: SessionState,
    request: CaptureRequest,
    config: Option<DeviceConfiguration>,
    unit_count: usize,
    units: Vec<CaptureUnit>,
    units_filled: usize,
    cancelled: bool,
    warnings: Vec<SessionWarning>,
    fault: Option<CaptureError>,
}

impl CaptureSession {
    fn new(request: CaptureRequest) -> Self {
        Self {
            state: SessionState::Idle,
            request,
            config: None,
            unit_count: 0,
            units: Vec::new(),
            units_filled: 0,
            cancelled: false,
            warnings: Vec::new(),
            fault: None,
        }
    }

    fn enter(&mut self, state: SessionState) {
        debug!(from = ?self.state, to = ?state, "Capture state");
        self.state = state;
    }

    /// Terminal failure. Partial data is never handed out.
    fn into_faulted(mut self, e: CaptureError) -> Self {
        debug!(error = %e, "Session faulted");
        self.enter(SessionState::Faulted);
        self.units = Vec::new();
        self.units_filled = 0;
        self.fault = Some(e);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn request(&self) -> &CaptureRequest {
        &self.request
    }

    /// The configuration handed to the device, once resolved
    pub fn config(&self) -> Option<&DeviceConfiguration> {
        self.config.as_ref()
    }

    pub fn effective_bandwidth_hz(&self) -> Option<f64> {
        self.config.as_ref().map(|c| c.bandwidth_hz)
    }

    pub fn samples_per_unit(&self) -> Option<usize> {
        self.config.as_ref().map(|c| c.samples_per_unit)
    }

    pub fn unit_count(&self) -> usize {
        self.unit_count
    }

    pub fn units(&self) -> &[CaptureUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<CaptureUnit> {
        self.units
    }

    pub fn units_filled(&self) -> usize {
        self.units_filled
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn warnings(&self) -> &[SessionWarning] {
        &self.warnings
    }

    pub fn fault(&self) -> Option<&CaptureError> {
        self.fault.as_ref()
    }

    /// `Ok` with the units for a closed session, the fault otherwise
    pub fn outcome(&self) -> Result<&[CaptureUnit], &CaptureError> {
        match &self.fault {
            Some(e) => Err(e),
            None => Ok(&self.units),
        }
    }
}

/// Exclusive owner of an open device; closes it at most once
struct DeviceGuard {
    device: Option<Box<dyn Device>>,
}

impl DeviceGuard {
    fn new(device: Box<dyn Device>) -> Self {
        Self {
            device: Some(device),
        }
    }

    fn device(&mut self) -> &mut dyn Device {
        self.device
            .as_deref_mut()
            .expect("device used after release")
    }

    fn release(&mut self) {
        if let Some(device) = self.device.take() {
            match device.close() {
                Ok(()) => debug!("Device closed"),
                Err(e) => warn!("Failed to close device cleanly: {e}"),
            }
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct StreamEnd {
    filled: usize,
    cancelled: bool,
}

/// Drives one platform through capture sessions
pub struct CaptureEngine<'a> {
    platform: &'a dyn Platform,
    settings: Section,
    reporter: Box<dyn ProgressReporter + 'a>,
    hook: Box<dyn QuantizationHook + 'a>,
    cancel: CancelToken,
    max_stalled_pulls: usize,
}

impl<'a> CaptureEngine<'a> {
    /// `settings` is the platform's persisted section
    pub fn new(platform: &'a dyn Platform, settings: Section) -> Self {
        Self {
            platform,
            settings,
            reporter: Box::new(NoReporter),
            hook: Box::new(Identity),
            cancel: CancelToken::new(),
            max_stalled_pulls: DEFAULT_MAX_STALLED_PULLS,
        }
    }

    pub fn with_reporter(mut self, reporter: impl ProgressReporter + 'a) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn with_hook(mut self, hook: impl QuantizationHook + 'a) -> Self {
        self.hook = Box::new(hook);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_stalled_pulls(mut self, n: usize) -> Self {
        self.max_stalled_pulls = n.max(1);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Capture `byte_budget` bytes worth of units. The returned session is either
    /// `Closed` or `Faulted`.
    pub fn run_capture(
        &mut self,
        center_hz: f64,
        bandwidth_hz: f64,
        byte_budget: i64,
    ) -> CaptureSession {
        let session = self.run_session(center_hz, bandwidth_hz, byte_budget);
        self.cancel.reset();
        session
    }

    fn run_session(
        &mut self,
        center_hz: f64,
        bandwidth_hz: f64,
        byte_budget: i64,
    ) -> CaptureSession {
        let mut session = CaptureSession::new(CaptureRequest {
            center_hz,
            bandwidth_hz,
            byte_budget,
        });

        let limits = self.platform.limits();
        let resolved = match resolve(center_hz, bandwidth_hz, &self.settings, &limits) {
            Ok(r) => r,
            Err(e) => return session.into_faulted(e.into()),
        };
        session
            .warnings
            .extend(resolved.warnings.into_iter().map(SessionWarning::Resolve));
        let config = resolved.config;
        let spu = config.samples_per_unit;
        session.unit_count = plan(byte_budget, bytes_per_unit(spu));
        session.units = preallocate(session.unit_count, spu);
        self.reporter
            .on_capture_planned(session.unit_count as u64 * spu as u64);
        info!(
            platform = self.platform.name(),
            center_mhz = config.center_hz / 1e6,
            bandwidth_mhz = config.bandwidth_hz / 1e6,
            decimation = config.decimation,
            "Capturing {} units of {} samples",
            session.unit_count,
            spu
        );
        session.config = Some(config.clone());

        session.enter(SessionState::Opening);
        let mut guard = match self.platform.open() {
            Ok(device) => DeviceGuard::new(device),
            Err(e) => return session.into_faulted(e.into()),
        };

        session.enter(SessionState::Configuring);
        match guard.device().configure(&config) {
            Ok(warnings) => session
                .warnings
                .extend(warnings.into_iter().map(SessionWarning::Field)),
            Err(e) => {
                guard.release();
                return session.into_faulted(e.into());
            }
        }
        if let Err(e) = guard.device().start_stream() {
            guard.release();
            return session.into_faulted(e.into());
        }

        session.enter(SessionState::Streaming);
        let started = Instant::now();
        let streamed = self.stream(guard.device(), &mut session.units, spu);

        session.enter(SessionState::Draining);
        if let Err(e) = guard.device().stop_stream() {
            warn!("Failed to stop the stream: {e}");
        }
        let end = match streamed {
            Ok(end) => end,
            Err(e) => {
                guard.release();
                return session.into_faulted(e);
            }
        };
        session.units_filled = end.filled;
        session.cancelled = end.cancelled;
        log_summary(&session.units[..end.filled], started);

        let quantized = self.hook.quantize(&session.units);
        guard.release();
        if let Err(e) = quantized {
            return session.into_faulted(e.into());
        }
        session.enter(SessionState::Closed);
        session
    }

    /// Fill `units` in order, one slot at a time
    fn stream(
        &mut self,
        device: &mut dyn Device,
        units: &mut [CaptureUnit],
        spu: usize,
    ) -> Result<StreamEnd, CaptureError> {
        let mut previous: Option<Timestamp> = None;
        for (index, unit) in units.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Capture cancelled after {index} units");
                return Ok(StreamEnd {
                    filled: index,
                    cancelled: true,
                });
            }
            let timestamp = match self.fill_unit(device, unit, index, spu)? {
                Some(ts) => ts,
                None => {
                    info!("Capture cancelled while filling unit {index}");
                    return Ok(StreamEnd {
                        filled: index,
                        cancelled: true,
                    });
                }
            };
            unit.mark_complete(timestamp);
            if let Some(prev) = previous {
                if timestamp < prev {
                    warn!(
                        unit = index,
                        "Device timestamp went backwards ({} < {})",
                        timestamp.as_secs_f64(),
                        prev.as_secs_f64()
                    );
                }
            }
            previous = Some(timestamp);
            self.reporter.on_unit_complete(spu);
        }
        Ok(StreamEnd {
            filled: units.len(),
            cancelled: self.cancel.is_cancelled(),
        })
    }

    /// Pull until `unit` holds `spu` samples. Short reads continue at the current offset;
    /// reported sample loss restarts the unit. Returns the timestamp of the unit's first
    /// sample, or `None` if the operator cancelled while the device was stalling.
    fn fill_unit(
        &mut self,
        device: &mut dyn Device,
        unit: &mut CaptureUnit,
        index: usize,
        spu: usize,
    ) -> Result<Option<Timestamp>, CaptureError> {
        let mut offset = 0;
        let mut first_sample_at = Timestamp::default();
        let mut stalled = 0;
        let mut restarts = 0;
        loop {
            let outcome = device.pull(unit.fill_from(offset));
            let last_error = match outcome {
                Ok(pulled) if pulled.samples > 0 => {
                    if offset == 0 {
                        first_sample_at = pulled.timestamp;
                    }
                    offset += pulled.samples.min(spu - offset);
                    stalled = 0;
                    if offset == spu {
                        return Ok(Some(first_sample_at));
                    }
                    trace!(unit = index, offset, "Short read, continuing");
                    continue;
                }
                Ok(_) => PullError::Timeout,
                Err(PullError::Fatal(e)) => {
                    return Err(CaptureError::StreamFault {
                        unit: index,
                        source: PullError::Fatal(e),
                    })
                }
                Err(PullError::SampleLoss(msg)) => {
                    warn!(unit = index, offset, "Sample loss ({msg}), restarting unit");
                    unit.reset();
                    offset = 0;
                    restarts += 1;
                    PullError::SampleLoss(msg)
                }
                Err(PullError::Timeout) => PullError::Timeout,
            };
            stalled += 1;
            if stalled >= self.max_stalled_pulls || restarts >= self.max_stalled_pulls {
                return Err(CaptureError::StreamFault {
                    unit: index,
                    source: last_error,
                });
            }
            if self.cancel.is_cancelled() {
                unit.reset();
                return Ok(None);
            }
        }
    }
}

fn log_summary(filled: &[CaptureUnit], started: Instant) {
    let (first, last) = match (filled.first(), filled.last()) {
        (Some(f), Some(l)) => (f.timestamp(), l.timestamp()),
        _ => {
            info!("No units captured");
            return;
        }
    };
    let samples: usize = filled.iter().map(|u| u.samples().len()).sum();
    let elapsed = started.elapsed().as_secs_f64();
    info!(
        "Captured {} units ({} samples) from {} to {} in {:.2}s",
        filled.len(),
        samples,
        first.to_epoch(),
        last.to_epoch(),
        elapsed
    );
}
