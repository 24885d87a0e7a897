//! In this module, we implement all the monitoring logic for a capture.
//! The engine only ever calls [`ProgressReporter`] methods. Rate estimation and the
//! progress bar live on the far side of a bounded channel, in their own thread.

use std::io::Write;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info};
use tracing_subscriber::fmt::MakeWriter;

/// How often the elapsed time on the bar ticks
const TICK: Duration = Duration::from_millis(100);
/// Events buffered between the capture thread and the monitor
const CHANNEL_CAPACITY: usize = 1024;
const TEMPLATE: &str =
    "Capturing... {bar:30.cyan/blue} {percent:>3}% ({msg}, {per_sec}) {elapsed_precise}";

/// Receives capture progress from the engine
pub trait ProgressReporter {
    /// Called once per session, before streaming, with the number of samples expected
    fn on_capture_planned(&mut self, _total_samples: u64) {}

    fn on_unit_complete(&mut self, samples_in_unit: usize);
}

/// Reporter that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReporter;

impl ProgressReporter for NoReporter {
    fn on_unit_complete(&mut self, _samples_in_unit: usize) {}
}

/// Adapts a closure into a reporter
pub struct FnReporter<F>(pub F);

impl<F: FnMut(usize)> ProgressReporter for FnReporter<F> {
    fn on_unit_complete(&mut self, samples_in_unit: usize) {
        (self.0)(samples_in_unit)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent {
    Planned { total_samples: u64 },
    UnitComplete { samples: usize, at: Instant },
}

/// Forwards events to a [`RateMonitor`] without ever blocking
pub struct ChannelReporter {
    sender: Sender<ProgressEvent>,
}

impl ProgressReporter for ChannelReporter {
    fn on_capture_planned(&mut self, total_samples: u64) {
        let _ = self.sender.try_send(ProgressEvent::Planned { total_samples });
    }

    fn on_unit_complete(&mut self, samples_in_unit: usize) {
        // A full or closed channel only costs us a progress update
        let _ = self.sender.try_send(ProgressEvent::UnitComplete {
            samples: samples_in_unit,
            at: Instant::now(),
        });
    }
}

/// Cumulative samples over elapsed wall time
#[derive(Debug, Clone, Copy)]
pub struct RateEstimator {
    start: Instant,
    samples: u64,
}

impl RateEstimator {
    pub fn new(start: Instant) -> Self {
        Self { start, samples: 0 }
    }

    pub fn record(&mut self, samples: usize) {
        self.samples += samples as u64;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Samples per second as of `now`
    pub fn rate(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        if elapsed > 0.0 {
            self.samples as f64 / elapsed
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateSummary {
    pub total_samples: u64,
    pub samples: u64,
    pub elapsed: Duration,
    pub samples_per_second: f64,
}

/// Owns the thread that drives the capture progress bar
pub struct RateMonitor {
    handle: JoinHandle<RateSummary>,
}

impl RateMonitor {
    /// Start a monitor drawing into `progress`, or drawing nothing when `None`.
    /// The returned reporter goes to the engine; the monitor finishes once it is dropped.
    pub fn spawn(progress: Option<&MultiProgress>) -> (Self, ChannelReporter) {
        let bar = match progress {
            Some(multi) => {
                let bar = multi.add(ProgressBar::new(0));
                bar.set_style(
                    ProgressStyle::with_template(TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.enable_steady_tick(TICK);
                bar
            }
            None => ProgressBar::hidden(),
        };
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        let handle = thread::spawn(move || monitor(receiver, bar));
        (Self { handle }, ChannelReporter { sender })
    }

    pub fn join(self) -> Option<RateSummary> {
        self.handle.join().ok()
    }
}

fn monitor(receiver: Receiver<ProgressEvent>, bar: ProgressBar) -> RateSummary {
    let start = Instant::now();
    let mut estimator = RateEstimator::new(start);
    let mut total_samples = 0;
    let mut last_event = start;
    for event in receiver {
        match event {
            ProgressEvent::Planned { total_samples: n } => {
                total_samples = n;
                bar.set_length(n);
            }
            ProgressEvent::UnitComplete { samples, at } => {
                estimator.record(samples);
                last_event = at;
                bar.inc(samples as u64);
                bar.set_message(format!("{:.2} megasamples/second", estimator.rate(at) / 1e6));
            }
        }
    }
    bar.finish();
    let summary = RateSummary {
        total_samples,
        samples: estimator.samples(),
        elapsed: last_event.duration_since(start),
        samples_per_second: estimator.rate(last_event),
    };
    debug!(?summary, "Monitor finished");
    info!(
        "Captured {} samples @ {:.2} megasamples/second",
        summary.samples,
        summary.samples_per_second / 1e6
    );
    summary
}

/// Log writer that hides every progress bar in `progress` while a line is written,
/// so log events land above the bar instead of inside it
#[derive(Clone)]
pub struct SuspendingWriter {
    progress: MultiProgress,
}

impl SuspendingWriter {
    pub fn new(progress: MultiProgress) -> Self {
        Self { progress }
    }
}

impl<'a> MakeWriter<'a> for SuspendingWriter {
    type Writer = SuspendedLine;

    fn make_writer(&'a self) -> Self::Writer {
        SuspendedLine {
            progress: self.progress.clone(),
            line: Vec::new(),
        }
    }
}

/// One formatted event, written to stderr when dropped
pub struct SuspendedLine {
    progress: MultiProgress,
    line: Vec<u8>,
}

impl Write for SuspendedLine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for SuspendedLine {
    fn drop(&mut self) {
        if self.line.is_empty() {
            return;
        }
        let line = &self.line;
        self.progress.suspend(|| {
            let _ = std::io::stderr().write_all(line);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_estimator() {
        let start = Instant::now();
        let mut est = RateEstimator::new(start);
        est.record(1_000);
        est.record(1_000);
        assert_eq!(2_000, est.samples());
        let rate = est.rate(start + Duration::from_secs(2));
        assert!((rate - 1_000.0).abs() < 1e-9);
        assert_eq!(0.0, est.rate(start));
    }

    #[test]
    fn test_monitor_counts_events_and_stops_when_reporter_dropped() {
        let (monitor, mut reporter) = RateMonitor::spawn(None);
        reporter.on_capture_planned(300);
        for _ in 0..3 {
            reporter.on_unit_complete(100);
        }
        drop(reporter);
        let summary = monitor.join().unwrap();
        assert_eq!(300, summary.total_samples);
        assert_eq!(300, summary.samples);
    }

    #[test]
    fn test_monitor_drives_a_visible_bar() {
        let multi = MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        let (monitor, mut reporter) = RateMonitor::spawn(Some(&multi));
        reporter.on_capture_planned(50);
        reporter.on_unit_complete(25);
        reporter.on_unit_complete(25);
        drop(reporter);
        assert_eq!(50, monitor.join().unwrap().samples);
    }

    #[test]
    fn test_reporter_survives_a_dead_monitor() {
        let (sender, receiver) = bounded(1);
        drop(receiver);
        let mut reporter = ChannelReporter { sender };
        reporter.on_capture_planned(10);
        reporter.on_unit_complete(10);
        reporter.on_unit_complete(10);
    }

    #[test]
    fn test_suspended_line_buffers_until_drop() {
        let writer = SuspendingWriter::new(MultiProgress::with_draw_target(
            indicatif::ProgressDrawTarget::hidden(),
        ));
        let mut line = writer.make_writer();
        line.write_all(b"WARN sample loss\n").unwrap();
        assert_eq!(b"WARN sample loss\n".as_slice(), line.line.as_slice());
    }
}
