//! Capture unit preallocation
//!
//! Every unit is allocated at full size before the stream starts so the pull loop never
//! grows a buffer.

use crate::complex::ComplexFloat;

/// Bytes a single complex sample is budgeted at when sizing a capture
pub const BYTES_PER_COMPLEX_SAMPLE: u64 = 16;
/// Bytes of timestamp stored alongside every unit
pub const TIMESTAMP_OVERHEAD_BYTES: u64 = 8;

/// Device clock time, seconds and nanoseconds since the UNIX epoch
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Split fractional seconds (as reported by UHD) into whole seconds and nanoseconds
    pub fn from_parts(full_secs: i64, frac_secs: f64) -> Self {
        let nanos = (frac_secs * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
        Self::new(full_secs, nanos)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.nanos as f64 / 1e9
    }

    /// Signed nanoseconds from `earlier` to `self`
    pub fn nanos_since(&self, earlier: Timestamp) -> i64 {
        (self.secs - earlier.secs) * 1_000_000_000 + self.nanos as i64 - earlier.nanos as i64
    }

    pub fn to_epoch(&self) -> hifitime::Epoch {
        hifitime::Epoch::from_unix_seconds(self.as_secs_f64())
    }
}

/// One fixed-size, timestamped chunk of contiguous IQ samples
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureUnit {
    samples: Vec<ComplexFloat>,
    timestamp: Timestamp,
    complete: bool,
}

impl CaptureUnit {
    fn empty(samples_per_unit: usize) -> Self {
        Self {
            samples: vec![ComplexFloat::default(); samples_per_unit],
            timestamp: Timestamp::default(),
            complete: false,
        }
    }

    pub fn samples(&self) -> &[ComplexFloat] {
        &self.samples
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Writable view from `offset`, only while the unit is being filled
    pub(crate) fn fill_from(&mut self, offset: usize) -> &mut [ComplexFloat] {
        debug_assert!(!self.complete, "completed units are immutable");
        &mut self.samples[offset..]
    }

    pub(crate) fn mark_complete(&mut self, timestamp: Timestamp) {
        self.timestamp = timestamp;
        self.complete = true;
    }

    /// Drop whatever a partial fill left behind
    pub(crate) fn reset(&mut self) {
        debug_assert!(!self.complete, "completed units are immutable");
        self.samples.fill(ComplexFloat::default());
        self.timestamp = Timestamp::default();
    }
}

/// Bytes one unit accounts for in the capture budget
pub fn bytes_per_unit(samples_per_unit: usize) -> u64 {
    samples_per_unit as u64 * BYTES_PER_COMPLEX_SAMPLE + TIMESTAMP_OVERHEAD_BYTES
}

/// How many units a byte budget needs, `ceil(byte_budget / bytes_per_unit)`.
/// Non-positive budgets need none.
pub fn plan(byte_budget: i64, bytes_per_unit: u64) -> usize {
    assert!(bytes_per_unit > 0, "bytes_per_unit must be positive");
    if byte_budget <= 0 {
        return 0;
    }
    (byte_budget as u64).div_ceil(bytes_per_unit) as usize
}

/// Allocate `unit_count` empty units, each already holding `samples_per_unit` samples
pub fn preallocate(unit_count: usize, samples_per_unit: usize) -> Vec<CaptureUnit> {
    (0..unit_count)
        .map(|_| CaptureUnit::empty(samples_per_unit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_single_bb60_unit() {
        let bpu = bytes_per_unit(262_144);
        assert_eq!(4_194_312, bpu);
        assert_eq!(1, plan(1_000_000, bpu));
    }

    #[test]
    fn test_plan_is_ceiling() {
        assert_eq!(1, plan(1, 10));
        assert_eq!(1, plan(10, 10));
        assert_eq!(2, plan(11, 10));
        assert_eq!(400, plan(4_000, 10));
    }

    #[test]
    fn test_nanos_since_crosses_second() {
        let a = Timestamp::new(10, 999_999_500);
        let b = Timestamp::new(11, 500);
        assert_eq!(1_000, b.nanos_since(a));
        assert_eq!(-1_000, a.nanos_since(b));
        assert_eq!(Timestamp::new(3, 250_000_000), Timestamp::from_parts(3, 0.25));
    }

    #[test]
    fn test_plan_matches_ceil_for_random_inputs() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let budget: i64 = rng.gen_range(-1_000_000..10_000_000_000);
            let bpu: u64 = rng.gen_range(1..10_000_000);
            let expected = if budget <= 0 {
                0
            } else {
                let budget = budget as u64;
                (budget / bpu + u64::from(budget % bpu != 0)) as usize
            };
            let got = plan(budget, bpu);
            assert_eq!(expected, got, "budget {budget} bpu {bpu}");
            assert_eq!(got == 0, budget <= 0);
        }
    }

    #[test]
    fn test_non_positive_budget_needs_no_units() {
        assert_eq!(0, plan(0, 100));
        assert_eq!(0, plan(-5, 100));
    }

    #[test]
    fn test_preallocate_sizes_every_unit() {
        let units = preallocate(3, 128);
        assert_eq!(3, units.len());
        assert!(units.iter().all(|u| u.samples().len() == 128 && !u.is_complete()));
    }

    #[test]
    fn test_timestamp_ordering_and_conversion() {
        let a = Timestamp::new(10, 999_999_999);
        let b = Timestamp::new(11, 0);
        assert!(a < b);
        assert!((Timestamp::new(1, 500_000_000).as_secs_f64() - 1.5).abs() < 1e-12);
        assert_eq!(Timestamp::new(3, 250_000_000), Timestamp::from_parts(3, 0.25));
    }

    #[test]
    fn test_reset_clears_partial_fill() {
        let mut units = preallocate(1, 4);
        units[0].fill_from(2)[0] = ComplexFloat::new(1.0, 1.0);
        units[0].reset();
        assert!(units[0].samples().iter().all(|s| *s == ComplexFloat::default()));
    }
}
