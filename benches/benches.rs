use criterion::{black_box, criterion_group, criterion_main, Criterion};
use iq_slurper::{
    buffers::{bytes_per_unit, plan, preallocate},
    complex::{deinterleave, ComplexFloat},
    device::{sim::SimPlatform, DeviceConfiguration, GainPolicy, Platform},
};
use rand::prelude::*;

const SAMPLES_PER_UNIT: usize = 262_144;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    let mut interleaved = vec![0f32; 2 * SAMPLES_PER_UNIT];
    rng.fill(&mut interleaved[..]);
    let mut unit = vec![ComplexFloat::default(); SAMPLES_PER_UNIT];

    c.bench_function("plan", |b| {
        b.iter(|| plan(black_box(4_000_000_000), bytes_per_unit(black_box(SAMPLES_PER_UNIT))))
    });

    c.bench_function("preallocate 64 units", |b| {
        b.iter(|| preallocate(black_box(64), black_box(SAMPLES_PER_UNIT)))
    });

    c.bench_function("deinterleave unit", |b| {
        b.iter(|| deinterleave(black_box(&interleaved), black_box(&mut unit)))
    });

    let platform = SimPlatform {
        max_pull: None,
        tone_offset_hz: 1e6,
    };
    let mut device = platform.open().unwrap();
    device
        .configure(&DeviceConfiguration {
            center_hz: 2.45e9,
            bandwidth_hz: 20e6,
            decimation: 1,
            gain: GainPolicy::Auto,
            samples_per_unit: SAMPLES_PER_UNIT,
            samples_per_packet: None,
        })
        .unwrap();
    device.start_stream().unwrap();
    c.bench_function("sim pull unit", |b| {
        b.iter(|| device.pull(black_box(&mut unit)).unwrap())
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
