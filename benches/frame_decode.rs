//! Benchmarks for feed frame decoding
//!
//! Covers the per-frame cost paid on every relay push:
//! - `decode` on grids of increasing size
//! - `FrameDecoder::ingest` alternating good and rejected frames
//!
//! Run with `--features benchmark`.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use kartwall::protocol::{FrameDecoder, decode};
use kartwall::test_utils::sample_frame;
use std::hint::black_box;

fn bench_decode_grid_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frame");

    for drivers in [1usize, 12, 40] {
        let frame = sample_frame(drivers);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(drivers), &frame, |b, frame| {
            b.iter(|| black_box(decode(black_box(frame))))
        });
    }

    group.finish();
}

fn bench_decoder_with_rejections(c: &mut Criterion) {
    let good = sample_frame(12);
    let wrapped = format!("\u{feff}cb({good});");
    let bad = "{\"D\":[{\"N\":\"trunc";

    c.bench_function("decoder_ingest_mixed", |b| {
        let mut decoder = FrameDecoder::new();
        b.iter(|| {
            let _ = black_box(decoder.ingest(black_box(&good)));
            let _ = black_box(decoder.ingest(black_box(bad)));
            let _ = black_box(decoder.ingest(black_box(&wrapped)));
        })
    });
}

criterion_group!(benches, bench_decode_grid_sizes, bench_decoder_with_rejections);
criterion_main!(benches);
