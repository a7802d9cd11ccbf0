//! Envelope codec benchmarks: serialize + seal + compress across
//! representative payload sizes.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use simurgh::{Envelope, EnvelopeCodec, FrameKind};

fn envelope(size: usize) -> Envelope {
    Envelope {
        kind: FrameKind::Request,
        shard_id: 42,
        event: "register_health_update".to_string(),
        payload: (0..size).map(|i| (i % 251) as u8).collect(),
        source_host: "127.0.0.1".to_string(),
        source_port: 7000,
    }
}

fn bench_encode(c: &mut Criterion) {
    let codec = EnvelopeCodec::new("benchmark-secret");

    let mut group = c.benchmark_group("encode");
    for size in [64usize, 1024, 16384] {
        let message = envelope(size);
        group.bench_function(format!("{size}b"), |b| {
            b.iter(|| codec.encode(black_box(&message)).unwrap())
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let codec = EnvelopeCodec::new("benchmark-secret");

    let mut group = c.benchmark_group("decode");
    for size in [64usize, 1024, 16384] {
        let encoded = codec.encode(&envelope(size)).unwrap();
        group.bench_function(format!("{size}b"), |b| {
            b.iter(|| codec.decode(black_box(&encoded)).unwrap())
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let codec = EnvelopeCodec::new("benchmark-secret");
    let message = envelope(1024);

    c.bench_function("round_trip_1k", |b| {
        b.iter(|| {
            let encoded = codec.encode(black_box(&message)).unwrap();
            codec.decode(&encoded).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_round_trip);
criterion_main!(benches);
