//! Criterion benchmarks for the hpfeeds binary codec.
//!
//! Measures encode and decode latency for the frames that dominate broker
//! traffic: PUBLISH at a range of payload sizes, plus the handshake frames.
//!
//! Run with:
//! ```bash
//! cargo bench --package hpfeeds-core --bench codec_bench
//! ```

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hpfeeds_core::protocol::{
    compute_digest, decode_frame, encode_frame, Frame, DEFAULT_MAX_FRAME_SIZE,
};

// ── Frame fixtures ────────────────────────────────────────────────────────────

fn make_publish(payload_len: usize) -> Frame {
    Frame::Publish {
        ident: "sensor-01".to_string(),
        channel: "dionaea.capture".to_string(),
        payload: Bytes::from(vec![0x5A; payload_len]),
    }
}

fn make_auth() -> Frame {
    Frame::Auth {
        ident: "sensor-01".to_string(),
        digest: compute_digest(&[1, 2, 3, 4], b"benchmark-secret"),
    }
}

fn make_info() -> Frame {
    Frame::Info {
        name: "hpfeeds".to_string(),
        nonce: Bytes::from_static(&[1, 2, 3, 4]),
    }
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    for size in [0usize, 256, 4096, 65536] {
        let frame = make_publish(size);
        let encoded = encode_frame(&frame).expect("encode");
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, f| {
            b.iter(|| encode_frame(black_box(f)).expect("encode"))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, bytes| {
            b.iter(|| decode_frame(black_box(bytes), DEFAULT_MAX_FRAME_SIZE).expect("decode"))
        });
    }
    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let info = encode_frame(&make_info()).expect("encode");
    let auth = encode_frame(&make_auth()).expect("encode");

    c.bench_function("decode_info", |b| {
        b.iter(|| decode_frame(black_box(&info), DEFAULT_MAX_FRAME_SIZE).expect("decode"))
    });
    c.bench_function("decode_auth", |b| {
        b.iter(|| decode_frame(black_box(&auth), DEFAULT_MAX_FRAME_SIZE).expect("decode"))
    });
    c.bench_function("compute_digest", |b| {
        b.iter(|| compute_digest(black_box(&[9, 8, 7, 6]), black_box(b"benchmark-secret")))
    });
}

criterion_group!(benches, bench_publish, bench_handshake);
criterion_main!(benches);
