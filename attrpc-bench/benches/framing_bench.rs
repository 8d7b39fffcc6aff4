//! Framing, reassembly and envelope benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use attrpc_protocol::{frame, Envelope, PrefixedEnvelope, Reassembler, Reassembly, VarintEnvelope};

/// Payload with a marker or escape byte every few positions.
fn create_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 7) as u8).collect()
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [20, 244, 4096] {
        let payload = create_payload(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(frame::encode(payload)));
        });
    }

    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [20, 244, 4096] {
        let encoded = frame::encode(&create_payload(size));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(frame::decode(encoded).unwrap()));
        });
    }

    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");

    // Fragment sizes for the default and a large negotiated MTU.
    for unit in [20, 244] {
        let encoded = frame::encode(&create_payload(4096));
        let fragments: Vec<_> = encoded.chunks(unit).map(|c| c.to_vec()).collect();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(unit),
            &fragments,
            |b, fragments| {
                let mut reassembler = Reassembler::new();
                b.iter(|| {
                    for fragment in fragments {
                        if let Reassembly::Complete(framed) = reassembler.push(fragment).unwrap() {
                            black_box(framed);
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_correlation_id");
    let payload = create_payload(244);

    let prefixed = PrefixedEnvelope.seal(0x0102_0304, &payload);
    group.bench_function("prefixed", |b| {
        b.iter(|| black_box(PrefixedEnvelope.correlation_id(&prefixed)));
    });

    // Id placed after a length-delimited field so extraction has to skip it.
    let mut varint = vec![0x12, 100];
    varint.extend_from_slice(&payload[..100]);
    varint.extend_from_slice(&VarintEnvelope.seal(0x0102_0304, &[]));
    group.bench_function("varint", |b| {
        b.iter(|| black_box(VarintEnvelope.correlation_id(&varint)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_reassembly,
    bench_envelope,
);

criterion_main!(benches);
