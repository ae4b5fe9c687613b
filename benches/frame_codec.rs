//! Frame codec benchmark suite.
//!
//! Measures how fast pipelined frames are reassembled:
//! - Payload sizes: 64 B, 4 KiB, 1 MiB
//! - Read chunk sizes: 1 KiB, 64 KiB
//!
//! Run with: cargo bench --bench frame_codec
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use guestlink::protocol::FrameDecoder;
use guestlink::protocol::frame;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[64, 4 * 1024, 1024 * 1024];
const CHUNK_SIZES: &[usize] = &[1024, 64 * 1024];

/// Bytes of encoded frames per iteration.
const STREAM_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Benchmark: Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for &size in PAYLOAD_SIZES {
        let payload = vec![b'a'; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| frame::encode(black_box(payload)).expect("encode"));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Pipelined Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for &size in PAYLOAD_SIZES {
        let stream = pipelined_stream(size);
        group.throughput(Throughput::Bytes(stream.len() as u64));

        for &chunk in CHUNK_SIZES {
            let id = format!("{size}B_payload_{chunk}B_reads");
            group.bench_with_input(BenchmarkId::new("pipelined", id), &stream, |b, stream| {
                b.iter(|| decode_all(black_box(stream), chunk));
            });
        }
    }

    group.finish();
}

// ============================================================================
// Helper Functions
// ============================================================================

fn pipelined_stream(payload_size: usize) -> Vec<u8> {
    let frame = frame::encode(&vec![b'x'; payload_size]).expect("encode");
    let count = (STREAM_BYTES / frame.len()).max(1);
    frame.repeat(count)
}

fn decode_all(stream: &[u8], chunk_size: usize) -> usize {
    let mut decoder = FrameDecoder::default();
    let mut frames = 0;
    for chunk in stream.chunks(chunk_size) {
        decoder.feed(chunk);
        while let Some(payload) = decoder.next_frame().expect("valid stream") {
            black_box(payload);
            frames += 1;
        }
    }
    frames
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
