//! Throughput benchmarks for the SPSC ring and the sample codec.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tono_core::format::{decode_to_f32, encode_from_f32};
use tono_core::{SampleFormat, byte_ring};

fn ring_write_read(c: &mut Criterion) {
    let (mut producer, mut consumer) = byte_ring(8192).unwrap();
    let src = vec![0x5Au8; 4096];
    let mut dst = vec![0u8; 4096];

    c.bench_function("ring_write_read_4k", |b| {
        b.iter(|| {
            let written = producer.write(black_box(&src));
            let read = consumer.read(black_box(&mut dst));
            black_box((written, read));
        });
    });
}

fn sample_codec(c: &mut Criterion) {
    let samples: Vec<f32> = (0..4096).map(|i| ((i % 255) as f32) / 127.5 - 1.0).collect();
    let mut s16 = vec![0u8; 4096 * 2];
    let mut back = vec![0f32; 4096];

    c.bench_function("s16_encode_decode_4k", |b| {
        b.iter(|| {
            encode_from_f32(SampleFormat::S16, black_box(&samples), &mut s16).unwrap();
            decode_to_f32(SampleFormat::S16, black_box(&s16), &mut back).unwrap();
        });
    });
}

criterion_group!(benches, ring_write_read, sample_codec);
criterion_main!(benches);
