//! Property-based tests for tono-core primitives.
//!
//! Covers the ring-buffer fill invariant across arbitrary operation
//! histories, sample-format round-trip error bounds, and channel-map
//! construction.

use proptest::prelude::*;
use tono_core::format::{decode_to_f32, encode_from_f32};
use tono_core::{ChannelMap, SampleFormat, byte_ring};

/// One step of a random ring history.
#[derive(Debug, Clone)]
enum RingOp {
    Write(usize),
    Read(usize),
    SeekRead(usize),
    SeekWrite(usize),
}

/// One step of a random overwrite history.
#[derive(Debug, Clone)]
enum OverwriteOp {
    Write(Vec<u8>),
    Overwrite(Vec<u8>),
    Read(usize),
}

fn ring_op() -> impl Strategy<Value = RingOp> {
    prop_oneof![
        (1usize..64).prop_map(RingOp::Write),
        (1usize..64).prop_map(RingOp::Read),
        (0usize..32).prop_map(RingOp::SeekRead),
        (0usize..32).prop_map(RingOp::SeekWrite),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// For any history of writes, reads, and seeks, the committed byte
    /// count stays within `[0, capacity]` and both halves agree on it.
    #[test]
    fn ring_fill_invariant(ops in prop::collection::vec(ring_op(), 1..200)) {
        let (mut producer, mut consumer) = byte_ring(64).unwrap();
        let capacity = producer.capacity();
        let mut model_fill = 0usize;

        for op in ops {
            match op {
                RingOp::Write(n) => {
                    let src = vec![0xA5u8; n];
                    let written = producer.write(&src);
                    prop_assert!(written <= capacity - model_fill);
                    model_fill += written;
                }
                RingOp::Read(n) => {
                    let mut dst = vec![0u8; n];
                    let read = consumer.read(&mut dst);
                    prop_assert!(read <= model_fill);
                    model_fill -= read;
                }
                RingOp::SeekRead(n) => {
                    if consumer.seek(n).is_ok() {
                        model_fill -= n;
                    }
                }
                RingOp::SeekWrite(n) => {
                    if producer.seek(n).is_ok() {
                        model_fill += n;
                    }
                }
            }

            let fill = producer.pointer_distance();
            prop_assert_eq!(fill, model_fill);
            prop_assert_eq!(consumer.pointer_distance(), model_fill);
            prop_assert!(fill <= capacity);
        }
    }

    /// Ring payload comes out in the order and with the bytes it went in,
    /// regardless of how reads and writes interleave.
    #[test]
    fn ring_is_fifo(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..48), 1..32)) {
        let (mut producer, mut consumer) = byte_ring(256).unwrap();
        let mut sent: Vec<u8> = Vec::new();
        let mut received: Vec<u8> = Vec::new();

        for chunk in &chunks {
            let written = producer.write(chunk);
            sent.extend_from_slice(&chunk[..written]);

            let mut dst = vec![0u8; 32];
            let read = consumer.read(&mut dst);
            received.extend_from_slice(&dst[..read]);
        }

        let mut dst = vec![0u8; 256];
        let read = consumer.read(&mut dst);
        received.extend_from_slice(&dst[..read]);

        prop_assert_eq!(received, sent);
    }

    /// Overwrite writes agree with a deque model: the oldest bytes make
    /// room, the newest always land.
    #[test]
    fn overwrite_matches_deque_model(
        ops in prop::collection::vec(
            prop_oneof![
                prop::collection::vec(any::<u8>(), 1..32).prop_map(OverwriteOp::Write),
                prop::collection::vec(any::<u8>(), 1..48).prop_map(OverwriteOp::Overwrite),
                (1usize..32).prop_map(OverwriteOp::Read),
            ],
            1..100,
        ),
    ) {
        let (mut producer, mut consumer) = byte_ring(32).unwrap();
        let capacity = producer.capacity();
        let mut model: std::collections::VecDeque<u8> = std::collections::VecDeque::new();

        for op in ops {
            match op {
                OverwriteOp::Write(src) => {
                    let written = producer.write(&src);
                    prop_assert_eq!(written, src.len().min(capacity - model.len()));
                    model.extend(&src[..written]);
                }
                OverwriteOp::Overwrite(src) => {
                    let (written, dropped) = producer.write_overwrite(&src);
                    // No consumer grant is live here, so the newest bytes
                    // always land and exactly the deficit is dropped.
                    let kept = &src[src.len() - src.len().min(capacity)..];
                    let deficit =
                        (kept.len() + model.len()).saturating_sub(capacity);
                    prop_assert_eq!(written, kept.len());
                    prop_assert_eq!(dropped, deficit + (src.len() - kept.len()));
                    for _ in 0..deficit.min(model.len()) {
                        model.pop_front();
                    }
                    model.extend(kept);
                }
                OverwriteOp::Read(n) => {
                    let mut dst = vec![0u8; n];
                    let read = consumer.read(&mut dst);
                    prop_assert_eq!(read, n.min(model.len()));
                    for byte in &dst[..read] {
                        prop_assert_eq!(Some(*byte), model.pop_front());
                    }
                }
            }
            prop_assert_eq!(producer.pointer_distance(), model.len());
        }

        let mut rest = vec![0u8; capacity];
        let read = consumer.read(&mut rest);
        prop_assert_eq!(read, model.len());
        let tail: Vec<u8> = model.into_iter().collect();
        prop_assert_eq!(&rest[..read], &tail[..]);
    }

    /// `f32 → u8 → f32` stays within one part in 255.
    #[test]
    fn u8_roundtrip_bound(x in -1.0f32..=1.0) {
        let mut byte = [0u8; 1];
        encode_from_f32(SampleFormat::U8, &[x], &mut byte).unwrap();
        let mut back = [0f32; 1];
        decode_to_f32(SampleFormat::U8, &byte, &mut back).unwrap();
        prop_assert!((back[0] - x).abs() <= 1.0 / 255.0);
    }

    /// `f32 → s16 → f32` stays within one part in 32768.
    #[test]
    fn s16_roundtrip_bound(x in -1.0f32..=1.0) {
        let mut bytes = [0u8; 2];
        encode_from_f32(SampleFormat::S16, &[x], &mut bytes).unwrap();
        let mut back = [0f32; 1];
        decode_to_f32(SampleFormat::S16, &bytes, &mut back).unwrap();
        prop_assert!((back[0] - x).abs() <= 1.0 / 32768.0);
    }

    /// `f32 → s24 → f32` stays within one part in 2^23.
    #[test]
    fn s24_roundtrip_bound(x in -1.0f32..=1.0) {
        let mut bytes = [0u8; 3];
        encode_from_f32(SampleFormat::S24, &[x], &mut bytes).unwrap();
        let mut back = [0f32; 1];
        decode_to_f32(SampleFormat::S24, &bytes, &mut back).unwrap();
        prop_assert!((back[0] - x).abs() <= 1.0 / 8_388_608.0);
    }

    /// Standard maps always have the requested channel count.
    #[test]
    fn standard_map_length(channels in 1u16..=16) {
        let map = ChannelMap::standard(channels).unwrap();
        prop_assert_eq!(map.len(), channels as usize);
    }
}
