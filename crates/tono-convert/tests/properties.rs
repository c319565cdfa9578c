//! Property-based tests for the conversion pipeline.

use proptest::prelude::*;
use tono_convert::{
    ChannelConverter, DataConverter, DataConverterConfig, ResampleAlgorithm, Resampler,
    ResamplerConfig, SincWindow,
};
use tono_core::channel::ChannelMap;
use tono_core::source::SourceFormat;

fn algorithm() -> impl Strategy<Value = ResampleAlgorithm> {
    prop_oneof![
        Just(ResampleAlgorithm::Linear),
        (2usize..=16).prop_map(|half| ResampleAlgorithm::Sinc {
            taps: half * 2,
            window: SincWindow::Hann,
        }),
        (2usize..=16).prop_map(|half| ResampleAlgorithm::Sinc {
            taps: half * 2,
            window: SincWindow::Blackman,
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// The accounting functions agree with what process actually does, for
    /// arbitrary rate pairs and kernels.
    #[test]
    fn accounting_matches_process(
        in_rate in 4_000u32..192_000,
        out_rate in 4_000u32..192_000,
        out_frames in 1usize..600,
        algorithm in algorithm(),
    ) {
        let config = ResamplerConfig { in_rate, out_rate, channels: 1, algorithm };
        let planner = Resampler::new(config).unwrap();
        let required = planner.required_input_frame_count(out_frames as u64) as usize;

        let mut live = Resampler::new(config).unwrap();
        let input = vec![0.5f32; required];
        let mut output = vec![0f32; out_frames];
        let (consumed, produced) = live.process(&input, &mut output).unwrap();
        prop_assert_eq!(produced, out_frames);
        prop_assert_eq!(consumed, required);

        // And the reverse direction stays within the documented bound.
        let expected = planner.expected_output_frame_count(required as u64);
        let ratio = f64::from(out_rate) / f64::from(in_rate);
        let bound = required as f64 * ratio + planner.lookahead_frames() as f64 + 1.0;
        prop_assert!(expected as f64 <= bound);
        prop_assert!(expected >= out_frames as u64);
    }

    /// Resampled output is always finite and bounded by the input peak for
    /// the linear kernel (a convex interpolation).
    #[test]
    fn linear_kernel_is_convex(
        input in prop::collection::vec(-1.0f32..=1.0, 32..512),
        out_rate in 8_000u32..96_000,
    ) {
        let mut resampler = Resampler::new(ResamplerConfig {
            in_rate: 48_000,
            out_rate,
            channels: 1,
            algorithm: ResampleAlgorithm::Linear,
        }).unwrap();
        let mut output = vec![0f32; 2048];
        let (_, produced) = resampler.process(&input, &mut output).unwrap();
        for &s in &output[..produced] {
            prop_assert!(s.is_finite());
            prop_assert!(s.abs() <= 1.0 + 1e-6);
        }
    }

    /// A weight matrix and its inverse permutation restore the input
    /// exactly for permutation matrices.
    #[test]
    fn permutation_matrix_roundtrip(frames in 1usize..64, swap in any::<bool>()) {
        let map = ChannelMap::standard(2).unwrap();
        let forward = if swap { vec![0.0, 1.0, 1.0, 0.0] } else { vec![1.0, 0.0, 0.0, 1.0] };
        let converter = ChannelConverter::with_matrix(map, map, forward.clone()).unwrap();
        let inverse = ChannelConverter::with_matrix(map, map, forward).unwrap();

        let input: Vec<f32> = (0..frames * 2).map(|i| (i as f32) * 0.01 - 0.5).collect();
        let mut mid = vec![0f32; frames * 2];
        let mut back = vec![0f32; frames * 2];
        converter.process(&input, &mut mid, frames).unwrap();
        inverse.process(&mid, &mut back, frames).unwrap();
        prop_assert_eq!(back, input);
    }

    /// Splitting the input into arbitrary chunks produces the same stream
    /// as one big call.
    #[test]
    fn chunked_conversion_equals_whole(split in 1usize..500) {
        let fmt_in = SourceFormat::f32(1, 44_100).unwrap();
        let fmt_out = SourceFormat::f32(1, 48_000).unwrap();
        let samples: Vec<f32> = (0..1000)
            .map(|i| libm::sinf(i as f32 * 0.05) * 0.9)
            .collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut whole = DataConverter::new(DataConverterConfig::new(fmt_in, fmt_out)).unwrap();
        let mut out_whole = vec![0u8; 2400 * 4];
        let (_, p_whole) = whole.process(&bytes, &mut out_whole).unwrap();

        let mut chunked = DataConverter::new(DataConverterConfig::new(fmt_in, fmt_out)).unwrap();
        let mut out_chunked = vec![0u8; 2400 * 4];
        let split_at = (split.min(999)) * 4;
        let (c1, p1) = chunked.process(&bytes[..split_at], &mut out_chunked).unwrap();
        prop_assert_eq!(c1 as usize * 4, split_at);
        let (_, p2) = chunked
            .process(&bytes[split_at..], &mut out_chunked[(p1 as usize) * 4..])
            .unwrap();

        let total = ((p1 + p2) as usize).min(p_whole as usize) * 4;
        prop_assert_eq!(&out_chunked[..total], &out_whole[..total]);
    }
}
