//! The composed data converter.
//!
//! [`DataConverter`] chains the three conversion stages into one streaming
//! unit: decode to `f32`, remix channels, resample, remix again, encode to
//! the output format. The channel stages are placed so the resampler always
//! runs at `min(in_channels, out_channels)` — downmix before resampling,
//! upmix after.
//!
//! An identity configuration (same format, channels, rate, and map) is
//! detected at build time and collapses to a straight byte copy.
//!
//! Processing is chunked through scratch buffers sized at construction;
//! `process` itself never allocates.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use tono_core::format::{SampleFormat, decode_to_f32, encode_from_f32};
use tono_core::result::{Error, Result};
use tono_core::source::SourceFormat;

use crate::channels::ChannelConverter;
use crate::resampler::{ResampleAlgorithm, Resampler, ResamplerConfig};

/// Frames moved through the scratch buffers per internal pass.
const CHUNK_FRAMES: usize = 512;

/// Configuration for a [`DataConverter`].
#[derive(Debug, Clone, Copy)]
pub struct DataConverterConfig {
    /// Format of the bytes handed to `process` as input.
    pub in_format: SourceFormat,
    /// Format of the bytes `process` writes as output.
    pub out_format: SourceFormat,
    /// Kernel used when the rates differ.
    pub resample_algorithm: ResampleAlgorithm,
}

impl DataConverterConfig {
    /// A converter config with the default sinc kernel.
    pub fn new(in_format: SourceFormat, out_format: SourceFormat) -> Self {
        Self {
            in_format,
            out_format,
            resample_algorithm: ResampleAlgorithm::sinc_default(),
        }
    }
}

/// Streaming format/channel/rate converter.
pub struct DataConverter {
    in_format: SourceFormat,
    out_format: SourceFormat,
    /// Identity composition; process is a byte copy.
    passthrough: bool,
    /// Downmix applied before the resampler.
    pre: Option<ChannelConverter>,
    /// Upmix (or same-count remap) applied after the resampler.
    post: Option<ChannelConverter>,
    resampler: Option<Resampler>,
    mid_channels: usize,
    /// Scratch: decoded input chunk, `CHUNK_FRAMES * in_channels`.
    decoded: Vec<f32>,
    /// Scratch: after pre-mix, `CHUNK_FRAMES * mid_channels`.
    pre_mixed: Vec<f32>,
    /// Scratch: after resample, `CHUNK_FRAMES * mid_channels`.
    resampled: Vec<f32>,
    /// Scratch: after post-mix, `CHUNK_FRAMES * out_channels`.
    post_mixed: Vec<f32>,
}

impl DataConverter {
    /// Builds the conversion pipeline for a config.
    pub fn new(config: DataConverterConfig) -> Result<Self> {
        let input = config.in_format;
        let output = config.out_format;
        if input.channels == 0
            || output.channels == 0
            || input.sample_rate == 0
            || output.sample_rate == 0
        {
            return Err(Error::InvalidArgs);
        }

        let passthrough = input == output;
        let in_ch = input.channels as usize;
        let out_ch = output.channels as usize;
        let mid_channels = in_ch.min(out_ch);

        let (pre, post) = if passthrough || input.channel_map == output.channel_map {
            (None, None)
        } else if out_ch < in_ch {
            (
                Some(ChannelConverter::mixdown(
                    input.channel_map,
                    output.channel_map,
                )),
                None,
            )
        } else {
            (
                None,
                Some(ChannelConverter::mixdown(
                    input.channel_map,
                    output.channel_map,
                )),
            )
        };

        let resampler = if passthrough || input.sample_rate == output.sample_rate {
            None
        } else {
            Some(Resampler::new(ResamplerConfig {
                in_rate: input.sample_rate,
                out_rate: output.sample_rate,
                channels: mid_channels as u16,
                algorithm: config.resample_algorithm,
            })?)
        };

        Ok(Self {
            in_format: input,
            out_format: output,
            passthrough,
            pre,
            post,
            resampler,
            mid_channels,
            decoded: vec![0.0; CHUNK_FRAMES * in_ch],
            pre_mixed: vec![0.0; CHUNK_FRAMES * mid_channels],
            resampled: vec![0.0; CHUNK_FRAMES * mid_channels],
            post_mixed: vec![0.0; CHUNK_FRAMES * out_ch],
        })
    }

    /// The input format.
    pub fn in_format(&self) -> SourceFormat {
        self.in_format
    }

    /// The output format.
    pub fn out_format(&self) -> SourceFormat {
        self.out_format
    }

    /// Whether the configuration collapsed to a byte copy.
    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Resampler lookahead in input frames; zero when rates match.
    pub fn lookahead_frames(&self) -> u64 {
        self.resampler.as_ref().map_or(0, Resampler::lookahead_frames)
    }

    /// Clears streaming state (resampler phase and history).
    pub fn reset(&mut self) {
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
    }

    /// Input frames needed, from the current phase, to produce
    /// `out_frames` output frames.
    pub fn required_input_frame_count(&self, out_frames: u64) -> u64 {
        match &self.resampler {
            Some(r) => r.required_input_frame_count(out_frames),
            None => out_frames,
        }
    }

    /// Output frames producible, from the current phase, given `in_frames`
    /// input frames.
    pub fn expected_output_frame_count(&self, in_frames: u64) -> u64 {
        match &self.resampler {
            Some(r) => r.expected_output_frame_count(in_frames),
            None => in_frames,
        }
    }

    /// Converts bytes in the input format into bytes in the output format.
    ///
    /// Both slices must hold whole frames of their respective formats.
    /// Returns `(in_frames_consumed, out_frames_produced)`; either side may
    /// stop the conversion short.
    pub fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<(u64, u64)> {
        let in_bpf = self.in_format.bytes_per_frame();
        let out_bpf = self.out_format.bytes_per_frame();
        if input.len() % in_bpf != 0 || output.len() % out_bpf != 0 {
            return Err(Error::InvalidArgs);
        }
        let in_total = input.len() / in_bpf;
        let out_total = output.len() / out_bpf;

        if self.passthrough {
            let n = in_total.min(out_total);
            output[..n * out_bpf].copy_from_slice(&input[..n * in_bpf]);
            return Ok((n as u64, n as u64));
        }

        let in_ch = self.in_format.channels as usize;
        let out_ch = self.out_format.channels as usize;
        let mid = self.mid_channels;

        let mut consumed = 0usize;
        let mut produced = 0usize;
        loop {
            let in_take = CHUNK_FRAMES.min(in_total - consumed);
            let out_room = CHUNK_FRAMES.min(out_total - produced);
            if out_room == 0 {
                break;
            }

            // Stage 1: decode to f32. try_cast_slice is the aligned fast
            // path for f32 input; misaligned byte slices fall back to the
            // copying decoder.
            let decoded: &[f32] = if self.in_format.format == SampleFormat::F32 {
                match bytemuck::try_cast_slice(&input[consumed * in_bpf..(consumed + in_take) * in_bpf]) {
                    Ok(slice) => slice,
                    Err(_) => {
                        decode_to_f32(
                            SampleFormat::F32,
                            &input[consumed * in_bpf..(consumed + in_take) * in_bpf],
                            &mut self.decoded[..in_take * in_ch],
                        )?;
                        &self.decoded[..in_take * in_ch]
                    }
                }
            } else {
                decode_to_f32(
                    self.in_format.format,
                    &input[consumed * in_bpf..(consumed + in_take) * in_bpf],
                    &mut self.decoded[..in_take * in_ch],
                )?;
                &self.decoded[..in_take * in_ch]
            };

            // Stage 2: pre-mix down to the resampling channel count.
            let pre_mixed: &[f32] = if let Some(pre) = &self.pre {
                pre.process(decoded, &mut self.pre_mixed[..in_take * mid], in_take)?;
                &self.pre_mixed[..in_take * mid]
            } else {
                decoded
            };

            // Stage 3: resample.
            let (chunk_consumed, chunk_mid_frames, mid_slice): (usize, usize, &[f32]) =
                if let Some(resampler) = &mut self.resampler {
                    let (c, p) =
                        resampler.process(pre_mixed, &mut self.resampled[..out_room * mid])?;
                    (c, p, &self.resampled[..p * mid])
                } else {
                    let n = in_take.min(out_room);
                    (n, n, &pre_mixed[..n * mid])
                };

            // Stage 4: post-mix up to the output channel count.
            let post_mixed: &[f32] = if let Some(post) = &self.post {
                post.process(
                    mid_slice,
                    &mut self.post_mixed[..chunk_mid_frames * out_ch],
                    chunk_mid_frames,
                )?;
                &self.post_mixed[..chunk_mid_frames * out_ch]
            } else {
                mid_slice
            };

            // Stage 5: encode. The only clamping stage in the pipeline.
            encode_from_f32(
                self.out_format.format,
                post_mixed,
                &mut output[produced * out_bpf..(produced + chunk_mid_frames) * out_bpf],
            )?;

            consumed += chunk_consumed;
            produced += chunk_mid_frames;
            if chunk_consumed == 0 && chunk_mid_frames == 0 {
                break;
            }
        }

        Ok((consumed as u64, produced as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tono_core::channel::ChannelMap;

    fn f32_format(channels: u16, rate: u32) -> SourceFormat {
        SourceFormat::f32(channels, rate).unwrap()
    }

    fn format(sample: SampleFormat, channels: u16, rate: u32) -> SourceFormat {
        SourceFormat {
            format: sample,
            channels,
            sample_rate: rate,
            channel_map: ChannelMap::standard(channels).unwrap(),
        }
    }

    fn to_bytes(samples: &[f32]) -> Vec<u8> {
        let mut bytes = vec![0u8; samples.len() * 4];
        encode_from_f32(SampleFormat::F32, samples, &mut bytes).unwrap();
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Vec<f32> {
        let mut samples = vec![0.0f32; bytes.len() / 4];
        decode_to_f32(SampleFormat::F32, bytes, &mut samples).unwrap();
        samples
    }

    #[test]
    fn identity_collapses_to_copy() {
        let fmt = f32_format(2, 48_000);
        let mut converter = DataConverter::new(DataConverterConfig::new(fmt, fmt)).unwrap();
        assert!(converter.is_passthrough());

        let input = to_bytes(&[0.1, 0.2, 0.3, 0.4]);
        let mut output = vec![0u8; input.len()];
        let (c, p) = converter.process(&input, &mut output).unwrap();
        assert_eq!((c, p), (2, 2));
        assert_eq!(input, output);
    }

    #[test]
    fn format_only_conversion() {
        let mut converter = DataConverter::new(DataConverterConfig::new(
            format(SampleFormat::S16, 1, 48_000),
            f32_format(1, 48_000),
        ))
        .unwrap();
        assert!(!converter.is_passthrough());

        // 0.5 in s16.
        let half = 16384i16.to_le_bytes();
        let input = [half[0], half[1]];
        let mut output = vec![0u8; 4];
        let (c, p) = converter.process(&input, &mut output).unwrap();
        assert_eq!((c, p), (1, 1));
        let out = from_bytes(&output);
        assert!((out[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn stereo_to_mono_while_resampling_runs_mono() {
        // in 2ch@48k -> out 1ch@24k: the pre stage downmixes so the
        // resampler only sees one channel.
        let mut converter = DataConverter::new(DataConverterConfig {
            in_format: f32_format(2, 48_000),
            out_format: f32_format(1, 24_000),
            resample_algorithm: ResampleAlgorithm::Linear,
        })
        .unwrap();
        assert!(converter.pre.is_some());
        assert!(converter.post.is_none());
        assert_eq!(
            converter.resampler.as_ref().unwrap().channels(),
            1,
            "resampler must run at min(in, out) channels"
        );

        let input: Vec<f32> = (0..256).flat_map(|_| [0.5f32, 0.5]).collect();
        let input = to_bytes(&input);
        let mut output = vec![0u8; 256 * 4];
        let (_, p) = converter.process(&input, &mut output).unwrap();
        assert!(p > 0);
        let out = from_bytes(&output[..(p as usize) * 4]);
        // 0.5 downmixed at 2 * 0.707 then resampled: constant signal.
        for (i, s) in out.iter().enumerate().skip(4) {
            assert!((s - 0.7071).abs() < 1e-3, "sample {i}: {s}");
        }
    }

    #[test]
    fn mono_to_stereo_upmix_happens_after_resample() {
        let mut converter = DataConverter::new(DataConverterConfig {
            in_format: f32_format(1, 24_000),
            out_format: f32_format(2, 48_000),
            resample_algorithm: ResampleAlgorithm::Linear,
        })
        .unwrap();
        assert!(converter.pre.is_none());
        assert!(converter.post.is_some());
        assert_eq!(converter.resampler.as_ref().unwrap().channels(), 1);

        let input = to_bytes(&vec![0.5f32; 256]);
        let mut output = vec![0u8; 1024 * 8];
        let (_, p) = converter.process(&input, &mut output).unwrap();
        assert!(p > 0);
        let out = from_bytes(&output[..(p as usize) * 8]);
        for frame in out.chunks(2).skip(4) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn accounting_delegates_to_resampler() {
        let converter = DataConverter::new(DataConverterConfig {
            in_format: f32_format(1, 44_100),
            out_format: f32_format(1, 48_000),
            resample_algorithm: ResampleAlgorithm::sinc_default(),
        })
        .unwrap();
        let required = converter.required_input_frame_count(480);
        let ratio: f64 = 44_100.0 / 48_000.0;
        let ceil = (480.0 * ratio).ceil() as u64;
        assert!(required >= ceil + converter.lookahead_frames() - 1);
        assert!(required <= ceil + converter.lookahead_frames() + 1);

        let no_resample =
            DataConverter::new(DataConverterConfig::new(f32_format(1, 48_000), format(SampleFormat::S16, 1, 48_000)))
                .unwrap();
        assert_eq!(no_resample.required_input_frame_count(128), 128);
        assert_eq!(no_resample.expected_output_frame_count(128), 128);
    }

    #[test]
    fn large_streams_chunk_correctly() {
        // More than CHUNK_FRAMES to force several internal passes.
        let mut converter = DataConverter::new(DataConverterConfig::new(
            f32_format(1, 48_000),
            format(SampleFormat::S16, 1, 48_000),
        ))
        .unwrap();
        let samples: Vec<f32> = (0..2000).map(|i| ((i % 100) as f32) / 100.0 - 0.5).collect();
        let input = to_bytes(&samples);
        let mut output = vec![0u8; 2000 * 2];
        let (c, p) = converter.process(&input, &mut output).unwrap();
        assert_eq!((c, p), (2000, 2000));

        let mut back = vec![0.0f32; 2000];
        decode_to_f32(SampleFormat::S16, &output, &mut back).unwrap();
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 1.0 / 32768.0);
        }
    }

    #[test]
    fn short_output_stops_conversion() {
        let mut converter = DataConverter::new(DataConverterConfig::new(
            f32_format(1, 48_000),
            format(SampleFormat::S16, 1, 48_000),
        ))
        .unwrap();
        let input = to_bytes(&vec![0.1f32; 100]);
        let mut output = vec![0u8; 40 * 2];
        let (c, p) = converter.process(&input, &mut output).unwrap();
        assert_eq!((c, p), (40, 40));
    }

    #[test]
    fn ragged_byte_lengths_are_rejected() {
        let mut converter = DataConverter::new(DataConverterConfig::new(
            f32_format(2, 48_000),
            f32_format(2, 48_000),
        ))
        .unwrap();
        let input = vec![0u8; 12]; // 1.5 stereo f32 frames
        let mut output = vec![0u8; 16];
        assert!(converter.process(&input, &mut output).is_err());
    }
}
