//! Channel-count and layout conversion.
//!
//! A [`ChannelConverter`] maps N input channels to M output channels using
//! one of three modes: identity (same layout, straight copy), a standard
//! mixdown derived from channel positions, or a caller-supplied weight
//! matrix. The converter is built once and is stateless across `process`
//! calls.
//!
//! # Standard mixdown table
//!
//! Weights are derived at build time from the two channel maps:
//!
//! - Matching positions copy 1:1.
//! - Front-center folds into front-left/right at 0.707 (and the reverse
//!   for downmix to mono, giving stereo→mono = 0.707·L + 0.707·R).
//! - Back and side channels fold into the same-side front channel at 0.5,
//!   or into front-center at 0.5 when downmixing to mono.
//! - LFE is muted unless an explicit LFE mix gain is supplied.
//! - Any input position the table leaves unrouted is distributed equally
//!   across all non-LFE outputs at `1 / in_channels`.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use tono_core::channel::{ChannelMap, ChannelPosition};
use tono_core::result::{Error, Result};

/// How a [`ChannelConverter`] maps inputs to outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMixMode {
    /// Same layout in and out; process is a copy.
    Identity,
    /// Weights derived from the standard mixdown table.
    Mixdown,
    /// Caller-supplied N×M weight matrix.
    Matrix,
}

/// Stateless N→M channel converter.
pub struct ChannelConverter {
    in_map: ChannelMap,
    out_map: ChannelMap,
    mode: ChannelMixMode,
    /// Row-major `[out][in]` weights; empty in identity mode.
    weights: Vec<f32>,
}

impl ChannelConverter {
    /// Identity converter over a single layout.
    pub fn identity(map: ChannelMap) -> Self {
        Self {
            in_map: map,
            out_map: map,
            mode: ChannelMixMode::Identity,
            weights: Vec::new(),
        }
    }

    /// Standard mixdown between two layouts, LFE muted.
    pub fn mixdown(in_map: ChannelMap, out_map: ChannelMap) -> Self {
        Self::mixdown_with_lfe(in_map, out_map, 0.0)
    }

    /// Standard mixdown with the LFE input routed to every non-LFE output
    /// at `lfe_gain` instead of muted.
    pub fn mixdown_with_lfe(in_map: ChannelMap, out_map: ChannelMap, lfe_gain: f32) -> Self {
        if in_map == out_map {
            return Self::identity(in_map);
        }
        let weights = build_mixdown_weights(&in_map, &out_map, lfe_gain);
        Self {
            in_map,
            out_map,
            mode: ChannelMixMode::Mixdown,
            weights,
        }
    }

    /// Explicit weight matrix, row-major `[out][in]`. The matrix length
    /// must be `in_map.len() * out_map.len()`.
    pub fn with_matrix(in_map: ChannelMap, out_map: ChannelMap, weights: Vec<f32>) -> Result<Self> {
        if weights.len() != in_map.len() * out_map.len() {
            return Err(Error::InvalidArgs);
        }
        Ok(Self {
            in_map,
            out_map,
            mode: ChannelMixMode::Matrix,
            weights,
        })
    }

    /// Input channel count.
    pub fn in_channels(&self) -> u16 {
        self.in_map.len() as u16
    }

    /// Output channel count.
    pub fn out_channels(&self) -> u16 {
        self.out_map.len() as u16
    }

    /// The conversion mode chosen at build time.
    pub fn mode(&self) -> ChannelMixMode {
        self.mode
    }

    /// Weight applied from input channel `i` to output channel `o`.
    /// Identity mode reports 1 on the diagonal.
    pub fn weight(&self, o: usize, i: usize) -> f32 {
        match self.mode {
            ChannelMixMode::Identity => {
                if o == i {
                    1.0
                } else {
                    0.0
                }
            }
            _ => self.weights[o * self.in_map.len() + i],
        }
    }

    /// Converts `frames` frames from `input` into `output`.
    ///
    /// `input` must hold `frames * in_channels` samples and `output`
    /// `frames * out_channels`; anything else is [`Error::InvalidArgs`].
    pub fn process(&self, input: &[f32], output: &mut [f32], frames: usize) -> Result<()> {
        let ic = self.in_map.len();
        let oc = self.out_map.len();
        if input.len() < frames * ic || output.len() < frames * oc {
            return Err(Error::InvalidArgs);
        }

        if self.mode == ChannelMixMode::Identity {
            output[..frames * oc].copy_from_slice(&input[..frames * ic]);
            return Ok(());
        }

        // Output channels outermost: each pass reads one weight row
        // sequentially and strides the output by a constant.
        for o in 0..oc {
            let row = &self.weights[o * ic..(o + 1) * ic];
            for f in 0..frames {
                let frame = &input[f * ic..(f + 1) * ic];
                let mut acc = 0.0f32;
                for (sample, w) in frame.iter().zip(row.iter()) {
                    acc += *sample * *w;
                }
                output[f * oc + o] = acc;
            }
        }
        Ok(())
    }
}

/// Pair weight from the standard table, exclusive of exact matches and LFE.
fn fold_weight(src: ChannelPosition, dst: ChannelPosition) -> f32 {
    use ChannelPosition::{BackLeft, BackRight, FrontCenter, FrontLeft, FrontRight, SideLeft, SideRight};
    match (src, dst) {
        // Center fans out to the front pair, and the front pair folds down
        // to center, both at -3 dB.
        (FrontCenter, FrontLeft | FrontRight) | (FrontLeft | FrontRight, FrontCenter) => {
            core::f32::consts::FRAC_1_SQRT_2
        }
        // Surrounds fold into the same-side front at half gain.
        (BackLeft | SideLeft, FrontLeft) | (BackRight | SideRight, FrontRight) => 0.5,
        // Downmix to mono routes surrounds through center.
        (BackLeft | BackRight | SideLeft | SideRight, FrontCenter) => 0.5,
        _ => 0.0,
    }
}

fn build_mixdown_weights(in_map: &ChannelMap, out_map: &ChannelMap, lfe_gain: f32) -> Vec<f32> {
    let ic = in_map.len();
    let oc = out_map.len();
    let mut weights = vec![0.0f32; ic * oc];

    for (i, src) in in_map.positions().iter().enumerate() {
        if src.is_lfe() {
            if lfe_gain != 0.0 {
                for (o, dst) in out_map.positions().iter().enumerate() {
                    if !dst.is_lfe() {
                        weights[o * ic + i] = lfe_gain;
                    }
                }
            }
            continue;
        }

        // Exact position match wins outright.
        if let Some(o) = out_map.find(*src) {
            weights[o * ic + i] = 1.0;
            continue;
        }

        // Fold by the documented table.
        let mut routed = false;
        for (o, dst) in out_map.positions().iter().enumerate() {
            let w = fold_weight(*src, *dst);
            if w != 0.0 {
                weights[o * ic + i] = w;
                routed = true;
            }
        }

        // Fallback for layouts outside the table: rectangular average
        // across every non-LFE output.
        if !routed {
            let spread = 1.0 / ic as f32;
            for (o, dst) in out_map.positions().iter().enumerate() {
                if !dst.is_lfe() {
                    weights[o * ic + i] = spread;
                }
            }
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    const INV_SQRT2: f32 = core::f32::consts::FRAC_1_SQRT_2;

    #[test]
    fn identity_is_bit_exact() {
        let map = ChannelMap::standard(2).unwrap();
        let converter = ChannelConverter::identity(map);
        let input = [0.1f32, -0.9, 0.5, 0.25];
        let mut output = [0f32; 4];
        converter.process(&input, &mut output, 2).unwrap();
        assert_eq!(input, output);
        assert_eq!(converter.mode(), ChannelMixMode::Identity);
    }

    #[test]
    fn matching_maps_collapse_to_identity() {
        let map = ChannelMap::standard(6).unwrap();
        let converter = ChannelConverter::mixdown(map, map);
        assert_eq!(converter.mode(), ChannelMixMode::Identity);
    }

    #[test]
    fn stereo_to_mono_weights() {
        let converter = ChannelConverter::mixdown(
            ChannelMap::standard(2).unwrap(),
            ChannelMap::standard(1).unwrap(),
        );
        assert!((converter.weight(0, 0) - INV_SQRT2).abs() < 1e-6);
        assert!((converter.weight(0, 1) - INV_SQRT2).abs() < 1e-6);

        let input = [1.0f32, 1.0];
        let mut output = [0f32; 1];
        converter.process(&input, &mut output, 1).unwrap();
        assert!((output[0] - 2.0 * INV_SQRT2).abs() < 1e-6);
    }

    #[test]
    fn five_one_to_stereo_follows_table() {
        // 5.1 order: FL FR FC LFE BL BR.
        let converter = ChannelConverter::mixdown(
            ChannelMap::standard(6).unwrap(),
            ChannelMap::standard(2).unwrap(),
        );
        // FL/FR copy.
        assert_eq!(converter.weight(0, 0), 1.0);
        assert_eq!(converter.weight(1, 1), 1.0);
        // Center at -3 dB into both.
        assert!((converter.weight(0, 2) - INV_SQRT2).abs() < 1e-6);
        assert!((converter.weight(1, 2) - INV_SQRT2).abs() < 1e-6);
        // LFE muted.
        assert_eq!(converter.weight(0, 3), 0.0);
        assert_eq!(converter.weight(1, 3), 0.0);
        // Surrounds at half gain, same side only.
        assert_eq!(converter.weight(0, 4), 0.5);
        assert_eq!(converter.weight(1, 4), 0.0);
        assert_eq!(converter.weight(1, 5), 0.5);
    }

    #[test]
    fn lfe_gain_routes_lfe() {
        let converter = ChannelConverter::mixdown_with_lfe(
            ChannelMap::standard(6).unwrap(),
            ChannelMap::standard(2).unwrap(),
            0.25,
        );
        assert_eq!(converter.weight(0, 3), 0.25);
        assert_eq!(converter.weight(1, 3), 0.25);
    }

    #[test]
    fn mono_to_stereo_fans_out() {
        let converter = ChannelConverter::mixdown(
            ChannelMap::standard(1).unwrap(),
            ChannelMap::standard(2).unwrap(),
        );
        let input = [0.8f32];
        let mut output = [0f32; 2];
        converter.process(&input, &mut output, 1).unwrap();
        assert!((output[0] - 0.8 * INV_SQRT2).abs() < 1e-6);
        assert_eq!(output[0], output[1]);
    }

    #[test]
    fn unrouted_positions_use_rectangular_average() {
        use ChannelPosition::{Aux, FrontLeft, FrontRight};
        // Aux channels have no table entry; they spread at 1/in_channels.
        let in_map =
            ChannelMap::from_positions(&[FrontLeft, FrontRight, Aux(0), Aux(1)]).unwrap();
        let out_map = ChannelMap::standard(2).unwrap();
        let converter = ChannelConverter::mixdown(in_map, out_map);
        assert_eq!(converter.weight(0, 2), 0.25);
        assert_eq!(converter.weight(1, 2), 0.25);
        assert_eq!(converter.weight(0, 3), 0.25);
    }

    #[test]
    fn matrix_mode_applies_given_weights() {
        let in_map = ChannelMap::standard(2).unwrap();
        let out_map = ChannelMap::standard(2).unwrap();
        // Swap channels.
        let converter =
            ChannelConverter::with_matrix(in_map, out_map, vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        let input = [0.25f32, -0.75];
        let mut output = [0f32; 2];
        converter.process(&input, &mut output, 1).unwrap();
        assert_eq!(output, [-0.75, 0.25]);
    }

    #[test]
    fn matrix_length_is_checked() {
        let map = ChannelMap::standard(2).unwrap();
        assert!(ChannelConverter::with_matrix(map, map, vec![1.0; 3]).is_err());
    }

    #[test]
    fn short_buffers_are_rejected() {
        let converter = ChannelConverter::identity(ChannelMap::standard(2).unwrap());
        let input = [0f32; 2];
        let mut output = [0f32; 2];
        assert!(converter.process(&input, &mut output, 2).is_err());
    }
}
