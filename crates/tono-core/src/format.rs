//! Sample formats and the per-sample codec to and from `f32`.
//!
//! The engine carries `f32` internally; every other format exists only at
//! the edges (backend-native buffers, data-source native formats). The
//! codec here is the single place sample scaling happens, and the only
//! place output is clamped to format range.
//!
//! Scaling is symmetric around zero with rounding on encode, so a
//! round trip through any integer format stays within half a quantization
//! step (`1/255` for `u8`, `1/65534` for `s16`, and so on).

use crate::result::{Error, Result};

/// PCM sample formats supported at the engine edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Unsigned 8-bit, offset-binary around 128.
    U8,
    /// Signed 16-bit little-endian.
    S16,
    /// Signed 24-bit little-endian, packed (3 bytes per sample).
    S24,
    /// Signed 32-bit little-endian.
    S32,
    /// 32-bit float little-endian. The canonical intermediate form.
    F32,
}

impl SampleFormat {
    /// Size of one sample in bytes.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S24 => 3,
            Self::S32 | Self::F32 => 4,
        }
    }

    /// Size of one frame (one sample per channel) in bytes.
    pub const fn bytes_per_frame(self, channels: u16) -> usize {
        self.bytes_per_sample() * channels as usize
    }

    /// Short stable name for log messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S24 => "s24",
            Self::S32 => "s32",
            Self::F32 => "f32",
        }
    }
}

impl core::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[inline]
fn clamp_unit(x: f32) -> f32 {
    x.clamp(-1.0, 1.0)
}

#[inline]
fn round_scaled(x: f32, scale: f32) -> i64 {
    // Round half away from zero, in f64 so the s32 scale stays exact.
    let v = f64::from(x) * f64::from(scale);
    if v >= 0.0 {
        (v + 0.5) as i64
    } else {
        (v - 0.5) as i64
    }
}

/// Decodes interleaved samples of `format` from `src` into `dst`.
///
/// `src` must hold exactly `dst.len()` samples in `format`; anything else is
/// [`Error::InvalidArgs`]. `F32` input is a byte-for-byte copy.
pub fn decode_to_f32(format: SampleFormat, src: &[u8], dst: &mut [f32]) -> Result<()> {
    let bps = format.bytes_per_sample();
    if src.len() != dst.len() * bps {
        return Err(Error::InvalidArgs);
    }
    match format {
        SampleFormat::U8 => {
            for (out, byte) in dst.iter_mut().zip(src.iter()) {
                *out = (f32::from(*byte) - 127.5) / 127.5;
            }
        }
        SampleFormat::S16 => {
            for (out, bytes) in dst.iter_mut().zip(src.chunks_exact(2)) {
                let s = i16::from_le_bytes([bytes[0], bytes[1]]);
                *out = f32::from(s) / 32767.0;
            }
        }
        SampleFormat::S24 => {
            for (out, bytes) in dst.iter_mut().zip(src.chunks_exact(3)) {
                // Sign-extend the packed 24-bit value through the top byte.
                let s = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
                *out = s as f32 / 8_388_607.0;
            }
        }
        SampleFormat::S32 => {
            for (out, bytes) in dst.iter_mut().zip(src.chunks_exact(4)) {
                let s = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                *out = (f64::from(s) / 2_147_483_647.0) as f32;
            }
        }
        SampleFormat::F32 => {
            for (out, bytes) in dst.iter_mut().zip(src.chunks_exact(4)) {
                *out = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
        }
    }
    Ok(())
}

/// Encodes interleaved `f32` samples into `dst` in `format`.
///
/// Values outside `[-1, 1]` are clamped here; this is the only clamping
/// stage in the engine. `dst` must hold exactly `src.len()` samples in
/// `format`.
pub fn encode_from_f32(format: SampleFormat, src: &[f32], dst: &mut [u8]) -> Result<()> {
    let bps = format.bytes_per_sample();
    if dst.len() != src.len() * bps {
        return Err(Error::InvalidArgs);
    }
    match format {
        SampleFormat::U8 => {
            for (byte, x) in dst.iter_mut().zip(src.iter()) {
                // Offset-binary: quantize around the same 127.5 center the
                // decoder divides by, or the round trip drifts a full step.
                *byte = round_scaled(clamp_unit(*x) + 1.0, 127.5).clamp(0, 255) as u8;
            }
        }
        SampleFormat::S16 => {
            for (bytes, x) in dst.chunks_exact_mut(2).zip(src.iter()) {
                let s = round_scaled(clamp_unit(*x), 32767.0) as i16;
                bytes.copy_from_slice(&s.to_le_bytes());
            }
        }
        SampleFormat::S24 => {
            for (bytes, x) in dst.chunks_exact_mut(3).zip(src.iter()) {
                let s = round_scaled(clamp_unit(*x), 8_388_607.0) as i32;
                let le = s.to_le_bytes();
                bytes.copy_from_slice(&le[..3]);
            }
        }
        SampleFormat::S32 => {
            for (bytes, x) in dst.chunks_exact_mut(4).zip(src.iter()) {
                let s = round_scaled(clamp_unit(*x), 2_147_483_647.0)
                    .clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                bytes.copy_from_slice(&s.to_le_bytes());
            }
        }
        SampleFormat::F32 => {
            for (bytes, x) in dst.chunks_exact_mut(4).zip(src.iter()) {
                bytes.copy_from_slice(&x.to_le_bytes());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(format: SampleFormat, x: f32) -> f32 {
        let mut bytes = [0u8; 4];
        let dst = &mut bytes[..format.bytes_per_sample()];
        encode_from_f32(format, &[x], dst).unwrap();
        let mut out = [0f32; 1];
        decode_to_f32(format, dst, &mut out).unwrap();
        out[0]
    }

    #[test]
    fn sizes() {
        assert_eq!(SampleFormat::U8.bytes_per_sample(), 1);
        assert_eq!(SampleFormat::S24.bytes_per_sample(), 3);
        assert_eq!(SampleFormat::F32.bytes_per_frame(2), 8);
        assert_eq!(SampleFormat::S24.bytes_per_frame(6), 18);
    }

    #[test]
    fn u8_roundtrip_within_half_step() {
        for i in 0..=200 {
            let x = (i as f32) / 100.0 - 1.0;
            let err = (roundtrip(SampleFormat::U8, x) - x).abs();
            assert!(err <= 1.0 / 255.0, "x={x} err={err}");
        }
    }

    #[test]
    fn s16_roundtrip_within_half_step() {
        for i in 0..=2000 {
            let x = (i as f32) / 1000.0 - 1.0;
            let err = (roundtrip(SampleFormat::S16, x) - x).abs();
            assert!(err <= 1.0 / 32768.0, "x={x} err={err}");
        }
    }

    #[test]
    fn s24_sign_extension() {
        // -1.0 encodes to 0x800001 in packed bytes and decodes back negative.
        let mut bytes = [0u8; 3];
        encode_from_f32(SampleFormat::S24, &[-1.0], &mut bytes).unwrap();
        let mut out = [0f32; 1];
        decode_to_f32(SampleFormat::S24, &bytes, &mut out).unwrap();
        assert!((out[0] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn clamping_happens_on_encode() {
        assert!((roundtrip(SampleFormat::S16, 2.5) - 1.0).abs() < 1e-4);
        assert!((roundtrip(SampleFormat::S16, -2.5) + 1.0).abs() < 1e-4);
    }

    #[test]
    fn f32_is_bit_exact() {
        let x = 0.123456789_f32;
        assert_eq!(roundtrip(SampleFormat::F32, x), x);
    }

    #[test]
    fn length_mismatch_is_invalid_args() {
        let mut out = [0f32; 2];
        assert_eq!(
            decode_to_f32(SampleFormat::S16, &[0, 0], &mut out),
            Err(Error::InvalidArgs)
        );
    }
}
