//! Deterministic white-noise source.
//!
//! [`Noise`] produces uniform white noise from a seeded linear congruential
//! generator. Two instances with the same seed emit identical streams,
//! which is what makes the engine's mixing and conversion tests exact.

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

use crate::channel::MAX_CHANNELS;
use crate::format::encode_from_f32;
use crate::result::{Error, Result};
use crate::source::{DataSource, SourceFormat};

/// Configuration for a [`Noise`] source.
#[derive(Debug, Clone, Copy)]
pub struct NoiseConfig {
    /// Native format the generator encodes into.
    pub format: SourceFormat,
    /// Peak amplitude, usually in `(0, 1]`.
    pub amplitude: f64,
    /// Seed for the per-instance generator state.
    pub seed: u32,
}

/// Seeded uniform white noise. Infinite, not seekable.
pub struct Noise {
    config: NoiseConfig,
    state: u32,
    cursor: u64,
}

impl Noise {
    /// Creates a noise source.
    pub fn new(config: NoiseConfig) -> Result<Self> {
        if config.amplitude <= 0.0 || config.format.sample_rate == 0 || config.format.channels == 0
        {
            return Err(Error::InvalidArgs);
        }
        Ok(Self {
            config,
            state: config.seed,
            cursor: 0,
        })
    }

    #[inline]
    fn next_sample(&mut self) -> f32 {
        // Numerical Recipes LCG constants.
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let unit = f64::from(self.state) / f64::from(u32::MAX);
        ((unit * 2.0 - 1.0) * self.config.amplitude) as f32
    }
}

impl DataSource for Noise {
    fn format(&self) -> SourceFormat {
        self.config.format
    }

    fn read_pcm_frames(&mut self, dst: &mut [u8]) -> Result<u64> {
        let bpf = self.config.format.bytes_per_frame();
        let frames = (dst.len() / bpf) as u64;
        let channels = self.config.format.channels as usize;
        let mut frame_samples = [0f32; MAX_CHANNELS];

        for i in 0..frames {
            for sample in frame_samples[..channels].iter_mut() {
                *sample = self.next_sample();
            }
            encode_from_f32(
                self.config.format.format,
                &frame_samples[..channels],
                &mut dst[(i as usize) * bpf..][..bpf],
            )?;
        }
        self.cursor += frames;
        Ok(frames)
    }

    fn cursor_pcm_frames(&self) -> Result<u64> {
        Ok(self.cursor)
    }

    fn try_duplicate(&self) -> Option<Box<dyn DataSource>> {
        Some(Box::new(Self {
            config: self.config,
            state: self.state,
            cursor: self.cursor,
        }))
    }
}
