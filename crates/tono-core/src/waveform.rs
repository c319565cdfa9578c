//! Deterministic waveform generator source.
//!
//! [`Waveform`] produces sine, square, sawtooth, or triangle waves at a
//! fixed frequency and amplitude. Output is a pure function of the frame
//! cursor, so the source is seekable and two instances with the same config
//! produce identical streams. It is infinite: it never reports
//! at-end.

#[cfg(not(feature = "std"))]
use alloc::boxed::Box;

use crate::channel::MAX_CHANNELS;
use crate::format::encode_from_f32;
use crate::result::{Error, Result};
use crate::source::{DataSource, SourceFormat};

/// Waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformKind {
    /// Pure sine.
    Sine,
    /// Naive square (±amplitude).
    Square,
    /// Rising sawtooth.
    Sawtooth,
    /// Symmetric triangle.
    Triangle,
}

/// Configuration for a [`Waveform`].
#[derive(Debug, Clone, Copy)]
pub struct WaveformConfig {
    /// Native format the generator encodes into.
    pub format: SourceFormat,
    /// Shape of the wave.
    pub kind: WaveformKind,
    /// Peak amplitude, usually in `(0, 1]`.
    pub amplitude: f64,
    /// Frequency in Hz.
    pub frequency: f64,
}

impl WaveformConfig {
    /// A sine at `frequency` Hz in `f32` at the given channel count/rate.
    pub fn sine_f32(channels: u16, sample_rate: u32, amplitude: f64, frequency: f64) -> Result<Self> {
        Ok(Self {
            format: SourceFormat::f32(channels, sample_rate)?,
            kind: WaveformKind::Sine,
            amplitude,
            frequency,
        })
    }
}

/// Deterministic, seekable, infinite waveform source.
pub struct Waveform {
    config: WaveformConfig,
    cursor: u64,
}

impl Waveform {
    /// Creates a generator. Zero or negative frequency, non-positive
    /// amplitude, or a zero sample rate is [`Error::InvalidArgs`].
    pub fn new(config: WaveformConfig) -> Result<Self> {
        if config.frequency <= 0.0
            || config.amplitude <= 0.0
            || config.format.sample_rate == 0
            || config.format.channels == 0
        {
            return Err(Error::InvalidArgs);
        }
        Ok(Self { config, cursor: 0 })
    }

    /// The generator configuration.
    pub fn config(&self) -> &WaveformConfig {
        &self.config
    }

    fn sample_at(&self, frame: u64) -> f32 {
        // Phase as a fraction of one cycle, computed from the absolute
        // frame index so seeks land exactly on the right phase.
        let cycles =
            frame as f64 * self.config.frequency / f64::from(self.config.format.sample_rate);
        let t = cycles - libm::floor(cycles);
        let value = match self.config.kind {
            WaveformKind::Sine => libm::sin(t * core::f64::consts::TAU),
            WaveformKind::Square => {
                if t < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            WaveformKind::Sawtooth => 2.0 * t - 1.0,
            WaveformKind::Triangle => {
                if t < 0.5 {
                    4.0 * t - 1.0
                } else {
                    3.0 - 4.0 * t
                }
            }
        };
        (value * self.config.amplitude) as f32
    }
}

impl DataSource for Waveform {
    fn format(&self) -> SourceFormat {
        self.config.format
    }

    fn read_pcm_frames(&mut self, dst: &mut [u8]) -> Result<u64> {
        let bpf = self.config.format.bytes_per_frame();
        let frames = (dst.len() / bpf) as u64;
        let channels = self.config.format.channels as usize;
        let mut frame_samples = [0f32; MAX_CHANNELS];

        for i in 0..frames {
            let sample = self.sample_at(self.cursor + i);
            frame_samples[..channels].fill(sample);
            encode_from_f32(
                self.config.format.format,
                &frame_samples[..channels],
                &mut dst[(i as usize) * bpf..][..bpf],
            )?;
        }
        self.cursor += frames;
        Ok(frames)
    }

    fn seek_to_pcm_frame(&mut self, frame: u64) -> Result<()> {
        self.cursor = frame;
        Ok(())
    }

    fn cursor_pcm_frames(&self) -> Result<u64> {
        Ok(self.cursor)
    }

    fn try_duplicate(&self) -> Option<Box<dyn DataSource>> {
        Some(Box::new(Self {
            config: self.config,
            cursor: self.cursor,
        }))
    }
}
