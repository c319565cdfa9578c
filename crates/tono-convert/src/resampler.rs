//! Streaming arbitrary-ratio resampler.
//!
//! The resampler consumes interleaved `f32` frames at one rate and produces
//! them at another. Two kernels are available: linear interpolation (two
//! taps, cheap, audible aliasing on wideband material) and windowed sinc
//! (configurable tap count, Hann or Blackman window).
//!
//! # Phase model
//!
//! Output frame positions advance through the input stream by
//! `in_rate / out_rate` per frame, accumulated in `f64`. The kernel is
//! centered between the two middle frames of a `taps`-deep history window,
//! so the resampler carries a lookahead of `taps / 2` frames (1 for
//! linear): that many input frames must be consumed past an output position
//! before the output frame can be produced. [`flush`](Resampler::flush)
//! drains the lookahead with silence.
//!
//! `process` is deterministic: the same state and input produce
//! byte-identical output. Rate changes via
//! [`set_rate`](Resampler::set_rate) preserve the fractional phase;
//! [`reset`](Resampler::reset) returns to the zero-phase state.
//!
//! # Kernel error
//!
//! For a round trip `resample(r)` then `resample(1/r)` on band-limited
//! material below a quarter of the lower rate, the documented bounds are
//! 5% peak error for the linear kernel and 2% for a 16-tap Hann sinc.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use tono_core::result::{Error, Result};

/// Widest supported sinc kernel.
pub const MAX_SINC_TAPS: usize = 64;

/// Window applied to the sinc kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SincWindow {
    /// Hann window. Good default.
    Hann,
    /// Blackman window. Lower stopband leakage, wider transition band.
    Blackman,
}

/// Resampling kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleAlgorithm {
    /// Two-point linear interpolation.
    Linear,
    /// Windowed sinc with an even tap count in `[4, MAX_SINC_TAPS]`.
    Sinc {
        /// Kernel width in taps.
        taps: usize,
        /// Window function.
        window: SincWindow,
    },
}

impl ResampleAlgorithm {
    /// A reasonable quality default: 16-tap Hann sinc.
    pub const fn sinc_default() -> Self {
        Self::Sinc {
            taps: 16,
            window: SincWindow::Hann,
        }
    }
}

/// Configuration for a [`Resampler`].
#[derive(Debug, Clone, Copy)]
pub struct ResamplerConfig {
    /// Input sample rate in Hz.
    pub in_rate: u32,
    /// Output sample rate in Hz.
    pub out_rate: u32,
    /// Channel count; all channels share the phase accumulator.
    pub channels: u16,
    /// Kernel selection.
    pub algorithm: ResampleAlgorithm,
}

/// Streaming resampler state.
pub struct Resampler {
    channels: usize,
    in_rate: u32,
    out_rate: u32,
    algorithm: ResampleAlgorithm,
    taps: usize,
    /// Lookahead in frames: `taps / 2` for sinc, 1 for linear.
    lookahead: i64,
    /// Input frames per output frame.
    step: f64,
    /// Fractional input position in `[0, 1)` between the two center taps.
    frac: f64,
    /// Consumed-frames margin past the current integer position. Emission
    /// requires `ahead == lookahead`; a negative value is the startup or
    /// post-carry deficit.
    ahead: i64,
    /// Last `taps` input frames, interleaved, oldest first.
    history: Vec<f32>,
}

impl Resampler {
    /// Builds a resampler. Zero rates, zero channels, or an invalid sinc
    /// tap count fail with [`Error::InvalidArgs`].
    pub fn new(config: ResamplerConfig) -> Result<Self> {
        if config.in_rate == 0 || config.out_rate == 0 || config.channels == 0 {
            return Err(Error::InvalidArgs);
        }
        let taps = match config.algorithm {
            ResampleAlgorithm::Linear => 2,
            ResampleAlgorithm::Sinc { taps, .. } => {
                if taps < 4 || taps > MAX_SINC_TAPS || taps % 2 != 0 {
                    return Err(Error::InvalidArgs);
                }
                taps
            }
        };
        let channels = config.channels as usize;
        Ok(Self {
            channels,
            in_rate: config.in_rate,
            out_rate: config.out_rate,
            algorithm: config.algorithm,
            taps,
            lookahead: (taps / 2) as i64,
            step: f64::from(config.in_rate) / f64::from(config.out_rate),
            frac: 0.0,
            ahead: -1,
            history: vec![0.0; taps * channels],
        })
    }

    /// Input rate in Hz.
    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    /// Output rate in Hz.
    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    /// Channel count.
    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    /// Lookahead in input frames.
    pub fn lookahead_frames(&self) -> u64 {
        self.lookahead as u64
    }

    /// Changes the conversion ratio, preserving the fractional phase and
    /// the input history. Zero rates fail with [`Error::InvalidArgs`].
    pub fn set_rate(&mut self, in_rate: u32, out_rate: u32) -> Result<()> {
        if in_rate == 0 || out_rate == 0 {
            return Err(Error::InvalidArgs);
        }
        self.in_rate = in_rate;
        self.out_rate = out_rate;
        self.step = f64::from(in_rate) / f64::from(out_rate);
        Ok(())
    }

    /// Returns to the zero-phase state: history cleared, fractional phase
    /// zero, startup lookahead pending.
    pub fn reset(&mut self) {
        self.frac = 0.0;
        self.ahead = -1;
        self.history.fill(0.0);
    }

    /// Pushes one input frame into the history window.
    #[inline]
    fn push_frame(&mut self, frame: &[f32]) {
        let ch = self.channels;
        self.history.copy_within(ch.., 0);
        let tail = self.history.len() - ch;
        self.history[tail..].copy_from_slice(frame);
    }

    /// Emits one output frame from the history at the current phase.
    fn emit(&self, out: &mut [f32]) {
        match self.algorithm {
            ResampleAlgorithm::Linear => {
                let ch = self.channels;
                let a = &self.history[..ch];
                let b = &self.history[ch..];
                let t = self.frac as f32;
                for c in 0..ch {
                    out[c] = a[c] + (b[c] - a[c]) * t;
                }
            }
            ResampleAlgorithm::Sinc { window, .. } => {
                let mut weights = [0f64; MAX_SINC_TAPS];
                let half = (self.taps / 2) as f64;
                let mut sum = 0.0;
                for (i, w) in weights[..self.taps].iter_mut().enumerate() {
                    // Distance from the output position to history frame i
                    // (oldest first): frac + half - 1 - i.
                    let d = self.frac + half - 1.0 - i as f64;
                    *w = sinc(d) * window_value(window, d, half);
                    sum += *w;
                }
                // Normalize so DC passes at unity regardless of phase.
                let ch = self.channels;
                for c in 0..ch {
                    let mut acc = 0.0f64;
                    for (i, w) in weights[..self.taps].iter().enumerate() {
                        acc += f64::from(self.history[i * ch + c]) * *w;
                    }
                    out[c] = (acc / sum) as f32;
                }
            }
        }
    }

    /// Converts as much as possible, bounded by input and output space.
    ///
    /// Slice lengths must be whole frames. Returns
    /// `(in_frames_consumed, out_frames_produced)`. A zero-input call
    /// returns `(0, 0)`; use [`flush`](Self::flush) to drain the tail.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(usize, usize)> {
        let ch = self.channels;
        if input.len() % ch != 0 || output.len() % ch != 0 {
            return Err(Error::InvalidArgs);
        }
        let in_frames = input.len() / ch;
        let out_cap = output.len() / ch;
        if in_frames == 0 {
            return Ok((0, 0));
        }

        // Equal rates short-circuit to a copy, keeping the history window
        // warm so a later rate change starts from real samples.
        if self.in_rate == self.out_rate {
            let n = in_frames.min(out_cap);
            output[..n * ch].copy_from_slice(&input[..n * ch]);
            let tail_frames = n.min(self.taps);
            for f in (n - tail_frames)..n {
                self.push_frame(&input[f * ch..(f + 1) * ch]);
            }
            if tail_frames > 0 {
                self.ahead = self.lookahead;
            }
            return Ok((n, n));
        }

        let mut consumed = 0usize;
        let mut produced = 0usize;
        loop {
            // Fill the lookahead before each emission.
            while self.ahead < self.lookahead {
                if consumed == in_frames {
                    return Ok((consumed, produced));
                }
                self.push_frame(&input[consumed * ch..(consumed + 1) * ch]);
                consumed += 1;
                self.ahead += 1;
            }
            if produced == out_cap {
                return Ok((consumed, produced));
            }

            self.emit(&mut output[produced * ch..(produced + 1) * ch]);
            produced += 1;

            // Advance the phase; carry whole frames out of the fraction.
            self.frac += self.step;
            let carry = self.frac as i64; // truncation == floor for positive
            self.frac -= carry as f64;
            for _ in 0..carry {
                if consumed < in_frames {
                    self.push_frame(&input[consumed * ch..(consumed + 1) * ch]);
                    consumed += 1;
                } else {
                    // Integer position moved past the newest frame we hold;
                    // the next lookahead fill repays the deficit.
                    self.ahead -= 1;
                }
            }
        }
    }

    /// Drains the remaining output that the lookahead still covers by
    /// feeding silence, then resets to the zero-phase state. Returns the
    /// frames produced into `output`.
    pub fn flush(&mut self, output: &mut [f32]) -> Result<usize> {
        let ch = self.channels;
        if output.len() % ch != 0 {
            return Err(Error::InvalidArgs);
        }
        if self.in_rate == self.out_rate {
            // Nothing buffered at unity ratio.
            self.reset();
            return Ok(0);
        }
        // Lookahead is at most MAX_SINC_TAPS / 2 frames; silence fits on
        // the stack, keeping flush allocation-free like process.
        let zeros = [0.0f32; (MAX_SINC_TAPS / 2) * tono_core::MAX_CHANNELS];
        let span = (self.lookahead as usize) * ch;
        let (_, produced) = self.process(&zeros[..span], output)?;
        self.reset();
        Ok(produced)
    }

    /// Input frames that must be supplied, from the current phase, before
    /// `out_frames` output frames can be produced. Deterministic; includes
    /// the startup lookahead.
    pub fn required_input_frame_count(&self, out_frames: u64) -> u64 {
        if out_frames == 0 {
            return 0;
        }
        if self.in_rate == self.out_rate {
            return out_frames;
        }
        let mut frac = self.frac;
        let mut ahead = self.ahead;
        let mut needed = 0u64;
        for _ in 0..out_frames {
            if ahead < self.lookahead {
                needed += (self.lookahead - ahead) as u64;
                ahead = self.lookahead;
            }
            frac += self.step;
            let carry = frac as i64;
            frac -= carry as f64;
            ahead -= carry;
        }
        needed
    }

    /// Output frames that `in_frames` more input frames allow, from the
    /// current phase. Deterministic; mirrors `process` exactly.
    pub fn expected_output_frame_count(&self, in_frames: u64) -> u64 {
        if self.in_rate == self.out_rate {
            return in_frames;
        }
        let mut frac = self.frac;
        let mut ahead = self.ahead;
        let mut avail = in_frames;
        let mut produced = 0u64;
        loop {
            while ahead < self.lookahead {
                if avail == 0 {
                    return produced;
                }
                avail -= 1;
                ahead += 1;
            }
            produced += 1;
            frac += self.step;
            let carry = frac as i64;
            frac -= carry as f64;
            for _ in 0..carry {
                if avail > 0 {
                    avail -= 1;
                } else {
                    ahead -= 1;
                }
            }
        }
    }
}

#[inline]
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        let px = core::f64::consts::PI * x;
        libm::sin(px) / px
    }
}

#[inline]
fn window_value(window: SincWindow, d: f64, half: f64) -> f64 {
    let t = d / half;
    if t.abs() >= 1.0 {
        return 0.0;
    }
    match window {
        SincWindow::Hann => 0.5 + 0.5 * libm::cos(core::f64::consts::PI * t),
        SincWindow::Blackman => {
            let pt = core::f64::consts::PI * t;
            0.42 + 0.5 * libm::cos(pt) + 0.08 * libm::cos(2.0 * pt)
        }
    }
}
