//! Tono Convert - the data conversion pipeline
//!
//! Three stages, each usable alone and composable into a single streaming
//! [`DataConverter`]:
//!
//! - [`Resampler`] - Arbitrary-ratio sample rate conversion (linear or
//!   windowed sinc) with streaming state and exact frame accounting
//! - [`ChannelConverter`] - N→M channel remix via identity, standard
//!   mixdown tables, or an explicit weight matrix
//! - [`DataConverter`] - (format → f32) → channels → rate → channels →
//!   (f32 → format), resampling at the smaller of the two channel counts
//!
//! All `process` paths are allocation-free; scratch is sized at
//! construction.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

pub mod channels;
pub mod converter;
pub mod resampler;

pub use channels::{ChannelConverter, ChannelMixMode};
pub use converter::{DataConverter, DataConverterConfig};
pub use resampler::{ResampleAlgorithm, Resampler, ResamplerConfig, SincWindow};
