//! Tono Core - shared primitives for the tono audio engine
//!
//! This crate provides the foundation the rest of the engine is built on:
//! the result taxonomy, the log bus, PCM format and channel-map vocabulary,
//! the lock-free SPSC ring buffer, and the [`DataSource`] abstraction.
//!
//! # Core Abstractions
//!
//! ## Results & Logging
//!
//! - [`Error`] / [`Result`] - Typed result codes returned by every fallible
//!   operation in the engine
//! - [`LogBus`] - Structured `(level, message)` event emission with
//!   user-installable sinks
//!
//! ## PCM Vocabulary
//!
//! - [`SampleFormat`] - `u8`/`s16`/`s24`/`s32`/`f32` with fixed sizes;
//!   `f32` is the canonical intermediate form
//! - [`ChannelMap`] / [`ChannelPosition`] - Ordered speaker layouts
//! - [`frames`] - Silence/copy/volume helpers over interleaved `f32`
//!
//! ## Transport
//!
//! - [`byte_ring`] / [`pcm_ring`] - Lock-free single-producer/single-consumer
//!   FIFOs used for duplex coupling and async hand-off, with drop-oldest
//!   overwrite for overflow-tolerant paths
//!
//! ## Sources
//!
//! - [`DataSource`] - A lazy, possibly finite, possibly seekable sequence of
//!   PCM frames in a declared native format
//! - [`Waveform`] / [`Noise`] - Deterministic built-in generators
//!
//! # no_std Support
//!
//! This crate is `no_std` compatible for embedded targets. Disable the
//! default `std` feature:
//!
//! ```toml
//! [dependencies]
//! tono-core = { version = "0.1", default-features = false }
//! ```
//!
//! # Design Principles
//!
//! - **Real-time safe**: no allocation, no locking on any audio-path
//!   operation; allocation happens at construction only
//! - **Typed results everywhere**: no operation silently swallows a failure
//! - **Object-safe traits**: sources are `dyn`-dispatched at the seams

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

pub mod channel;
pub mod format;
pub mod frames;
pub mod log;
pub mod noise;
pub mod result;
pub mod ring;
pub mod source;
pub mod waveform;

// Re-export main types at crate root
pub use channel::{ChannelMap, ChannelPosition, MAX_CHANNELS};
pub use format::SampleFormat;
pub use log::{LogBus, LogLevel};
pub use noise::{Noise, NoiseConfig};
pub use result::{Error, Result};
pub use ring::{
    ByteRingConsumer, ByteRingProducer, PcmRingConsumer, PcmRingProducer, byte_ring, pcm_ring,
};
pub use source::{ChainedSource, DataSource, LoopingSource, SourceFormat};
pub use waveform::{Waveform, WaveformConfig, WaveformKind};
