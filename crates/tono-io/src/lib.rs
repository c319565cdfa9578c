//! Tono IO - contexts, devices, and pluggable backends
//!
//! This crate is the device half of the tono audio engine:
//!
//! - [`Context`] - Backend selection from a priority list, device
//!   enumeration and capability discovery
//! - [`Device`] - A realtime stream: open, start/stop, data callback
//!   delivery, duplex coupling, single-threaded stepping
//! - [`backend`] - The vtable every OS port implements; the engine above
//!   it is OS-agnostic
//! - [`NullBackend`] - A deterministic, hardware-free backend for tests,
//!   CI, and single-threaded stepping
//! - `cpal-backend` feature - The cpal OS port (ALSA / CoreAudio / WASAPI)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tono_io::{Context, ContextConfig, Device, DeviceConfig};
//! use tono_io::backend::DeviceRole;
//!
//! let context = Context::with_defaults(ContextConfig::default())?;
//! let mut device = Device::new(
//!     Arc::clone(&context),
//!     DeviceConfig::new(DeviceRole::Playback),
//!     Box::new(|mut data| {
//!         if let Some(out) = data.output.take() {
//!             out.fill(0.0); // your synth here
//!         }
//!     }),
//! )?;
//! device.start()?;
//! ```

pub mod backend;
mod context;
mod device;
pub mod null_backend;

#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;

pub use context::{Context, ContextConfig, default_backends};
pub use device::{
    BlockingMode, DataCallback, Device, DeviceConfig, DeviceState, Notification,
    NotificationCallback, StreamData, ThreadingMode, XrunKind,
};
pub use null_backend::{NullBackend, NullBackendConfig, NullBackendHandle};

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalBackend;
