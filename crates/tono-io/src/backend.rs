//! Pluggable device backend abstraction.
//!
//! This module defines the traits every OS audio port implements. The
//! engine above them is OS-agnostic: it negotiates stream descriptors,
//! converts between client and native formats, and runs the device state
//! machine, while the backend only moves native-format bytes.
//!
//! Two stream shapes exist, mirroring how platform APIs actually behave:
//!
//! - **Driven** ([`DrivenStream`]): the backend owns the audio thread and
//!   invokes the data callbacks it was given at open (cpal, CoreAudio,
//!   WASAPI event mode).
//! - **Polled** ([`PolledStream`]): the backend exposes blocking
//!   read/write and the engine supplies the thread (or the application
//!   steps it in single-threaded mode). The null backend works this way.
//!
//! Backends are selected at context init from a priority list; see
//! [`Context`](crate::Context).

use std::sync::Arc;

use tono_core::channel::ChannelMap;
use tono_core::result::{Error, Result};
use tono_core::{LogBus, SampleFormat};

/// Static description of a backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendInfo {
    /// Human-readable backend name (e.g. "cpal", "null").
    pub name: &'static str,
}

/// What a device is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Render only.
    Playback,
    /// Record only.
    Capture,
    /// Synchronized render and record.
    Duplex,
    /// Record what another application renders.
    Loopback,
}

impl DeviceRole {
    /// Whether the role opens a playback-side stream.
    pub fn has_playback(self) -> bool {
        matches!(self, Self::Playback | Self::Duplex)
    }

    /// Whether the role opens a capture-side stream.
    pub fn has_capture(self) -> bool {
        matches!(self, Self::Capture | Self::Duplex | Self::Loopback)
    }
}

/// Device sharing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareMode {
    /// Mix with other clients (always supported).
    #[default]
    Shared,
    /// Exclusive hardware access; backends may refuse with
    /// [`Error::ShareModeNotSupported`].
    Exclusive,
}

/// Opaque, backend-scoped device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

/// One native format a device supports.
#[derive(Debug, Clone)]
pub struct NativeDataFormat {
    /// Sample format.
    pub format: SampleFormat,
    /// Channel count.
    pub channels: u16,
    /// Lowest supported rate in Hz.
    pub min_sample_rate: u32,
    /// Highest supported rate in Hz.
    pub max_sample_rate: u32,
    /// Native speaker layout.
    pub channel_map: ChannelMap,
}

/// A device as reported by enumeration.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Backend-scoped identifier, stable across enumerations.
    pub id: DeviceId,
    /// Human-readable name.
    pub name: String,
    /// Whether this is the backend's default device for its role.
    pub is_default: bool,
    /// Native formats the device advertises.
    pub native_formats: Vec<NativeDataFormat>,
}

/// Requested stream parameters. `None` fields are negotiated by the
/// backend; a reroute may then change what the callback observes.
#[derive(Debug, Clone, Default)]
pub struct DeviceRequest {
    /// Specific device, or the backend default.
    pub device_id: Option<DeviceId>,
    /// Preferred native sample format.
    pub format: Option<SampleFormat>,
    /// Preferred channel count.
    pub channels: Option<u16>,
    /// Preferred sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Preferred speaker layout.
    pub channel_map: Option<ChannelMap>,
    /// Preferred period size in frames.
    pub period_frames: Option<usize>,
    /// Preferred periods per buffer.
    pub period_count: Option<usize>,
    /// Sharing policy.
    pub share_mode: ShareMode,
}

/// Granted stream parameters after negotiation.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// The device the stream was opened on.
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub device_name: String,
    /// Whether the stream was opened on the backend default device.
    pub on_default_device: bool,
    /// Granted native sample format.
    pub format: SampleFormat,
    /// Granted channel count.
    pub channels: u16,
    /// Granted sample rate in Hz.
    pub sample_rate: u32,
    /// Granted speaker layout.
    pub channel_map: ChannelMap,
    /// Granted period size in frames.
    pub period_frames: usize,
    /// Granted periods per buffer.
    pub period_count: usize,
    /// Granted sharing policy.
    pub share_mode: ShareMode,
}

impl StreamDescriptor {
    /// Size of one native frame in bytes.
    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_frame(self.channels)
    }
}

/// Out-of-band events a backend reports to the engine.
///
/// Delivered synchronously from whatever thread the backend noticed the
/// condition on; handlers must be non-blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    /// The OS default device changed while a stream was open on it.
    DefaultDeviceChanged,
    /// The stream was interrupted (e.g. a phone call on mobile hosts).
    InterruptionBegan,
    /// The interruption ended; the stream may be restarted.
    InterruptionEnded,
    /// The host unlocked audio (browser autoplay gates).
    Unlocked,
    /// An unrecoverable stream error; the engine stops the device.
    StreamError,
}

/// Engine handler for [`BackendEvent`]s.
pub type BackendEventCallback = Arc<dyn Fn(BackendEvent) + Send + Sync>;

/// Native-format data pumps a driven backend invokes from its audio
/// thread. Buffers are whole frames in the granted descriptor's format.
pub struct StreamDataCallbacks {
    /// Fills the playback buffer. `None` for capture-only streams.
    pub playback: Option<Box<dyn FnMut(&mut [u8]) + Send>>,
    /// Consumes the capture buffer. `None` for playback-only streams.
    pub capture: Option<Box<dyn FnMut(&[u8]) + Send>>,
}

/// A stream whose backend owns the audio thread.
pub trait DrivenStream {
    /// Starts callback delivery. Returns with the stream running.
    fn start(&mut self) -> Result<()>;

    /// Stops callback delivery. Returns after the last callback.
    fn stop(&mut self) -> Result<()>;
}

/// A stream the engine drives through blocking read/write.
pub trait PolledStream: Send {
    /// Prepares the stream for data transfer.
    fn start(&mut self) -> Result<()>;

    /// Halts data transfer.
    fn stop(&mut self) -> Result<()>;

    /// Blocks until the next period is due (or returns [`Error::Busy`]
    /// immediately when `blocking` is false and no period is ready).
    /// A wakeup aborts a pending wait with [`Error::Cancelled`].
    fn wait_period(&mut self, blocking: bool) -> Result<()>;

    /// Reads up to one period of native capture frames into `dst`.
    /// Returns frames read. Playback-only streams keep the default.
    fn read(&mut self, _dst: &mut [u8]) -> Result<usize> {
        Err(Error::DeviceTypeNotSupported)
    }

    /// Writes native playback frames from `src`. Returns frames written.
    /// Capture-only streams keep the default.
    fn write(&mut self, _src: &[u8]) -> Result<usize> {
        Err(Error::DeviceTypeNotSupported)
    }

    /// A handle that unblocks a pending [`wait_period`](Self::wait_period)
    /// from another thread, when the backend supports it.
    fn wakeup_handle(&self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        None
    }
}

/// A stream in whichever shape the backend produces.
pub enum BackendStream {
    /// Backend-owned audio thread; see [`DrivenStream`].
    Driven(Box<dyn DrivenStream>),
    /// Engine-driven; see [`PolledStream`].
    Polled(Box<dyn PolledStream>),
}

/// Everything `open_stream` hands back: the stream plus the granted
/// descriptor for each direction that was requested.
pub struct OpenedStream {
    /// The stream object.
    pub stream: BackendStream,
    /// Granted playback descriptor, when the role has playback.
    pub playback: Option<StreamDescriptor>,
    /// Granted capture descriptor, when the role has capture.
    pub capture: Option<StreamDescriptor>,
}

/// A backend: the factory for per-context state.
pub trait Backend {
    /// Static backend description.
    fn info(&self) -> BackendInfo;

    /// Initializes backend state for a context. Failing here makes the
    /// context try the next backend in its priority list.
    fn create_context(&self, log: &LogBus) -> Result<Box<dyn BackendContext>>;
}

/// Per-context backend state: enumeration and stream construction.
///
/// `Send` so a context can migrate between control threads; streams it
/// opens may themselves be thread-bound (cpal's are).
pub trait BackendContext: Send {
    /// Calls `callback` once per known device, with its role.
    fn enumerate_devices(
        &self,
        callback: &mut dyn FnMut(DeviceRole, &DeviceInfo),
    ) -> Result<()>;

    /// Detailed info for a device, or the role's default when `id` is
    /// `None`.
    fn device_info(&self, id: Option<&DeviceId>, role: DeviceRole) -> Result<DeviceInfo>;

    /// Opens the backend stream(s) for a role, negotiating each requested
    /// direction. Driven backends capture `data`; polled backends ignore
    /// it.
    fn open_stream(
        &self,
        role: DeviceRole,
        playback: Option<&DeviceRequest>,
        capture: Option<&DeviceRequest>,
        data: StreamDataCallbacks,
        events: BackendEventCallback,
    ) -> Result<OpenedStream>;
}
