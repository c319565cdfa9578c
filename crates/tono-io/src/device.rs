//! Devices: realtime streams with format bridging and duplex coupling.
//!
//! A [`Device`] opens one backend stream (playback or capture) or a
//! coupled pair (duplex, loopback) and invokes the application's data
//! callback with interleaved `f32` buffers in the *client* format. The
//! client format is `f32` at the channel count and rate the application
//! requested (or, for fields left unspecified, whatever the backend
//! granted); the data conversion pipeline bridges client and native
//! formats in both directions.
//!
//! # Threading
//!
//! - **Multi-threaded** (default): the backend owns the audio thread
//!   (driven streams), or the engine spawns one that runs the period loop
//!   (polled streams). `start` returns with the thread running; `stop`
//!   joins it after the last period.
//! - **Single-threaded**: no thread is spawned; the application calls
//!   [`step`](Device::step) from a thread of its choice. Each step
//!   processes at most one period. [`wakeup`](Device::wakeup) unblocks a
//!   pending blocking step.
//!
//! # Duplex coupling
//!
//! Capture and playback sides meet in a lock-free PCM ring holding client
//! frames, sized to at least one period. The capture side converts and
//! pushes; the playback side pulls a matching frame count and hands both
//! buffers to the callback. Ring underflow zero-fills the input side; a
//! full ring reclaims the oldest buffered frames to make room for the
//! newest and emits an xrun notification.
//!
//! # Realtime contract
//!
//! Both delivery paths are allocation-free and lock-free. Polled pumps
//! are owned outright by the period loop. Driven pumps (cpal) are parked
//! in atomic cells the backend's audio callback checks out and returns
//! with one lock-free swap each per period; the data callback itself
//! lives inside the pump, so no mutex is ever taken on the audio thread.
//! The cells are only contended across a reroute, while the stream is
//! stopped. The data callback must not block, allocate, or take locks; a
//! panicking callback is caught, logged, and its period replaced with
//! silence.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_utils::atomic::AtomicCell;

use tono_convert::{DataConverter, DataConverterConfig, ResampleAlgorithm};
use tono_core::channel::ChannelMap;
use tono_core::format::encode_from_f32;
use tono_core::result::{Error, Result};
use tono_core::ring::{PcmRingConsumer, PcmRingProducer, pcm_ring};
use tono_core::source::SourceFormat;
use tono_core::{LogBus, SampleFormat};

use crate::backend::{
    BackendEvent, BackendStream, DeviceRequest, DeviceRole, DrivenStream, OpenedStream,
    PolledStream, StreamDataCallbacks, StreamDescriptor,
};
use crate::context::Context;

/// Consecutive fatal period errors tolerated before the device stops
/// itself and notifies `Errored`.
const MAX_CONSECUTIVE_STREAM_ERRORS: u32 = 3;

/// Device run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    /// Initialized, not streaming. (Construction is initialization; drop
    /// is uninit.)
    Stopped = 0,
    /// `start` in progress.
    Starting = 1,
    /// Streaming; callbacks are being delivered.
    Started = 2,
    /// `stop` in progress; draining.
    Stopping = 3,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Who owns the period loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// The engine or backend owns the audio thread.
    #[default]
    MultiThreaded,
    /// The application calls [`Device::step`].
    SingleThreaded,
}

/// Blocking behavior of [`Device::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    /// Wait for the next period.
    Blocking,
    /// Return [`Error::Busy`] when no period is due.
    NonBlocking,
}

/// Which side of a duplex stream ran out of ring space or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrunKind {
    /// The capture→playback ring was full; the oldest buffered frames
    /// were dropped to make room.
    CaptureOverrun,
    /// The ring was empty; the callback saw zero-filled input.
    PlaybackUnderrun,
}

/// Out-of-band device notifications.
///
/// Delivered synchronously; handlers must be non-blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The device entered the started state.
    Started,
    /// The device entered the stopped state.
    Stopped,
    /// The device reinitialized onto a new default device.
    Rerouted,
    /// The backend reported an interruption (mobile hosts).
    InterruptionBegan,
    /// The interruption ended.
    InterruptionEnded,
    /// The host unlocked audio (browser autoplay gates).
    Unlocked,
    /// An unrecoverable stream error; the device is stopped.
    Errored,
    /// A ring under/overrun on the duplex path.
    Xrun(XrunKind),
}

/// Handler for [`Notification`]s.
pub type NotificationCallback = Arc<dyn Fn(Notification) + Send + Sync>;

/// One invocation of the data callback.
///
/// Playback-only devices get `output` and no `input`; capture-only the
/// reverse; duplex both, with the same `frames` on each side.
pub struct StreamData<'a> {
    /// Client playback buffer to fill, `frames * out_channels` samples.
    pub output: Option<&'a mut [f32]>,
    /// Client capture buffer, `frames * in_channels` samples.
    pub input: Option<&'a [f32]>,
    /// Frames this invocation. At most one period, possibly fewer.
    pub frames: usize,
    /// Channels of `output`.
    pub out_channels: u16,
    /// Channels of `input`.
    pub in_channels: u16,
    /// Client sample rate in Hz.
    pub sample_rate: u32,
}

/// The application's data callback. Runs on the audio (or stepping)
/// thread; must be realtime-safe. The callback is owned by the pump that
/// invokes it; reroute recovers it by draining the pump.
pub type DataCallback = Box<dyn FnMut(StreamData<'_>) + Send>;

/// Configuration for [`Device::new`].
pub struct DeviceConfig {
    /// What to open.
    pub role: DeviceRole,
    /// Playback-side request; ignored for capture-only roles.
    pub playback: DeviceRequest,
    /// Capture-side request; ignored for playback-only roles.
    pub capture: DeviceRequest,
    /// Who owns the period loop.
    pub threading: ThreadingMode,
    /// Notification handler.
    pub notification: Option<NotificationCallback>,
    /// Kernel for client↔native rate conversion.
    pub resample_algorithm: ResampleAlgorithm,
    /// Duplex ring size in periods; at least 1, default 2.
    pub duplex_ring_periods: usize,
}

impl DeviceConfig {
    /// Defaults for a role: negotiated formats, multi-threaded, sinc
    /// resampling, two-period duplex ring.
    pub fn new(role: DeviceRole) -> Self {
        Self {
            role,
            playback: DeviceRequest::default(),
            capture: DeviceRequest::default(),
            threading: ThreadingMode::default(),
            notification: None,
            resample_algorithm: ResampleAlgorithm::sinc_default(),
            duplex_ring_periods: 2,
        }
    }
}

struct DeviceShared {
    state: AtomicU8,
    notification: Option<NotificationCallback>,
    log: LogBus,
    reroute_pending: AtomicBool,
    stop_flag: AtomicBool,
}

impl DeviceShared {
    fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn notify(&self, notification: Notification) {
        if let Some(callback) = &self.notification {
            callback(notification);
        }
    }
}

/// Client-format description of one direction.
#[derive(Clone, Copy)]
struct ClientFormat {
    channels: u16,
    sample_rate: u32,
}

impl ClientFormat {
    fn source_format(self) -> Result<SourceFormat> {
        Ok(SourceFormat {
            format: SampleFormat::F32,
            channels: self.channels,
            sample_rate: self.sample_rate,
            channel_map: ChannelMap::standard(self.channels).map_err(|_| Error::InvalidArgs)?,
        })
    }
}

fn native_source_format(desc: &StreamDescriptor) -> SourceFormat {
    SourceFormat {
        format: desc.format,
        channels: desc.channels,
        sample_rate: desc.sample_rate,
        channel_map: desc.channel_map,
    }
}

/// Runs the user callback with panic isolation. On panic the output is
/// silenced and the incident logged; the audio thread survives.
fn run_callback(
    callback: &mut DataCallback,
    log: &LogBus,
    mut output: Option<&mut [f32]>,
    input: Option<&[f32]>,
    frames: usize,
    out_channels: u16,
    in_channels: u16,
    sample_rate: u32,
) {
    // Pre-silence so a panicking callback leaves a clean period behind.
    if let Some(out) = output.as_mut() {
        out.fill(0.0);
    }
    let result = catch_unwind(AssertUnwindSafe(|| {
        let data = StreamData {
            output,
            input,
            frames,
            out_channels,
            in_channels,
            sample_rate,
        };
        callback(data);
    }));
    if result.is_err() {
        log.error("data callback panicked; emitting silence for this period");
    }
}

struct DuplexIn {
    consumer: PcmRingConsumer,
    /// Client-format staging the callback reads its input from.
    staging: Vec<f32>,
    channels: u16,
}

/// Client→native pump for the playback direction. Owns the user callback
/// for playback-only and duplex devices.
struct PlaybackPump {
    callback: DataCallback,
    converter: Option<DataConverter>,
    client: ClientFormat,
    client_buf: Vec<f32>,
    client_buf_frames: usize,
    duplex_in: Option<DuplexIn>,
    native_bpf: usize,
    shared: Arc<DeviceShared>,
}

impl PlaybackPump {
    fn new(
        callback: DataCallback,
        client: ClientFormat,
        desc: &StreamDescriptor,
        algorithm: ResampleAlgorithm,
        duplex_in: Option<DuplexIn>,
        shared: Arc<DeviceShared>,
    ) -> Result<Self> {
        let native = native_source_format(desc);
        let client_fmt = client.source_format()?;
        let converter = if client_fmt == native {
            None
        } else {
            Some(DataConverter::new(DataConverterConfig {
                in_format: client_fmt,
                out_format: native,
                resample_algorithm: algorithm,
            })?)
        };
        let client_buf_frames = match &converter {
            Some(c) => c.required_input_frame_count(desc.period_frames as u64) as usize + 16,
            None => desc.period_frames,
        };
        Ok(Self {
            callback,
            converter,
            client,
            client_buf: vec![0.0; client_buf_frames * client.channels as usize],
            client_buf_frames,
            duplex_in,
            native_bpf: desc.bytes_per_frame(),
            shared,
        })
    }

    /// Hands the user callback back for a pump rebuild.
    fn into_callback(self) -> DataCallback {
        self.callback
    }

    /// Reads duplex input for `frames` client frames, zero-filling (and
    /// noting the underrun) when the ring runs dry.
    fn fetch_duplex_input<'a>(
        duplex: &'a mut Option<DuplexIn>,
        shared: &DeviceShared,
        frames: usize,
    ) -> Option<&'a [f32]> {
        let duplex = duplex.as_mut()?;
        let channels = duplex.channels as usize;
        let staging = &mut duplex.staging[..frames * channels];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(staging);
        let got = duplex.consumer.read_frames(bytes);
        if got < frames {
            duplex.staging[got * channels..frames * channels].fill(0.0);
            shared.log.debug("duplex ring underrun; input zero-filled");
            shared.notify(Notification::Xrun(XrunKind::PlaybackUnderrun));
        }
        Some(&duplex.staging[..frames * channels])
    }

    /// Fills one native playback buffer from the user callback.
    fn fill_native(&mut self, native: &mut [u8]) {
        let native_bpf = self.native_bpf;
        let client_buf_frames = self.client_buf_frames;
        let native_frames = native.len() / native_bpf;
        let out_channels = self.client.channels;
        let in_channels = self
            .duplex_in
            .as_ref()
            .map_or(out_channels, |d| d.channels);
        let sample_rate = self.client.sample_rate;

        let Self {
            callback,
            converter,
            client_buf,
            duplex_in,
            shared,
            ..
        } = self;

        match converter {
            None => {
                // Client and native agree: render straight into the native
                // buffer when it is f32-aligned, else through staging.
                match bytemuck::try_cast_slice_mut::<u8, f32>(native) {
                    Ok(out) => {
                        let input =
                            Self::fetch_duplex_input(duplex_in, shared, native_frames);
                        run_callback(
                            callback,
                            &shared.log,
                            Some(out),
                            input,
                            native_frames,
                            out_channels,
                            in_channels,
                            sample_rate,
                        );
                    }
                    Err(_) => {
                        let staged = &mut client_buf[..native_frames * out_channels as usize];
                        let input =
                            Self::fetch_duplex_input(duplex_in, shared, native_frames);
                        run_callback(
                            callback,
                            &shared.log,
                            Some(&mut *staged),
                            input,
                            native_frames,
                            out_channels,
                            in_channels,
                            sample_rate,
                        );
                        let _ = encode_from_f32(SampleFormat::F32, staged, native);
                    }
                }
            }
            Some(converter) => {
                let mut filled = 0usize;
                while filled < native_frames {
                    let need = converter
                        .required_input_frame_count((native_frames - filled) as u64)
                        as usize;
                    let take = need.min(client_buf_frames);
                    if take == 0 {
                        break;
                    }
                    let staged = &mut client_buf[..take * out_channels as usize];
                    let input = Self::fetch_duplex_input(duplex_in, shared, take);
                    run_callback(
                        callback,
                        &shared.log,
                        Some(staged),
                        input,
                        take,
                        out_channels,
                        in_channels,
                        sample_rate,
                    );

                    let staged_bytes: &[u8] = bytemuck::cast_slice(&client_buf[..take * out_channels as usize]);
                    match converter.process(
                        staged_bytes,
                        &mut native[filled * native_bpf..native_frames * native_bpf],
                    ) {
                        Ok((consumed, produced)) => {
                            filled += produced as usize;
                            if consumed == 0 && produced == 0 {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                // Anything the converter could not yet produce becomes
                // silence rather than stale bytes.
                if filled < native_frames {
                    native[filled * native_bpf..].fill(0);
                }
            }
        }
    }
}

/// Native→client pump for the capture direction. Owns the user callback
/// for capture-only devices; duplex devices push into the ring instead.
struct CapturePump {
    callback: Option<DataCallback>,
    ring: Option<PcmRingProducer>,
    converter: Option<DataConverter>,
    client: ClientFormat,
    client_buf: Vec<f32>,
    native_bpf: usize,
    shared: Arc<DeviceShared>,
}

impl CapturePump {
    fn new(
        callback: Option<DataCallback>,
        ring: Option<PcmRingProducer>,
        client: ClientFormat,
        desc: &StreamDescriptor,
        algorithm: ResampleAlgorithm,
        shared: Arc<DeviceShared>,
    ) -> Result<Self> {
        let native = native_source_format(desc);
        let client_fmt = client.source_format()?;
        let converter = if client_fmt == native {
            None
        } else {
            Some(DataConverter::new(DataConverterConfig {
                in_format: native,
                out_format: client_fmt,
                resample_algorithm: algorithm,
            })?)
        };
        let worst_case_client = match &converter {
            Some(c) => c.expected_output_frame_count(desc.period_frames as u64) as usize + 16,
            None => desc.period_frames,
        };
        Ok(Self {
            callback,
            ring,
            converter,
            client,
            client_buf: vec![0.0; worst_case_client * client.channels as usize],
            native_bpf: desc.bytes_per_frame(),
            shared,
        })
    }

    /// Hands the user callback back for a pump rebuild, when this pump
    /// owns it.
    fn into_callback(self) -> Option<DataCallback> {
        self.callback
    }

    /// Converts one native capture buffer and delivers it (callback or
    /// duplex ring).
    fn push_native(&mut self, native: &[u8]) {
        let native_frames = native.len() / self.native_bpf;
        let channels = self.client.channels as usize;

        let client_frames = match &mut self.converter {
            None => {
                let samples = &mut self.client_buf[..native_frames * channels];
                match bytemuck::try_cast_slice::<u8, f32>(native) {
                    Ok(cast) => samples.copy_from_slice(cast),
                    Err(_) => {
                        let _ = tono_core::format::decode_to_f32(
                            SampleFormat::F32,
                            native,
                            samples,
                        );
                    }
                }
                native_frames
            }
            Some(converter) => {
                let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.client_buf[..]);
                match converter.process(native, out_bytes) {
                    Ok((_, produced)) => produced as usize,
                    Err(_) => 0,
                }
            }
        };
        if client_frames == 0 {
            return;
        }
        let samples = &self.client_buf[..client_frames * channels];

        if let Some(ring) = &mut self.ring {
            let bytes: &[u8] = bytemuck::cast_slice(samples);
            // Overflow reclaims the oldest buffered frames so the newest
            // capture survives; either form of loss is an overrun.
            let (written, dropped) = ring.write_frames_overwrite(bytes);
            if dropped > 0 || written < client_frames {
                self.shared
                    .log
                    .warning("duplex ring overflow; oldest frames dropped");
                self.shared
                    .notify(Notification::Xrun(XrunKind::CaptureOverrun));
            }
        } else if let Some(callback) = &mut self.callback {
            run_callback(
                callback,
                &self.shared.log,
                None,
                Some(samples),
                client_frames,
                0,
                self.client.channels,
                self.client.sample_rate,
            );
        }
    }
}

/// The engine-driven period loop for polled backends.
struct PolledEngine {
    stream: Box<dyn PolledStream>,
    playback: Option<PlaybackPump>,
    capture: Option<CapturePump>,
    /// Native staging, f32-backed so the aligned fast paths apply.
    playback_native: Vec<f32>,
    playback_native_bytes: usize,
    capture_native: Vec<f32>,
    capture_native_bytes: usize,
    shared: Arc<DeviceShared>,
    consecutive_errors: u32,
}

impl PolledEngine {
    /// Processes at most one period. Transient errors pass through for
    /// the caller to interpret.
    fn step(&mut self, blocking: bool) -> Result<()> {
        self.stream.wait_period(blocking)?;

        if let Some(capture) = &mut self.capture {
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.capture_native[..]);
            let bytes = &mut bytes[..self.capture_native_bytes];
            let frames = self.stream.read(bytes)?;
            if frames > 0 {
                capture.push_native(&bytes[..frames * capture.native_bpf]);
            }
        }

        if let Some(playback) = &mut self.playback {
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.playback_native[..]);
            let bytes = &mut bytes[..self.playback_native_bytes];
            playback.fill_native(bytes);
            let mut written = 0usize;
            let bpf = playback.native_bpf;
            let total = bytes.len() / bpf;
            while written < total {
                let n = self.stream.write(&bytes[written * bpf..])?;
                if n == 0 {
                    break;
                }
                written += n;
            }
        }
        Ok(())
    }

    /// Multi-threaded loop: runs until the stop flag, stopping the device
    /// after repeated fatal errors.
    fn run_loop(&mut self) {
        while !self.shared.stop_flag.load(Ordering::Acquire) {
            match self.step(true) {
                Ok(()) => self.consecutive_errors = 0,
                Err(e) if e.is_transient() || e == Error::Cancelled => {}
                Err(_) => {
                    self.consecutive_errors += 1;
                    self.shared.log.warning("stream period failed; retrying");
                    if self.consecutive_errors > MAX_CONSECUTIVE_STREAM_ERRORS {
                        self.shared.log.error("stream failed repeatedly; stopping");
                        self.shared.set_state(DeviceState::Stopped);
                        self.shared.notify(Notification::Errored);
                        break;
                    }
                }
            }
        }
    }
}

/// Lock-free parking spot for a pump shared with a driven backend's audio
/// callback. `Option<Box<T>>` is pointer-sized, so the cell's swaps are
/// plain atomic exchanges.
type PumpCell<T> = Arc<AtomicCell<Option<Box<T>>>>;

enum Engine {
    /// Backend-owned audio thread; pumps live in the cells the driven
    /// closures hold.
    Driven {
        stream: Box<dyn DrivenStream>,
        playback_cell: PumpCell<PlaybackPump>,
        capture_cell: PumpCell<CapturePump>,
    },
    /// Engine-driven, currently idle (stopped, or single-threaded).
    PolledIdle(Box<PolledEngine>),
    /// Engine-driven, loop running on a spawned thread.
    PolledRunning(JoinHandle<Box<PolledEngine>>),
}

/// A realtime audio device. See the [module docs](self).
pub struct Device {
    context: Arc<Context>,
    shared: Arc<DeviceShared>,
    engine: Option<Engine>,
    threading: ThreadingMode,
    role: DeviceRole,
    playback_desc: Option<StreamDescriptor>,
    capture_desc: Option<StreamDescriptor>,
    playback_client: Option<ClientFormat>,
    capture_client: Option<ClientFormat>,
    playback_request: DeviceRequest,
    capture_request: DeviceRequest,
    resample_algorithm: ResampleAlgorithm,
    duplex_ring_periods: usize,
    wakeup: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Device {
    /// Opens a device on `context`. The granted descriptors are available
    /// immediately; the device starts stopped.
    pub fn new(
        context: Arc<Context>,
        config: DeviceConfig,
        callback: DataCallback,
    ) -> Result<Self> {
        if config.duplex_ring_periods == 0 {
            return Err(Error::InvalidArgs);
        }
        let shared = Arc::new(DeviceShared {
            state: AtomicU8::new(DeviceState::Stopped as u8),
            notification: config.notification.clone(),
            log: context.log().clone(),
            reroute_pending: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
        });

        let mut device = Self {
            context,
            shared,
            engine: None,
            threading: config.threading,
            role: config.role,
            playback_desc: None,
            capture_desc: None,
            playback_client: None,
            capture_client: None,
            playback_request: config.playback,
            capture_request: config.capture,
            resample_algorithm: config.resample_algorithm,
            duplex_ring_periods: config.duplex_ring_periods,
            wakeup: None,
        };
        device.open_backend(callback)?;
        Ok(device)
    }

    /// (Re)opens the backend stream(s) and rebuilds the pumps around the
    /// data callback. Used by construction and by reroute handling; on
    /// failure the callback is lost with the half-built state.
    fn open_backend(&mut self, callback: DataCallback) -> Result<()> {
        let role = self.role;
        let playback_request = role.has_playback().then(|| self.playback_request.clone());
        let capture_request = role.has_capture().then(|| self.capture_request.clone());

        // Driven backends need data callbacks before negotiation finishes,
        // so the closures go through lazily-filled pump cells. Check-out
        // and return are single atomic swaps; no lock on the audio thread.
        let playback_cell: PumpCell<PlaybackPump> = Arc::new(AtomicCell::new(None));
        let capture_cell: PumpCell<CapturePump> = Arc::new(AtomicCell::new(None));
        let data = StreamDataCallbacks {
            playback: role.has_playback().then(|| {
                let cell = Arc::clone(&playback_cell);
                Box::new(move |native: &mut [u8]| {
                    if let Some(mut pump) = cell.take() {
                        pump.fill_native(native);
                        cell.store(Some(pump));
                    } else {
                        native.fill(0);
                    }
                }) as Box<dyn FnMut(&mut [u8]) + Send>
            }),
            capture: role.has_capture().then(|| {
                let cell = Arc::clone(&capture_cell);
                Box::new(move |native: &[u8]| {
                    if let Some(mut pump) = cell.take() {
                        pump.push_native(native);
                        cell.store(Some(pump));
                    }
                }) as Box<dyn FnMut(&[u8]) + Send>
            }),
        };

        let events = {
            let shared = Arc::clone(&self.shared);
            Arc::new(move |event: BackendEvent| match event {
                BackendEvent::DefaultDeviceChanged => {
                    shared.log.info("backend default device changed");
                    shared.reroute_pending.store(true, Ordering::Release);
                }
                BackendEvent::InterruptionBegan => {
                    shared.notify(Notification::InterruptionBegan);
                }
                BackendEvent::InterruptionEnded => {
                    shared.notify(Notification::InterruptionEnded);
                }
                BackendEvent::Unlocked => shared.notify(Notification::Unlocked),
                BackendEvent::StreamError => {
                    shared.log.error("backend reported a fatal stream error");
                    shared.set_state(DeviceState::Stopped);
                    shared.notify(Notification::Errored);
                }
            }) as crate::backend::BackendEventCallback
        };

        let OpenedStream {
            stream,
            playback: playback_desc,
            capture: capture_desc,
        } = self.context.backend().open_stream(
            role,
            playback_request.as_ref(),
            capture_request.as_ref(),
            data,
            events,
        )?;

        // Client side: requested fields win; unspecified fields follow the
        // granted native format (and may change across a reroute).
        let playback_client = playback_desc.as_ref().map(|desc| ClientFormat {
            channels: self.playback_request.channels.unwrap_or(desc.channels),
            sample_rate: self
                .playback_request
                .sample_rate
                .unwrap_or(desc.sample_rate),
        });
        let capture_client = capture_desc.as_ref().map(|desc| ClientFormat {
            channels: self.capture_request.channels.unwrap_or(desc.channels),
            // Duplex input is delivered at the playback client rate so
            // both sides of one callback carry the same frame count.
            sample_rate: match &playback_client {
                Some(p) if role == DeviceRole::Duplex => p.sample_rate,
                _ => self
                    .capture_request
                    .sample_rate
                    .unwrap_or(desc.sample_rate),
            },
        });

        // Duplex coupling ring, sized in client frames.
        let (ring_producer, duplex_in) = if role == DeviceRole::Duplex {
            let capture_client = capture_client.expect("duplex has capture");
            let playback = playback_desc.as_ref().expect("duplex has playback");
            let client_period = (playback.period_frames as u64
                * u64::from(capture_client.sample_rate)
                / u64::from(playback.sample_rate).max(1)) as usize
                + 1;
            let (mut producer, consumer) = pcm_ring(
                SampleFormat::F32,
                capture_client.channels,
                client_period * self.duplex_ring_periods,
            )?;
            // Prime with one period of silence so the first playback pull
            // does not report an underrun before capture has delivered.
            producer.seek(client_period.min(producer.capacity_frames()))?;
            let staging_frames = producer.capacity_frames();
            (
                Some(producer),
                Some(DuplexIn {
                    consumer,
                    staging: vec![0.0; staging_frames * capture_client.channels as usize],
                    channels: capture_client.channels,
                }),
            )
        } else {
            (None, None)
        };

        // Build pumps now that negotiation is done. The playback pump
        // takes the callback when it exists; otherwise the capture pump
        // does (capture-only and loopback roles).
        let mut callback = Some(callback);
        if let (Some(desc), Some(client)) = (&playback_desc, playback_client) {
            let pump = PlaybackPump::new(
                callback.take().ok_or(Error::InvalidOperation)?,
                client,
                desc,
                self.resample_algorithm,
                duplex_in,
                Arc::clone(&self.shared),
            )?;
            playback_cell.store(Some(Box::new(pump)));
        }
        if let (Some(desc), Some(client)) = (&capture_desc, capture_client) {
            let pump = CapturePump::new(
                callback.take(),
                ring_producer,
                client,
                desc,
                self.resample_algorithm,
                Arc::clone(&self.shared),
            )?;
            capture_cell.store(Some(Box::new(pump)));
        }

        let engine = match stream {
            BackendStream::Driven(stream) => {
                if self.threading == ThreadingMode::SingleThreaded {
                    return Err(Error::DeviceTypeNotSupported);
                }
                self.wakeup = None;
                Engine::Driven {
                    stream,
                    playback_cell,
                    capture_cell,
                }
            }
            BackendStream::Polled(stream) => {
                self.wakeup = stream.wakeup_handle();
                let playback_native_bytes = playback_desc
                    .as_ref()
                    .map_or(0, |d| d.period_frames * d.bytes_per_frame());
                let capture_native_bytes = capture_desc
                    .as_ref()
                    .map_or(0, |d| d.period_frames * d.bytes_per_frame());
                Engine::PolledIdle(Box::new(PolledEngine {
                    stream,
                    playback: playback_cell.take().map(|pump| *pump),
                    capture: capture_cell.take().map(|pump| *pump),
                    playback_native: vec![0.0; playback_native_bytes.div_ceil(4)],
                    playback_native_bytes,
                    capture_native: vec![0.0; capture_native_bytes.div_ceil(4)],
                    capture_native_bytes,
                    shared: Arc::clone(&self.shared),
                    consecutive_errors: 0,
                }))
            }
        };

        self.engine = Some(engine);
        self.playback_desc = playback_desc;
        self.capture_desc = capture_desc;
        self.playback_client = playback_client;
        self.capture_client = capture_client;
        Ok(())
    }

    /// The device's current run state.
    pub fn state(&self) -> DeviceState {
        self.shared.state()
    }

    /// Granted playback descriptor, for roles that have one.
    pub fn playback_descriptor(&self) -> Option<&StreamDescriptor> {
        self.playback_desc.as_ref()
    }

    /// Granted capture descriptor, for roles that have one.
    pub fn capture_descriptor(&self) -> Option<&StreamDescriptor> {
        self.capture_desc.as_ref()
    }

    /// Client channel count and sample rate of the playback side.
    pub fn playback_client_format(&self) -> Option<(u16, u32)> {
        self.playback_client.map(|c| (c.channels, c.sample_rate))
    }

    /// Client channel count and sample rate of the capture side.
    pub fn capture_client_format(&self) -> Option<(u16, u32)> {
        self.capture_client.map(|c| (c.channels, c.sample_rate))
    }

    /// Device name for a role side.
    pub fn name(&self, role: DeviceRole) -> Result<&str> {
        let desc = if role.has_playback() {
            self.playback_desc.as_ref()
        } else {
            self.capture_desc.as_ref()
        };
        desc.map(|d| d.device_name.as_str())
            .ok_or(Error::DeviceTypeNotSupported)
    }

    /// Starts the stream. A no-op when already started. Returns with the
    /// audio thread running (multi-threaded) or the stream ready to step.
    pub fn start(&mut self) -> Result<()> {
        match self.state() {
            DeviceState::Started => return Ok(()),
            DeviceState::Starting | DeviceState::Stopping => return Err(Error::Busy),
            DeviceState::Stopped => {}
        }
        self.shared.set_state(DeviceState::Starting);

        let result = self.start_engine();
        match result {
            Ok(()) => {
                self.shared.set_state(DeviceState::Started);
                self.shared.notify(Notification::Started);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(DeviceState::Stopped);
                Err(e)
            }
        }
    }

    fn start_engine(&mut self) -> Result<()> {
        match self.engine.take() {
            Some(Engine::Driven {
                mut stream,
                playback_cell,
                capture_cell,
            }) => {
                let result = stream.start();
                self.engine = Some(Engine::Driven {
                    stream,
                    playback_cell,
                    capture_cell,
                });
                result
            }
            Some(Engine::PolledIdle(mut engine)) => {
                engine.stream.start()?;
                if self.threading == ThreadingMode::MultiThreaded {
                    self.shared.stop_flag.store(false, Ordering::Release);
                    let handle = std::thread::Builder::new()
                        .name("tono-device".to_string())
                        .spawn(move || {
                            engine.run_loop();
                            engine
                        })
                        .map_err(|_| Error::OutOfMemory)?;
                    self.engine = Some(Engine::PolledRunning(handle));
                } else {
                    self.engine = Some(Engine::PolledIdle(engine));
                }
                Ok(())
            }
            Some(running @ Engine::PolledRunning(_)) => {
                self.engine = Some(running);
                Ok(())
            }
            None => Err(Error::DeviceNotInitialized),
        }
    }

    /// Stops the stream and drains the period loop. A no-op when already
    /// stopped.
    pub fn stop(&mut self) -> Result<()> {
        match self.state() {
            DeviceState::Stopped => return Ok(()),
            DeviceState::Starting | DeviceState::Stopping => return Err(Error::Busy),
            DeviceState::Started => {}
        }
        self.shared.set_state(DeviceState::Stopping);
        let result = self.stop_engine();
        self.shared.set_state(DeviceState::Stopped);
        if result.is_ok() {
            self.shared.notify(Notification::Stopped);
        }
        result
    }

    fn stop_engine(&mut self) -> Result<()> {
        match self.engine.take() {
            Some(Engine::Driven {
                mut stream,
                playback_cell,
                capture_cell,
            }) => {
                let result = stream.stop();
                self.engine = Some(Engine::Driven {
                    stream,
                    playback_cell,
                    capture_cell,
                });
                result
            }
            Some(Engine::PolledRunning(handle)) => {
                self.shared.stop_flag.store(true, Ordering::Release);
                if let Some(wake) = &self.wakeup {
                    wake();
                }
                let mut engine = handle.join().map_err(|_| Error::InvalidOperation)?;
                let result = engine.stream.stop();
                self.engine = Some(Engine::PolledIdle(engine));
                result
            }
            Some(Engine::PolledIdle(mut engine)) => {
                let result = engine.stream.stop();
                self.engine = Some(Engine::PolledIdle(engine));
                result
            }
            None => Err(Error::DeviceNotInitialized),
        }
    }

    /// Processes at most one period on the calling thread. Single-threaded
    /// devices only; the device must be started.
    ///
    /// Returns [`Error::Busy`] when non-blocking and no period is due, and
    /// [`Error::Cancelled`] when a [`wakeup`](Self::wakeup) aborted a
    /// blocking wait.
    pub fn step(&mut self, mode: BlockingMode) -> Result<()> {
        if self.threading != ThreadingMode::SingleThreaded {
            return Err(Error::InvalidOperation);
        }
        if self.state() != DeviceState::Started {
            return Err(Error::DeviceNotStarted);
        }
        self.process_events()?;
        match self.engine.as_mut() {
            Some(Engine::PolledIdle(engine)) => {
                engine.step(mode == BlockingMode::Blocking)
            }
            _ => Err(Error::InvalidOperation),
        }
    }

    /// Unblocks a pending blocking [`step`](Self::step) without changing
    /// device state. A no-op when the backend offers no wakeup primitive.
    pub fn wakeup(&self) {
        if let Some(wake) = &self.wakeup {
            wake();
        }
    }

    /// A clonable handle performing [`wakeup`](Self::wakeup), for threads
    /// that cannot hold a reference to the device while another steps it.
    pub fn wakeup_handle(&self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        self.wakeup.clone()
    }

    /// Handles deferred backend events: currently, transparent reroute
    /// onto a changed default device. Multi-threaded applications call
    /// this from their control loop; single-threaded stepping does it
    /// automatically.
    pub fn process_events(&mut self) -> Result<()> {
        if !self.shared.reroute_pending.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let opened_on_default = self
            .playback_desc
            .as_ref()
            .map(|d| d.on_default_device)
            .or_else(|| self.capture_desc.as_ref().map(|d| d.on_default_device))
            .unwrap_or(false);
        if !opened_on_default {
            return Ok(());
        }

        self.shared.log.info("rerouting onto the new default device");
        let was_started = self.state() == DeviceState::Started;
        if was_started {
            self.stop()?;
        }
        let Some(callback) = self.take_callback() else {
            self.shared
                .log
                .error("reroute failed: data callback unrecoverable");
            self.shared.notify(Notification::Errored);
            return Err(Error::InvalidOperation);
        };
        self.open_backend(callback)?;
        if was_started {
            self.start()?;
        }
        self.shared.notify(Notification::Rerouted);
        Ok(())
    }

    /// Tears the engine down and recovers the data callback from whichever
    /// pump owns it. The stream must be stopped first.
    fn take_callback(&mut self) -> Option<DataCallback> {
        match self.engine.take()? {
            Engine::Driven {
                stream,
                playback_cell,
                capture_cell,
            } => {
                // Dropping the stream stops the backend's audio thread,
                // which parks the pumps back in their cells.
                drop(stream);
                let playback = Self::drain_pump(&playback_cell, self.playback_desc.is_some());
                let capture = Self::drain_pump(&capture_cell, self.capture_desc.is_some());
                playback
                    .map(|pump| pump.into_callback())
                    .or_else(|| capture.and_then(|pump| pump.into_callback()))
            }
            Engine::PolledIdle(engine) => {
                let PolledEngine {
                    playback, capture, ..
                } = *engine;
                playback
                    .map(PlaybackPump::into_callback)
                    .or_else(|| capture.and_then(CapturePump::into_callback))
            }
            Engine::PolledRunning(handle) => {
                // The caller stops before rebuilding; drain defensively.
                self.shared.stop_flag.store(true, Ordering::Release);
                if let Some(wake) = &self.wakeup {
                    wake();
                }
                let engine = handle.join().ok()?;
                let PolledEngine {
                    playback, capture, ..
                } = *engine;
                playback
                    .map(PlaybackPump::into_callback)
                    .or_else(|| capture.and_then(CapturePump::into_callback))
            }
        }
    }

    /// Waits out an in-flight audio callback and takes the pump from its
    /// cell. Bounded; a cell that never yields means the backend did not
    /// quiesce on stream drop.
    fn drain_pump<T>(cell: &PumpCell<T>, expected: bool) -> Option<Box<T>> {
        if !expected {
            return None;
        }
        for _ in 0..1024 {
            if let Some(pump) = cell.take() {
                return Some(pump);
            }
            std::thread::yield_now();
        }
        None
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Uninit implies stop-and-drain; failures here have no recipient.
        let _ = self.stop();
    }
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("backend", &self.context.backend_name())
            .finish_non_exhaustive()
    }
}
