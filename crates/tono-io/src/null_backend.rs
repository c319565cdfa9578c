//! The null backend: a deterministic device with no hardware behind it.
//!
//! Playback bytes are discarded, capture bytes come from an optional
//! generator (or silence), and pacing against the wall clock can be
//! disabled so tests can step as fast as they like. This is also the
//! backend that can simulate out-of-band events such as a default-device
//! change, which is how reroute handling is exercised without an OS.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tono_core::channel::ChannelMap;
use tono_core::format::encode_from_f32;
use tono_core::result::{Error, Result};
use tono_core::{LogBus, SampleFormat};

use crate::backend::{
    Backend, BackendContext, BackendEvent, BackendEventCallback, BackendInfo, BackendStream,
    DeviceId, DeviceInfo, DeviceRequest, DeviceRole, NativeDataFormat, OpenedStream, PolledStream,
    ShareMode, StreamDataCallbacks, StreamDescriptor,
};

/// Generator for simulated capture input: fills interleaved `f32` frames
/// starting at the given absolute frame index.
pub type CaptureFill = Arc<dyn Fn(&mut [f32], u64) + Send + Sync>;

/// Configuration for a [`NullBackend`].
#[derive(Clone, Default)]
pub struct NullBackendConfig {
    /// Pace periods against the wall clock. Off, every
    /// [`wait_period`](PolledStream::wait_period) is immediately due,
    /// which is what deterministic tests want.
    pub pace: bool,
    /// Simulated capture signal; silence when absent.
    pub capture_fill: Option<CaptureFill>,
}

impl NullBackendConfig {
    /// Real-time pacing, silent capture.
    pub fn paced() -> Self {
        Self {
            pace: true,
            capture_fill: None,
        }
    }
}

struct NullShared {
    /// Event callbacks of every stream opened through this backend.
    events: Mutex<Vec<BackendEventCallback>>,
}

/// Deterministic no-hardware backend.
pub struct NullBackend {
    config: NullBackendConfig,
    shared: Arc<NullShared>,
}

/// Control handle for simulating backend events from tests.
#[derive(Clone)]
pub struct NullBackendHandle {
    shared: Arc<NullShared>,
}

impl NullBackendHandle {
    /// Reports a default-device change to every open stream, synchronously
    /// on the calling thread.
    pub fn simulate_default_device_change(&self) {
        for callback in self.shared.events.lock().unwrap().iter() {
            callback(BackendEvent::DefaultDeviceChanged);
        }
    }

    /// Reports an unrecoverable stream error to every open stream.
    pub fn simulate_stream_error(&self) {
        for callback in self.shared.events.lock().unwrap().iter() {
            callback(BackendEvent::StreamError);
        }
    }
}

impl NullBackend {
    /// A paced null backend with silent capture.
    pub fn new() -> Self {
        Self::with_config(NullBackendConfig::paced()).0
    }

    /// A null backend with explicit config, plus the simulation handle.
    pub fn with_config(config: NullBackendConfig) -> (Self, NullBackendHandle) {
        let shared = Arc::new(NullShared {
            events: Mutex::new(Vec::new()),
        });
        (
            Self {
                config,
                shared: Arc::clone(&shared),
            },
            NullBackendHandle { shared },
        )
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NullBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo { name: "null" }
    }

    fn create_context(&self, _log: &LogBus) -> Result<Box<dyn BackendContext>> {
        Ok(Box::new(NullContext {
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct NullContext {
    config: NullBackendConfig,
    shared: Arc<NullShared>,
}

fn null_device_info(role: DeviceRole) -> DeviceInfo {
    let (id, name) = match role {
        DeviceRole::Playback => ("null-playback", "Null Playback Device"),
        _ => ("null-capture", "Null Capture Device"),
    };
    DeviceInfo {
        id: DeviceId(id.to_string()),
        name: name.to_string(),
        is_default: true,
        native_formats: vec![NativeDataFormat {
            format: SampleFormat::F32,
            channels: 2,
            min_sample_rate: 8_000,
            max_sample_rate: 384_000,
            channel_map: ChannelMap::standard(2).expect("stereo map"),
        }],
    }
}

fn negotiate(request: &DeviceRequest, role: DeviceRole) -> Result<StreamDescriptor> {
    if request.share_mode == ShareMode::Exclusive {
        return Err(Error::ShareModeNotSupported);
    }
    let channels = request.channels.unwrap_or(2);
    let sample_rate = request.sample_rate.unwrap_or(48_000);
    if channels == 0 || sample_rate == 0 {
        return Err(Error::InvalidArgs);
    }
    let info = null_device_info(role);
    Ok(StreamDescriptor {
        device_id: request.device_id.clone().unwrap_or(info.id),
        device_name: info.name,
        on_default_device: request.device_id.is_none(),
        format: request.format.unwrap_or(SampleFormat::F32),
        channels,
        sample_rate,
        channel_map: match request.channel_map {
            Some(map) => map,
            None => ChannelMap::standard(channels).map_err(|_| Error::InvalidArgs)?,
        },
        period_frames: request.period_frames.unwrap_or(480),
        period_count: request.period_count.unwrap_or(2),
        share_mode: ShareMode::Shared,
    })
}

impl BackendContext for NullContext {
    fn enumerate_devices(
        &self,
        callback: &mut dyn FnMut(DeviceRole, &DeviceInfo),
    ) -> Result<()> {
        callback(DeviceRole::Playback, &null_device_info(DeviceRole::Playback));
        callback(DeviceRole::Capture, &null_device_info(DeviceRole::Capture));
        Ok(())
    }

    fn device_info(&self, id: Option<&DeviceId>, role: DeviceRole) -> Result<DeviceInfo> {
        let info = null_device_info(role);
        match id {
            None => Ok(info),
            Some(id) if *id == info.id => Ok(info),
            Some(_) => Err(Error::Unavailable),
        }
    }

    fn open_stream(
        &self,
        role: DeviceRole,
        playback: Option<&DeviceRequest>,
        capture: Option<&DeviceRequest>,
        _data: StreamDataCallbacks,
        events: BackendEventCallback,
    ) -> Result<OpenedStream> {
        let playback_desc = match (role.has_playback(), playback) {
            (true, Some(request)) => Some(negotiate(request, DeviceRole::Playback)?),
            (true, None) => Some(negotiate(&DeviceRequest::default(), DeviceRole::Playback)?),
            (false, _) => None,
        };
        let capture_desc = match (role.has_capture(), capture) {
            (true, Some(request)) => Some(negotiate(request, DeviceRole::Capture)?),
            (true, None) => Some(negotiate(&DeviceRequest::default(), DeviceRole::Capture)?),
            (false, _) => None,
        };

        // Pace by the playback clock when both sides exist.
        let timing = playback_desc
            .as_ref()
            .or(capture_desc.as_ref())
            .expect("role implies at least one direction");
        let period = Duration::from_secs_f64(
            timing.period_frames as f64 / f64::from(timing.sample_rate),
        );

        let capture_staging = capture_desc
            .as_ref()
            .map(|d| vec![0.0f32; d.period_frames * d.channels as usize]);

        self.shared.events.lock().unwrap().push(events);

        Ok(OpenedStream {
            stream: BackendStream::Polled(Box::new(NullStream {
                pace: self.config.pace,
                period,
                playback_bpf: playback_desc
                    .as_ref()
                    .map_or(8, StreamDescriptor::bytes_per_frame),
                pacer: Arc::new(Pacer {
                    state: Mutex::new(PacerState {
                        next_due: None,
                        woken: false,
                    }),
                    condvar: Condvar::new(),
                }),
                capture_fill: self.config.capture_fill.clone(),
                capture_desc: capture_desc.clone(),
                capture_staging,
                capture_cursor: 0,
            })),
            playback: playback_desc,
            capture: capture_desc,
        })
    }
}

struct PacerState {
    next_due: Option<Instant>,
    woken: bool,
}

struct Pacer {
    state: Mutex<PacerState>,
    condvar: Condvar,
}

struct NullStream {
    pace: bool,
    period: Duration,
    playback_bpf: usize,
    pacer: Arc<Pacer>,
    capture_fill: Option<CaptureFill>,
    capture_desc: Option<StreamDescriptor>,
    /// f32 staging for the capture generator before native encoding.
    capture_staging: Option<Vec<f32>>,
    capture_cursor: u64,
}

impl PolledStream for NullStream {
    fn start(&mut self) -> Result<()> {
        let mut state = self.pacer.state.lock().unwrap();
        state.next_due = Some(Instant::now() + self.period);
        state.woken = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.pacer.state.lock().unwrap().next_due = None;
        Ok(())
    }

    fn wait_period(&mut self, blocking: bool) -> Result<()> {
        if !self.pace {
            return Ok(());
        }
        let mut state = self.pacer.state.lock().unwrap();
        loop {
            if state.woken {
                state.woken = false;
                return Err(Error::Cancelled);
            }
            let Some(due) = state.next_due else {
                return Err(Error::DeviceNotStarted);
            };
            let now = Instant::now();
            if now >= due {
                state.next_due = Some(due + self.period);
                return Ok(());
            }
            if !blocking {
                return Err(Error::Busy);
            }
            let (next, _timeout) = self
                .pacer
                .condvar
                .wait_timeout(state, due - now)
                .unwrap();
            state = next;
        }
    }

    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let desc = self
            .capture_desc
            .as_ref()
            .ok_or(Error::DeviceTypeNotSupported)?;
        let bpf = desc.bytes_per_frame();
        let frames = (dst.len() / bpf).min(desc.period_frames);
        let channels = desc.channels as usize;

        match (&self.capture_fill, &mut self.capture_staging) {
            (Some(fill), Some(staging)) => {
                let samples = &mut staging[..frames * channels];
                fill(samples, self.capture_cursor);
                encode_from_f32(desc.format, samples, &mut dst[..frames * bpf])?;
            }
            _ => dst[..frames * bpf].fill(0),
        }
        self.capture_cursor += frames as u64;
        Ok(frames)
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        // The bit bucket accepts whole frames only.
        Ok(src.len() / self.playback_bpf)
    }

    fn wakeup_handle(&self) -> Option<Arc<dyn Fn() + Send + Sync>> {
        let pacer = Arc::clone(&self.pacer);
        Some(Arc::new(move || {
            pacer.state.lock().unwrap().woken = true;
            pacer.condvar.notify_all();
        }))
    }
}
