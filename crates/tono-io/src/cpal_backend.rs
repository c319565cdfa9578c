//! The cpal OS port (ALSA, CoreAudio, WASAPI behind one crate).
//!
//! cpal streams are driven: the platform owns the audio thread and calls
//! back with `f32` buffers, which map straight onto the engine's
//! [`StreamDataCallbacks`]. Streams are opened in `f32` at the device's
//! default (or requested) channel count and rate; everything else is the
//! engine's data conversion pipeline.
//!
//! Reroute limitation: cpal exposes no default-device-change notification,
//! so this port never emits
//! [`BackendEvent::DefaultDeviceChanged`]; reroute handling is exercised
//! through the null backend instead.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use tono_core::channel::ChannelMap;
use tono_core::result::{Error, Result};
use tono_core::{LogBus, SampleFormat};

use crate::backend::{
    Backend, BackendContext, BackendEvent, BackendEventCallback, BackendInfo, BackendStream,
    DeviceId, DeviceInfo, DeviceRequest, DeviceRole, DrivenStream, NativeDataFormat, OpenedStream,
    ShareMode, StreamDataCallbacks, StreamDescriptor,
};

/// Errors surfaced by the cpal layer before mapping onto engine result
/// codes.
#[derive(Debug, thiserror::Error)]
pub enum CpalError {
    /// Device enumeration failed.
    #[error("device enumeration failed: {0}")]
    Devices(#[from] cpal::DevicesError),
    /// A device refused to report its name.
    #[error("device name unavailable: {0}")]
    Name(#[from] cpal::DeviceNameError),
    /// No default stream config.
    #[error("default stream config unavailable: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
    /// Stream construction failed.
    #[error("stream construction failed: {0}")]
    Build(#[from] cpal::BuildStreamError),
    /// Stream start failed.
    #[error("stream start failed: {0}")]
    Play(#[from] cpal::PlayStreamError),
    /// Stream stop failed.
    #[error("stream stop failed: {0}")]
    Pause(#[from] cpal::PauseStreamError),
}

impl CpalError {
    fn code(&self) -> Error {
        match self {
            Self::Devices(_) | Self::Name(_) => Error::Unavailable,
            Self::DefaultConfig(_) => Error::FormatNotSupported,
            Self::Build(_) => Error::FailedToOpenBackendDevice,
            Self::Play(_) | Self::Pause(_) => Error::InvalidOperation,
        }
    }
}

/// The cpal backend.
pub struct CpalBackend;

impl CpalBackend {
    /// The backend over the platform default host.
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpalBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo { name: "cpal" }
    }

    fn create_context(&self, log: &LogBus) -> Result<Box<dyn BackendContext>> {
        let host = cpal::default_host();
        // Probe enumeration once so a hostless environment falls through
        // to the next backend in the priority list.
        host.devices().map_err(|e| {
            log.info(&format!("cpal: host probe failed: {e}"));
            Error::NoBackend
        })?;
        Ok(Box::new(CpalContext {
            host,
            log: log.clone(),
        }))
    }
}

struct CpalContext {
    host: cpal::Host,
    log: LogBus,
}

fn device_info(device: &cpal::Device, role: DeviceRole, is_default: bool) -> Result<DeviceInfo> {
    let name = device.name().map_err(|e| {
        let e = CpalError::from(e);
        e.code()
    })?;
    let config = match role {
        DeviceRole::Playback => device.default_output_config(),
        _ => device.default_input_config(),
    }
    .map_err(|e| CpalError::from(e).code())?;

    let channels = config.channels();
    Ok(DeviceInfo {
        id: DeviceId(name.clone()),
        name,
        is_default,
        native_formats: vec![NativeDataFormat {
            format: SampleFormat::F32,
            channels,
            min_sample_rate: config.sample_rate().0,
            max_sample_rate: config.sample_rate().0,
            channel_map: ChannelMap::standard(channels).map_err(|_| Error::FormatNotSupported)?,
        }],
    })
}

impl CpalContext {
    fn find_device(&self, id: Option<&DeviceId>, role: DeviceRole) -> Result<cpal::Device> {
        let default = match role {
            DeviceRole::Playback => self.host.default_output_device(),
            _ => self.host.default_input_device(),
        };
        match id {
            None => default.ok_or(Error::Unavailable),
            Some(DeviceId(name)) => {
                let devices = match role {
                    DeviceRole::Playback => self.host.output_devices(),
                    _ => self.host.input_devices(),
                }
                .map_err(|e| CpalError::from(e).code())?;
                for device in devices {
                    if device.name().map(|n| n == *name).unwrap_or(false) {
                        return Ok(device);
                    }
                }
                Err(Error::Unavailable)
            }
        }
    }

    fn open_direction(
        &self,
        role: DeviceRole,
        request: &DeviceRequest,
        data: &mut StreamDataCallbacks,
        events: &BackendEventCallback,
    ) -> Result<(cpal::Stream, StreamDescriptor)> {
        if request.share_mode == ShareMode::Exclusive {
            return Err(Error::ShareModeNotSupported);
        }
        let device = self.find_device(request.device_id.as_ref(), role)?;
        let name = device.name().map_err(|e| CpalError::from(e).code())?;
        let default_config = match role {
            DeviceRole::Playback => device.default_output_config(),
            _ => device.default_input_config(),
        }
        .map_err(|e| CpalError::from(e).code())?;

        let channels = request.channels.unwrap_or(default_config.channels());
        let sample_rate = request.sample_rate.unwrap_or(default_config.sample_rate().0);
        let period_frames = request.period_frames.unwrap_or(480);
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: match request.period_frames {
                Some(frames) => cpal::BufferSize::Fixed(frames as u32),
                None => cpal::BufferSize::Default,
            },
        };

        let error_events = events.clone();
        let error_log = self.log.clone();
        let error_callback = move |err: cpal::StreamError| {
            error_log.error(&format!("cpal stream error: {err}"));
            error_events(BackendEvent::StreamError);
        };

        let stream = match role {
            DeviceRole::Playback => {
                let mut fill = data.playback.take().ok_or(Error::InvalidArgs)?;
                device
                    .build_output_stream(
                        &config,
                        move |buffer: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            fill(bytemuck::cast_slice_mut(buffer));
                        },
                        error_callback,
                        None,
                    )
                    .map_err(|e| CpalError::from(e).code())?
            }
            _ => {
                let mut push = data.capture.take().ok_or(Error::InvalidArgs)?;
                device
                    .build_input_stream(
                        &config,
                        move |buffer: &[f32], _: &cpal::InputCallbackInfo| {
                            push(bytemuck::cast_slice(buffer));
                        },
                        error_callback,
                        None,
                    )
                    .map_err(|e| CpalError::from(e).code())?
            }
        };

        Ok((
            stream,
            StreamDescriptor {
                device_id: DeviceId(name.clone()),
                device_name: name,
                on_default_device: request.device_id.is_none(),
                format: SampleFormat::F32,
                channels,
                sample_rate,
                channel_map: ChannelMap::standard(channels)
                    .map_err(|_| Error::FormatNotSupported)?,
                period_frames,
                period_count: request.period_count.unwrap_or(2),
                share_mode: ShareMode::Shared,
            },
        ))
    }
}

impl BackendContext for CpalContext {
    fn enumerate_devices(
        &self,
        callback: &mut dyn FnMut(DeviceRole, &DeviceInfo),
    ) -> Result<()> {
        let default_output = self
            .host
            .default_output_device()
            .and_then(|d| d.name().ok());
        if let Ok(outputs) = self.host.output_devices() {
            for device in outputs {
                let is_default =
                    device.name().ok().as_deref() == default_output.as_deref();
                if let Ok(info) = device_info(&device, DeviceRole::Playback, is_default) {
                    callback(DeviceRole::Playback, &info);
                }
            }
        }

        let default_input = self.host.default_input_device().and_then(|d| d.name().ok());
        if let Ok(inputs) = self.host.input_devices() {
            for device in inputs {
                let is_default = device.name().ok().as_deref() == default_input.as_deref();
                if let Ok(info) = device_info(&device, DeviceRole::Capture, is_default) {
                    callback(DeviceRole::Capture, &info);
                }
            }
        }
        Ok(())
    }

    fn device_info(&self, id: Option<&DeviceId>, role: DeviceRole) -> Result<DeviceInfo> {
        let device = self.find_device(id, role)?;
        device_info(&device, role, id.is_none())
    }

    fn open_stream(
        &self,
        role: DeviceRole,
        playback: Option<&DeviceRequest>,
        capture: Option<&DeviceRequest>,
        mut data: StreamDataCallbacks,
        events: BackendEventCallback,
    ) -> Result<OpenedStream> {
        if role == DeviceRole::Loopback {
            return Err(Error::DeviceTypeNotSupported);
        }

        let mut streams = Vec::new();
        let playback_desc = if role.has_playback() {
            let request = playback.cloned().unwrap_or_default();
            let (stream, desc) =
                self.open_direction(DeviceRole::Playback, &request, &mut data, &events)?;
            streams.push(stream);
            Some(desc)
        } else {
            None
        };
        let capture_desc = if role.has_capture() {
            let request = capture.cloned().unwrap_or_default();
            let (stream, desc) =
                self.open_direction(DeviceRole::Capture, &request, &mut data, &events)?;
            streams.push(stream);
            Some(desc)
        } else {
            None
        };

        Ok(OpenedStream {
            stream: BackendStream::Driven(Box::new(CpalStream { streams })),
            playback: playback_desc,
            capture: capture_desc,
        })
    }
}

struct CpalStream {
    streams: Vec<cpal::Stream>,
}

impl DrivenStream for CpalStream {
    fn start(&mut self) -> Result<()> {
        for stream in &self.streams {
            stream.play().map_err(|e| CpalError::from(e).code())?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        for stream in &self.streams {
            stream.pause().map_err(|e| CpalError::from(e).code())?;
        }
        Ok(())
    }
}
