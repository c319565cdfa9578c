//! Graph node that pulls a data source.
//!
//! [`DataSourceNode`] wraps any [`DataSource`] and exposes it as a node
//! with a single output bus carrying `f32` at the graph rate. When the
//! source's native format differs, an internal [`DataConverter`] bridges
//! it; the staging buffer is sized at construction so process stays
//! allocation-free.

use tono_convert::{DataConverter, DataConverterConfig};
use tono_core::channel::ChannelMap;
use tono_core::result::{Error, Result};
use tono_core::source::{DataSource, SourceFormat};
use tono_core::SampleFormat;

use crate::graph::NodeGraph;
use crate::node::{Node, ProcessContext};

/// A data source exposed as a single-output graph node.
pub struct DataSourceNode {
    source: Box<dyn DataSource>,
    converter: Option<DataConverter>,
    native_bpf: usize,
    out_channels: [u16; 1],
    /// Native-format staging for converter input; empty in the direct path.
    staging: Vec<u8>,
    staging_frames: usize,
}

impl DataSourceNode {
    /// Wraps `source`, keeping its native channel count.
    pub fn new(source: Box<dyn DataSource>, graph: &NodeGraph) -> Result<Self> {
        let channels = source.format().channels;
        Self::with_channels(source, graph, channels)
    }

    /// Wraps `source`, converting to `channels` channels on the output
    /// bus. The bus always carries `f32` at the graph sample rate.
    pub fn with_channels(
        source: Box<dyn DataSource>,
        graph: &NodeGraph,
        channels: u16,
    ) -> Result<Self> {
        let native = source.format();
        let out_format = SourceFormat {
            format: SampleFormat::F32,
            channels,
            sample_rate: graph.sample_rate(),
            channel_map: ChannelMap::standard(channels)?,
        };

        let (converter, staging_frames) = if native == out_format {
            (None, 0)
        } else {
            let converter = DataConverter::new(DataConverterConfig::new(native, out_format))?;
            // Enough native frames to satisfy the largest single pull, plus
            // slack for the resampler lookahead drifting across calls.
            let frames = converter
                .required_input_frame_count(graph.max_frames_per_read() as u64)
                as usize
                + 8;
            (Some(converter), frames)
        };

        Ok(Self {
            staging: vec![0u8; staging_frames * native.bytes_per_frame()],
            native_bpf: native.bytes_per_frame(),
            source,
            converter,
            out_channels: [channels],
            staging_frames,
        })
    }

    /// The wrapped source.
    pub fn source(&self) -> &dyn DataSource {
        &*self.source
    }

    /// The wrapped source, mutably (e.g. to seek between reads).
    pub fn source_mut(&mut self) -> &mut dyn DataSource {
        &mut *self.source
    }
}

impl Node for DataSourceNode {
    fn input_buses(&self) -> &[u16] {
        &[]
    }

    fn output_buses(&self) -> &[u16] {
        &self.out_channels
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<usize> {
        let frames = ctx.frames();
        let out_bpf = SampleFormat::F32.bytes_per_frame(self.out_channels[0]);
        let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(ctx.output(0));

        let Some(converter) = &mut self.converter else {
            // Native format already matches the bus: read straight in.
            return match self.source.read_pcm_frames(&mut out_bytes[..frames * out_bpf]) {
                Ok(n) => Ok(n as usize),
                Err(e) => Err(e),
            };
        };

        let mut produced = 0usize;
        let mut ended = false;
        while produced < frames && !ended {
            let need = converter.required_input_frame_count((frames - produced) as u64) as usize;
            let take = need.min(self.staging_frames);
            if take == 0 {
                break;
            }
            let n_read = match self
                .source
                .read_pcm_frames(&mut self.staging[..take * self.native_bpf])
            {
                Ok(n) => n as usize,
                Err(Error::AtEnd) => {
                    ended = true;
                    0
                }
                Err(e) => return Err(e),
            };
            if n_read == 0 {
                break;
            }
            let (_, p) = converter.process(
                &self.staging[..n_read * self.native_bpf],
                &mut out_bytes[produced * out_bpf..frames * out_bpf],
            )?;
            produced += p as usize;
        }

        if produced == 0 && ended {
            return Err(Error::AtEnd);
        }
        Ok(produced)
    }
}
