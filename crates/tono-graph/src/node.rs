//! The node trait and its processing context.
//!
//! A [`Node`] declares its input and output buses (each with a channel
//! count) and a `process` callback. Buses carry interleaved `f32` at the
//! graph sample rate; the graph owns all bus buffers and hands them to the
//! node through a [`ProcessContext`].
//!
//! `process` runs on the audio thread. Implementations must not allocate,
//! block, or take contended locks.

use tono_core::result::Result;

/// Maximum buses on either side of a node.
pub const MAX_NODE_BUSES: usize = 4;

/// Stable identifier of a node in its graph's arena.
///
/// IDs are assigned sequentially and never reused within a graph instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Raw arena index.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Behavioral flags a node declares at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// With matching single-input/single-output shapes, the graph routes
    /// the summed input straight through without calling `process`.
    pub passthrough: bool,
    /// Processed on every graph read even when nothing downstream pulled,
    /// so generators keep their phase.
    pub continuous: bool,
    /// Disconnected input buses are passed as `None` instead of silence;
    /// the node must tolerate missing input.
    pub allow_null_input: bool,
    /// Input buses accept connections of any channel count; mismatched
    /// contributions are remixed by the standard mixdown at attach time.
    pub flexible_input: bool,
}

/// Per-node run state.
///
/// Nodes start in `Started`. A `Stopped` node outputs silence on all buses
/// and does not pull its upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Participating in graph evaluation.
    Started,
    /// Emitting silence; upstream pulls are suppressed.
    Stopped,
}

/// Buffer access handed to [`Node::process`].
///
/// Input buses are read-only sums of their connected upstream outputs
/// (`None` for a disconnected bus on an `allow_null_input` node). Output
/// buses are write-only slices into the node's own output cache; a node
/// writes them one bus at a time.
pub struct ProcessContext<'a> {
    pub(crate) frames: usize,
    pub(crate) inputs: &'a [Option<&'a [f32]>],
    pub(crate) input_channels: &'a [u16],
    pub(crate) outputs: &'a mut [f32],
    /// Per-output-bus `(sample offset, channels)` into `outputs`.
    pub(crate) output_spans: &'a [(usize, u16)],
}

impl<'a> ProcessContext<'a> {
    /// Frames to produce this call. Never exceeds the graph's configured
    /// maximum read size, but may be anything down to zero.
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Number of input buses.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Number of output buses.
    pub fn output_count(&self) -> usize {
        self.output_spans.len()
    }

    /// Channel count of input bus `bus`.
    pub fn input_channels(&self, bus: usize) -> u16 {
        self.input_channels[bus]
    }

    /// Channel count of output bus `bus`.
    pub fn output_channels(&self, bus: usize) -> u16 {
        self.output_spans[bus].1
    }

    /// The summed input on `bus`, `frames() * input_channels(bus)` samples.
    /// `None` only on `allow_null_input` nodes with the bus disconnected.
    ///
    /// The returned slice borrows the graph's bus buffer, not this context,
    /// so it can be held across [`output`](Self::output) calls.
    #[inline]
    pub fn input(&self, bus: usize) -> Option<&'a [f32]> {
        self.inputs[bus].map(|s| &s[..self.frames * self.input_channels[bus] as usize])
    }

    /// Writable output for `bus`, `frames() * output_channels(bus)`
    /// samples, pre-zeroed by the graph.
    #[inline]
    pub fn output(&mut self, bus: usize) -> &mut [f32] {
        let (offset, channels) = self.output_spans[bus];
        &mut self.outputs[offset..offset + self.frames * channels as usize]
    }

    /// Copies an input bus straight to an output bus of the same channel
    /// count; a null input writes silence. The common body of identity and
    /// splitter nodes.
    pub fn copy_input_to_output(&mut self, in_bus: usize, out_bus: usize) -> Result<()> {
        let in_ch = self.input_channels[in_bus] as usize;
        let (offset, out_ch) = self.output_spans[out_bus];
        if in_ch != out_ch as usize {
            return Err(tono_core::Error::InvalidArgs);
        }
        let samples = self.frames * in_ch;
        // The inner reference outlives the &mut self borrow, so reading the
        // input and writing the output do not conflict.
        match self.inputs[in_bus] {
            Some(src) => {
                self.outputs[offset..offset + samples].copy_from_slice(&src[..samples]);
            }
            None => self.outputs[offset..offset + samples].fill(0.0),
        }
        Ok(())
    }
}

/// A DSP node.
///
/// Implementations declare fixed bus shapes and fill their output buses in
/// `process`. The return value is the number of frames actually produced;
/// returning less than `ctx.frames()` signals partial output, which the
/// graph propagates downstream and pads with silence.
/// [`Error::AtEnd`](tono_core::Error::AtEnd) (with nothing produced) marks
/// the node finished for the rest of the graph's life.
pub trait Node: Send {
    /// Channel count of each input bus, in bus order.
    fn input_buses(&self) -> &[u16];

    /// Channel count of each output bus, in bus order.
    fn output_buses(&self) -> &[u16];

    /// Behavioral flags. Default: none.
    fn flags(&self) -> NodeFlags {
        NodeFlags::default()
    }

    /// Produces up to `ctx.frames()` frames on every output bus.
    ///
    /// Realtime: must not allocate, block, or take contended locks.
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<usize>;

    /// Called when the node's state flips between started and stopped.
    /// Generators typically reset nothing; filters may clear history.
    fn on_state_change(&mut self, _state: NodeState) {}
}
