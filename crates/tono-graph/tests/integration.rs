//! Integration tests for the node graph engine.

use tono_core::result::{Error, Result};
use tono_core::source::{DataSource, SourceFormat};
use tono_core::{Waveform, WaveformConfig};
use tono_graph::{
    DataSourceNode, GraphError, Node, NodeFlags, NodeGraph, NodeGraphConfig, NodeState,
    ProcessContext, SplitterNode,
};

/// Test node: emits a constant value on one mono bus.
struct Constant {
    value: f32,
    buses: [u16; 1],
}

impl Constant {
    fn new(value: f32) -> Self {
        Self { value, buses: [1] }
    }
}

impl Node for Constant {
    fn input_buses(&self) -> &[u16] {
        &[]
    }
    fn output_buses(&self) -> &[u16] {
        &self.buses
    }
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<usize> {
        let frames = ctx.frames();
        ctx.output(0).fill(self.value);
        Ok(frames)
    }
}

/// Test node: multiplies its mono input by a fixed factor.
struct Gain {
    factor: f32,
    in_buses: [u16; 1],
    out_buses: [u16; 1],
}

impl Gain {
    fn new(factor: f32) -> Self {
        Self {
            factor,
            in_buses: [1],
            out_buses: [1],
        }
    }
}

impl Node for Gain {
    fn input_buses(&self) -> &[u16] {
        &self.in_buses
    }
    fn output_buses(&self) -> &[u16] {
        &self.out_buses
    }
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<usize> {
        let frames = ctx.frames();
        let factor = self.factor;
        if let Some(input) = ctx.input(0) {
            for (o, s) in ctx.output(0).iter_mut().zip(input.iter()) {
                *o = *s * factor;
            }
        }
        Ok(frames)
    }
}

/// Test source: emits `length` frames of a constant, then ends.
struct FiniteSource {
    value: f32,
    length: u64,
    cursor: u64,
    format: SourceFormat,
}

impl FiniteSource {
    fn new(value: f32, length: u64, channels: u16, rate: u32) -> Self {
        Self {
            value,
            length,
            cursor: 0,
            format: SourceFormat::f32(channels, rate).unwrap(),
        }
    }
}

impl DataSource for FiniteSource {
    fn format(&self) -> SourceFormat {
        self.format
    }

    fn read_pcm_frames(&mut self, dst: &mut [u8]) -> Result<u64> {
        let bpf = self.format.bytes_per_frame();
        let cap = (dst.len() / bpf) as u64;
        let n = cap.min(self.length - self.cursor);
        if n == 0 {
            return Err(Error::AtEnd);
        }
        let samples: &mut [f32] = bytemuck::cast_slice_mut(&mut dst[..(n as usize) * bpf]);
        samples.fill(self.value);
        self.cursor += n;
        Ok(n)
    }
}

fn mono_graph() -> NodeGraph {
    NodeGraph::new(NodeGraphConfig::new(1, 48_000)).unwrap()
}

#[test]
fn empty_graph_produces_silence_not_at_end() {
    let mut graph = mono_graph();
    let mut out = vec![1.0f32; 256];
    let produced = graph.read_pcm_frames(&mut out, 256).unwrap();
    assert_eq!(produced, 256);
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
fn summation_through_gain() {
    // Two constant 0.25 sources into a gain node set to 2.0 via its
    // output-bus volume: every sample is exactly 1.0.
    let mut graph = mono_graph();
    let a = graph.add_node(Box::new(Constant::new(0.25))).unwrap();
    let b = graph.add_node(Box::new(Constant::new(0.25))).unwrap();
    let gain = graph.add_node(Box::new(Gain::new(1.0))).unwrap();
    let endpoint = graph.endpoint();

    graph.attach_output_bus(a, 0, gain, 0).unwrap();
    graph.attach_output_bus(b, 0, gain, 0).unwrap();
    graph.attach_output_bus(gain, 0, endpoint, 0).unwrap();
    graph.set_output_bus_volume(gain, 0, 2.0).unwrap();

    let mut out = vec![0.0f32; 1024];
    let produced = graph.read_pcm_frames(&mut out, 1024).unwrap();
    assert_eq!(produced, 1024);
    for (i, &s) in out.iter().enumerate() {
        assert!((s - 1.0).abs() < 1e-6, "sample {i}: {s}");
    }
}

#[test]
fn partial_input_then_at_end() {
    // A 100-frame source: the first read returns 100, later reads at-end.
    let mut graph = mono_graph();
    let source = FiniteSource::new(0.5, 100, 1, 48_000);
    let node = DataSourceNode::new(Box::new(source), &graph).unwrap();
    let id = graph.add_node(Box::new(node)).unwrap();
    graph.attach_output_bus(id, 0, graph.endpoint(), 0).unwrap();

    let mut out = vec![0.0f32; 1024];
    let produced = graph.read_pcm_frames(&mut out, 1024).unwrap();
    assert_eq!(produced, 100);
    assert!((out[99] - 0.5).abs() < 1e-6);
    // The remainder is silence-filled.
    assert!(out[100..].iter().all(|&s| s == 0.0));

    assert_eq!(graph.read_pcm_frames(&mut out, 1024), Err(Error::AtEnd));
    assert_eq!(graph.read_pcm_frames(&mut out, 1024), Err(Error::AtEnd));
}

#[test]
fn cycle_is_rejected() {
    let mut graph = mono_graph();
    let a = graph.add_node(Box::new(Gain::new(1.0))).unwrap();
    let b = graph.add_node(Box::new(Gain::new(1.0))).unwrap();

    graph.attach_output_bus(a, 0, b, 0).unwrap();
    assert!(matches!(
        graph.attach_output_bus(b, 0, a, 0),
        Err(GraphError::CycleDetected)
    ));
    assert!(matches!(
        graph.attach_output_bus(a, 0, a, 0),
        Err(GraphError::CycleDetected)
    ));
}

#[test]
fn duplicate_attach_is_rejected() {
    let mut graph = mono_graph();
    let a = graph.add_node(Box::new(Constant::new(0.1))).unwrap();
    graph.attach_output_bus(a, 0, graph.endpoint(), 0).unwrap();
    assert!(matches!(
        graph.attach_output_bus(a, 0, graph.endpoint(), 0),
        Err(GraphError::DuplicateConnection)
    ));
}

#[test]
fn rebuild_is_idempotent() {
    // Detaching and re-attaching identical connections leaves read output
    // invariant.
    let mut graph = mono_graph();
    let a = graph.add_node(Box::new(Constant::new(0.3))).unwrap();
    let b = graph.add_node(Box::new(Constant::new(0.2))).unwrap();
    graph.attach_output_bus(a, 0, graph.endpoint(), 0).unwrap();
    graph.attach_output_bus(b, 0, graph.endpoint(), 0).unwrap();

    let mut first = vec![0.0f32; 256];
    graph.read_pcm_frames(&mut first, 256).unwrap();

    let generation = graph.topology_generation();
    graph.detach_output_bus(a, 0).unwrap();
    graph.detach_output_bus(b, 0).unwrap();
    graph.attach_output_bus(a, 0, graph.endpoint(), 0).unwrap();
    graph.attach_output_bus(b, 0, graph.endpoint(), 0).unwrap();
    assert!(graph.topology_generation() > generation);

    let mut second = vec![0.0f32; 256];
    graph.read_pcm_frames(&mut second, 256).unwrap();
    assert_eq!(first, second);
}

#[test]
fn splitter_diamond_stays_coherent() {
    // Constant -> splitter -> two gains -> endpoint. The splitter's node
    // is processed once per read; both branches see identical data.
    let mut graph = mono_graph();
    let source = graph.add_node(Box::new(Constant::new(0.25))).unwrap();
    let split = graph.add_node(Box::new(SplitterNode::new(1))).unwrap();
    let top = graph.add_node(Box::new(Gain::new(1.0))).unwrap();
    let bottom = graph.add_node(Box::new(Gain::new(3.0))).unwrap();

    graph.attach_output_bus(source, 0, split, 0).unwrap();
    graph.attach_output_bus(split, 0, top, 0).unwrap();
    graph.attach_output_bus(split, 1, bottom, 0).unwrap();
    graph.attach_output_bus(top, 0, graph.endpoint(), 0).unwrap();
    graph.attach_output_bus(bottom, 0, graph.endpoint(), 0).unwrap();

    let mut out = vec![0.0f32; 128];
    graph.read_pcm_frames(&mut out, 128).unwrap();
    // 0.25 + 0.75.
    for &s in &out {
        assert!((s - 1.0).abs() < 1e-6);
    }
}

#[test]
fn stopped_node_outputs_silence() {
    let mut graph = mono_graph();
    let source = graph.add_node(Box::new(Constant::new(0.5))).unwrap();
    graph
        .attach_output_bus(source, 0, graph.endpoint(), 0)
        .unwrap();

    graph.set_node_state(source, NodeState::Stopped).unwrap();
    let mut out = vec![1.0f32; 64];
    graph.read_pcm_frames(&mut out, 64).unwrap();
    assert!(out.iter().all(|&s| s == 0.0));

    graph.set_node_state(source, NodeState::Started).unwrap();
    graph.read_pcm_frames(&mut out, 64).unwrap();
    assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
}

#[test]
fn continuous_node_keeps_phase_without_downstream() {
    // A continuous source not attached to anything still advances.
    struct Ticker {
        ticks: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        buses: [u16; 1],
    }
    impl Node for Ticker {
        fn input_buses(&self) -> &[u16] {
            &[]
        }
        fn output_buses(&self) -> &[u16] {
            &self.buses
        }
        fn flags(&self) -> NodeFlags {
            NodeFlags {
                continuous: true,
                ..NodeFlags::default()
            }
        }
        fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<usize> {
            self.ticks
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(ctx.frames())
        }
    }

    let ticks = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut graph = mono_graph();
    graph
        .add_node(Box::new(Ticker {
            ticks: std::sync::Arc::clone(&ticks),
            buses: [1],
        }))
        .unwrap();

    let mut out = vec![0.0f32; 64];
    graph.read_pcm_frames(&mut out, 64).unwrap();
    graph.read_pcm_frames(&mut out, 64).unwrap();
    assert_eq!(ticks.load(std::sync::atomic::Ordering::Relaxed), 2);
}

#[test]
fn channel_mismatch_needs_flexible_bus() {
    struct StereoConst {
        buses: [u16; 1],
    }
    impl Node for StereoConst {
        fn input_buses(&self) -> &[u16] {
            &[]
        }
        fn output_buses(&self) -> &[u16] {
            &self.buses
        }
        fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<usize> {
            let frames = ctx.frames();
            ctx.output(0).fill(0.5);
            Ok(frames)
        }
    }

    struct FlexibleSink {
        in_buses: [u16; 1],
        out_buses: [u16; 1],
    }
    impl Node for FlexibleSink {
        fn input_buses(&self) -> &[u16] {
            &self.in_buses
        }
        fn output_buses(&self) -> &[u16] {
            &self.out_buses
        }
        fn flags(&self) -> NodeFlags {
            NodeFlags {
                flexible_input: true,
                passthrough: true,
                ..NodeFlags::default()
            }
        }
        fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<usize> {
            ctx.copy_input_to_output(0, 0)?;
            Ok(ctx.frames())
        }
    }

    let mut graph = mono_graph();
    let stereo = graph.add_node(Box::new(StereoConst { buses: [2] })).unwrap();

    // Endpoint is mono and not flexible: mismatch is rejected.
    assert!(matches!(
        graph.attach_output_bus(stereo, 0, graph.endpoint(), 0),
        Err(GraphError::ChannelMismatch { src: 2, dst: 1 })
    ));

    // A flexible mono sink accepts it through the standard mixdown.
    let sink = graph
        .add_node(Box::new(FlexibleSink {
            in_buses: [1],
            out_buses: [1],
        }))
        .unwrap();
    graph.attach_output_bus(stereo, 0, sink, 0).unwrap();
    graph.attach_output_bus(sink, 0, graph.endpoint(), 0).unwrap();

    let mut out = vec![0.0f32; 64];
    graph.read_pcm_frames(&mut out, 64).unwrap();
    // Stereo 0.5/0.5 folded to mono: 2 * 0.5 * 0.707.
    let expected = core::f32::consts::FRAC_1_SQRT_2;
    for &s in &out {
        assert!((s - expected).abs() < 1e-3, "{s}");
    }
}

#[test]
fn waveform_source_node_resamples_to_graph_rate() {
    // 44.1 kHz sine source into a 48 kHz graph: the node's converter
    // resamples and the output peak stays at the source amplitude.
    let mut graph = NodeGraph::new(NodeGraphConfig::new(2, 48_000)).unwrap();
    let waveform = Waveform::new(WaveformConfig::sine_f32(2, 44_100, 0.5, 440.0).unwrap()).unwrap();
    let node = DataSourceNode::new(Box::new(waveform), &graph).unwrap();
    let id = graph.add_node(Box::new(node)).unwrap();
    graph.attach_output_bus(id, 0, graph.endpoint(), 0).unwrap();

    let mut out = vec![0.0f32; 1024 * 2];
    let mut peak = 0.0f32;
    for _ in 0..48 {
        let produced = graph.read_pcm_frames(&mut out, 1024).unwrap();
        assert!(produced > 0);
        for &s in &out[..produced * 2] {
            peak = peak.max(s.abs());
        }
    }
    assert!((peak - 0.5).abs() < 0.01, "peak {peak}");
}

#[test]
fn remove_node_drops_its_connections() {
    let mut graph = mono_graph();
    let a = graph.add_node(Box::new(Constant::new(0.5))).unwrap();
    graph.attach_output_bus(a, 0, graph.endpoint(), 0).unwrap();
    assert_eq!(graph.connection_count(), 1);

    graph.remove_node(a).unwrap();
    assert_eq!(graph.connection_count(), 0);
    assert!(matches!(
        graph.remove_node(a),
        Err(GraphError::NodeNotFound(_))
    ));

    let mut out = vec![0.0f32; 16];
    let produced = graph.read_pcm_frames(&mut out, 16).unwrap();
    assert_eq!(produced, 16);
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
fn endpoint_is_immutable() {
    let mut graph = mono_graph();
    assert!(matches!(
        graph.remove_node(graph.endpoint()),
        Err(GraphError::EndpointImmutable)
    ));
}

#[test]
fn volume_scales_at_summation() {
    let mut graph = mono_graph();
    let a = graph.add_node(Box::new(Constant::new(0.5))).unwrap();
    graph.attach_output_bus(a, 0, graph.endpoint(), 0).unwrap();
    graph.set_output_bus_volume(a, 0, 0.5).unwrap();
    assert_eq!(graph.output_bus_volume(a, 0).unwrap(), 0.5);

    let mut out = vec![0.0f32; 32];
    graph.read_pcm_frames(&mut out, 32).unwrap();
    assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
}
