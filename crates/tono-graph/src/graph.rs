//! The node graph: arena, topology, and pull-model evaluation.
//!
//! Mutation (add/remove/attach/detach) happens on the control thread and
//! takes `&mut self`; evaluation ([`NodeGraph::read_pcm_frames`]) also takes
//! `&mut self` and is allocation-free and lock-free. Exclusive access is the
//! graph lock; the generation counter published on every topology mutation
//! lets shared-state holders detect rebuilds without one.
//!
//! Evaluation walks from the endpoint outward through input-bus
//! connections. Within one read, every node is processed at most once: the
//! first pull fills the node's output cache, later pulls in the same read
//! reuse it, so diamond fan-outs stay phase-coherent.

use std::sync::atomic::{AtomicU64, Ordering};

use tono_convert::ChannelConverter;
use tono_core::channel::{ChannelMap, MAX_CHANNELS};
use tono_core::frames::mix_into;
use tono_core::result::Error;
use tono_core::LogBus;

use crate::node::{MAX_NODE_BUSES, Node, NodeFlags, NodeId, NodeState, ProcessContext};

/// Errors from graph mutation operations.
#[derive(Debug)]
pub enum GraphError {
    /// The referenced node is not in the graph.
    NodeNotFound(NodeId),
    /// A bus index exceeded the node's declared bus count.
    BusOutOfRange,
    /// Source and destination bus channel counts differ and the
    /// destination bus is not flexible.
    ChannelMismatch {
        /// Channels on the upstream output bus.
        src: u16,
        /// Channels on the downstream input bus.
        dst: u16,
    },
    /// The attachment would create a cycle.
    CycleDetected,
    /// This exact connection already exists.
    DuplicateConnection,
    /// No connection matched the detach request.
    NotAttached,
    /// The endpoint cannot be removed or re-registered.
    EndpointImmutable,
    /// A node declared more than [`MAX_NODE_BUSES`] buses, a zero-channel
    /// bus, or more than [`MAX_CHANNELS`] channels.
    InvalidBusShape,
    /// The graph configuration is unusable (zero channels, rate, or size).
    InvalidConfig,
}

impl core::fmt::Display for GraphError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NodeNotFound(id) => write!(f, "node {id} not found"),
            Self::BusOutOfRange => write!(f, "bus index out of range"),
            Self::ChannelMismatch { src, dst } => {
                write!(f, "channel mismatch: {src} -> {dst} on an inflexible bus")
            }
            Self::CycleDetected => write!(f, "attachment would create a cycle"),
            Self::DuplicateConnection => write!(f, "connection already exists"),
            Self::NotAttached => write!(f, "no such connection"),
            Self::EndpointImmutable => write!(f, "the endpoint cannot be removed"),
            Self::InvalidBusShape => write!(f, "invalid bus shape"),
            Self::InvalidConfig => write!(f, "invalid graph configuration"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<GraphError> for Error {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::CycleDetected | GraphError::EndpointImmutable => Error::InvalidOperation,
            _ => Error::InvalidArgs,
        }
    }
}

/// Configuration for a [`NodeGraph`].
#[derive(Debug, Clone)]
pub struct NodeGraphConfig {
    /// Channel count of the endpoint (and of the device it feeds).
    pub channels: u16,
    /// Graph sample rate in Hz.
    pub sample_rate: u32,
    /// Largest single `read_pcm_frames` request; sizes every bus buffer.
    pub max_frames_per_read: usize,
    /// Bus buffers in the scratch pool. Bounds the number of
    /// simultaneously summed buses along one pull path.
    pub pool_buffers: usize,
    /// Log bus for non-fatal evaluation diagnostics.
    pub log: LogBus,
}

impl NodeGraphConfig {
    /// A config with the default read size (2048 frames) and pool (16
    /// buffers).
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
            max_frames_per_read: 2048,
            pool_buffers: 16,
            log: LogBus::disabled(),
        }
    }
}

/// A connection record: upstream output bus to downstream input bus.
struct Connection {
    src: NodeId,
    src_bus: u16,
    dst: NodeId,
    dst_bus: u16,
    /// Standard mixdown for flexible-bus channel adaptation.
    mix: Option<ChannelConverter>,
}

struct NodeSlot {
    node: Box<dyn Node>,
    state: NodeState,
    flags: NodeFlags,
    input_channels: Vec<u16>,
    output_channels: Vec<u16>,
    /// Connection ids feeding each input bus, in attach order.
    input_conns: Vec<Vec<u32>>,
    /// Linear gain applied per output bus at every summation site.
    out_volumes: Vec<f32>,
    /// Flat output cache, all buses concatenated; see `out_spans`.
    out_cache: Vec<f32>,
    /// Per-output-bus `(sample offset, channels)` into `out_cache`.
    out_spans: Vec<(usize, u16)>,
    /// Read-cycle memo: cache is valid for this stamp.
    visit_stamp: u64,
    cached_frames: usize,
    /// The node reported at-end; it produces nothing from now on.
    finished: bool,
}

/// Scratch-buffer pool for input-bus summation.
struct BusPool {
    storage: Vec<f32>,
    stride: usize,
    free: Vec<usize>,
}

impl BusPool {
    fn new(count: usize, stride: usize) -> Self {
        Self {
            storage: vec![0.0; count * stride],
            stride,
            free: (0..count).collect(),
        }
    }

    fn acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    fn release(&mut self, idx: usize) {
        self.free.push(idx);
    }

    /// Returns every buffer to the free list. Used after an errored pull,
    /// where unwinding skipped the per-node releases. `free` already has
    /// the capacity, so this does not allocate.
    fn reset_free(&mut self) {
        let count = self.storage.len() / self.stride;
        self.free.clear();
        self.free.extend(0..count);
    }

    fn buffer(&self, idx: usize) -> &[f32] {
        &self.storage[idx * self.stride..(idx + 1) * self.stride]
    }

    fn buffer_mut(&mut self, idx: usize) -> &mut [f32] {
        &mut self.storage[idx * self.stride..(idx + 1) * self.stride]
    }

    /// Two distinct buffers, mutably.
    fn pair_mut(&mut self, a: usize, b: usize) -> (&mut [f32], &mut [f32]) {
        debug_assert_ne!(a, b);
        let stride = self.stride;
        let (lo, hi, swapped) = if a < b { (a, b, false) } else { (b, a, true) };
        let (head, tail) = self.storage.split_at_mut(hi * stride);
        let low = &mut head[lo * stride..(lo + 1) * stride];
        let high = &mut tail[..stride];
        if swapped { (high, low) } else { (low, high) }
    }
}

/// How one input bus is presented to `process`.
#[derive(Clone, Copy)]
enum BusInput {
    /// `allow_null_input` bus with no connections.
    Null,
    /// Disconnected or degraded bus: the shared silence buffer.
    Silence,
    /// Summed contributions in a pool buffer.
    Pool(usize),
}

const ENDPOINT_INDEX: usize = 0;

/// Terminal node: single matching input and output bus, identity process.
struct EndpointNode {
    buses: [u16; 1],
}

impl Node for EndpointNode {
    fn input_buses(&self) -> &[u16] {
        &self.buses
    }

    fn output_buses(&self) -> &[u16] {
        &self.buses
    }

    fn flags(&self) -> NodeFlags {
        NodeFlags {
            passthrough: true,
            ..NodeFlags::default()
        }
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> tono_core::Result<usize> {
        // Normally skipped via the passthrough flag.
        ctx.copy_input_to_output(0, 0)?;
        Ok(ctx.frames())
    }
}

/// Pull-model DAG of DSP nodes. See the [crate docs](crate) for the model.
pub struct NodeGraph {
    channels: u16,
    sample_rate: u32,
    max_frames: usize,
    slots: Vec<Option<NodeSlot>>,
    connections: Vec<Option<Connection>>,
    next_conn: u32,
    pool: BusPool,
    /// Shared read-only silence, one pool stride long.
    silence: Vec<f32>,
    /// Read-cycle counter for per-node memoization.
    stamp: u64,
    /// Topology generation, Release-published on every mutation.
    generation: AtomicU64,
    /// Global frames produced through the endpoint.
    frames_read: u64,
    log: LogBus,
}

impl NodeGraph {
    /// Creates a graph with its endpoint registered at
    /// [`endpoint()`](Self::endpoint).
    pub fn new(config: NodeGraphConfig) -> Result<Self, GraphError> {
        if config.channels == 0
            || config.channels as usize > MAX_CHANNELS
            || config.sample_rate == 0
            || config.max_frames_per_read == 0
            || config.pool_buffers < 2
        {
            return Err(GraphError::InvalidConfig);
        }
        let stride = config.max_frames_per_read * MAX_CHANNELS;
        let mut graph = Self {
            channels: config.channels,
            sample_rate: config.sample_rate,
            max_frames: config.max_frames_per_read,
            slots: Vec::new(),
            connections: Vec::new(),
            next_conn: 0,
            pool: BusPool::new(config.pool_buffers, stride),
            silence: vec![0.0; stride],
            stamp: 0,
            generation: AtomicU64::new(0),
            frames_read: 0,
            log: config.log,
        };
        let endpoint = graph.register(Box::new(EndpointNode {
            buses: [config.channels],
        }))?;
        debug_assert_eq!(endpoint.index() as usize, ENDPOINT_INDEX);
        Ok(graph)
    }

    /// The endpoint's id.
    pub fn endpoint(&self) -> NodeId {
        NodeId(ENDPOINT_INDEX as u32)
    }

    /// Endpoint/device channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Graph sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Largest single read request, in frames.
    pub fn max_frames_per_read(&self) -> usize {
        self.max_frames
    }

    /// Total frames produced through the endpoint so far.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Current topology generation. Bumped (Release) by every mutation.
    pub fn topology_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of live nodes, endpoint included.
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_some()).count()
    }

    fn bump_generation(&mut self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Adds a node to the arena. The node starts in [`NodeState::Started`]
    /// with unity volume on every output bus.
    pub fn add_node(&mut self, node: Box<dyn Node>) -> Result<NodeId, GraphError> {
        let id = self.register(node)?;
        self.bump_generation();
        Ok(id)
    }

    fn register(&mut self, node: Box<dyn Node>) -> Result<NodeId, GraphError> {
        let input_channels = node.input_buses().to_vec();
        let output_channels = node.output_buses().to_vec();
        if input_channels.len() > MAX_NODE_BUSES || output_channels.len() > MAX_NODE_BUSES {
            return Err(GraphError::InvalidBusShape);
        }
        for &ch in input_channels.iter().chain(output_channels.iter()) {
            if ch == 0 || ch as usize > MAX_CHANNELS {
                return Err(GraphError::InvalidBusShape);
            }
        }

        let mut spans = Vec::with_capacity(output_channels.len());
        let mut offset = 0usize;
        for &ch in &output_channels {
            spans.push((offset, ch));
            offset += self.max_frames * ch as usize;
        }

        let flags = node.flags();
        let slot = NodeSlot {
            node,
            state: NodeState::Started,
            flags,
            input_conns: vec![Vec::new(); input_channels.len()],
            out_volumes: vec![1.0; output_channels.len()],
            out_cache: vec![0.0; offset],
            out_spans: spans,
            input_channels,
            output_channels,
            visit_stamp: 0,
            cached_frames: 0,
            finished: false,
        };
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(slot));
        Ok(id)
    }

    /// Removes a node and every connection touching it. The endpoint is
    /// immutable. Returns the node itself.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Box<dyn Node>, GraphError> {
        let idx = id.0 as usize;
        if idx == ENDPOINT_INDEX {
            return Err(GraphError::EndpointImmutable);
        }
        if self.slots.get(idx).and_then(|s| s.as_ref()).is_none() {
            return Err(GraphError::NodeNotFound(id));
        }

        // Drop connections in both directions.
        for cid in 0..self.connections.len() {
            let touches = self.connections[cid]
                .as_ref()
                .is_some_and(|c| c.src == id || c.dst == id);
            if touches {
                self.unlink(cid as u32);
            }
        }

        let slot = self.slots[idx].take().expect("checked above");
        self.bump_generation();
        Ok(slot.node)
    }

    fn slot(&self, id: NodeId) -> Result<&NodeSlot, GraphError> {
        self.slots
            .get(id.0 as usize)
            .and_then(|s| s.as_ref())
            .ok_or(GraphError::NodeNotFound(id))
    }

    fn slot_mut(&mut self, id: NodeId) -> Result<&mut NodeSlot, GraphError> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(GraphError::NodeNotFound(id))
    }

    /// Connects `src`'s output bus to `dst`'s input bus.
    ///
    /// Rejects unknown nodes, out-of-range buses, duplicate connections,
    /// channel mismatches (unless `dst` declared `flexible_input`, in which
    /// case a standard mixdown is attached to the connection), and anything
    /// that would create a cycle.
    pub fn attach_output_bus(
        &mut self,
        src: NodeId,
        src_bus: u16,
        dst: NodeId,
        dst_bus: u16,
    ) -> Result<(), GraphError> {
        let src_channels = {
            let s = self.slot(src)?;
            *s.output_channels
                .get(src_bus as usize)
                .ok_or(GraphError::BusOutOfRange)?
        };
        let (dst_channels, dst_flexible) = {
            let d = self.slot(dst)?;
            (
                *d.input_channels
                    .get(dst_bus as usize)
                    .ok_or(GraphError::BusOutOfRange)?,
                d.flags.flexible_input,
            )
        };

        let duplicate = self.connections.iter().flatten().any(|c| {
            c.src == src && c.src_bus == src_bus && c.dst == dst && c.dst_bus == dst_bus
        });
        if duplicate {
            return Err(GraphError::DuplicateConnection);
        }

        // Adding src -> dst cycles iff dst already reaches src.
        if src == dst || self.can_reach(dst, src) {
            return Err(GraphError::CycleDetected);
        }

        let mix = if src_channels == dst_channels {
            None
        } else if dst_flexible {
            let in_map = ChannelMap::standard(src_channels).map_err(|_| GraphError::InvalidBusShape)?;
            let out_map =
                ChannelMap::standard(dst_channels).map_err(|_| GraphError::InvalidBusShape)?;
            Some(ChannelConverter::mixdown(in_map, out_map))
        } else {
            return Err(GraphError::ChannelMismatch {
                src: src_channels,
                dst: dst_channels,
            });
        };

        let cid = self.next_conn;
        self.next_conn += 1;
        let idx = cid as usize;
        if idx >= self.connections.len() {
            self.connections.resize_with(idx + 1, || None);
        }
        self.connections[idx] = Some(Connection {
            src,
            src_bus,
            dst,
            dst_bus,
            mix,
        });
        self.slot_mut(dst)?.input_conns[dst_bus as usize].push(cid);
        self.bump_generation();
        Ok(())
    }

    /// Detaches every connection leaving `src`'s output bus.
    pub fn detach_output_bus(&mut self, src: NodeId, src_bus: u16) -> Result<(), GraphError> {
        if (src_bus as usize) >= self.slot(src)?.output_channels.len() {
            return Err(GraphError::BusOutOfRange);
        }
        let matching: Vec<u32> = self
            .connections
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.as_ref()
                    .filter(|c| c.src == src && c.src_bus == src_bus)
                    .map(|_| i as u32)
            })
            .collect();
        if matching.is_empty() {
            return Err(GraphError::NotAttached);
        }
        for cid in matching {
            self.unlink(cid);
        }
        self.bump_generation();
        Ok(())
    }

    fn unlink(&mut self, cid: u32) {
        let Some(conn) = self.connections[cid as usize].take() else {
            return;
        };
        if let Some(dst) = self.slots.get_mut(conn.dst.0 as usize).and_then(|s| s.as_mut()) {
            dst.input_conns[conn.dst_bus as usize].retain(|&c| c != cid);
        }
    }

    /// True when `from` can reach `to` along data-flow connections.
    fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.slots.len()];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            let idx = node.0 as usize;
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            for conn in self.connections.iter().flatten() {
                if conn.src == node && !seen[conn.dst.0 as usize] {
                    stack.push(conn.dst);
                }
            }
        }
        false
    }

    /// Sets the linear gain applied wherever `node`'s output bus is summed
    /// into a downstream input.
    pub fn set_output_bus_volume(
        &mut self,
        node: NodeId,
        bus: u16,
        gain: f32,
    ) -> Result<(), GraphError> {
        let slot = self.slot_mut(node)?;
        let volume = slot
            .out_volumes
            .get_mut(bus as usize)
            .ok_or(GraphError::BusOutOfRange)?;
        *volume = gain;
        Ok(())
    }

    /// The gain of `node`'s output bus.
    pub fn output_bus_volume(&self, node: NodeId, bus: u16) -> Result<f32, GraphError> {
        self.slot(node)?
            .out_volumes
            .get(bus as usize)
            .copied()
            .ok_or(GraphError::BusOutOfRange)
    }

    /// Starts or stops a node. Stopped nodes output silence and do not
    /// pull their upstreams.
    pub fn set_node_state(&mut self, node: NodeId, state: NodeState) -> Result<(), GraphError> {
        let slot = self.slot_mut(node)?;
        if slot.state != state {
            slot.state = state;
            slot.node.on_state_change(state);
        }
        Ok(())
    }

    /// The node's current run state.
    pub fn node_state(&self, node: NodeId) -> Result<NodeState, GraphError> {
        Ok(self.slot(node)?.state)
    }

    /// Pulls `frames` frames of interleaved `f32` from the endpoint.
    ///
    /// Returns the frames actually produced, which is less than `frames`
    /// when upstream sources ran short; the remainder of `out` is
    /// silence-filled either way. Once every source feeding the endpoint
    /// has finished, reads return [`Error::AtEnd`].
    ///
    /// Realtime-safe: no allocation, no locks.
    pub fn read_pcm_frames(&mut self, out: &mut [f32], frames: usize) -> tono_core::Result<usize> {
        let ch = self.channels as usize;
        if frames == 0 {
            return Ok(0);
        }
        if frames > self.max_frames || out.len() < frames * ch {
            return Err(Error::InvalidArgs);
        }

        self.stamp += 1;
        let produced = match self.pull_node(ENDPOINT_INDEX, frames) {
            Ok(produced) => produced,
            Err(e) => {
                self.pool.reset_free();
                return Err(e);
            }
        };

        {
            let endpoint = self.slots[ENDPOINT_INDEX].as_ref().expect("endpoint");
            out[..produced * ch].copy_from_slice(&endpoint.out_cache[..produced * ch]);
        }
        out[produced * ch..frames * ch].fill(0.0);

        // Continuous nodes run even without downstream demand.
        for idx in 0..self.slots.len() {
            let due = self.slots[idx]
                .as_ref()
                .is_some_and(|s| s.flags.continuous && s.visit_stamp != self.stamp);
            if due && self.pull_node(idx, frames).is_err() {
                self.pool.reset_free();
            }
        }

        self.frames_read += produced as u64;

        if produced == 0 {
            let endpoint = self.slots[ENDPOINT_INDEX].as_ref().expect("endpoint");
            if endpoint.finished {
                return Err(Error::AtEnd);
            }
        }
        Ok(produced)
    }

    /// Evaluates one node for the current read cycle, memoized by stamp.
    /// Returns the frames available in the node's output cache.
    fn pull_node(&mut self, idx: usize, frames: usize) -> tono_core::Result<usize> {
        let (state, finished, flags, n_inputs) = {
            let slot = self.slots[idx].as_ref().ok_or(Error::InvalidOperation)?;
            if slot.visit_stamp == self.stamp {
                return Ok(slot.cached_frames);
            }
            (
                slot.state,
                slot.finished,
                slot.flags,
                slot.input_channels.len(),
            )
        };

        if state == NodeState::Stopped || finished {
            let produced = if finished { 0 } else { frames };
            let slot = self.slots[idx].as_mut().expect("checked above");
            slot.visit_stamp = self.stamp;
            slot.cached_frames = produced;
            let NodeSlot {
                out_cache,
                out_spans,
                ..
            } = slot;
            for &(offset, bus_ch) in out_spans.iter() {
                out_cache[offset..offset + frames * bus_ch as usize].fill(0.0);
            }
            return Ok(produced);
        }

        // Phase 1: evaluate input buses into pool buffers.
        let mut bus_inputs = [BusInput::Silence; MAX_NODE_BUSES];
        let mut bus_produced = [0usize; MAX_NODE_BUSES];
        let mut bus_connected = [false; MAX_NODE_BUSES];
        let mut any_connected = false;
        let mut all_upstream_finished = true;

        for b in 0..n_inputs {
            let (n_conns, bus_ch) = {
                let slot = self.slots[idx].as_ref().expect("live node");
                (
                    slot.input_conns[b].len(),
                    slot.input_channels[b] as usize,
                )
            };

            if n_conns == 0 {
                bus_inputs[b] = if flags.allow_null_input {
                    BusInput::Null
                } else {
                    BusInput::Silence
                };
                continue;
            }
            bus_connected[b] = true;
            any_connected = true;

            let Some(buf) = self.pool.acquire() else {
                self.log.error("graph bus pool exhausted; input bus silenced");
                bus_inputs[b] = BusInput::Silence;
                continue;
            };
            self.pool.buffer_mut(buf)[..frames * bus_ch].fill(0.0);
            bus_inputs[b] = BusInput::Pool(buf);

            for k in 0..n_conns {
                let cid = {
                    let slot = self.slots[idx].as_ref().expect("live node");
                    slot.input_conns[b][k] as usize
                };
                let (src, src_bus) = {
                    let conn = self.connections[cid].as_ref().expect("live connection");
                    (conn.src.0 as usize, conn.src_bus as usize)
                };

                let n_up = self.pull_node(src, frames)?;
                let src_slot = self.slots[src].as_ref().expect("live upstream");
                if !src_slot.finished {
                    all_upstream_finished = false;
                }
                if n_up == 0 {
                    continue;
                }
                bus_produced[b] = bus_produced[b].max(n_up);

                let volume = src_slot.out_volumes[src_bus];
                let src_ch = src_slot.output_channels[src_bus] as usize;
                let (src_offset, _) = src_slot.out_spans[src_bus];

                if src_ch == bus_ch {
                    let src_cache = {
                        let s = self.slots[src].as_ref().expect("live upstream");
                        &s.out_cache[src_offset..src_offset + n_up * src_ch]
                    };
                    mix_into(
                        &mut self.pool.buffer_mut(buf)[..n_up * bus_ch],
                        src_cache,
                        volume,
                    );
                } else {
                    // Flexible bus: remix the contribution, then sum.
                    let Some(scratch) = self.pool.acquire() else {
                        self.log
                            .error("graph bus pool exhausted; contribution dropped");
                        continue;
                    };
                    let remixed = {
                        let conn = self.connections[cid].as_ref().expect("live connection");
                        let mix = conn.mix.as_ref().expect("mismatched buses carry a mixer");
                        let src_cache = {
                            let s = self.slots[src].as_ref().expect("live upstream");
                            &s.out_cache[src_offset..src_offset + n_up * src_ch]
                        };
                        mix.process(src_cache, self.pool.buffer_mut(scratch), n_up)
                    };
                    if remixed.is_err() {
                        self.pool.release(scratch);
                        continue;
                    }
                    let (bus_buf, scratch_buf) = self.pool.pair_mut(buf, scratch);
                    mix_into(
                        &mut bus_buf[..n_up * bus_ch],
                        &scratch_buf[..n_up * bus_ch],
                        volume,
                    );
                    self.pool.release(scratch);
                }
            }
        }

        // Partial-output propagation: a node with upstream data processes
        // only as many frames as its busiest bus delivered.
        let effective = if any_connected {
            let mut max = 0usize;
            for b in 0..n_inputs {
                if bus_connected[b] {
                    max = max.max(bus_produced[b]);
                }
            }
            max
        } else {
            frames
        };

        // All sources above are done and delivered nothing: this node is
        // finished too.
        if any_connected && all_upstream_finished && effective == 0 {
            self.release_buses(&bus_inputs, n_inputs);
            let slot = self.slots[idx].as_mut().expect("live node");
            slot.finished = true;
            slot.visit_stamp = self.stamp;
            slot.cached_frames = 0;
            return Ok(0);
        }

        // Phase 2: run the node (or route around it).
        let result = self.run_process(idx, effective, &bus_inputs, &bus_produced, n_inputs);
        self.release_buses(&bus_inputs, n_inputs);
        let produced = match result {
            Ok(n) => n,
            Err(Error::AtEnd) => {
                let slot = self.slots[idx].as_mut().expect("live node");
                slot.finished = true;
                0
            }
            Err(e) => return Err(e),
        };

        let slot = self.slots[idx].as_mut().expect("live node");
        slot.visit_stamp = self.stamp;
        slot.cached_frames = produced;
        Ok(produced)
    }

    fn release_buses(&mut self, bus_inputs: &[BusInput; MAX_NODE_BUSES], n_inputs: usize) {
        for input in bus_inputs.iter().take(n_inputs) {
            if let BusInput::Pool(buf) = input {
                self.pool.release(*buf);
            }
        }
    }

    /// Invokes the node's process callback (or the passthrough shortcut)
    /// with its cache as the output target.
    fn run_process(
        &mut self,
        idx: usize,
        effective: usize,
        bus_inputs: &[BusInput; MAX_NODE_BUSES],
        bus_produced: &[usize; MAX_NODE_BUSES],
        n_inputs: usize,
    ) -> tono_core::Result<usize> {
        let pool = &self.pool;
        let silence = &self.silence;
        let slot = self.slots[idx].as_mut().expect("live node");
        let NodeSlot {
            node,
            flags,
            input_channels,
            output_channels,
            out_cache,
            out_spans,
            ..
        } = slot;

        // Passthrough: matching 1-in/1-out shapes route the summed input
        // directly, skipping the callback.
        if flags.passthrough
            && n_inputs == 1
            && output_channels.len() == 1
            && input_channels[0] == output_channels[0]
        {
            let ch = output_channels[0] as usize;
            let produced = match bus_inputs[0] {
                BusInput::Pool(buf) => {
                    let n = bus_produced[0];
                    out_cache[..n * ch].copy_from_slice(&pool.buffer(buf)[..n * ch]);
                    n
                }
                // Disconnected passthrough emits silence for the request.
                BusInput::Silence | BusInput::Null => {
                    out_cache[..effective * ch].fill(0.0);
                    effective
                }
            };
            return Ok(produced);
        }

        // Zero the cache the node is about to fill, then hand it over.
        for &(offset, bus_ch) in out_spans.iter() {
            out_cache[offset..offset + effective * bus_ch as usize].fill(0.0);
        }

        let mut inputs: [Option<&[f32]>; MAX_NODE_BUSES] = [None; MAX_NODE_BUSES];
        for (b, input) in bus_inputs.iter().enumerate().take(n_inputs) {
            let bus_ch = input_channels[b] as usize;
            inputs[b] = match input {
                BusInput::Null => None,
                BusInput::Silence => Some(&silence[..effective * bus_ch]),
                BusInput::Pool(buf) => Some(&pool.buffer(*buf)[..effective * bus_ch]),
            };
        }

        let mut ctx = ProcessContext {
            frames: effective,
            inputs: &inputs[..n_inputs],
            input_channels,
            outputs: out_cache,
            output_spans: out_spans,
        };
        let produced = node.process(&mut ctx)?;
        Ok(produced.min(effective))
    }
}
