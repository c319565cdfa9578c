//! Tono Graph - the pull-model node graph engine
//!
//! A [`NodeGraph`] is a DAG of DSP [`Node`]s rooted at a distinguished
//! endpoint. Evaluation is pull-model: the device callback asks the graph
//! for frames, the graph asks the endpoint, and the endpoint's demand
//! propagates upstream through input-bus connections, summing contributions
//! with per-output-bus gain along the way.
//!
//! # Architecture
//!
//! Nodes live in an arena addressed by stable [`NodeId`]s; connections are
//! `(upstream, upstream bus, downstream, downstream bus)` records. There
//! are no back-pointers, so the topology cannot form reference cycles, and
//! attach-time cycle detection keeps it a strict DAG.
//!
//! Bus buffers come from a pool allocated once at graph construction;
//! [`NodeGraph::read_pcm_frames`] is allocation-free and lock-free. Rust's
//! ownership model stands in for the usual graph lock: topology mutations
//! take `&mut self`, which cannot overlap a concurrent pull. A generation
//! counter (Release-published, Acquire-read) lets holders of shared
//! snapshots detect rebuilds cheaply.
//!
//! # Example
//!
//! ```rust,ignore
//! use tono_graph::{NodeGraph, NodeGraphConfig, nodes::DataSourceNode};
//!
//! let mut graph = NodeGraph::new(NodeGraphConfig::new(2, 48_000))?;
//! let node = DataSourceNode::new(Box::new(waveform), &graph)?;
//! let source = graph.add_node(Box::new(node))?;
//! graph.attach_output_bus(source, 0, graph.endpoint(), 0)?;
//!
//! let mut out = vec![0.0f32; 480 * 2];
//! let frames = graph.read_pcm_frames(&mut out, 480)?;
//! ```

pub mod graph;
pub mod node;
pub mod nodes;

pub use graph::{GraphError, NodeGraph, NodeGraphConfig};
pub use node::{
    MAX_NODE_BUSES, Node, NodeFlags, NodeId, NodeState, ProcessContext,
};
pub use nodes::{DataSourceNode, SplitterNode};
