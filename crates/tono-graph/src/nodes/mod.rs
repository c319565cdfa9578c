//! Built-in utility nodes.

mod data_source;
mod splitter;

pub use data_source::DataSourceNode;
pub use splitter::SplitterNode;
