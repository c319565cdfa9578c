//! 1-in/2-out splitter.

use tono_core::result::Result;

use crate::node::{Node, ProcessContext};

/// Copies its single input bus to both output buses.
pub struct SplitterNode {
    in_buses: [u16; 1],
    out_buses: [u16; 2],
}

impl SplitterNode {
    /// A splitter for `channels`-channel buses.
    pub fn new(channels: u16) -> Self {
        Self {
            in_buses: [channels],
            out_buses: [channels, channels],
        }
    }
}

impl Node for SplitterNode {
    fn input_buses(&self) -> &[u16] {
        &self.in_buses
    }

    fn output_buses(&self) -> &[u16] {
        &self.out_buses
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<usize> {
        ctx.copy_input_to_output(0, 0)?;
        ctx.copy_input_to_output(0, 1)?;
        Ok(ctx.frames())
    }
}
