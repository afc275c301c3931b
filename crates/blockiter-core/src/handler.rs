//! Block handler trait — the caller's per-block callback.

use crate::types::{Block, HeaderView};

/// What the iterator does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    /// Produce the next block.
    #[default]
    Continue,
    /// End the iteration; no further files are read.
    Stop,
}

impl Flow {
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

impl From<()> for Flow {
    fn from(_: ()) -> Self {
        Self::Continue
    }
}

/// Called once per block, in ascending height order.
///
/// Implemented for every `FnMut(&Block, &HeaderView) -> Result<Flow, E>`.
pub trait BlockHandler {
    type Error;

    fn handle_block(&mut self, block: &Block, header: &HeaderView) -> Result<Flow, Self::Error>;
}

impl<F, E> BlockHandler for F
where
    F: FnMut(&Block, &HeaderView) -> Result<Flow, E>,
{
    type Error = E;

    fn handle_block(&mut self, block: &Block, header: &HeaderView) -> Result<Flow, E> {
        self(block, header)
    }
}
