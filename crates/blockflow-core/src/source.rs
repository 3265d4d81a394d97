//! Interface to the block source.

use async_trait::async_trait;
use blockflow_types::{Block, Cursor, Step};

use crate::error::Error;

/// One delivery from the block source.
#[derive(Debug, Clone)]
pub struct SourcedBlock {
    pub block: Block,
    pub cursor: Cursor,
    pub step: Step,
}

/// A push stream of typed blocks with fork steps and cursors. Implementations
/// live outside this crate (merged-file readers, live hubs); tests drive the
/// pipeline with an in-memory source.
#[async_trait]
pub trait BlockSource: Send {
    /// The next delivery, or `None` once the source is exhausted.
    async fn next_block(&mut self) -> Result<Option<SourcedBlock>, Error>;
}

/// In-memory source over a fixed script of deliveries.
pub struct VecBlockSource {
    blocks: std::vec::IntoIter<SourcedBlock>,
}

impl VecBlockSource {
    pub fn new(blocks: Vec<SourcedBlock>) -> Self {
        VecBlockSource {
            blocks: blocks.into_iter(),
        }
    }
}

#[async_trait]
impl BlockSource for VecBlockSource {
    async fn next_block(&mut self) -> Result<Option<SourcedBlock>, Error> {
        Ok(self.blocks.next())
    }
}
