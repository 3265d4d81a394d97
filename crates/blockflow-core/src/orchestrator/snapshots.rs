//! Enumeration of a store module's on-disk segments.

use std::sync::Arc;

use blockflow_dstore::retry::{DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};
use blockflow_dstore::{with_retries, ObjectStore};

use crate::block::{parse_state_filename, Range, Ranges};
use crate::error::Error;

/// The full and partial segments a store module has on disk.
#[derive(Debug, Default, Clone)]
pub struct Snapshots {
    /// Complete segments, sorted by ascending end block.
    pub completes: Ranges,
    /// Partial segments, sorted by ascending start block.
    pub partials: Ranges,
}

impl Snapshots {
    pub fn sort(&mut self) {
        self.completes.sort_by_end();
        self.partials.sort_by_start();
    }

    /// The largest complete end block, or 0 when no complete segment exists.
    pub fn last_completed_block(&self) -> u64 {
        self.completes
            .0
            .last()
            .map(|r| r.exclusive_end_block)
            .unwrap_or(0)
    }

    /// The greatest complete segment whose end does not exceed `block_num`.
    pub fn last_complete_snapshot_before(&self, block_num: u64) -> Option<Range> {
        self.completes
            .iter()
            .rev()
            .find(|r| r.exclusive_end_block <= block_num)
            .copied()
    }

    /// Whether a partial with exactly these endpoints exists.
    pub fn contains_partial(&self, range: &Range) -> bool {
        self.partials.iter().any(|r| r == range)
    }
}

impl std::fmt::Display for Snapshots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "completes=[{}], partials=[{}]",
            self.completes, self.partials
        )
    }
}

/// Walk a store module's prefix and classify every state file.
pub async fn list_snapshots(objects: &Arc<dyn ObjectStore>) -> Result<Snapshots, Error> {
    let files = with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
        objects.list_files("", usize::MAX)
    })
    .await?;

    let mut out = Snapshots::default();
    for file in files {
        let info = parse_state_filename(&file)?;
        if info.partial {
            out.partials.0.push(info.range);
        } else {
            out.completes.0.push(info.range);
        }
    }
    out.sort();
    Ok(out)
}
