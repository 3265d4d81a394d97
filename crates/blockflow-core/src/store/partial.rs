//! Partial store segments: state scoped to a backfill range.

use anyhow::Context;
use blockflow_dstore::retry::{DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};
use blockflow_dstore::with_retries;
use tracing::debug;

use crate::block::{partial_filename, Range};
use crate::error::Error;
use crate::store::base::BaseStore;

/// A store holding only the writes of `[initial_block, end)`, produced by a
/// backfill worker and destined to be squashed into the full store. Persisted
/// as `.partial` segments, deleted after their content has been merged.
pub struct PartialKV {
    pub base: BaseStore,
    initial_block: u64,
    exclusive_end_block: u64,
}

impl PartialKV {
    pub fn new(base: BaseStore, initial_block: u64) -> Self {
        PartialKV {
            base,
            initial_block,
            exclusive_end_block: initial_block,
        }
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Start of the partial's declared range (not the module's initial
    /// block).
    pub fn initial_block(&self) -> u64 {
        self.initial_block
    }

    pub fn range(&self) -> Range {
        Range::new(self.initial_block, self.exclusive_end_block)
    }

    pub fn set_range_end(&mut self, exclusive_end_block: u64) {
        self.exclusive_end_block = exclusive_end_block;
    }

    fn storage_filename(&self, at_end: u64) -> String {
        partial_filename(&Range::new(self.initial_block, at_end))
    }

    /// Load the partial segment ending at `at_end`.
    pub async fn load(&mut self, at_end: u64) -> Result<(), Error> {
        let filename = self.storage_filename(at_end);
        let content = with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
            self.base.objects().open(&filename)
        })
        .await?;
        self.base
            .unmarshal_kv(&content)
            .with_context(|| format!("store {:?} segment {}", self.name(), filename))
            .map_err(|e| Error::protocol(format!("{:#}", e)))?;
        self.exclusive_end_block = at_end;
        debug!(store = %self.name(), %filename, keys = self.base.length(), "loaded partial store");
        Ok(())
    }

    /// Serialize the partial for persistence at `at_end`; the caller writes
    /// the returned content.
    pub fn prepare_save(&mut self, at_end: u64) -> Result<(String, Vec<u8>), Error> {
        let filename = self.storage_filename(at_end);
        let content = self
            .base
            .marshal_kv()
            .map_err(|e| Error::protocol(format!("{:#}", e)))?;
        self.exclusive_end_block = at_end;
        Ok((filename, content))
    }

    /// Persist the partial segment ending at `at_end`, inline.
    pub async fn save(&mut self, at_end: u64) -> Result<String, Error> {
        let (filename, content) = self.prepare_save(at_end)?;
        with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
            self.base.objects().write(&filename, content.clone())
        })
        .await?;
        debug!(store = %self.name(), %filename, "saved partial store");
        Ok(filename)
    }

    /// Remove the on-disk partial segment ending at `at_end` (after its
    /// content has been merged).
    pub async fn delete_store(&self, at_end: u64) -> Result<(), Error> {
        let filename = self.storage_filename(at_end);
        with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
            self.base.objects().delete(&filename)
        })
        .await?;
        debug!(store = %self.name(), %filename, "deleted partial store");
        Ok(())
    }
}

impl std::fmt::Debug for PartialKV {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialKV")
            .field("name", &self.name())
            .field("range", &self.range())
            .field("keys", &self.base.length())
            .finish()
    }
}
