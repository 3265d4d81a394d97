//! Full store segments: state aligned with `[module_initial_block, end)`.

use anyhow::Context;
use blockflow_dstore::retry::{DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};
use blockflow_dstore::with_retries;
use blockflow_types::UpdatePolicy;
use tracing::debug;

use crate::block::{full_state_filename, Range};
use crate::error::Error;
use crate::store::base::BaseStore;
use crate::store::partial::PartialKV;

/// A store whose data covers `[module_initial_block, exclusive_end_block)`,
/// checkpointed as `.kv` segments.
pub struct FullKV {
    pub base: BaseStore,
    exclusive_end_block: u64,
}

impl FullKV {
    /// A full store with no data yet; it covers the empty range starting at
    /// the module's initial block.
    pub fn new(base: BaseStore) -> Self {
        let exclusive_end_block = base.initial_block();
        FullKV {
            base,
            exclusive_end_block,
        }
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// End of the range currently held in memory.
    pub fn exclusive_end_block(&self) -> u64 {
        self.exclusive_end_block
    }

    pub fn covered_range(&self) -> Range {
        Range::new(self.base.initial_block(), self.exclusive_end_block)
    }

    fn storage_filename(&self, at_end: u64) -> String {
        full_state_filename(&Range::new(self.base.initial_block(), at_end))
    }

    /// Load the checkpoint ending at `at_end`.
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
        debug!(store = %self.name(), %filename, keys = self.base.length(), "loaded full store");
        Ok(())
    }

    /// Serialize the current state for a checkpoint ending at `at_end`,
    /// marking the store as covering up to that block. The caller decides
    /// whether to write inline ([`FullKV::save`]) or in a spawned task.
    pub fn prepare_save(&mut self, at_end: u64) -> Result<(String, Vec<u8>), Error> {
        let filename = self.storage_filename(at_end);
        let content = self
            .base
            .marshal_kv()
            .map_err(|e| Error::protocol(format!("{:#}", e)))?;
        self.exclusive_end_block = at_end;
        Ok((filename, content))
    }

    /// Persist a checkpoint ending at `at_end`, inline.
    pub async fn save(&mut self, at_end: u64) -> Result<String, Error> {
        let (filename, content) = self.prepare_save(at_end)?;
        with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
            self.base.objects().write(&filename, content.clone())
        })
        .await?;
        debug!(store = %self.name(), %filename, "saved full store");
        Ok(filename)
    }

    /// Merge a contiguous partial segment into this store, combining
    /// overlapping keys per the store's update policy. The partial must start
    /// exactly where this store ends.
    pub fn merge(&mut self, other: PartialKV) -> Result<(), Error> {
        if self.base.update_policy() != other.base.update_policy() {
            return Err(Error::protocol(format!(
                "merging store {:?}: update policy mismatch ({} vs {})",
                self.name(),
                self.base.update_policy(),
                other.base.update_policy(),
            )));
        }
        if self.base.value_type() != other.base.value_type() {
            return Err(Error::protocol(format!(
                "merging store {:?}: value type mismatch ({:?} vs {:?})",
                self.name(),
                self.base.value_type(),
                other.base.value_type(),
            )));
        }
        if other.initial_block() != self.exclusive_end_block {
            return Err(Error::protocol(format!(
                "merging store {:?}: partial starts at {} but full store ends at {}",
                self.name(),
                other.initial_block(),
                self.exclusive_end_block,
            )));
        }

        let policy = self.base.update_policy();
        let value_type = self.base.value_type().to_string();
        let next_end = other.range().exclusive_end_block;

        for (key, right) in other.base.kv {
            let combined = match self.base.kv.get(&key) {
                None => right,
                Some(left) => match policy {
                    UpdatePolicy::Set => right,
                    UpdatePolicy::SetIfNotExists => left.clone(),
                    UpdatePolicy::Add => super::value::combine_add(&value_type, left, &right)
                        .map_err(|e| Error::protocol(format!("{:#}", e)))?,
                    UpdatePolicy::Min => super::value::combine_min(&value_type, left, &right)
                        .map_err(|e| Error::protocol(format!("{:#}", e)))?,
                    UpdatePolicy::Max => super::value::combine_max(&value_type, left, &right)
                        .map_err(|e| Error::protocol(format!("{:#}", e)))?,
                    UpdatePolicy::Append => {
                        let mut merged = left.clone();
                        merged.extend_from_slice(&right);
                        merged
                    }
                    UpdatePolicy::Unset => {
                        return Err(Error::protocol(format!(
                            "merging store {:?}: unset update policy",
                            self.base.name(),
                        )))
                    }
                },
            };
            self.base.kv.insert(key, combined);
        }

        self.exclusive_end_block = next_end;
        Ok(())
    }
}

impl std::fmt::Debug for FullKV {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullKV")
            .field("name", &self.name())
            .field("range", &self.covered_range())
            .field("keys", &self.base.length())
            .finish()
    }
}
