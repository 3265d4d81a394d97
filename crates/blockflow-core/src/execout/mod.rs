//! Execution-output caching: per-module output caches plus the per-block
//! view module executors read their inputs from.

mod cache;

use std::collections::HashMap;
use std::sync::Arc;

use blockflow_dstore::ObjectStore;
use blockflow_types::{Block, BlockRef, Clock, Cursor, Step};
use tokio::sync::mpsc;

use crate::error::Error;

pub use cache::{CacheItem, OutputCache};

/// The per-block view executors read from and write to: the raw block under
/// its declared type name, plus every module output produced (or cache-hit)
/// so far within this block.
pub struct ExecOutputView {
    pub clock: Clock,
    pub cursor: Cursor,
    pub step: Step,
    values: HashMap<String, Vec<u8>>,
}

impl ExecOutputView {
    pub fn new(block: &Block, block_type: &str, cursor: Cursor, step: Step) -> Self {
        let mut values = HashMap::new();
        values.insert(block_type.to_string(), block.payload.clone());
        ExecOutputView {
            clock: block.clock(),
            cursor,
            step,
            values,
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    pub fn set(&mut self, name: &str, value: Vec<u8>) {
        self.values.insert(name.to_string(), value);
    }
}

/// Owns one [`OutputCache`] per module, each scoped under the module's hash
/// so incompatible recomputations never share artifacts.
pub struct CachingEngine {
    caches: HashMap<String, Arc<OutputCache>>,
    save_interval: u64,
}

impl CachingEngine {
    /// Build one cache per `(module_name, module_hash)` pair, each rooted at
    /// `<hash>/outputs` under `objects`.
    pub fn new(
        objects: &Arc<dyn ObjectStore>,
        modules: &[(String, String)],
        save_interval: u64,
        err_tx: mpsc::Sender<Error>,
    ) -> Self {
        let mut caches = HashMap::new();
        for (name, hash) in modules {
            let scoped = objects.sub_store(&format!("{}/outputs", hash));
            caches.insert(
                name.clone(),
                Arc::new(OutputCache::new(
                    name.clone(),
                    scoped,
                    save_interval,
                    err_tx.clone(),
                )),
            );
        }
        CachingEngine {
            caches,
            save_interval,
        }
    }

    pub fn save_interval(&self) -> u64 {
        self.save_interval
    }

    pub fn cache(&self, module_name: &str) -> Option<Arc<OutputCache>> {
        self.caches.get(module_name).cloned()
    }

    /// Position every cache at `at_block` (loading existing segments when
    /// present).
    pub async fn init(&self, at_block: u64) -> Result<(), Error> {
        for cache in self.caches.values() {
            cache.load_at_block(at_block).await?;
        }
        Ok(())
    }

    /// Notify the engine of a new block so segment files roll once the block
    /// leaves the current range.
    pub fn new_block(&self, block_ref: &BlockRef, _step: Step) -> Result<(), Error> {
        for cache in self.caches.values() {
            if cache.is_out_of_range(block_ref) {
                cache.roll(block_ref.num)?;
            }
        }
        Ok(())
    }

    /// Remove one block's entries from every cache (undo path).
    pub fn delete_block(&self, block_id: &str) {
        for cache in self.caches.values() {
            cache.delete(block_id);
        }
    }
}
