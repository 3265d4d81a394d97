//! Per-module, content-addressed output cache.
//!
//! One cache instance covers one module and holds the module's outputs for
//! the current segment range, persisted as `.output` files named after the
//! range they cover.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use blockflow_dstore::retry::{DEFAULT_ATTEMPTS, DEFAULT_BACKOFF};
use blockflow_dstore::{with_retries, ObjectStore};
use blockflow_types::{BlockRef, Clock, Cursor};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::block::{
    boundary_below, continuous_ranges, output_filename, parse_output_filename, Range, Ranges,
};
use crate::error::Error;

/// One cached module output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItem {
    pub block_num: u64,
    pub block_id: String,
    #[serde(with = "blockflow_types::b64")]
    pub payload: Vec<u8>,
    /// Unix timestamp in milliseconds, from the block's clock.
    pub timestamp: i64,
    pub cursor: Cursor,
}

struct Inner {
    current_range: Range,
    kv: HashMap<String, CacheItem>,
}

/// Output cache for one module. Reads take the read lock; `set` and `delete`
/// take the write lock. Segment writes run in a spawned task and report
/// failures through the request's error channel.
pub struct OutputCache {
    module_name: String,
    objects: Arc<dyn ObjectStore>,
    save_interval: u64,
    inner: RwLock<Inner>,
    err_tx: mpsc::Sender<Error>,
}

impl OutputCache {
    pub fn new(
        module_name: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
        save_interval: u64,
        err_tx: mpsc::Sender<Error>,
    ) -> Self {
        OutputCache {
            module_name: module_name.into(),
            objects,
            save_interval,
            inner: RwLock::new(Inner {
                current_range: Range::new(0, 0),
                kv: HashMap::new(),
            }),
            err_tx,
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn current_range(&self) -> Range {
        self.inner.read().current_range
    }

    pub fn current_filename(&self) -> String {
        output_filename(&self.inner.read().current_range)
    }

    /// True when `block_ref` falls outside the current segment, meaning the
    /// segment must be rolled before caching this block.
    pub fn is_out_of_range(&self, block_ref: &BlockRef) -> bool {
        !self.inner.read().current_range.contains_block_ref(block_ref)
    }

    pub fn set(&self, clock: &Clock, cursor: &Cursor, payload: &[u8]) {
        let item = CacheItem {
            block_num: clock.number,
            block_id: clock.id.clone(),
            payload: payload.to_vec(),
            timestamp: clock.timestamp,
            cursor: cursor.clone(),
        };
        self.inner.write().kv.insert(clock.id.clone(), item);
    }

    pub fn get(&self, clock: &Clock) -> Option<Vec<u8>> {
        self.inner.read().kv.get(&clock.id).map(|i| i.payload.clone())
    }

    pub fn get_at_block(&self, block_num: u64) -> Option<Vec<u8>> {
        self.inner
            .read()
            .kv
            .values()
            .find(|i| i.block_num == block_num)
            .map(|i| i.payload.clone())
    }

    /// Remove one entry (used on undo).
    pub fn delete(&self, block_id: &str) {
        self.inner.write().kv.remove(block_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All items of the current segment, ordered by block number.
    pub fn sorted_cache_items(&self) -> Vec<CacheItem> {
        let mut items: Vec<CacheItem> = self.inner.read().kv.values().cloned().collect();
        items.sort_by_key(|i| i.block_num);
        items
    }

    /// Locate and load the segment covering `at_block`. When none exists,
    /// install an empty current range `[at_block, at_block + save_interval)`
    /// and return `false`.
    pub async fn load_at_block(&self, at_block: u64) -> Result<bool, Error> {
        debug!(module = %self.module_name, at_block, "loading cache at block");
        let segment_start = boundary_below(at_block, self.save_interval);
        match self.find_segment(segment_start).await? {
            Some(range) => {
                self.load(range).await?;
                Ok(true)
            }
            None => {
                let mut inner = self.inner.write();
                inner.kv = HashMap::new();
                inner.current_range = Range::new(at_block, at_block + self.save_interval);
                Ok(false)
            }
        }
    }

    /// Find the widest existing segment starting at `segment_start`.
    async fn find_segment(&self, segment_start: u64) -> Result<Option<Range>, Error> {
        let prefix = format!("{:010}", segment_start);
        let files = with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
            self.objects.list_files(&prefix, usize::MAX)
        })
        .await?;
        let mut best: Option<Range> = None;
        for file in files {
            let range = parse_output_filename(&file)?;
            match best {
                Some(current) if range.exclusive_end_block <= current.exclusive_end_block => {}
                _ => best = Some(range),
            }
        }
        Ok(best)
    }

    /// Load the segment covering exactly `range`.
    pub async fn load(&self, range: Range) -> Result<(), Error> {
        let filename = output_filename(&range);
        let content = with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
            self.objects.open(&filename)
        })
        .await?;
        let kv: HashMap<String, CacheItem> = serde_json::from_slice(&content)
            .with_context(|| format!("cache segment {}", filename))
            .map_err(|e| Error::protocol(format!("{:#}", e)))?;

        let mut inner = self.inner.write();
        inner.kv = kv;
        inner.current_range = range;
        debug!(module = %self.module_name, %filename, items = inner.kv.len(), "cache segment loaded");
        Ok(())
    }

    /// Serialize the current segment and enqueue its write. Returns once the
    /// write task is spawned; a write failure surfaces through the request's
    /// error channel.
    pub fn save(&self) -> Result<(), Error> {
        let (filename, content) = {
            let inner = self.inner.read();
            let content = serde_json::to_vec(&inner.kv)
                .context("serialize cache segment")
                .map_err(|e| Error::protocol(format!("{:#}", e)))?;
            (output_filename(&inner.current_range), content)
        };

        let objects = Arc::clone(&self.objects);
        let err_tx = self.err_tx.clone();
        let module_name = self.module_name.clone();
        tokio::spawn(async move {
            let result = with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
                objects.write(&filename, content.clone())
            })
            .await;
            if let Err(err) = result {
                tracing::warn!(module = %module_name, %filename, error = %err, "cache write failed");
                let _ = err_tx.send(Error::Storage(err)).await;
            }
        });
        Ok(())
    }

    /// Persist the current segment and move to the one containing
    /// `next_block`.
    pub fn roll(&self, next_block: u64) -> Result<(), Error> {
        self.save()?;
        let mut inner = self.inner.write();
        let start = boundary_below(next_block, self.save_interval);
        inner.current_range = Range::new(start, start + self.save_interval);
        inner.kv = HashMap::new();
        Ok(())
    }

    /// Every cached segment range, sorted by start block.
    pub async fn list_cache_ranges(&self) -> Result<Ranges, Error> {
        let files = with_retries(DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, || {
            self.objects.list_files("", usize::MAX)
        })
        .await?;
        let mut out = Vec::with_capacity(files.len());
        for file in files {
            out.push(parse_output_filename(&file)?);
        }
        let mut ranges = Ranges(out);
        ranges.sort_by_start();
        Ok(ranges)
    }

    /// The longest contiguous run of cached segments starting at or after
    /// `from`.
    pub async fn list_continuous_cache_ranges(&self, from: u64) -> Result<Ranges, Error> {
        let ranges = self.list_cache_ranges().await?;
        Ok(Ranges(continuous_ranges(&ranges.0, from)))
    }
}
