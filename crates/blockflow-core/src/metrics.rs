//! Runtime counters (thread-safe, injected explicitly through constructors).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Progress counters exposed by the runtime. Transport to an external sink is
/// out of scope; consumers read a [`MetricsSnapshot`].
#[derive(Debug, Default)]
pub struct Metrics {
    /// Blocks entering the pipeline.
    pub block_begin_process: AtomicU64,
    /// Blocks fully executed by the pipeline.
    pub block_end_process: AtomicU64,
    /// Squasher tasks launched.
    pub squashes_launched: AtomicU64,
    /// Duration of the most recent squash batch, in nanoseconds.
    pub last_squash_duration: AtomicU64,
    /// Average per-merge duration within the most recent squash batch, in
    /// nanoseconds.
    pub last_squash_avg_duration: AtomicU64,
}

impl Metrics {
    pub fn record_block_begin(&self) {
        self.block_begin_process.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block_end(&self) {
        self.block_end_process.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_squash_launched(&self) {
        self.squashes_launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_squash_batch(&self, total: Duration, merges: u64) {
        self.last_squash_duration
            .store(total.as_nanos() as u64, Ordering::Relaxed);
        let avg = if merges > 0 {
            total.as_nanos() as u64 / merges
        } else {
            0
        };
        self.last_squash_avg_duration.store(avg, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            block_begin_process: self.block_begin_process.load(Ordering::Relaxed),
            block_end_process: self.block_end_process.load(Ordering::Relaxed),
            squashes_launched: self.squashes_launched.load(Ordering::Relaxed),
            last_squash_duration_ns: self.last_squash_duration.load(Ordering::Relaxed),
            last_squash_avg_duration_ns: self.last_squash_avg_duration.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`Metrics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub block_begin_process: u64,
    pub block_end_process: u64,
    pub squashes_launched: u64,
    pub last_squash_duration_ns: u64,
    pub last_squash_avg_duration_ns: u64,
}
