//! Planning of missing partial-store segments and dependency-ordered job
//! release.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::block::{boundary_below, Range, Ranges};
use crate::error::Error;
use crate::graph::ModuleGraph;
use crate::orchestrator::storage_state::StorageState;

/// One unit of backfill work: compute the partial store segment `range` for
/// `module_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub module_name: String,
    pub range: Range,
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.module_name, self.range)
    }
}

/// Executes one job, producing the ranges it covered. The transport behind
/// this (in-process pipeline, remote sub-request) is the caller's concern.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job) -> Result<Ranges, Error>;
}

struct PendingJob {
    job: Job,
    /// `(ancestor store, watermark it must reach)` pairs gating this job.
    deps: Vec<(String, u64)>,
}

struct PlannerState {
    pending: Vec<PendingJob>,
    /// Highest contiguous block each store has been squashed up to.
    watermarks: HashMap<String, u64>,
    ready_tx: Option<mpsc::Sender<Job>>,
}

/// Plans the partial segments missing for every store module to advance from
/// its last checkpoint to the request's start block, and releases them in
/// dependency order as upstream stores report completion.
pub struct JobsPlanner {
    state: Mutex<PlannerState>,
    token: CancellationToken,
    /// Per-module exclusive end block at which the module is caught up.
    targets: HashMap<String, u64>,
    /// Partials already on disk, fed to squashers before any job runs.
    preexisting: HashMap<String, Ranges>,
}

impl JobsPlanner {
    /// Compute the plan. Returns the planner plus the bounded channel on
    /// which ready jobs are delivered; the channel closes once every planned
    /// job has been released.
    pub fn new(
        graph: &ModuleGraph,
        storage_state: &StorageState,
        save_interval: u64,
        request_start_block: u64,
        token: CancellationToken,
    ) -> Result<(Arc<JobsPlanner>, mpsc::Receiver<Job>), Error> {
        let mut watermarks = HashMap::new();
        let mut targets = HashMap::new();
        let mut preexisting: HashMap<String, Ranges> = HashMap::new();
        let mut pending = Vec::new();
        let mut total_jobs = 0usize;

        for module in graph.stores() {
            let snapshots = storage_state.get(&module.name);
            let start = snapshots
                .and_then(|s| s.last_complete_snapshot_before(request_start_block))
                .map(|r| r.exclusive_end_block)
                .unwrap_or(module.initial_block);
            let target = request_start_block.max(start);

            watermarks.insert(module.name.clone(), start);
            targets.insert(module.name.clone(), target);

            let ancestors: Vec<String> = graph
                .ancestor_stores_of(&module.name)?
                .iter()
                .map(|m| m.name.clone())
                .collect();

            for range in missing_ranges(start, target, save_interval) {
                if snapshots.is_some_and(|s| s.contains_partial(&range)) {
                    preexisting
                        .entry(module.name.clone())
                        .or_default()
                        .0
                        .push(range);
                    continue;
                }
                let deps: Vec<(String, u64)> = ancestors
                    .iter()
                    .map(|a| (a.clone(), range.exclusive_end_block))
                    .collect();
                pending.push(PendingJob {
                    job: Job {
                        module_name: module.name.clone(),
                        range,
                    },
                    deps,
                });
                total_jobs += 1;
            }
        }

        // Every job flows through this channel exactly once, so the capacity
        // bound can never block a release.
        let (ready_tx, ready_rx) = mpsc::channel(total_jobs.max(1));

        let planner = Arc::new(JobsPlanner {
            state: Mutex::new(PlannerState {
                pending,
                watermarks,
                ready_tx: Some(ready_tx),
            }),
            token,
            targets,
            preexisting,
        });
        info!(jobs = total_jobs, "backfill plan computed");
        planner.release_ready();
        Ok((planner, ready_rx))
    }

    /// The block each store module must reach.
    pub fn target_for(&self, module_name: &str) -> Option<u64> {
        self.targets.get(module_name).copied()
    }

    /// The squash watermark each store starts from.
    pub fn start_for(&self, module_name: &str) -> Option<u64> {
        self.state.lock().watermarks.get(module_name).copied()
    }

    /// Partials already on disk for `module_name`, to be squashed without
    /// running a job.
    pub fn preexisting_partials(&self, module_name: &str) -> Option<Ranges> {
        self.preexisting.get(module_name).cloned()
    }

    pub fn jobs_pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Record that `module_name` has been squashed contiguously up to
    /// `block`, releasing any job this unblocks. Called by squashers.
    pub fn signal_completion_up_until(&self, module_name: &str, block: u64) {
        {
            let mut state = self.state.lock();
            let watermark = state.watermarks.entry(module_name.to_string()).or_insert(0);
            if block <= *watermark {
                return;
            }
            *watermark = block;
            debug!(module = module_name, block, "store completion signaled");
        }
        self.release_ready();
    }

    fn release_ready(&self) {
        let mut state = self.state.lock();
        if self.token.is_cancelled() {
            // No new jobs after cancellation; close the ready channel.
            state.pending.clear();
            state.ready_tx = None;
            return;
        }

        let mut index = 0;
        while index < state.pending.len() {
            let satisfied = {
                let pending = &state.pending[index];
                pending.deps.iter().all(|(ancestor, required)| {
                    let target = self.targets.get(ancestor).copied().unwrap_or(0);
                    let watermark = state.watermarks.get(ancestor).copied().unwrap_or(0);
                    watermark >= (*required).min(target)
                })
            };
            if !satisfied {
                index += 1;
                continue;
            }
            let pending = state.pending.remove(index);
            debug!(job = %pending.job, "job released");
            if let Some(tx) = &state.ready_tx {
                // Capacity equals the total job count, so this never blocks.
                let _ = tx.try_send(pending.job);
            }
        }

        if state.pending.is_empty() {
            state.ready_tx = None;
        }
    }
}

/// The save-interval-aligned ranges covering `[from, to)`; only the leading
/// range may start off-boundary, only the trailing one may end off-boundary.
fn missing_ranges(from: u64, to: u64, save_interval: u64) -> Vec<Range> {
    let mut out = Vec::new();
    let mut cursor = from;
    while cursor < to {
        let boundary = boundary_below(cursor, save_interval) + save_interval;
        let end = boundary.min(to);
        out.push(Range::new(cursor, end));
        cursor = end;
    }
    out
}
