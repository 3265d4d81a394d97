//! Per-module squashing of completed partial segments into the full store.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::block::{Range, Ranges};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::orchestrator::planner::JobsPlanner;
use crate::store::{FullKV, PartialKV};

/// Bound on buffered completion batches per squasher.
const PARTIALS_INBOX_CAPACITY: usize = 100;

/// Handle to one module's squasher task.
///
/// The task owns the module's full store and is its only mutator: completed
/// partial ranges arrive (in any order) on a bounded inbox, and contiguous
/// runs are merged in block order, persisting full checkpoints at
/// save-interval boundaries. Closing the inbox means no more partials will
/// arrive; the squasher drains what it can and reports on the completion
/// channel.
pub struct StoreSquasher {
    name: String,
    partials_tx: mpsc::Sender<Ranges>,
    completion_rx: oneshot::Receiver<Result<FullKV, Error>>,
}

impl StoreSquasher {
    pub fn launch(
        store: FullKV,
        next_expected_start_block: u64,
        target_exclusive_end_block: u64,
        save_interval: u64,
        planner: Arc<JobsPlanner>,
        token: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> StoreSquasher {
        let name = store.name().to_string();
        let (partials_tx, partials_rx) = mpsc::channel(PARTIALS_INBOX_CAPACITY);
        let (completion_tx, completion_rx) = oneshot::channel();

        metrics.record_squash_launched();
        info!(store = %name, next_expected_start_block, target_exclusive_end_block, "launching store squasher");

        tokio::spawn(run_squasher(SquasherTask {
            store,
            next_expected_start_block,
            target_exclusive_end_block,
            save_interval,
            planner,
            token,
            metrics,
            partials_rx,
            completion_tx,
        }));

        StoreSquasher {
            name,
            partials_tx,
            completion_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route a batch of completed partial ranges to the squasher.
    pub async fn squash(&self, ranges: Ranges) -> Result<(), Error> {
        if ranges.is_empty() {
            return Err(Error::protocol(format!(
                "empty partials batch for module {:?}",
                self.name
            )));
        }
        debug!(store = %self.name, ranges = %ranges, "queuing partials for squashing");
        self.partials_tx
            .send(ranges)
            .await
            .map_err(|_| Error::Canceled)
    }

    /// Signal that no more partials will arrive, then wait for the squasher
    /// to drain and return the merged full store.
    pub async fn wait_for_completion(self) -> Result<FullKV, Error> {
        drop(self.partials_tx);
        self.completion_rx.await.map_err(|_| Error::Canceled)?
    }
}

struct SquasherTask {
    store: FullKV,
    next_expected_start_block: u64,
    target_exclusive_end_block: u64,
    save_interval: u64,
    planner: Arc<JobsPlanner>,
    token: CancellationToken,
    metrics: Arc<Metrics>,
    partials_rx: mpsc::Receiver<Ranges>,
    completion_tx: oneshot::Sender<Result<FullKV, Error>>,
}

async fn run_squasher(mut task: SquasherTask) {
    let name = task.store.name().to_string();
    let mut pending: Vec<Range> = Vec::new();

    loop {
        let batch = tokio::select! {
            // Cancellation wins over a simultaneously closed inbox.
            biased;
            _ = task.token.cancelled() => {
                debug!(store = %name, "squasher canceled");
                let _ = task.completion_tx.send(Err(Error::Canceled));
                return;
            }
            batch = task.partials_rx.recv() => batch,
        };

        match batch {
            Some(ranges) => {
                pending.extend(ranges);
                pending.sort_by_key(|r| r.start_block);
            }
            None => {
                // Inbox closed: everything mergeable has been merged already.
                if !pending.is_empty() {
                    let _ = task.completion_tx.send(Err(Error::protocol(format!(
                        "store {:?}: hole below partials {}, merged up to {}",
                        name,
                        Ranges(pending),
                        task.next_expected_start_block,
                    ))));
                } else {
                    info!(store = %name, up_to = task.next_expected_start_block, "squashing done");
                    let _ = task.completion_tx.send(Ok(task.store));
                }
                return;
            }
        }

        let started = Instant::now();
        match process_pending(&mut task, &mut pending).await {
            Ok(0) => {}
            Ok(merges) => {
                task.planner
                    .signal_completion_up_until(&name, task.next_expected_start_block);
                task.metrics.record_squash_batch(started.elapsed(), merges);
                debug!(store = %name, merges, up_to = task.next_expected_start_block, "squash batch done");
            }
            Err(err) => {
                let _ = task.completion_tx.send(Err(err));
                return;
            }
        }
    }
}

/// Merge the contiguous head of `pending`, stopping at the first gap.
/// Returns the number of ranges merged.
async fn process_pending(task: &mut SquasherTask, pending: &mut Vec<Range>) -> Result<u64, Error> {
    let mut merges = 0u64;
    let mut writes: JoinSet<Result<(), Error>> = JoinSet::new();

    let result = loop {
        let Some(&head) = pending.first() else {
            break Ok(());
        };
        if head.start_block > task.next_expected_start_block {
            // An earlier partial is still missing.
            break Ok(());
        }
        if head.start_block < task.next_expected_start_block {
            break Err(Error::protocol(format!(
                "store {:?}: non-contiguous partial {}, expected start {}",
                task.store.name(),
                head,
                task.next_expected_start_block,
            )));
        }

        if let Err(err) = merge_one(task, head, &mut writes).await {
            break Err(err);
        }
        pending.remove(0);
        merges += 1;
        task.next_expected_start_block = head.exclusive_end_block;
        if head.exclusive_end_block == task.target_exclusive_end_block {
            debug!(store = %task.store.name(), "target block reached");
        }
    };

    // Always settle in-flight writes; their first error wins over a clean
    // loop exit.
    let mut write_error: Option<Error> = None;
    while let Some(joined) = writes.join_next().await {
        let write_result =
            joined.map_err(|e| Error::protocol(format!("squasher write task: {}", e)))?;
        if let (Err(err), None) = (write_result, &write_error) {
            write_error = Some(err);
        }
    }

    result.and(match write_error {
        Some(err) => Err(err),
        None => Ok(merges),
    })
}

async fn merge_one(
    task: &mut SquasherTask,
    range: Range,
    writes: &mut JoinSet<Result<(), Error>>,
) -> Result<(), Error> {
    let mut partial = PartialKV::new(task.store.base.clone_config(), range.start_block);
    partial.load(range.exclusive_end_block).await?;

    debug!(store = %task.store.name(), %range, keys = partial.base.length(), "merging partial");
    let deleter = PartialKV::new(task.store.base.clone_config(), range.start_block);
    task.store.merge(partial)?;

    writes.spawn(async move { deleter.delete_store(range.exclusive_end_block).await });

    let on_boundary = range.exclusive_end_block % task.save_interval == 0;
    let is_first_checkpoint = on_boundary && range.start_block == task.store.base.initial_block();
    let closes_full_segment = on_boundary && range.len() == task.save_interval;
    if is_first_checkpoint || closes_full_segment {
        let (filename, content) = task.store.prepare_save(range.exclusive_end_block)?;
        let objects = Arc::clone(task.store.base.objects());
        writes.spawn(async move {
            blockflow_dstore::with_retries(
                blockflow_dstore::retry::DEFAULT_ATTEMPTS,
                blockflow_dstore::retry::DEFAULT_BACKOFF,
                || objects.write(&filename, content.clone()),
            )
            .await?;
            Ok(())
        });
    }
    Ok(())
}
