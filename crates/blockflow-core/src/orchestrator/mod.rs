//! Parallel backfill orchestration.
//!
//! The planner computes the partial segments missing for every store module
//! and releases them as jobs in dependency order; a bounded worker pool runs
//! the jobs; one squasher per module merges completed partials into the full
//! store. Completions flow through a single bounded channel owned by the
//! driver, which routes them to the owning squasher.

pub mod planner;
pub mod snapshots;
pub mod squasher;
pub mod storage_state;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::Ranges;
use crate::error::Error;
use crate::store::FullKV;

pub use planner::{Job, JobRunner, JobsPlanner};
pub use snapshots::{list_snapshots, Snapshots};
pub use squasher::StoreSquasher;
pub use storage_state::{fetch_storage_state, StorageState};

/// Bound on buffered worker completions.
const COMPLETIONS_CAPACITY: usize = 100;

/// Drive a backfill to completion: run every planned job with at most
/// `concurrency` workers, routing completions to the per-module squashers.
/// Returns the merged full stores. The first error cancels siblings, drains
/// in-flight work, and is the one surfaced.
pub async fn run_backfill(
    planner: Arc<JobsPlanner>,
    mut ready_rx: mpsc::Receiver<Job>,
    runner: Arc<dyn JobRunner>,
    squashers: HashMap<String, StoreSquasher>,
    concurrency: usize,
    token: CancellationToken,
) -> Result<HashMap<String, FullKV>, Error> {
    // Partials already on disk squash without running a job.
    for (name, squasher) in &squashers {
        if let Some(ranges) = planner.preexisting_partials(name) {
            if !ranges.is_empty() {
                debug!(store = %name, ranges = %ranges, "squashing pre-existing partials");
                squasher.squash(ranges).await?;
            }
        }
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let (done_tx, mut done_rx) =
        mpsc::channel::<Result<(String, Ranges), Error>>(COMPLETIONS_CAPACITY);

    let mut first_error: Option<Error> = None;
    let mut ready_open = true;
    let mut in_flight = 0usize;

    while ready_open || in_flight > 0 {
        tokio::select! {
            job = ready_rx.recv(), if ready_open && first_error.is_none() => {
                match job {
                    None => ready_open = false,
                    Some(job) => {
                        in_flight += 1;
                        let runner = Arc::clone(&runner);
                        let semaphore = Arc::clone(&semaphore);
                        let done_tx = done_tx.clone();
                        let token = token.clone();
                        tokio::spawn(async move {
                            let result = async {
                                let _permit = semaphore
                                    .acquire_owned()
                                    .await
                                    .map_err(|_| Error::Canceled)?;
                                if token.is_cancelled() {
                                    return Err(Error::Canceled);
                                }
                                debug!(job = %job, "running job");
                                let ranges = runner.run(&job).await?;
                                Ok((job.module_name.clone(), ranges))
                            }
                            .await;
                            let _ = done_tx.send(result).await;
                        });
                    }
                }
            }
            done = done_rx.recv(), if in_flight > 0 => {
                in_flight -= 1;
                match done.expect("completions channel held open by the driver") {
                    Ok((module_name, ranges)) => {
                        let routed = match squashers.get(&module_name) {
                            Some(squasher) => squasher.squash(ranges).await,
                            None => Err(Error::protocol(format!(
                                "completion for unknown module {:?}",
                                module_name
                            ))),
                        };
                        if let Err(err) = routed {
                            if first_error.is_none() {
                                token.cancel();
                                first_error = Some(err);
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "job failed");
                        if first_error.is_none() {
                            // Cancel siblings; keep draining in-flight work.
                            token.cancel();
                            first_error = Some(err);
                        }
                    }
                }
            }
            _ = token.cancelled(), if first_error.is_none() => {
                first_error = Some(Error::Canceled);
                ready_open = false;
            }
        }

        if first_error.is_some() && ready_open {
            // No new jobs are started after the first failure.
            ready_rx.close();
            ready_open = false;
        }
    }

    // Closing every inbox tells the squashers to drain and report.
    let mut stores = HashMap::new();
    for (name, squasher) in squashers {
        match squasher.wait_for_completion().await {
            Ok(store) => {
                stores.insert(name, store);
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => {
            info!(stores = stores.len(), "backfill complete");
            Ok(stores)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Range;
    use crate::graph::ModuleGraph;
    use crate::metrics::Metrics;
    use crate::store::{BaseStore, PartialKV};
    use async_trait::async_trait;
    use blockflow_dstore::{MemStore, ObjectStore};
    use blockflow_types::{Input, Module, ModuleKind, StoreMode, UpdatePolicy};
    use parking_lot::Mutex;

    fn store_module(name: &str, inputs: Vec<Input>) -> Module {
        Module {
            name: name.to_string(),
            initial_block: 0,
            kind: ModuleKind::Store {
                value_type: "int64".to_string(),
                update_policy: UpdatePolicy::Add,
            },
            inputs,
            binary_entrypoint: name.to_string(),
        }
    }

    /// Runs jobs by writing a one-key partial segment, the way a worker
    /// process would through the per-block pipeline.
    struct RecordingRunner {
        objects: Arc<dyn ObjectStore>,
        log: Mutex<Vec<Job>>,
        fail_on: Option<Range>,
    }

    #[async_trait]
    impl JobRunner for RecordingRunner {
        async fn run(&self, job: &Job) -> Result<Ranges, Error> {
            if self.fail_on.as_ref() == Some(&job.range) {
                return Err(Error::protocol("synthetic job failure"));
            }
            self.log.lock().push(job.clone());
            let objects = self.objects.sub_store(&job.module_name);
            let base = BaseStore::new(
                job.module_name.clone(),
                0,
                "hash",
                UpdatePolicy::Add,
                "int64",
                objects,
            )
            .map_err(|e| Error::protocol(format!("{:#}", e)))?;
            let mut partial = PartialKV::new(base, job.range.start_block);
            partial.base.add(0, "blocks", b"1").unwrap();
            partial.save(job.range.exclusive_end_block).await?;
            Ok(Ranges(vec![job.range]))
        }
    }

    fn full_store(objects: &Arc<dyn ObjectStore>, name: &str) -> FullKV {
        FullKV::new(
            BaseStore::new(
                name,
                0,
                "hash",
                UpdatePolicy::Add,
                "int64",
                objects.sub_store(name),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn backfill_runs_jobs_and_squashes() {
        let graph = ModuleGraph::new(vec![
            store_module("base", vec![]),
            store_module(
                "derived",
                vec![Input::Store {
                    module_name: "base".to_string(),
                    mode: StoreMode::Get,
                }],
            ),
        ])
        .unwrap();

        let objects: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let token = CancellationToken::new();
        let metrics = Arc::new(Metrics::default());
        let (planner, ready_rx) =
            JobsPlanner::new(&graph, &StorageState::default(), 100, 300, token.clone()).unwrap();

        let mut squashers = HashMap::new();
        for name in ["base", "derived"] {
            squashers.insert(
                name.to_string(),
                StoreSquasher::launch(
                    full_store(&objects, name),
                    0,
                    300,
                    100,
                    Arc::clone(&planner),
                    token.clone(),
                    Arc::clone(&metrics),
                ),
            );
        }

        let runner = Arc::new(RecordingRunner {
            objects: Arc::clone(&objects),
            log: Mutex::new(Vec::new()),
            fail_on: None,
        });

        let stores = run_backfill(planner, ready_rx, runner.clone(), squashers, 4, token)
            .await
            .unwrap();

        // Three segments per store, merged in order.
        assert_eq!(stores.len(), 2);
        for name in ["base", "derived"] {
            let store = stores.get(name).unwrap();
            assert_eq!(store.exclusive_end_block(), 300);
            assert_eq!(store.base.get_last("blocks").unwrap(), b"3");
        }

        // Dependency order held: every derived job ran after base covered it.
        let log = runner.log.lock();
        for (index, job) in log.iter().enumerate() {
            if job.module_name == "derived" {
                let covered = log[..index]
                    .iter()
                    .filter(|j| j.module_name == "base")
                    .map(|j| j.range.exclusive_end_block)
                    .max()
                    .unwrap_or(0);
                assert!(covered >= job.range.exclusive_end_block);
            }
        }
        assert_eq!(metrics.snapshot().squashes_launched, 2);
    }

    #[tokio::test]
    async fn first_job_error_cancels_and_surfaces() {
        let graph = ModuleGraph::new(vec![store_module("base", vec![])]).unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let token = CancellationToken::new();
        let (planner, ready_rx) =
            JobsPlanner::new(&graph, &StorageState::default(), 100, 300, token.clone()).unwrap();

        let mut squashers = HashMap::new();
        squashers.insert(
            "base".to_string(),
            StoreSquasher::launch(
                full_store(&objects, "base"),
                0,
                300,
                100,
                Arc::clone(&planner),
                token.clone(),
                Arc::new(Metrics::default()),
            ),
        );

        let runner = Arc::new(RecordingRunner {
            objects: Arc::clone(&objects),
            log: Mutex::new(Vec::new()),
            fail_on: Some(Range::new(100, 200)),
        });

        let err = run_backfill(planner, ready_rx, runner, squashers, 1, token.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert!(token.is_cancelled());
    }
}
