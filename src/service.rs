//! Request wiring: from a [`Request`] to a running pipeline (stream mode) or
//! a squashed set of full stores (backfill mode).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use blockflow_core::block::Range;
use blockflow_core::error::Error;
use blockflow_core::execout::CachingEngine;
use blockflow_core::graph::{ModuleGraph, ModuleHashes};
use blockflow_core::metrics::Metrics;
use blockflow_core::orchestrator::{
    fetch_storage_state, run_backfill, Job, JobRunner, JobsPlanner, StoreSquasher,
};
use blockflow_core::pipeline::{send_snapshots, Pipeline, PipelineConfig};
use blockflow_core::source::BlockSource;
use blockflow_core::store::{BaseStore, FullKV, PartialKV, StoreHandle, StoreMap};
use blockflow_core::wasm::ModuleRuntime;
use blockflow_core::Ranges;
use blockflow_dstore::ObjectStore;
use blockflow_types::{Cursor, Module, Request, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Produces block sources over arbitrary ranges, for backfill workers. The
/// returned source must deliver blocks from `range.start_block` through at
/// least `range.exclusive_end_block` (the stop block terminates the run).
pub trait BlockSourceFactory: Send + Sync {
    fn source_for(&self, range: Range) -> Box<dyn BlockSource>;
}

/// Streaming service over one object store.
pub struct Service {
    objects: Arc<dyn ObjectStore>,
    stores_save_interval: u64,
    output_cache_save_interval: u64,
    backfill_concurrency: usize,
    chain_head: Option<u64>,
    block_type: String,
    metrics: Arc<Metrics>,
}

impl Service {
    pub fn new(objects: Arc<dyn ObjectStore>, block_type: impl Into<String>) -> Self {
        Service {
            objects,
            stores_save_interval: 1_000,
            output_cache_save_interval: 100,
            backfill_concurrency: 10,
            chain_head: None,
            block_type: block_type.into(),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_stores_save_interval(mut self, blocks: u64) -> Self {
        self.stores_save_interval = blocks;
        self
    }

    pub fn with_output_cache_save_interval(mut self, blocks: u64) -> Self {
        self.output_cache_save_interval = blocks;
        self
    }

    pub fn with_backfill_concurrency(mut self, workers: usize) -> Self {
        self.backfill_concurrency = workers;
        self
    }

    /// Provide the current chain head, enabling head-relative start blocks.
    pub fn with_chain_head(mut self, head: u64) -> Self {
        self.chain_head = Some(head);
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    fn resolve_start_block(&self, request: &Request) -> Result<u64, Error> {
        if request.start_block_num >= 0 {
            return Ok(request.start_block_num as u64);
        }
        let head = self.chain_head.ok_or_else(|| {
            Error::invalid_request("head-relative start block requires a chain head")
        })?;
        let offset = request.start_block_num.unsigned_abs();
        Ok(head.saturating_sub(offset))
    }

    fn validate(&self, request: &Request) -> Result<(u64, ModuleGraph, ModuleHashes), Error> {
        if request.modules.is_empty() {
            return Err(Error::invalid_request("request has no modules"));
        }
        Cursor::from_opaque(request.start_cursor.to_string())
            .map_err(|e| Error::invalid_request(format!("invalid start cursor: {:#}", e)))?;

        let start_block = self.resolve_start_block(request)?;
        if request.stop_block_num > 0 && request.stop_block_num <= start_block {
            return Err(Error::invalid_request(format!(
                "stop block {} not beyond start block {}",
                request.stop_block_num, start_block
            )));
        }

        let graph = ModuleGraph::new(request.modules.clone())?;
        for name in request
            .output_modules
            .iter()
            .chain(&request.initial_store_snapshot_for_modules)
        {
            if graph.get(name).is_none() {
                return Err(Error::invalid_request(format!("unknown module {:?}", name)));
            }
        }
        let mut hashes = ModuleHashes::new();
        hashes.hash_all(&graph)?;
        Ok((start_block, graph, hashes))
    }

    fn states_store(&self, hash: &str) -> Arc<dyn ObjectStore> {
        self.objects.sub_store(&format!("{}/states", hash))
    }

    fn base_store(&self, module: &Module, hash: &str) -> Result<BaseStore, Error> {
        BaseStore::new(
            module.name.clone(),
            module.initial_block,
            hash,
            module.update_policy(),
            module.value_type(),
            self.states_store(hash),
        )
        .map_err(|e| Error::invalid_request(format!("{:#}", e)))
    }

    /// Serve one streaming request: load stores from their latest checkpoints
    /// at or below the start block, then drive the block source through the
    /// pipeline. Responses flow through the returned channel; the join handle
    /// resolves with the stream's terminal status.
    pub async fn blocks(
        &self,
        request: Request,
        runtime: Arc<dyn ModuleRuntime>,
        mut source: Box<dyn BlockSource>,
        token: CancellationToken,
    ) -> Result<
        (
            mpsc::Receiver<Response>,
            tokio::task::JoinHandle<Result<(), Error>>,
        ),
        Error,
    > {
        let (start_block, graph, hashes) = self.validate(&request)?;
        info!(start_block, stop_block = request.stop_block_num, "starting stream");

        // Stores resume from their latest checkpoint at or below the start.
        let named_stores: Vec<(String, Arc<dyn ObjectStore>)> = graph
            .stores()
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    self.states_store(hashes.get(&m.name).expect("hashed")),
                )
            })
            .collect();
        let storage_state = fetch_storage_state(named_stores).await?;

        let mut stores = StoreMap::new();
        for module in graph.stores() {
            let hash = hashes.get(&module.name).expect("hashed").to_string();
            let mut full = FullKV::new(self.base_store(module, &hash)?);
            if let Some(checkpoint) = storage_state
                .get(&module.name)
                .and_then(|s| s.last_complete_snapshot_before(start_block))
            {
                full.load(checkpoint.exclusive_end_block).await?;
                debug!(store = %module.name, checkpoint = %checkpoint, "store resumed");
            }
            stores.insert(StoreHandle::Full(full));
        }

        let (err_tx, mut err_rx) = mpsc::channel::<Error>(16);
        let named_hashes: Vec<(String, String)> = graph
            .modules()
            .iter()
            .map(|m| (m.name.clone(), hashes.get(&m.name).expect("hashed").to_string()))
            .collect();
        let caching_engine = CachingEngine::new(
            &self.objects,
            &named_hashes,
            self.output_cache_save_interval,
            err_tx,
        );
        caching_engine.init(start_block).await?;

        let (resp_tx, resp_rx) = mpsc::channel::<Response>(64);
        let mut pipeline = Pipeline::new(
            PipelineConfig {
                block_type: self.block_type.clone(),
                start_block,
                stop_block: request.stop_block_num,
                is_sub_request: false,
                save_interval: self.stores_save_interval,
                output_modules: request.output_modules.clone(),
            },
            &graph,
            runtime,
            stores,
            caching_engine,
            resp_tx.clone(),
            Arc::clone(&self.metrics),
        )?;

        let snapshot_modules = request.initial_store_snapshot_for_modules.clone();
        let handle = tokio::spawn(async move {
            send_snapshots(pipeline.stores(), &snapshot_modules, &resp_tx).await?;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Canceled),
                    Some(err) = err_rx.recv() => return Err(err),
                    delivery = source.next_block() => match delivery? {
                        None => return Ok(()),
                        Some(delivery) => {
                            let outcome = pipeline
                                .process_block(&delivery.block, &delivery.cursor, delivery.step)
                                .await?;
                            if outcome == blockflow_core::pipeline::BlockOutcome::StopBlockReached {
                                return Ok(());
                            }
                        }
                    },
                }
            }
        });

        Ok((resp_rx, handle))
    }

    /// Bring every store module of `graph` from its last checkpoint up to
    /// `target_block` by planning, running and squashing partial segments.
    /// Returns the merged full stores.
    pub async fn backfill(
        &self,
        graph: &ModuleGraph,
        target_block: u64,
        runner: Arc<dyn JobRunner>,
        token: CancellationToken,
    ) -> Result<HashMap<String, FullKV>, Error> {
        let mut hashes = ModuleHashes::new();
        hashes.hash_all(graph)?;

        let named_stores: Vec<(String, Arc<dyn ObjectStore>)> = graph
            .stores()
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    self.states_store(hashes.get(&m.name).expect("hashed")),
                )
            })
            .collect();
        let storage_state = fetch_storage_state(named_stores).await?;

        let (planner, ready_rx) = JobsPlanner::new(
            graph,
            &storage_state,
            self.stores_save_interval,
            target_block,
            token.clone(),
        )?;

        let mut squashers = HashMap::new();
        for module in graph.stores() {
            let hash = hashes.get(&module.name).expect("hashed").to_string();
            let mut full = FullKV::new(self.base_store(module, &hash)?);
            let start = planner
                .start_for(&module.name)
                .unwrap_or(module.initial_block);
            if start > module.initial_block {
                full.load(start).await?;
            }
            let target = planner.target_for(&module.name).unwrap_or(target_block);
            squashers.insert(
                module.name.clone(),
                StoreSquasher::launch(
                    full,
                    start,
                    target,
                    self.stores_save_interval,
                    Arc::clone(&planner),
                    token.clone(),
                    Arc::clone(&self.metrics),
                ),
            );
        }

        run_backfill(
            planner,
            ready_rx,
            runner,
            squashers,
            self.backfill_concurrency,
            token,
        )
        .await
    }
}

/// Runs backfill jobs in-process: executes the job module's ancestry over the
/// job range through a sub-request pipeline writing into a partial store,
/// then persists the `.partial` segment.
pub struct LocalJobRunner {
    objects: Arc<dyn ObjectStore>,
    graph: Arc<ModuleGraph>,
    hashes: HashMap<String, String>,
    runtime: Arc<dyn ModuleRuntime>,
    factory: Arc<dyn BlockSourceFactory>,
    block_type: String,
    stores_save_interval: u64,
    output_cache_save_interval: u64,
    metrics: Arc<Metrics>,
}

impl LocalJobRunner {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        graph: Arc<ModuleGraph>,
        runtime: Arc<dyn ModuleRuntime>,
        factory: Arc<dyn BlockSourceFactory>,
        block_type: impl Into<String>,
        stores_save_interval: u64,
        output_cache_save_interval: u64,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        let mut hasher = ModuleHashes::new();
        hasher.hash_all(&graph)?;
        let hashes = graph
            .modules()
            .iter()
            .map(|m| {
                (
                    m.name.clone(),
                    hasher.get(&m.name).expect("hashed").to_string(),
                )
            })
            .collect();
        Ok(LocalJobRunner {
            objects,
            graph,
            hashes,
            runtime,
            factory,
            block_type: block_type.into(),
            stores_save_interval,
            output_cache_save_interval,
            metrics,
        })
    }

    fn states_store(&self, module_name: &str) -> Arc<dyn ObjectStore> {
        let hash = &self.hashes[module_name];
        self.objects.sub_store(&format!("{}/states", hash))
    }
}

#[async_trait]
impl JobRunner for LocalJobRunner {
    async fn run(&self, job: &Job) -> Result<Ranges, Error> {
        let module = self
            .graph
            .get(&job.module_name)
            .ok_or_else(|| Error::invalid_request(format!("unknown module {:?}", job.module_name)))?
            .clone();

        // The job executes the module plus its whole ancestry over the range.
        let mut scoped: Vec<Module> = self
            .graph
            .ancestors_of(&job.module_name)?
            .into_iter()
            .cloned()
            .collect();
        scoped.push(module.clone());
        let sub_graph = ModuleGraph::new(scoped)?;

        // Ancestor stores resume from their checkpoint at the job start; the
        // job's own store is a fresh partial scoped to the range.
        let mut stores = StoreMap::new();
        let mut run_start = job.range.start_block;
        for ancestor in sub_graph.stores() {
            if ancestor.name == job.module_name {
                continue;
            }
            let objects = self.states_store(&ancestor.name);
            let base = BaseStore::new(
                ancestor.name.clone(),
                ancestor.initial_block,
                self.hashes[&ancestor.name].clone(),
                ancestor.update_policy(),
                ancestor.value_type(),
                objects.clone(),
            )
            .map_err(|e| Error::invalid_request(format!("{:#}", e)))?;
            let mut full = FullKV::new(base);
            let snapshots = blockflow_core::orchestrator::list_snapshots(&objects).await?;
            if let Some(checkpoint) = snapshots.last_complete_snapshot_before(job.range.start_block)
            {
                full.load(checkpoint.exclusive_end_block).await?;
            }
            run_start = run_start.min(full.exclusive_end_block());
            stores.insert(StoreHandle::Full(full));
        }

        let base = BaseStore::new(
            module.name.clone(),
            job.range.start_block,
            self.hashes[&module.name].clone(),
            module.update_policy(),
            module.value_type(),
            self.states_store(&module.name),
        )
        .map_err(|e| Error::invalid_request(format!("{:#}", e)))?;
        stores.insert(StoreHandle::Partial(PartialKV::new(
            base,
            job.range.start_block,
        )));

        let (err_tx, mut err_rx) = mpsc::channel::<Error>(16);
        let named_hashes: Vec<(String, String)> = sub_graph
            .modules()
            .iter()
            .map(|m| (m.name.clone(), self.hashes[&m.name].clone()))
            .collect();
        let caching_engine = CachingEngine::new(
            &self.objects,
            &named_hashes,
            self.output_cache_save_interval,
            err_tx,
        );
        caching_engine.init(run_start).await?;

        // Sub-requests emit progress only; nobody reads it here.
        let (resp_tx, mut resp_rx) = mpsc::channel::<Response>(16);
        let drain = tokio::spawn(async move { while resp_rx.recv().await.is_some() {} });

        let mut pipeline = Pipeline::new(
            PipelineConfig {
                block_type: self.block_type.clone(),
                start_block: run_start,
                stop_block: job.range.exclusive_end_block,
                is_sub_request: true,
                save_interval: self.stores_save_interval,
                output_modules: vec![job.module_name.clone()],
            },
            &sub_graph,
            Arc::clone(&self.runtime),
            stores,
            caching_engine,
            resp_tx,
            Arc::clone(&self.metrics),
        )?;

        let mut source = self.factory.source_for(Range::new(
            run_start,
            job.range.exclusive_end_block,
        ));
        let run_result = pipeline.run(source.as_mut()).await;
        drain.abort();
        if let Ok(err) = err_rx.try_recv() {
            return Err(err);
        }
        run_result?;

        let mut stores = pipeline.into_stores();
        let Some(StoreHandle::Partial(mut partial)) = stores.take(&job.module_name) else {
            return Err(Error::protocol(format!(
                "job store {:?} is not a partial",
                job.module_name
            )));
        };
        partial.save(job.range.exclusive_end_block).await?;
        debug!(job = %job, "partial segment written");
        Ok(Ranges(vec![job.range]))
    }
}
