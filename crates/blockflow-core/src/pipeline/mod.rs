//! The per-block pipeline: advance every module through a block, honoring
//! fork steps and finality, with per-module output caching and store
//! checkpointing.

pub mod executor;
pub mod fork_handler;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use blockflow_types::{
    Block, Clock, Cursor, ModuleOutput, ModuleProgress, ProgressKind, Response, Step, StoreDelta,
};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::block::boundary_below;
use crate::error::Error;
use crate::execout::{CachingEngine, ExecOutputView};
use crate::graph::ModuleGraph;
use crate::metrics::Metrics;
use crate::source::BlockSource;
use crate::store::{StoreHandle, StoreMap};
use crate::wasm::ModuleRuntime;

pub use executor::ModuleExecutor;
pub use fork_handler::{ForkHandler, ReversibleSegment};
pub use snapshot::send_snapshots;

/// What a processed block means for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Continue,
    /// The request's stop block was reached; the stream ends normally.
    StopBlockReached,
}

/// A hook invoked around block processing with the block's clock.
pub type BlockHook = Box<dyn FnMut(&Clock) -> anyhow::Result<()> + Send + Sync>;

/// Static configuration of one pipeline run.
pub struct PipelineConfig {
    /// Type name under which the raw block payload is exposed to modules.
    pub block_type: String,
    pub start_block: u64,
    /// Exclusive stop block; 0 means unbounded.
    pub stop_block: u64,
    /// Sub-requests emit progress only; the partial segment travels through
    /// the object store.
    pub is_sub_request: bool,
    pub save_interval: u64,
    pub output_modules: Vec<String>,
}

/// Drives all modules of a request through blocks, in topological order.
pub struct Pipeline {
    config: PipelineConfig,
    runtime: Arc<dyn ModuleRuntime>,
    executors: Vec<ModuleExecutor>,
    stores: StoreMap,
    caching_engine: CachingEngine,
    fork_handler: ForkHandler,
    resp_tx: mpsc::Sender<Response>,
    metrics: Arc<Metrics>,
    /// Next save-interval boundary per full store.
    next_boundaries: HashMap<String, u64>,
    pre_block_hooks: Vec<BlockHook>,
    post_job_hooks: Vec<BlockHook>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        graph: &ModuleGraph,
        runtime: Arc<dyn ModuleRuntime>,
        stores: StoreMap,
        caching_engine: CachingEngine,
        resp_tx: mpsc::Sender<Response>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        let mut executors = Vec::new();
        for module in graph.topological_order() {
            if module.is_map() {
                let cache = caching_engine.cache(&module.name).ok_or_else(|| {
                    Error::invalid_request(format!("no output cache for module {:?}", module.name))
                })?;
                executors.push(ModuleExecutor::new_map(module.clone(), cache));
            } else {
                if stores.get(&module.name).is_none() {
                    return Err(Error::invalid_request(format!(
                        "no store for module {:?}",
                        module.name
                    )));
                }
                executors.push(ModuleExecutor::new_store(module.clone()));
            }
        }

        let mut next_boundaries = HashMap::new();
        for (name, handle) in stores.iter() {
            if let StoreHandle::Full(full) = handle {
                next_boundaries.insert(
                    name.clone(),
                    boundary_below(full.exclusive_end_block(), config.save_interval)
                        + config.save_interval,
                );
            }
        }

        Ok(Pipeline {
            config,
            runtime,
            executors,
            stores,
            caching_engine,
            fork_handler: ForkHandler::new(),
            resp_tx,
            metrics,
            next_boundaries,
            pre_block_hooks: Vec::new(),
            post_job_hooks: Vec::new(),
        })
    }

    pub fn add_pre_block_hook(&mut self, hook: BlockHook) {
        self.pre_block_hooks.push(hook);
    }

    pub fn add_post_job_hook(&mut self, hook: BlockHook) {
        self.post_job_hooks.push(hook);
    }

    pub fn stores(&self) -> &StoreMap {
        &self.stores
    }

    pub fn into_stores(self) -> StoreMap {
        self.stores
    }

    /// Drain a block source until exhaustion or the stop block.
    pub async fn run(&mut self, source: &mut dyn BlockSource) -> Result<(), Error> {
        while let Some(delivery) = source.next_block().await? {
            let outcome = self
                .process_block(&delivery.block, &delivery.cursor, delivery.step)
                .await?;
            if outcome == BlockOutcome::StopBlockReached {
                break;
            }
        }
        Ok(())
    }

    /// Advance every module through one sourced block.
    pub async fn process_block(
        &mut self,
        block: &Block,
        cursor: &Cursor,
        step: Step,
    ) -> Result<BlockOutcome, Error> {
        self.metrics.record_block_begin();
        let clock = block.clock();

        let result = self.process_block_steps(block, &clock, cursor, step).await;
        if let Err(err) = &result {
            error!(block_num = clock.number, error = %err, "block processing failed");
        }
        // Post-job hooks run even on failure so progress accounting stays
        // accurate.
        self.run_hooks(&clock, /* pre: */ false)?;
        result
    }

    async fn process_block_steps(
        &mut self,
        block: &Block,
        clock: &Clock,
        cursor: &Cursor,
        step: Step,
    ) -> Result<BlockOutcome, Error> {
        let mut outcome = BlockOutcome::Continue;

        if step.matches(Step::UNDO) {
            self.fork_handler
                .handle_undo(clock, cursor, &mut self.stores, &self.resp_tx)
                .await?;
            self.caching_engine.delete_block(&clock.id);
        } else if step.matches(Step::STALLED) {
            self.fork_handler.remove_reversible_output(clock.number);
        } else if step.matches(Step::NEW) {
            outcome = self.handle_step_new(block, clock, cursor, step).await?;
        }

        if step.matches(Step::IRREVERSIBLE) {
            self.fork_handler.remove_reversible_output(clock.number);
        }

        self.caching_engine.new_block(&block.as_block_ref(), step)?;
        Ok(outcome)
    }

    async fn handle_step_new(
        &mut self,
        block: &Block,
        clock: &Clock,
        cursor: &Cursor,
        step: Step,
    ) -> Result<BlockOutcome, Error> {
        let mut view =
            ExecOutputView::new(block, &self.config.block_type, cursor.clone(), step);

        self.run_hooks(clock, /* pre: */ true)?;
        self.flush_stores(clock.number).await?;

        if self.config.stop_block > 0 && clock.number >= self.config.stop_block {
            debug!(block_num = clock.number, "stop block reached");
            return Ok(BlockOutcome::StopBlockReached);
        }

        let outputs = self.execute_modules(&mut view)?;

        let emitted: Vec<ModuleOutput> = outputs
            .into_iter()
            .filter(|o| self.config.output_modules.contains(&o.name))
            .collect();

        if !step.matches(Step::IRREVERSIBLE) {
            let mut store_deltas: HashMap<String, Vec<StoreDelta>> = HashMap::new();
            for (name, handle) in self.stores.iter() {
                let deltas = handle.base().deltas();
                if !deltas.is_empty() {
                    store_deltas.insert(name.clone(), deltas.to_vec());
                }
            }
            self.fork_handler
                .record_reversible(clock.number, emitted.clone(), store_deltas);
        }

        if self.config.is_sub_request {
            self.send_progress(clock).await?;
        } else if clock.number >= self.config.start_block {
            self.resp_tx
                .send(Response::BlockScopedData {
                    clock: clock.clone(),
                    cursor: cursor.clone(),
                    step,
                    outputs: emitted,
                })
                .await
                .map_err(|_| Error::Canceled)?;
        }

        self.stores.reset_deltas();
        debug!(block_num = clock.number, "block processed");
        Ok(BlockOutcome::Continue)
    }

    fn execute_modules(&mut self, view: &mut ExecOutputView) -> Result<Vec<ModuleOutput>, Error> {
        let block_num = view.clock.number;
        let runtime = Arc::clone(&self.runtime);

        // A panic inside module code aborts the block, not the process.
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut outputs = Vec::with_capacity(self.executors.len());
            for executor in &self.executors {
                if block_num < executor.initial_block() {
                    continue;
                }
                match executor.run(runtime.as_ref(), view, &mut self.stores) {
                    Ok(output) => outputs.push(output),
                    Err(err) => return Err((executor.module_name().to_string(), err)),
                }
            }
            Ok(outputs)
        }));

        match caught {
            Ok(Ok(outputs)) => {
                self.metrics.record_block_end();
                Ok(outputs)
            }
            Ok(Err((module, err))) => Err(Error::module_execution(block_num, module, err)),
            Err(panic) => Err(Error::module_execution(
                block_num,
                "unknown",
                anyhow!("panic at block {}: {}", block_num, panic_message(&panic)),
            )),
        }
    }

    /// Persist full-store checkpoints for every boundary `block_num` crosses.
    /// Sub-requests persist nothing here; their partial segment is written by
    /// the worker at the end of the job.
    async fn flush_stores(&mut self, block_num: u64) -> Result<(), Error> {
        if self.config.is_sub_request {
            return Ok(());
        }
        for (name, handle) in self.stores.iter_mut() {
            let StoreHandle::Full(full) = handle else {
                continue;
            };
            let Some(boundary) = self.next_boundaries.get_mut(name) else {
                continue;
            };
            while block_num >= *boundary {
                full.save(*boundary).await?;
                *boundary += self.config.save_interval;
            }
        }
        Ok(())
    }

    async fn send_progress(&self, clock: &Clock) -> Result<(), Error> {
        let progress: Vec<ModuleProgress> = self
            .config
            .output_modules
            .iter()
            .map(|name| ModuleProgress {
                name: name.clone(),
                kind: ProgressKind::ProcessedRanges(vec![(
                    self.config.start_block,
                    clock.number + 1,
                )]),
            })
            .collect();
        self.resp_tx
            .send(Response::Progress(progress))
            .await
            .map_err(|_| Error::Canceled)
    }

    fn run_hooks(&mut self, clock: &Clock, pre: bool) -> Result<(), Error> {
        let hooks = if pre {
            &mut self.pre_block_hooks
        } else {
            &mut self.post_job_hooks
        };
        for hook in hooks {
            hook(clock).map_err(|e| Error::module_execution(clock.number, "hook", e))?;
        }
        Ok(())
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
