//! Per-module executors: materialize declared inputs, run the WASM
//! entrypoint, route outputs to caches, stores and the exec-output view.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use blockflow_types::{Input, Module, ModuleOutput, OutputData, StoreDeltas, StoreMode};
use tracing::trace;

use crate::execout::{ExecOutputView, OutputCache};
use crate::store::StoreMap;
use crate::wasm::{Argument, ModuleRuntime};

/// Executes one module for one block. Map modules consult their output cache
/// before running; store modules mutate their own store through the host.
pub struct ModuleExecutor {
    module: Module,
    /// Output cache, for map modules.
    cache: Option<Arc<OutputCache>>,
}

impl ModuleExecutor {
    pub fn new_map(module: Module, cache: Arc<OutputCache>) -> Self {
        debug_assert!(module.is_map());
        ModuleExecutor {
            module,
            cache: Some(cache),
        }
    }

    pub fn new_store(module: Module) -> Self {
        debug_assert!(module.is_store());
        ModuleExecutor { module, cache: None }
    }

    pub fn module_name(&self) -> &str {
        &self.module.name
    }

    /// Modules do not execute for blocks below their initial block.
    pub fn initial_block(&self) -> u64 {
        self.module.initial_block
    }

    /// Run the module for the block described by `view`.
    pub fn run(
        &self,
        runtime: &dyn ModuleRuntime,
        view: &mut ExecOutputView,
        stores: &mut StoreMap,
    ) -> Result<ModuleOutput> {
        if self.module.is_map() {
            self.run_map(runtime, view, stores)
        } else {
            self.run_store(runtime, view, stores)
        }
    }

    fn run_map(
        &self,
        runtime: &dyn ModuleRuntime,
        view: &mut ExecOutputView,
        stores: &mut StoreMap,
    ) -> Result<ModuleOutput> {
        let cache = self.cache.as_ref().expect("map executor carries a cache");

        if let Some(cached) = cache.get(&view.clock) {
            trace!(module = %self.module.name, block = view.clock.number, "map output cache hit");
            view.set(&self.module.name, cached.clone());
            return Ok(ModuleOutput {
                name: self.module.name.clone(),
                data: OutputData::MapOutput(cached),
                logs: Vec::new(),
                logs_truncated: false,
            });
        }

        let arguments = materialize_inputs(&self.module, view, stores)?;
        let mut instance =
            runtime.new_instance(&view.clock, &self.module.binary_entrypoint, arguments)?;
        instance.execute()?;

        let output = instance.output().unwrap_or_default();
        let logs = instance.logs();
        let logs_truncated = instance.logs_truncated();
        drop(instance);

        cache.set(&view.clock, &view.cursor, &output);
        view.set(&self.module.name, output.clone());

        Ok(ModuleOutput {
            name: self.module.name.clone(),
            data: OutputData::MapOutput(output),
            logs,
            logs_truncated,
        })
    }

    fn run_store(
        &self,
        runtime: &dyn ModuleRuntime,
        view: &mut ExecOutputView,
        stores: &mut StoreMap,
    ) -> Result<ModuleOutput> {
        // The writer store leaves the map while it is mutably borrowed by the
        // instance; the graph is acyclic so it cannot also be an input.
        let mut own = stores
            .take(&self.module.name)
            .ok_or_else(|| anyhow!("store {:?} not found", self.module.name))?;

        let result = (|| -> Result<(Vec<String>, bool)> {
            let mut arguments = materialize_inputs(&self.module, view, stores)?;
            arguments.push(Argument::StoreWriter {
                name: self.module.name.clone(),
                store: own.base_mut(),
            });
            let mut instance =
                runtime.new_instance(&view.clock, &self.module.binary_entrypoint, arguments)?;
            instance.execute()?;
            Ok((instance.logs(), instance.logs_truncated()))
        })();

        let output = result.map(|(logs, logs_truncated)| ModuleOutput {
            name: self.module.name.clone(),
            data: OutputData::StoreDeltas(own.base().deltas().to_vec()),
            logs,
            logs_truncated,
        });
        stores.insert(own);
        output
    }
}

/// Build the argument list for a module's declared inputs, reading upstream
/// outputs from the view and upstream stores from the store map.
fn materialize_inputs<'a>(
    module: &Module,
    view: &'a ExecOutputView,
    stores: &'a StoreMap,
) -> Result<Vec<Argument<'a>>> {
    let mut arguments = Vec::with_capacity(module.inputs.len());
    for input in &module.inputs {
        let argument = match input {
            Input::Source { kind } => Argument::Block {
                name: kind.clone(),
                value: view.get(kind).ok_or_else(|| {
                    anyhow!("module {:?}: block payload {:?} missing", module.name, kind)
                })?,
            },
            Input::Map { module_name } => Argument::MapOutput {
                name: module_name.clone(),
                value: view
                    .get(module_name)
                    .ok_or_else(|| {
                        anyhow!(
                            "module {:?}: upstream output {:?} not produced",
                            module.name,
                            module_name
                        )
                    })?
                    .to_vec(),
            },
            Input::Store { module_name, mode } => {
                let handle = stores.get(module_name).ok_or_else(|| {
                    anyhow!(
                        "module {:?}: upstream store {:?} not found",
                        module.name,
                        module_name
                    )
                })?;
                match mode {
                    StoreMode::Get => Argument::StoreReader {
                        name: module_name.clone(),
                        store: handle.base(),
                    },
                    StoreMode::Deltas => {
                        let deltas = StoreDeltas {
                            deltas: handle.base().deltas().to_vec(),
                        };
                        Argument::StoreDeltas {
                            name: module_name.clone(),
                            value: serde_json::to_vec(&deltas)?,
                        }
                    }
                }
            }
        };
        arguments.push(argument);
    }
    Ok(arguments)
}
