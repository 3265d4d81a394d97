//! The module DAG: validation, topological order, ancestry queries and
//! content-addressed module hashes.
//!
//! Nodes live in an append-only vector and edges are integer indices, so the
//! shared-producer shape of the graph never creates ownership cycles.

use std::collections::{HashMap, HashSet};

use blockflow_types::{Input, Module, StoreMode};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// A validated module graph.
pub struct ModuleGraph {
    modules: Vec<Module>,
    by_name: HashMap<String, usize>,
    /// For each module, the indices of the modules its inputs reference.
    inputs: Vec<Vec<usize>>,
    topo: Vec<usize>,
}

impl ModuleGraph {
    pub fn new(modules: Vec<Module>) -> Result<Self, Error> {
        let mut by_name = HashMap::new();
        for (index, module) in modules.iter().enumerate() {
            if by_name.insert(module.name.clone(), index).is_some() {
                return Err(Error::invalid_request(format!(
                    "duplicate module name {:?}",
                    module.name
                )));
            }
        }

        let mut inputs = Vec::with_capacity(modules.len());
        for module in &modules {
            let mut deps = Vec::new();
            for input in &module.inputs {
                if let Some(dep) = input.module_dependency() {
                    let dep_index = *by_name.get(dep).ok_or_else(|| {
                        Error::invalid_request(format!(
                            "module {:?} depends on unknown module {:?}",
                            module.name, dep
                        ))
                    })?;
                    if let Input::Store { mode, .. } = input {
                        if !modules[dep_index].is_store() {
                            return Err(Error::invalid_request(format!(
                                "module {:?} reads module {:?} as a store (mode {:?}) but it is a map",
                                module.name, dep, mode
                            )));
                        }
                    }
                    deps.push(dep_index);
                }
            }
            // A module may reference the same producer through several
            // inputs; edges are deduplicated.
            deps.sort_unstable();
            deps.dedup();
            inputs.push(deps);
        }

        let topo = topological_sort(&modules, &inputs)?;

        Ok(ModuleGraph {
            modules,
            by_name,
            inputs,
            topo,
        })
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.by_name.get(name).map(|&i| &self.modules[i])
    }

    /// Modules in execution order: every producer before its consumers.
    pub fn topological_order(&self) -> Vec<&Module> {
        self.topo.iter().map(|&i| &self.modules[i]).collect()
    }

    pub fn stores(&self) -> Vec<&Module> {
        self.topological_order()
            .into_iter()
            .filter(|m| m.is_store())
            .collect()
    }

    pub fn maps(&self) -> Vec<&Module> {
        self.topological_order()
            .into_iter()
            .filter(|m| m.is_map())
            .collect()
    }

    /// Transitive producers of `name`, in topological order.
    pub fn ancestors_of(&self, name: &str) -> Result<Vec<&Module>, Error> {
        let start = *self
            .by_name
            .get(name)
            .ok_or_else(|| Error::invalid_request(format!("unknown module {:?}", name)))?;
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for &dep in &self.inputs[index] {
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        Ok(self
            .topo
            .iter()
            .filter(|&&i| seen.contains(&i))
            .map(|&i| &self.modules[i])
            .collect())
    }

    /// Transitive store producers of `name`, in topological order.
    pub fn ancestor_stores_of(&self, name: &str) -> Result<Vec<&Module>, Error> {
        Ok(self
            .ancestors_of(name)?
            .into_iter()
            .filter(|m| m.is_store())
            .collect())
    }

    /// Transitive consumers of `name`, in topological order.
    pub fn descendants_of(&self, name: &str) -> Result<Vec<&Module>, Error> {
        let start = *self
            .by_name
            .get(name)
            .ok_or_else(|| Error::invalid_request(format!("unknown module {:?}", name)))?;
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for (consumer, deps) in self.inputs.iter().enumerate() {
                if deps.contains(&index) && seen.insert(consumer) {
                    stack.push(consumer);
                }
            }
        }
        Ok(self
            .topo
            .iter()
            .filter(|&&i| seen.contains(&i))
            .map(|&i| &self.modules[i])
            .collect())
    }
}

fn topological_sort(modules: &[Module], inputs: &[Vec<usize>]) -> Result<Vec<usize>, Error> {
    let mut in_degree = vec![0usize; modules.len()];
    for (consumer, deps) in inputs.iter().enumerate() {
        in_degree[consumer] = deps.len();
    }

    // Ready nodes kept in descending index order so popping yields the
    // smallest index first, keeping the sort deterministic.
    let mut ready: Vec<usize> = (0..modules.len()).filter(|&i| in_degree[i] == 0).collect();
    ready.sort_unstable_by(|a, b| b.cmp(a));
    let mut out = Vec::with_capacity(modules.len());
    while let Some(index) = ready.pop() {
        out.push(index);
        for (consumer, deps) in inputs.iter().enumerate() {
            if deps.contains(&index) {
                in_degree[consumer] -= 1;
                if in_degree[consumer] == 0 {
                    ready.push(consumer);
                }
            }
        }
        ready.sort_unstable_by(|a, b| b.cmp(a));
    }

    if out.len() != modules.len() {
        let stuck: Vec<&str> = (0..modules.len())
            .filter(|i| !out.contains(i))
            .map(|i| modules[i].name.as_str())
            .collect();
        return Err(Error::invalid_request(format!(
            "module graph contains a cycle through {:?}",
            stuck
        )));
    }
    Ok(out)
}

/// Memoized content-addressed module hashes.
///
/// A module's hash digests its own declaration plus the sorted
/// `(input_kind, producer_hash)` pairs of its inputs, so equal hashes mean
/// interchangeable artifacts and every incompatible recomputation lands in a
/// distinct cache namespace.
#[derive(Default)]
pub struct ModuleHashes {
    hashes: HashMap<String, String>,
}

impl ModuleHashes {
    pub fn new() -> Self {
        ModuleHashes::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.hashes.get(name).map(|s| s.as_str())
    }

    /// Compute (and memoize) the hash of `module`.
    pub fn hash_module(&mut self, graph: &ModuleGraph, module: &Module) -> Result<String, Error> {
        if let Some(hash) = self.hashes.get(&module.name) {
            return Ok(hash.clone());
        }

        let mut input_entries: Vec<String> = Vec::new();
        for input in &module.inputs {
            let entry = match input {
                Input::Source { kind } => format!("source:{}", kind),
                Input::Map { module_name } => {
                    let producer = graph.get(module_name).ok_or_else(|| {
                        Error::invalid_request(format!("unknown module {:?}", module_name))
                    })?;
                    format!("map:{}", self.hash_module(graph, producer)?)
                }
                Input::Store { module_name, mode } => {
                    let producer = graph.get(module_name).ok_or_else(|| {
                        Error::invalid_request(format!("unknown module {:?}", module_name))
                    })?;
                    let mode = match mode {
                        StoreMode::Get => "get",
                        StoreMode::Deltas => "deltas",
                    };
                    format!("store:{}:{}", mode, self.hash_module(graph, producer)?)
                }
            };
            input_entries.push(entry);
        }
        input_entries.sort();

        let mut hasher = Sha256::new();
        hasher.update(module.name.as_bytes());
        hasher.update([0]);
        hasher.update(module.initial_block.to_be_bytes());
        match &module.kind {
            blockflow_types::ModuleKind::Map { output_type } => {
                hasher.update(b"map");
                hasher.update([0]);
                hasher.update(output_type.as_bytes());
            }
            blockflow_types::ModuleKind::Store {
                value_type,
                update_policy,
            } => {
                hasher.update(b"store");
                hasher.update([0]);
                hasher.update(value_type.as_bytes());
                hasher.update([0]);
                hasher.update(update_policy.to_string().as_bytes());
            }
        }
        hasher.update([0]);
        hasher.update(module.binary_entrypoint.as_bytes());
        for entry in &input_entries {
            hasher.update([0]);
            hasher.update(entry.as_bytes());
        }

        let hash = hex::encode(hasher.finalize());
        self.hashes.insert(module.name.clone(), hash.clone());
        Ok(hash)
    }

    /// Hash every module of the graph.
    pub fn hash_all(&mut self, graph: &ModuleGraph) -> Result<(), Error> {
        for module in graph.topological_order() {
            self.hash_module(graph, module)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_types::{ModuleKind, UpdatePolicy};

    fn map_module(name: &str, inputs: Vec<Input>) -> Module {
        Module {
            name: name.to_string(),
            initial_block: 0,
            kind: ModuleKind::Map {
                output_type: "proto:test.Output".to_string(),
            },
            inputs,
            binary_entrypoint: name.to_string(),
        }
    }

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

    fn diamond() -> Vec<Module> {
        vec![
            map_module("extract", vec![Input::Source { kind: "test.Block".into() }]),
            store_module(
                "totals",
                vec![Input::Map { module_name: "extract".into() }],
            ),
            map_module(
                "enrich",
                vec![
                    Input::Map { module_name: "extract".into() },
                    Input::Store { module_name: "totals".into(), mode: StoreMode::Get },
                ],
            ),
        ]
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let graph = ModuleGraph::new(diamond()).unwrap();
        let order: Vec<&str> = graph
            .topological_order()
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        let pos = |n: &str| order.iter().position(|&x| x == n).unwrap();
        assert!(pos("extract") < pos("totals"));
        assert!(pos("totals") < pos("enrich"));
        assert!(pos("extract") < pos("enrich"));
    }

    #[test]
    fn rejects_cycles() {
        let modules = vec![
            map_module("a", vec![Input::Map { module_name: "b".into() }]),
            map_module("b", vec![Input::Map { module_name: "a".into() }]),
        ];
        assert!(ModuleGraph::new(modules).is_err());
    }

    #[test]
    fn rejects_store_input_on_map() {
        let modules = vec![
            map_module("a", vec![]),
            map_module(
                "b",
                vec![Input::Store { module_name: "a".into(), mode: StoreMode::Get }],
            ),
        ];
        assert!(ModuleGraph::new(modules).is_err());
    }

    #[test]
    fn ancestry() {
        let graph = ModuleGraph::new(diamond()).unwrap();
        let ancestors: Vec<&str> = graph
            .ancestors_of("enrich")
            .unwrap()
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(ancestors, vec!["extract", "totals"]);

        let stores: Vec<&str> = graph
            .ancestor_stores_of("enrich")
            .unwrap()
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(stores, vec!["totals"]);

        let descendants: Vec<&str> = graph
            .descendants_of("extract")
            .unwrap()
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(descendants, vec!["totals", "enrich"]);
    }

    #[test]
    fn hashes_depend_on_transitive_inputs() {
        let graph = ModuleGraph::new(diamond()).unwrap();
        let mut hashes = ModuleHashes::new();
        hashes.hash_all(&graph).unwrap();
        let enrich_before = hashes.get("enrich").unwrap().to_string();

        // Changing an upstream module's declaration changes every downstream
        // hash.
        let mut modules = diamond();
        modules[0].initial_block = 42;
        let changed = ModuleGraph::new(modules).unwrap();
        let mut changed_hashes = ModuleHashes::new();
        changed_hashes.hash_all(&changed).unwrap();

        assert_ne!(changed_hashes.get("enrich").unwrap(), enrich_before);
        assert_eq!(hashes.get("enrich").unwrap().len(), 64);
    }
}
