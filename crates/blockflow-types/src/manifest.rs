//! Package and module declarations, plus the manifest reader.
//!
//! A package is a JSON document declaring the module DAG: each module is a
//! pure function compiled to WASM, consuming the block (or upstream module
//! outputs) and producing either a typed output (`map`) or keyed state
//! mutations (`store`).

use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// How overlapping values combine when two store segments are merged, and
/// which mutators the module may call at runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    #[default]
    Unset,
    /// Last write wins.
    Set,
    /// First write wins.
    SetIfNotExists,
    /// Numeric addition, decoding values per the store's value type.
    Add,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Byte concatenation, left followed by right.
    Append,
}

impl std::fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdatePolicy::Unset => "unset",
            UpdatePolicy::Set => "set",
            UpdatePolicy::SetIfNotExists => "set_if_not_exists",
            UpdatePolicy::Add => "add",
            UpdatePolicy::Min => "min",
            UpdatePolicy::Max => "max",
            UpdatePolicy::Append => "append",
        };
        f.write_str(s)
    }
}

/// Access mode for a store input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// Read-only key lookups against the upstream store.
    Get,
    /// The upstream store's per-block delta stream.
    Deltas,
}

/// One typed input of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Input {
    /// The raw chain block, identified by its type name.
    Source { kind: String },
    /// Another map module's output.
    Map { module_name: String },
    /// Another store, read-only or as a delta stream.
    Store { module_name: String, mode: StoreMode },
}

impl Input {
    /// The upstream module this input depends on, if any.
    pub fn module_dependency(&self) -> Option<&str> {
        match self {
            Input::Source { .. } => None,
            Input::Map { module_name } | Input::Store { module_name, .. } => Some(module_name),
        }
    }
}

/// What a module produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleKind {
    Map {
        output_type: String,
    },
    Store {
        value_type: String,
        update_policy: UpdatePolicy,
    },
}

/// A declared module: a named WASM entrypoint with typed inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub initial_block: u64,
    #[serde(flatten)]
    pub kind: ModuleKind,
    pub inputs: Vec<Input>,
    pub binary_entrypoint: String,
}

impl Module {
    pub fn is_store(&self) -> bool {
        matches!(self.kind, ModuleKind::Store { .. })
    }

    pub fn is_map(&self) -> bool {
        matches!(self.kind, ModuleKind::Map { .. })
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        match &self.kind {
            ModuleKind::Store { update_policy, .. } => *update_policy,
            ModuleKind::Map { .. } => UpdatePolicy::Unset,
        }
    }

    pub fn value_type(&self) -> &str {
        match &self.kind {
            ModuleKind::Store { value_type, .. } => value_type,
            ModuleKind::Map { .. } => "",
        }
    }
}

/// Package-level metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub doc: String,
}

/// Per-module documentation, parallel to `Package::modules`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleMeta {
    #[serde(default)]
    pub doc: String,
}

/// A full package: metadata, module declarations, module bytecode and the
/// embedded protobuf descriptor set used for binding generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    pub meta: Vec<PackageMeta>,
    pub modules: Vec<Module>,
    #[serde(default)]
    pub module_meta: Vec<ModuleMeta>,
    /// Serialized `FileDescriptorSet` covering the package's message types.
    #[serde(default, with = "crate::b64")]
    pub proto_descriptor: Vec<u8>,
    /// WASM bytecode, one blob shared by all modules of the package.
    #[serde(default, with = "crate::b64")]
    pub binary: Vec<u8>,
}

impl Package {
    /// Basic structural validation: non-empty meta, unique module names,
    /// every referenced input resolvable.
    pub fn validate(&self) -> Result<()> {
        if self.meta.is_empty() {
            return Err(anyhow!("package has no metadata entry"));
        }
        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module.name.as_str()) {
                return Err(anyhow!("duplicate module name {:?}", module.name));
            }
        }
        for module in &self.modules {
            for input in &module.inputs {
                if let Some(dep) = input.module_dependency() {
                    if !seen.contains(dep) {
                        return Err(anyhow!(
                            "module {:?} depends on unknown module {:?}",
                            module.name,
                            dep
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Read and validate a package manifest from a JSON file.
pub fn read_package(path: impl AsRef<Path>) -> Result<Package> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    let package: Package = serde_json::from_str(&raw)
        .with_context(|| format!("parse manifest {}", path.display()))?;
    package.validate()?;
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_module(name: &str, inputs: Vec<Input>) -> Module {
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

    #[test]
    fn validate_rejects_duplicate_names() {
        let package = Package {
            meta: vec![PackageMeta::default()],
            modules: vec![test_module("a", vec![]), test_module("a", vec![])],
            ..Default::default()
        };
        assert!(package.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let package = Package {
            meta: vec![PackageMeta::default()],
            modules: vec![test_module(
                "a",
                vec![Input::Map {
                    module_name: "missing".to_string(),
                }],
            )],
            ..Default::default()
        };
        assert!(package.validate().is_err());
    }

    #[test]
    fn manifest_roundtrip() {
        let package = Package {
            meta: vec![PackageMeta {
                name: "pkg".to_string(),
                version: "v0.1.0".to_string(),
                ..Default::default()
            }],
            modules: vec![
                test_module("block_index", vec![]),
                Module {
                    name: "totals".to_string(),
                    initial_block: 100,
                    kind: ModuleKind::Store {
                        value_type: "int64".to_string(),
                        update_policy: UpdatePolicy::Add,
                    },
                    inputs: vec![Input::Map {
                        module_name: "block_index".to_string(),
                    }],
                    binary_entrypoint: "totals".to_string(),
                },
            ],
            ..Default::default()
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&package).unwrap()).unwrap();

        let loaded = read_package(&path).unwrap();
        assert_eq!(loaded.modules, package.modules);
        assert_eq!(loaded.modules[1].update_policy(), UpdatePolicy::Add);
        assert_eq!(loaded.modules[1].value_type(), "int64");
    }
}
