//! `blockflow info`: dump package metadata, modules and hashes.

use std::path::Path;

use anyhow::{Context, Result};
use blockflow_core::graph::{ModuleGraph, ModuleHashes};
use blockflow_types::{read_package, ModuleKind};

pub fn run(manifest: &Path) -> Result<()> {
    let package = read_package(manifest)
        .with_context(|| format!("read manifest {}", manifest.display()))?;
    let graph =
        ModuleGraph::new(package.modules.clone()).context("creating module graph")?;
    let mut hashes = ModuleHashes::new();
    hashes.hash_all(&graph).context("hashing modules")?;

    let meta = &package.meta[0];
    println!("Package name: {}", meta.name);
    println!("Version: {}", meta.version);
    if !meta.doc.is_empty() {
        println!("Doc: {}", meta.doc.replace('\n', "\n  "));
    }

    println!("Modules:");
    println!("----");
    for (index, module) in package.modules.iter().enumerate() {
        println!("Name: {}", module.name);
        println!("Initial block: {}", module.initial_block);
        match &module.kind {
            ModuleKind::Map { output_type } => {
                println!("Kind: map");
                println!("Output Type: {}", output_type);
            }
            ModuleKind::Store {
                value_type,
                update_policy,
            } => {
                println!("Kind: store");
                println!("Value Type: {}", value_type);
                println!("Update Policy: {}", update_policy);
            }
        }
        println!("Hash: {}", hashes.get(&module.name).unwrap_or_default());
        if let Some(module_meta) = package.module_meta.get(index) {
            if !module_meta.doc.is_empty() {
                println!("Doc: {}", module_meta.doc.replace('\n', "\n  "));
            }
        }
        println!();
    }

    Ok(())
}
