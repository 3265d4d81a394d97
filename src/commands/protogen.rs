//! `blockflow protogen`: generate language bindings from the package's
//! embedded protobuf descriptors by delegating to `buf generate`.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use blockflow_core::graph::ModuleGraph;
use blockflow_types::read_package;

pub fn run(manifest: &Path, output_path: &Path, exclude_paths: &[String]) -> Result<()> {
    let package = read_package(manifest)
        .with_context(|| format!("reading manifest {}", manifest.display()))?;
    ModuleGraph::new(package.modules.clone()).context("processing module graph")?;

    if package.proto_descriptor.is_empty() {
        return Err(anyhow!("package carries no protobuf descriptors"));
    }

    // Relative output paths land next to the manifest.
    let output_path = if output_path.is_absolute() {
        output_path.to_path_buf()
    } else {
        manifest
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(output_path)
    };

    let descriptor_file = std::env::temp_dir().join("tmp.fds");
    std::fs::write(&descriptor_file, &package.proto_descriptor)
        .with_context(|| format!("writing {}", descriptor_file.display()))?;

    let buf_gen = PathBuf::from("buf.gen.yaml");
    let wrote_buf_gen = !buf_gen.exists();
    if wrote_buf_gen {
        let content = format!(
            "version: v1\nplugins:\n  - remote: buf.build/community/neoeinstein-prost:v0.3.1\n    out: {}\n",
            output_path.display()
        );
        println!("Writing to temporary 'buf.gen.yaml':\n---\n{}---", content);
        std::fs::write(&buf_gen, content).context("writing buf.gen.yaml")?;
    }

    let input = format!("{}#format=binpb", descriptor_file.display());
    let mut cmd_args = vec!["generate".to_string(), input];
    for exclude in exclude_paths {
        cmd_args.push("--exclude-path".to_string());
        cmd_args.push(exclude.clone());
    }
    println!("Running: buf {}", cmd_args.join(" "));

    let status = Command::new("buf")
        .args(&cmd_args)
        .status()
        .context("executing 'buf'")?;

    if wrote_buf_gen {
        println!("Removing temporary 'buf.gen.yaml'");
        std::fs::remove_file(&buf_gen).context("deleting buf.gen.yaml")?;
    }

    if !status.success() {
        return Err(anyhow!("'buf generate' exited with {}", status));
    }
    println!("Done");
    Ok(())
}
