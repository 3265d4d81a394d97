use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display package modules and docs
    Info {
        /// Path to the package manifest
        manifest: PathBuf,
    },

    /// Generate language bindings from a package's embedded descriptors
    Protogen {
        /// Path to the package manifest
        manifest: PathBuf,

        /// Directory to output generated files; relative paths are resolved
        /// against the manifest's directory
        #[arg(short = 'o', long, default_value = "src/pb")]
        output_path: PathBuf,

        /// Exclude specific files or directories, for example
        /// "proto/a/a.proto" or "proto/a"
        #[arg(short = 'x', long = "exclude-paths")]
        exclude_paths: Vec<String>,
    },

    /// Maintenance tools for on-disk module state
    #[command(subcommand)]
    Tools(ToolsCommand),
}

#[derive(Debug, Subcommand)]
pub enum ToolsCommand {
    /// Check the integrity of the state files under a store path
    Check {
        /// Directory holding one module's state segments
        store_path: PathBuf,
    },

    /// Print the contents of one state segment file
    ReadStore {
        /// Directory holding one module's state segments
        store_path: PathBuf,

        /// Segment file name, e.g. 0000010000-0000000100.kv
        segment: String,

        /// Only print these keys (all keys when omitted)
        #[arg(long = "key")]
        keys: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let args = Args::parse_from(["blockflow", "info", "pkg.json"]);
        assert!(matches!(args.command, Command::Info { .. }));

        let args = Args::parse_from([
            "blockflow", "protogen", "pkg.json", "-o", "out", "-x", "proto/a",
        ]);
        match args.command {
            Command::Protogen {
                output_path,
                exclude_paths,
                ..
            } => {
                assert_eq!(output_path, PathBuf::from("out"));
                assert_eq!(exclude_paths, vec!["proto/a".to_string()]);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = Args::parse_from(["blockflow", "tools", "check", "./states"]);
        assert!(matches!(
            args.command,
            Command::Tools(ToolsCommand::Check { .. })
        ));
    }
}
