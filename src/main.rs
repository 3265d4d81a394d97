use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use blockflow::args::{Args, Command, ToolsCommand};
use blockflow::commands;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Info { manifest } => commands::info::run(&manifest),
        Command::Protogen {
            manifest,
            output_path,
            exclude_paths,
        } => commands::protogen::run(&manifest, &output_path, &exclude_paths),
        Command::Tools(ToolsCommand::Check { store_path }) => {
            commands::tools::check(&store_path).await
        }
        Command::Tools(ToolsCommand::ReadStore {
            store_path,
            segment,
            keys,
        }) => commands::tools::read_store(&store_path, &segment, &keys).await,
    }
}
