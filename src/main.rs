use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use councilflow::Config;

#[derive(Parser)]
#[command(name = "councilflow", version, about = "Ingest meeting recordings into a provenance-tracked store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process the configured event source once.
    Run {
        /// Path to the TOML config file.
        #[arg(long, env = "COUNCILFLOW_CONFIG")]
        config: PathBuf,

        /// Override the worker pool size.
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Run { config, workers } => {
            let mut config = Config::load(&config)
                .with_context(|| format!("Failed to load config {}", config.display()))?;
            if workers.is_some() {
                config.workers = workers;
            }

            let orchestrator = config.build().await?;
            let summary = orchestrator.run().await?;

            println!(
                "processed: {}  skipped: {}  failed: {}",
                summary.processed,
                summary.skipped,
                summary.failed.len()
            );
            for failed in &summary.failed {
                println!("  {} [{}] {}", failed.video_uri, failed.kind, failed.message);
            }

            Ok(if summary.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
