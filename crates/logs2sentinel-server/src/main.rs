use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logs2sentinel_config::RuntimeConfig;
use logs2sentinel_server::CycleFailure;

const EXIT_STARTUP_ERROR: u8 = 1;
const EXIT_CYCLE_FAILURE: u8 = 2;

/// S3-to-Sentinel log ingestion pipeline
#[derive(Parser)]
#[command(name = "logs2sentinel")]
#[command(version)]
#[command(about = "Polls an S3-compatible store and routes parsed logs into Azure Sentinel", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-lived polling service
    Run,
    /// Run a single ingest cycle and exit
    RunOnce,
    /// Replay persisted failed batches through the sink
    ReplayFailed,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(EXIT_STARTUP_ERROR);
        }
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(EXIT_STARTUP_ERROR);
        }
    };

    let result = match cli.command {
        Command::Run => runtime.block_on(logs2sentinel_server::run(config)),
        Command::RunOnce => runtime.block_on(logs2sentinel_server::run_once(config)),
        Command::ReplayFailed => runtime.block_on(logs2sentinel_server::replay_failed(config)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is::<CycleFailure>() => {
            eprintln!("{e:#}");
            ExitCode::from(EXIT_CYCLE_FAILURE)
        }
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(EXIT_STARTUP_ERROR)
        }
    }
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    match &cli.config {
        Some(path) => RuntimeConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => RuntimeConfig::load().context(
            "Failed to load configuration (default: ./logs2sentinel.toml; override with --config)",
        ),
    }
}
