use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use surveyor::executor::HttpQueryExecutor;
use surveyor::{DiscoveryEngine, ProgressStore, SurveyorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "surveyor", version, about = "Catalog a remote telemetry store")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true, env = "SURVEYOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a discovery session, resuming from a fresh checkpoint if
    /// one exists.
    Run,
    /// Show progress of the checkpointed session.
    Status,
    /// Write a permanently retained snapshot of the checkpointed session.
    Snapshot { label: String },
    /// List retained snapshots.
    Snapshots,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config =
        SurveyorConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Status => status(&config),
        Command::Snapshot { label } => snapshot(&config, &label),
        Command::Snapshots => list_snapshots(&config),
    }
}

async fn run(config: SurveyorConfig) -> Result<()> {
    let executor = Arc::new(HttpQueryExecutor::new(&config.executor)?);
    let engine = DiscoveryEngine::new(&config, executor)?;

    let store = ProgressStore::new(&config.progress)?;
    let autosave = store.start_autosave(engine.session());

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; letting in-flight queries finish");
            cancel.cancel();
        }
    });

    let result = engine.run().await;
    autosave.stop();
    let status = result?;

    let session = engine.session();
    let session = session.lock().unwrap();
    let estimate = ProgressStore::estimate_progress(&session);
    println!("session {} finished with status {:?}", session.id, status);
    println!(
        "progress: {}% - {}",
        estimate.percentage, estimate.message
    );
    Ok(())
}

fn status(config: &SurveyorConfig) -> Result<()> {
    let store = ProgressStore::new(&config.progress)?;
    match store.load()? {
        Some(checkpoint) => {
            let estimate = ProgressStore::estimate_progress(&checkpoint.session);
            println!(
                "session {} ({:?}, checkpointed {})",
                checkpoint.session.id, checkpoint.session.status, checkpoint.timestamp
            );
            println!("{}% - {}", estimate.percentage, estimate.message);
        }
        None => println!("no resumable checkpoint found"),
    }
    Ok(())
}

fn snapshot(config: &SurveyorConfig, label: &str) -> Result<()> {
    let store = ProgressStore::new(&config.progress)?;
    match store.load()? {
        Some(checkpoint) => {
            let path = store.snapshot(&checkpoint.session, label)?;
            println!("snapshot written to {}", path.display());
        }
        None => println!("no checkpoint to snapshot"),
    }
    Ok(())
}

fn list_snapshots(config: &SurveyorConfig) -> Result<()> {
    let store = ProgressStore::new(&config.progress)?;
    let snapshots = store.list_snapshots()?;
    if snapshots.is_empty() {
        println!("no snapshots");
    }
    for path in snapshots {
        println!("{}", path.display());
    }
    Ok(())
}
