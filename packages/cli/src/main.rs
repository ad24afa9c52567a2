// ABOUTME: Entry point of the sandbox runner process
// ABOUTME: Loads config, sets up logging and runs the background loops or a single pass

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runner_config::RunnerConfig;
use runner_sandbox::Runner;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod logging;

#[derive(Parser)]
#[command(name = "sandbox-runner")]
#[command(about = "Sandbox lifecycle orchestrator for a single fleet node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run metrics, state sync, garbage collection and cache eviction until interrupted
    Serve,
    /// Run one garbage collection pass and print the report
    Gc {
        /// Report orphans without deleting them
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one state sync pass and print the report
    Sync,
    /// Take one metrics sample and print it
    Metrics,
    /// Check engine reachability and metrics freshness
    Health,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(cli.command.unwrap_or(Commands::Serve)).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = RunnerConfig::from_env().context("Failed to load configuration")?;
    let _guard = logging::init(&config.logging)?;

    let runner = Runner::from_config(config)
        .await
        .context("Failed to initialize runner")?;

    match command {
        Commands::Serve => serve(&runner).await,
        Commands::Gc { dry_run } => {
            let dry_run = dry_run || runner.config().gc.dry_run;
            let report = runner.garbage_collector()?.run_with(dry_run).await?;
            print_json(&report)
        }
        Commands::Sync => {
            let report = runner.state_sync()?.run().await?;
            print_json(&report)
        }
        Commands::Metrics => {
            let usage = runner.metrics().collect().await;
            print_json(&usage)
        }
        Commands::Health => {
            let report = runner.health().check().await;
            print_json(&report)
        }
    }
}

async fn serve(runner: &Runner) -> Result<()> {
    runner.engine().ping().await.context("Container engine is unreachable")?;

    let cancel = CancellationToken::new();
    let handles = runner.spawn_background(&cancel);
    info!("Runner started with {} background loops", handles.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for in-flight passes to finish");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background loop ended abnormally: {}", e);
        }
    }

    info!("Runner stopped");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
