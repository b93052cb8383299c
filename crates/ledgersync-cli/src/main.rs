use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledgersync_core::EntityKind;
use ledgersync_sync::{build_scheduler, ConfigError, RunReport, SyncConfig, SyncPipeline};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ledgersync-cli")]
#[command(about = "Mirror Axonaut invoices and payments into Notion databases")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over invoices, then payments.
    Sync,
    /// Run syncs on SYNC_CRON until interrupted.
    Schedule,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt().with_env_filter(filter).with_target(true).init();
}

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// Status for a finished run. Per-record failures do not change it; only a
/// run where every pass aborted does.
fn run_exit_status(report: &RunReport) -> u8 {
    if report.all_passes_aborted() {
        EXIT_FAILURE
    } else {
        EXIT_SUCCESS
    }
}

fn config_or_exit_status(config: Result<SyncConfig, ConfigError>) -> Result<SyncConfig, u8> {
    config.map_err(|err| {
        error!(error = %err, "configuration error");
        eprintln!("configuration error: {err}");
        EXIT_CONFIG
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    // Loaded here, before tracing, so LOG_LEVEL from `.env` applies.
    let _ = dotenvy::dotenv();
    init_tracing("info");
    let cli = Cli::parse();

    let config = match config_or_exit_status(SyncConfig::from_env()) {
        Ok(config) => config,
        Err(status) => return ExitCode::from(status),
    };

    let outcome = match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => sync_once(config).await,
        Commands::Schedule => schedule(config).await,
    };

    match outcome {
        Ok(status) => ExitCode::from(status),
        Err(err) => {
            error!(error = %format!("{err:#}"), "ledgersync failed");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn sync_once(config: SyncConfig) -> Result<u8> {
    let pipeline = SyncPipeline::new(config)?;
    let report = pipeline.run_once().await;
    let report_path = pipeline.persist_report(&report).await;

    print_summary(&report);
    if let Some(path) = report_path {
        println!("report: {}", path.display());
    }

    Ok(run_exit_status(&report))
}

fn print_summary(report: &RunReport) {
    println!(
        "sync complete: run_id={} dry_run={}",
        report.run_id, report.dry_run
    );
    for kind in EntityKind::ALL {
        if let Some(pass) = report.pass(kind) {
            println!(
                "  {kind}: status={:?} fetched={} created={} updated={} failed={}",
                pass.status, pass.fetched, pass.created, pass.updated, pass.failed
            );
        }
    }
}

async fn schedule(config: SyncConfig) -> Result<u8> {
    let cron = config.sync_cron.clone();
    let pipeline = Arc::new(SyncPipeline::new(config)?);
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(EXIT_SUCCESS)
}
