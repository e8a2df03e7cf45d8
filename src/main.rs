use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use matchcast::config::Config;
use matchcast::health::{Health, JobOutcome};
use matchcast::pipeline::{self, JobReport, Orchestrator};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "matchcast=info";

#[derive(Parser)]
#[command(author, version, about = "Football fixture predictions for chat subscribers")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "matchcast.toml", env = "MATCHCAST_CONFIG")]
    config: PathBuf,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run ingest, predict and dispatch on their cadences until interrupted.
    Run,
    /// Run one ingest pass and exit.
    IngestOnce,
    /// Run one predict pass and exit.
    PredictOnce,
    /// Run one dispatch pass and exit.
    DispatchOnce,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_file.as_deref()) {
        eprintln!("matchcast: {e:#}");
        return ExitCode::from(1);
    }
    match run(cli).await {
        Ok(outcome) => exit_code(outcome),
        Err(e) => {
            tracing::error!("fatal: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// 0 on success; 2 when some provider or delivery failed.
fn exit_code(outcome: JobOutcome) -> ExitCode {
    match outcome {
        JobOutcome::Ok => ExitCode::SUCCESS,
        JobOutcome::Partial | JobOutcome::Failed => ExitCode::from(2),
    }
}

async fn run(cli: Cli) -> Result<JobOutcome> {
    Config::load_env_file();
    let config = Config::load(&cli.config)?;
    let (config_tx, config_rx) = watch::channel(Arc::new(config));
    let health = Arc::new(Health::new());
    let orchestrator = Orchestrator::build(config_rx, health)?;

    let outcome = match cli.command {
        Command::Run => {
            run_forever(cli.config, config_tx, orchestrator).await?;
            JobOutcome::Ok
        }
        Command::IngestOnce => {
            let report = orchestrator.ingest_once(Utc::now()).await;
            orchestrator.persist().await?;
            report.outcome()
        }
        Command::PredictOnce => {
            let report = orchestrator.predict_once(Utc::now()).await;
            orchestrator.persist().await?;
            report.outcome()
        }
        Command::DispatchOnce => {
            let report = orchestrator.dispatch_once(Utc::now()).await;
            orchestrator.persist().await?;
            report.outcome()
        }
    };
    Ok(outcome)
}

async fn run_forever(
    config_path: PathBuf,
    config_tx: watch::Sender<Arc<Config>>,
    orchestrator: Orchestrator,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reload = tokio::spawn(pipeline::reload_on_hangup(
        config_path,
        config_tx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("signal received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    Arc::new(orchestrator).run(shutdown_rx).await?;
    match reload.await {
        Ok(Err(e)) => tracing::error!("config reload task: {:#}", e),
        Err(e) => tracing::error!("config reload task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
