use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use nethang::config::default_config_path;
use nethang::network::command::SystemRunner;
use nethang::network::monitor::{Metric, StatsPayload};
use nethang::path::PathRecord;
use nethang::{Engine, EngineEvent};

#[derive(Parser)]
#[command(name = "nethang", version, about = "Network impairment path engine")]
struct Cli {
    /// Config file (defaults to ~/.nethang/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until SIGINT/SIGTERM
    Run {
        /// Paths to activate after the startup reset
        #[arg(long = "activate", value_name = "ID")]
        activate: Vec<u32>,
    },
    /// Print the path list
    List,
    /// Add a path from a YAML record file
    Add { file: PathBuf },
    /// Replace path ID with a YAML record file
    Update { id: u32, file: PathBuf },
    /// Delete a path
    Delete { id: u32 },
    /// Print the model catalog
    Models,
    /// Check access to tc and iptables
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<nethang::Error>() {
                Some(engine_err) => match serde_json::to_string(&engine_err.failure()) {
                    Ok(json) => eprintln!("{}", json),
                    Err(_) => eprintln!("{:#}", e),
                },
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let engine = Engine::open(&config_path, Arc::new(SystemRunner))
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    match cli.command {
        Commands::Run { activate } => run(Arc::new(engine), activate).await,
        Commands::List => {
            print!("{}", serde_yaml::to_string(&engine.list_paths().await)?);
            Ok(())
        }
        Commands::Add { file } => {
            let id = engine.add_record(read_record(&file)?).await?;
            println!("{}", id);
            Ok(())
        }
        Commands::Update { id, file } => Ok(engine.update_path(id, read_record(&file)?).await?),
        Commands::Delete { id } => Ok(engine.delete_path(id).await?),
        Commands::Models => {
            for (name, entry) in engine.models().models {
                let steps = entry.timeline().len();
                let kind = if steps == 0 {
                    "static".to_string()
                } else {
                    format!("{} steps", steps)
                };
                println!("{:<24} {:<10} {}", name, kind, entry.description.unwrap_or_default());
            }
            Ok(())
        }
        Commands::Check => {
            let status = engine.check_tools();
            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.iter().all(|s| s.available) {
                Ok(())
            } else {
                anyhow::bail!("insufficient privileges or missing tools")
            }
        }
    }
}

fn read_record(file: &Path) -> Result<PathRecord> {
    let text = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("Failed to parse {}", file.display()))
}

async fn run(engine: Arc<Engine>, activate: Vec<u32>) -> Result<()> {
    engine.start().await.context("Startup reset failed")?;

    for id in activate {
        match engine.activate_path(id).await {
            Ok(()) => info!("Path {} active", id),
            Err(e) => error!("Cannot activate path {}: {}", id, e),
        }
    }

    let _watch = engine.watch()?;
    let mut events = engine.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::StatsTick(payload)) => log_stats(&payload),
                Ok(EngineEvent::PathsChanged) => debug!("Path list changed"),
                Ok(EngineEvent::ConfigChanged) => info!("Configuration changed"),
                Err(RecvError::Lagged(n)) => warn!("Event reporter skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    wait_for_shutdown_signal().await;
    info!("Termination signal received");
    reporter.abort();

    engine.shutdown().await.context("Shutdown sweep incomplete")?;
    info!("All paths deactivated");
    Ok(())
}

fn log_stats(payload: &StatsPayload) {
    let latest = |series: &[Option<f64>]| series.last().copied().flatten();

    for (id, directions) in &payload.series {
        for (direction, metrics) in directions {
            let rate_in = metrics.get(&Metric::BitRateIn).and_then(|s| latest(s.as_slice()));
            let rate_out = metrics.get(&Metric::BitRateOut).and_then(|s| latest(s.as_slice()));
            let drops = metrics.get(&Metric::QueueDropRate).and_then(|s| latest(s.as_slice()));
            if let (Some(rate_in), Some(rate_out)) = (rate_in, rate_out) {
                debug!(
                    "path {} {}: in {} kbit/s, out {} kbit/s, drop {}%",
                    id,
                    direction,
                    rate_in,
                    rate_out,
                    drops.unwrap_or(0.0)
                );
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
