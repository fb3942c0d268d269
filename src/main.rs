//! testpulse CLI - Inspect configuration, probes and the offline queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testpulse::collector::Collector;
use testpulse::config::{self, DEFAULT_CONFIG_TEMPLATE, TelemetryConfig};
use testpulse::environment::{SystemEnv, detect_with};
use testpulse::network::{NetworkProbe, Reachability};
use testpulse::queue::OfflineQueue;
use testpulse::scheduler::FlushScheduler;
use testpulse::upload::{HttpTransport, LoggingObserver, Uploader};

#[derive(Parser)]
#[command(name = "testpulse")]
#[command(about = "Test telemetry pipeline tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testpulse.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the detected environment and network metrics
    Probe {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the number of executions in the offline queue
    Status,

    /// Upload everything in the offline queue
    Replay,

    /// Delete everything in the offline queue
    Clear,

    /// Remove expired and orphaned offline queue files
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { force } => init_config(&cli.config, force),
        Commands::Probe { json } => probe(&cli.config, json).await,
        Commands::Status => queue_status(&cli.config),
        Commands::Replay => replay_queue(&cli.config).await,
        Commands::Clear => clear_queue(&cli.config),
        Commands::Cleanup => cleanup_queue(&cli.config),
    }
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("{}", style("Configuration is valid!").green().bold());
            println!();
            println!("Settings:");
            println!("  Endpoint: {}", config.api_endpoint);
            println!("  Project: {}", config.project_id);
            println!("  Batch size: {}", config.batch_size);
            println!("  Flush interval: {:?}", config.flush_interval());
            println!("  Sampling rate: {}", config.sampling_rate);
            println!(
                "  Retries: {} ({:?}, base {:?})",
                config.max_retries,
                config.retry_backoff,
                config.retry_delay()
            );
            println!("  Compression: {}", config.enable_compression);
            if config.enable_offline_queue {
                println!("  Offline queue: {}", config.offline_queue_path().display());
            } else {
                println!("  Offline queue: disabled");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", style("Configuration error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        eprintln!(
            "{} already exists. Pass --force to overwrite it.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Fill in api_key, project_id and api_endpoint, then run:");
    println!("  testpulse validate");

    Ok(())
}

async fn probe(config_path: &Path, json: bool) -> Result<()> {
    let config = config::load_config(config_path)?;
    let environment = detect_with(&SystemEnv, &config.environment, &config.custom_properties);
    let network = NetworkProbe::for_endpoint(&config.api_endpoint).measure().await;

    if json {
        let doc = serde_json::json!({ "environment": environment, "network": network });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{}", style("Environment").bold());
    println!("  Machine: {}", environment.machine_name);
    println!(
        "  OS: {} {} ({})",
        environment.os,
        environment.os_version.as_deref().unwrap_or(""),
        environment.architecture
    );
    println!("  Environment: {}", environment.environment_name);
    println!(
        "  CI: {}",
        environment.ci_provider.as_deref().unwrap_or(if environment.is_ci { "yes" } else { "no" })
    );
    println!("  Container: {}", if environment.is_container { "yes" } else { "no" });
    println!();

    let online = match network.online {
        Reachability::Online => style("online").green(),
        Reachability::Offline => style("offline").red(),
        Reachability::Unknown => style("unknown").yellow(),
    };
    println!("{}", style("Network").bold());
    println!("  Endpoint: {}", online);
    println!("  Connection: {:?}", network.connection_type);
    match network.latency_ms {
        Some(latency) => println!("  Latency: {:.2} ms", latency),
        None => println!("  Latency: unknown"),
    }
    match network.packet_loss_percent {
        Some(loss) => println!("  Packet loss: {:.0}%", loss),
        None => println!("  Packet loss: unknown"),
    }

    Ok(())
}

fn open_queue(config_path: &Path) -> Result<(TelemetryConfig, OfflineQueue)> {
    let config = config::load_config(config_path)?;
    if !config.enable_offline_queue {
        warn!("Offline queue is disabled in {}", config_path.display());
    }
    let queue = OfflineQueue::from_config(&config).with_context(|| {
        format!(
            "Failed to open offline queue at {}",
            config.offline_queue_path().display()
        )
    })?;
    Ok((config, queue))
}

fn queue_status(config_path: &Path) -> Result<()> {
    let (_, queue) = open_queue(config_path)?;
    let size = queue.len().context("Failed to read offline queue")?;
    println!("Offline queue: {}", queue.dir().display());
    println!("  Queued executions: {}", style(size).bold());
    Ok(())
}

async fn replay_queue(config_path: &Path) -> Result<()> {
    let (config, queue) = open_queue(config_path)?;
    let transport = Arc::new(HttpTransport::from_config(&config)?);
    let uploader = Uploader::from_config(&config, transport).with_observer(Arc::new(LoggingObserver));
    let scheduler = FlushScheduler::new(
        Arc::new(Collector::new(config.batch_size, 1.0)),
        Arc::new(uploader),
        Some(queue.clone()),
    );

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, returning unsent executions to the queue");
                cancel.cancel();
            }
        })
    };

    let report = scheduler.replay_queue(&cancel).await;
    ctrl_c.abort();

    let remaining = queue.len().context("Failed to read offline queue")?;
    println!(
        "Replayed {} executions, {} still queued",
        style(report.uploaded).green().bold(),
        remaining
    );
    if report.rejected > 0 {
        println!(
            "{}",
            style(format!(
                "Discarded {} executions the service rejected.",
                report.rejected
            ))
            .red()
        );
    }
    if report.returned > 0 {
        println!(
            "{}",
            style("Upload failed; remaining executions stay queued.").yellow()
        );
        std::process::exit(1);
    }
    Ok(())
}

fn clear_queue(config_path: &Path) -> Result<()> {
    let (_, queue) = open_queue(config_path)?;
    let removed = queue.clear().context("Failed to clear offline queue")?;
    println!("Removed {} queued executions", removed);
    Ok(())
}

fn cleanup_queue(config_path: &Path) -> Result<()> {
    let (_, queue) = open_queue(config_path)?;
    let report = queue.cleanup().context("Failed to clean up offline queue")?;

    if report.is_empty() {
        println!("Nothing to clean up");
        return Ok(());
    }
    println!("Offline queue cleanup:");
    println!(
        "  Expired segments: {} ({} executions)",
        report.expired_segments, report.expired_records
    );
    println!("  Restored claims: {}", report.restored_claims);
    println!("  Repaired segments: {}", report.repaired_segments);
    println!("  Removed temp files: {}", report.removed_temp_files);
    Ok(())
}
