//! IndexSync - Follower-side Index Replication
//!
//! Daemon that keeps a follower's index and configuration in sync with a
//! leader node.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use indexsync::api::HttpServer;
use indexsync::config::{IndexSyncConfig, LoggingConfig};
use indexsync::coordinator::{CycleOutcome, ReplicationClient};
use indexsync::error::Result;
use indexsync::host::{DirectoryHost, IndexHost};
use indexsync::scheduler::PollScheduler;
use indexsync::transport::HttpTransport;

/// IndexSync - Follower-side Index Replication
#[derive(Parser)]
#[command(name = "indexsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "indexsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the follower: poll the leader and serve the control API
    Start,

    /// Run a single replication cycle and exit
    Sync,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "indexsync.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "follower-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it can be read
    let logging = IndexSyncConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level.clone());
    init_logging(&level, &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Sync => run_sync(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load configuration and wire up the replication client
fn build_client(
    config_path: &Path,
) -> Result<(IndexSyncConfig, Arc<DirectoryHost>, Arc<ReplicationClient>)> {
    let config = match IndexSyncConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let host = Arc::new(DirectoryHost::open(config.data_dir(), config.conf_dir())?);
    let transport = Arc::new(HttpTransport::new(&config.leader)?);
    let client = Arc::new(ReplicationClient::new(transport, host.clone())?);

    Ok((config, host, client))
}

/// Start the follower
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting IndexSync follower...");

    let (config, _host, client) = build_client(&config_path)?;
    tracing::info!("Replicating from leader {}", client.leader());

    let scheduler = match config.leader.poll_interval()? {
        Some(interval) => Some(Arc::new(PollScheduler::new(Arc::clone(&client), interval)?)),
        None => {
            tracing::info!("No poll interval configured, replication runs on demand only");
            None
        }
    };

    let http_server = HttpServer::new(
        config.api.clone(),
        config.node.id.clone(),
        Arc::clone(&client),
        scheduler.as_ref().map(|s| s.control()),
    );

    let poller = async {
        match &scheduler {
            Some(scheduler) => scheduler.run().await,
            None => std::future::pending::<()>().await,
        }
    };
    let api = async {
        if config.api.enabled {
            http_server.start().await
        } else {
            tracing::info!("HTTP API disabled");
            std::future::pending::<Result<()>>().await
        }
    };

    tokio::select! {
        _ = poller => {}
        result = api => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    if let Some(scheduler) = &scheduler {
        scheduler.stop();
    }
    if client.abort() {
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while client.is_busy() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Replication cycle still running at shutdown");
        }
    }

    tracing::info!("IndexSync shutdown complete");
    Ok(())
}

/// Run one cycle in the foreground
async fn run_sync(config_path: PathBuf) -> Result<()> {
    let (_config, host, client) = build_client(&config_path)?;

    match client.run_cycle().await {
        CycleOutcome::NoOp(reason) => {
            println!("Nothing to replicate ({:?})", reason);
            Ok(())
        }
        CycleOutcome::Installed(summary) => {
            if summary.reloaded {
                // The reload runs in the background; let it finish before exiting
                let reloaded = tokio::time::timeout(Duration::from_secs(30), async {
                    loop {
                        match host.commit_point().await {
                            Ok(commit) if commit == summary.commit => break,
                            _ => tokio::time::sleep(Duration::from_millis(50)).await,
                        }
                    }
                })
                .await;
                if reloaded.is_err() {
                    tracing::warn!("Reload did not complete in time");
                }
            }
            println!("Replicated {}", summary.commit);
            println!("  Mode:        {}", if summary.full_copy { "full copy" } else { "incremental" });
            println!("  Index files: {}", summary.index_files.len());
            println!("  Conf files:  {}", summary.conf_files.join(", "));
            println!("  Bytes:       {}", summary.bytes_downloaded);
            Ok(())
        }
        CycleOutcome::Aborted => {
            println!("Replication aborted");
            Ok(())
        }
        CycleOutcome::Failed(e) => {
            eprintln!("Replication failed: {}", e);
            Err(e)
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    std::fs::write(&output, IndexSyncConfig::sample(&node_id))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at your leader's replication endpoint.");
    println!("Then start with: indexsync start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match IndexSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:       {}", config.node.id);
            println!("  Data Dir:      {}", config.data_dir().display());
            println!("  Conf Dir:      {}", config.conf_dir().display());
            println!("  Leader:        {}", config.leader.url);
            match config.leader.poll_interval()? {
                Some(interval) => println!("  Poll Interval: {}s", interval.as_secs()),
                None => println!("  Poll Interval: (disabled)"),
            }
            println!("  Compression:   {:?}", config.leader.compression);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
