//! IndexCtl - Command line tool for controlling an IndexSync follower
//!
//! Usage:
//!   indexctl status          - Show replication status
//!   indexctl fetch           - Start a replication cycle now
//!   indexctl abort           - Abort the running cycle
//!   indexctl enable-poll     - Resume scheduled polling
//!   indexctl disable-poll    - Pause scheduled polling

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// IndexSync Follower Control Tool
#[derive(Parser)]
#[command(name = "indexctl")]
#[command(about = "Control and monitor an IndexSync follower", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "indexsync.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show replication status of the follower
    Status,
    /// Start a replication cycle immediately
    Fetch,
    /// Abort the replication cycle in progress
    Abort,
    /// Resume scheduled polling
    EnablePoll,
    /// Pause scheduled polling
    DisablePoll,
}

// ============ API Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node_id: String,
    leader: String,
    replicating: bool,
    local: Option<CommitPoint>,
    session: Option<SessionStatus>,
    last_cycle: Option<CycleReport>,
    #[serde(default)]
    history: History,
    polling: Option<PollStatus>,
}

#[derive(Debug, Deserialize)]
struct CommitPoint {
    version: i64,
    generation: i64,
}

#[derive(Debug, Deserialize)]
struct FileDescriptor {
    name: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SessionStatus {
    target: CommitPoint,
    full_copy: bool,
    #[serde(default)]
    index_files_to_download: Vec<FileDescriptor>,
    #[serde(default)]
    index_files_downloaded: Vec<FileDescriptor>,
    #[serde(default)]
    conf_files_to_download: Vec<FileDescriptor>,
    #[serde(default)]
    conf_files_downloaded: Vec<FileDescriptor>,
    current_file: Option<FileDescriptor>,
    #[serde(default)]
    current_file_bytes_downloaded: u64,
    #[serde(default)]
    elapsed_secs: i64,
}

#[derive(Debug, Deserialize)]
struct CycleReport {
    finished_at: String,
    result: String,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct History {
    times_index_replicated: u64,
    times_config_replicated: u64,
    conf_files_replicated: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PollStatus {
    interval_secs: u64,
    disabled: bool,
    next_poll_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "127.0.0.1:8090".to_string()
}

fn resolve_endpoint(cli: &Cli) -> String {
    if let Some(endpoint) = &cli.endpoint {
        return endpoint.trim_end_matches('/').to_string();
    }

    let addr = std::fs::read_to_string(&cli.config)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    // A wildcard bind is reachable on loopback
    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = resolve_endpoint(&cli);

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Fetch => post_action(&endpoint, "/replication/fetch").await,
        Commands::Abort => post_action(&endpoint, "/replication/abort").await,
        Commands::EnablePoll => post_action(&endpoint, "/replication/poll/enable").await,
        Commands::DisablePoll => post_action(&endpoint, "/replication/poll/disable").await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> Result<()> {
    let url = format!("{}/replication/status", endpoint);
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    let status: StatusResponse = response.json().await?;

    println!();
    println!("Replication Status");
    println!("==================");
    println!();
    println!("Node ID:      {}", status.node_id);
    println!("Leader:       {}", status.leader);
    match &status.local {
        Some(local) => println!("Local:        version {} generation {}", local.version, local.generation),
        None => println!("Local:        (unknown)"),
    }
    println!("Replicating:  {}", if status.replicating { "yes" } else { "no" });

    if let Some(poll) = &status.polling {
        let state = if poll.disabled { "disabled" } else { "enabled" };
        println!("Polling:      every {}s ({})", poll.interval_secs, state);
        if let Some(next) = &poll.next_poll_at {
            println!("Next Poll:    {}", next);
        }
    } else {
        println!("Polling:      (not configured)");
    }

    if let Some(session) = &status.session {
        let done: u64 = session.index_files_downloaded.iter().map(|f| f.size).sum();
        let total: u64 = session.index_files_to_download.iter().map(|f| f.size).sum();
        println!();
        println!("Current Session");
        println!("---------------");
        println!(
            "Target:       version {} generation {}",
            session.target.version, session.target.generation
        );
        println!("Mode:         {}", if session.full_copy { "full copy" } else { "incremental" });
        println!(
            "Index Files:  {}/{} ({} of {} bytes)",
            session.index_files_downloaded.len(),
            session.index_files_to_download.len(),
            done,
            total
        );
        if !session.conf_files_to_download.is_empty() {
            println!(
                "Conf Files:   {}/{}",
                session.conf_files_downloaded.len(),
                session.conf_files_to_download.len()
            );
        }
        if let Some(file) = &session.current_file {
            println!(
                "Current File: {} ({}/{} bytes)",
                file.name, session.current_file_bytes_downloaded, file.size
            );
        }
        println!("Elapsed:      {}s", session.elapsed_secs);
    }

    if let Some(cycle) = &status.last_cycle {
        println!();
        println!("Last Cycle:   {} at {}", cycle.result, cycle.finished_at);
        println!("              {}", cycle.message);
    }

    println!();
    println!("Index Replicated:  {} times", status.history.times_index_replicated);
    println!("Config Replicated: {} times", status.history.times_config_replicated);
    if !status.history.conf_files_replicated.is_empty() {
        println!("Last Conf Files:   {}", status.history.conf_files_replicated.join(", "));
    }
    println!();

    Ok(())
}

async fn post_action(endpoint: &str, path: &str) -> Result<()> {
    let url = format!("{}{}", endpoint, path);
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    let status = response.status();
    let result: ActionResponse = response
        .json()
        .await
        .with_context(|| format!("unexpected response ({})", status))?;

    if result.success {
        println!("{}", result.message);
        Ok(())
    } else {
        bail!("{}", result.message)
    }
}
