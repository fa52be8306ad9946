//! raftlite - Distributed SQLite over Raft
//!
//! Command line entry point for running and inspecting a node.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raftlite::config::RaftliteConfig;
use raftlite::server::RaftliteNode;

/// raftlite - Distributed SQLite over Raft
#[derive(Parser)]
#[command(name = "raftlite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "raftlite.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Bootstrap a single-voter cluster if the log is empty
        #[arg(long)]
        bootstrap: bool,

        /// Address of a cluster member to join through (repeatable)
        #[arg(long)]
        join: Vec<String>,
    },

    /// Check node status
    Status {
        /// HTTP API address of the node
        #[arg(short, long, default_value = "localhost:4001")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "raftlite.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bootstrap, join } => {
            run_start(cli.config, cli.log_level, bootstrap, join).await
        }
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact");
            run_status(address).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging. `RUST_LOG` takes precedence over `level`.
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

/// Start the node and run until interrupted
async fn run_start(
    config_path: PathBuf,
    log_level: Option<String>,
    bootstrap: bool,
    join: Vec<String>,
) -> anyhow::Result<()> {
    let mut config = RaftliteConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    config.cluster.bootstrap |= bootstrap;
    config.cluster.join.extend(join);
    tracing::info!("Starting raftlite node {}", config.node.id);

    let node = RaftliteNode::start(config)
        .await
        .context("failed to start node")?;
    if let Some(addr) = node.http_addr() {
        tracing::info!("HTTP API available at http://{}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    node.shutdown().await;
    tracing::info!("raftlite shutdown complete");
    Ok(())
}

/// Print a node's status
async fn run_status(address: String) -> anyhow::Result<()> {
    let url = format!("http://{}/status", address);

    let status: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {}", url))?
        .json()
        .await
        .context("invalid status response")?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let config_content = format!(
        r#"# raftlite Configuration

[node]
id = "{node_id}"
bind_address = "0.0.0.0:4002"
data_dir = "/var/lib/raftlite/{node_id}"
# advertise_address = "my-public-ip:4002"

[cluster]
# Set on exactly one node when creating a new cluster
bootstrap = false
# join = ["node-1.example.com:4002"]
heartbeat_interval_ms = 100
election_timeout_min_ms = 1000
election_timeout_max_ms = 2000
max_batch_entries = 512
rpc_timeout_ms = 1000
# Remove voters silent for this many seconds (0 disables)
reap_timeout_secs = 0
fsync = true

[database]
# Omit to keep the database in memory; it is rebuilt from the log either way
# path = "/var/lib/raftlite/{node_id}/db.sqlite"

[router]
operation_timeout_ms = 10000
catchup_timeout_ms = 5000
max_attempts = 10
retry_backoff_ms = 50

[api]
enabled = true
bind_address = "0.0.0.0:4001"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: raftlite start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match RaftliteConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Advertise Address: {}", config.advertise_address());
            println!("  Bootstrap: {}", config.cluster.bootstrap);
            println!("  Join Targets: {}", config.cluster.join.len());
            match &config.database.path {
                Some(path) => println!("  Database: {}", path.display()),
                None => println!("  Database: (in memory)"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
