//! raftlite Configuration
//!
//! This module provides configuration structures for a raftlite node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main raftlite configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftliteConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster and consensus configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Embedded SQLite configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Request routing configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Data directory for the Raft log and state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Bootstrap this node as a single-voter cluster when its log is empty
    #[serde(default)]
    pub bootstrap: bool,

    /// Cluster addresses to try joining at startup
    #[serde(default)]
    pub join: Vec<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (randomized)
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Maximum entries per replication batch
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    /// Timeout for a single peer RPC in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Remove voters that stay silent this long (0 = never)
    #[serde(default)]
    pub reap_timeout_secs: u64,

    /// Use fsync for log durability (slower but safer)
    #[serde(default = "default_true")]
    pub fsync: bool,
}

/// Embedded database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// SQLite file path. The file is recreated at startup and rebuilt from
    /// the log; when absent the database lives in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Request router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How long a proposal may take to commit and apply
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// How long to wait for an unknown connection to appear locally
    #[serde(default = "default_catchup_timeout_ms")]
    pub catchup_timeout_ms: u64,

    /// Maximum attempts for redirectable failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between attempts in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    100
}

fn default_election_timeout_min_ms() -> u64 {
    1000
}

fn default_election_timeout_max_ms() -> u64 {
    2000
}

fn default_max_batch_entries() -> usize {
    512
}

fn default_rpc_timeout_ms() -> u64 {
    1000
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

fn default_catchup_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:4001".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/raftlite")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            join: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            max_batch_entries: default_max_batch_entries(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            reap_timeout_secs: 0,
            fsync: true,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            catchup_timeout_ms: default_catchup_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RaftliteConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: RaftliteConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a loopback node with short timers, used by the
    /// cluster control surface and tests.
    pub fn local(id: &str, data_dir: PathBuf, bootstrap: bool) -> Self {
        Self {
            node: NodeConfig {
                id: id.to_string(),
                bind_address: "127.0.0.1:0".to_string(),
                data_dir,
                advertise_address: None,
            },
            cluster: ClusterConfig {
                bootstrap,
                heartbeat_interval_ms: 50,
                election_timeout_min_ms: 300,
                election_timeout_max_ms: 600,
                rpc_timeout_ms: 500,
                fsync: false,
                ..ClusterConfig::default()
            },
            database: DatabaseConfig::default(),
            router: RouterConfig::default(),
            api: ApiConfig {
                enabled: false,
                bind_address: "127.0.0.1:0".to_string(),
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.election_timeout_min_ms > self.cluster.election_timeout_max_ms {
            return Err(crate::Error::Config(
                "cluster.election_timeout_min_ms exceeds election_timeout_max_ms".into(),
            ));
        }

        if self.cluster.heartbeat_interval_ms * 2 > self.cluster.election_timeout_min_ms {
            return Err(crate::Error::Config(
                "cluster.heartbeat_interval_ms must be well below the election timeout".into(),
            ));
        }

        if self.cluster.max_batch_entries == 0 {
            return Err(crate::Error::Config("cluster.max_batch_entries must be positive".into()));
        }

        if self.router.max_attempts == 0 {
            return Err(crate::Error::Config("router.max_attempts must be positive".into()));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the Raft log directory path
    pub fn log_dir(&self) -> PathBuf {
        self.node.data_dir.join("raft")
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get peer RPC timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.rpc_timeout_ms)
    }

    /// Get the reap timeout, if reaping is enabled
    pub fn reap_timeout(&self) -> Option<Duration> {
        match self.cluster.reap_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl RouterConfig {
    /// Proposal timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Catch-up timeout as Duration
    pub fn catchup_timeout(&self) -> Duration {
        Duration::from_millis(self.catchup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:4002"
data_dir = "/var/lib/raftlite"

[cluster]
join = ["node-2:4002", "node-3:4002"]
heartbeat_interval_ms = 100

[database]
path = "/var/lib/raftlite/db.sqlite"
"#;

        let config = RaftliteConfig::from_toml(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.cluster.join.len(), 2);
        assert!(config.cluster.fsync);
        assert_eq!(config.router.max_attempts, 10);
        assert!(config.reap_timeout().is_none());
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/raftlite/raft"));
    }

    #[test]
    fn test_rejects_inverted_election_timeouts() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:4002"

[cluster]
election_timeout_min_ms = 3000
election_timeout_max_ms = 1000
"#;

        assert!(RaftliteConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_local_config_is_valid() {
        let config = RaftliteConfig::local("n1", PathBuf::from("/tmp/n1"), true);
        config.validate().unwrap();
        assert_eq!(config.advertise_address(), "127.0.0.1:0");
    }
}
