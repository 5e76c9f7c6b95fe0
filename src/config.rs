//! IndexSync Configuration
//!
//! This module provides configuration structures for a replicating
//! follower node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::parse_interval;

/// Main IndexSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Leader connection configuration
    pub leader: LeaderConfig,

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
    /// Node identifier used in logs and status
    pub id: String,

    /// Data directory holding index directories and replication state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Configuration directory (defaults to `<data_dir>/conf`)
    #[serde(default)]
    pub conf_dir: Option<PathBuf>,
}

/// How file-content responses are compressed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Plain packet stream
    #[default]
    None,
    /// Leader deflates the stream itself (`compression=true`)
    Internal,
    /// Negotiated through HTTP content encoding
    External,
}

/// Leader connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    /// Replication endpoint of the leader
    #[serde(default)]
    pub url: String,

    /// Poll interval in `HH:mm:ss` form; unset disables the timer
    #[serde(default)]
    pub poll_interval: Option<String>,

    /// Stream compression mode
    #[serde(default)]
    pub compression: Compression,

    /// Cap on concurrent connections to the leader
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP control API
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
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/indexsync")
}

fn default_max_connections() -> usize {
    16
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
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

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            poll_interval: None,
            compression: Compression::None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl LeaderConfig {
    /// Create a leader configuration with defaults for everything but the URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Validate the leader section
    pub fn validate(&self) -> crate::Result<()> {
        if self.url.trim().is_empty() {
            return Err(crate::Error::Config(
                "leader.url is required for a follower".into(),
            ));
        }

        if self.max_connections == 0 {
            return Err(crate::Error::Config(
                "leader.max_connections must be at least 1".into(),
            ));
        }

        if let Some(interval) = &self.poll_interval {
            parse_interval(interval)?;
        }

        Ok(())
    }

    /// Parsed poll interval, `None` when polling is not configured or zero
    pub fn poll_interval(&self) -> crate::Result<Option<Duration>> {
        match &self.poll_interval {
            Some(interval) => {
                let parsed = parse_interval(interval)?;
                Ok((!parsed.is_zero()).then_some(parsed))
            }
            None => Ok(None),
        }
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl IndexSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: IndexSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        self.leader.validate()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the configuration directory path
    pub fn conf_dir(&self) -> PathBuf {
        self.node
            .conf_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("conf"))
    }

    /// Render a sample configuration file
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"# IndexSync follower configuration

[node]
id = "{node_id}"
data_dir = "/var/lib/indexsync"
# conf_dir = "/var/lib/indexsync/conf"

[leader]
# Replication endpoint on the leader (required)
url = "http://leader:8983/replication"
# How often to poll the leader, HH:mm:ss
poll_interval = "00:00:60"
# none | internal | external
compression = "none"
max_connections = 16

[api]
enabled = true
bind_address = "127.0.0.1:8090"

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "follower-1"
data_dir = "/data/indexsync"

[leader]
url = "http://leader:8983/replication"
poll_interval = "00:01:30"
compression = "internal"
"#;

        let config = IndexSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "follower-1");
        assert_eq!(config.leader.compression, Compression::Internal);
        assert_eq!(config.leader.max_connections, 16);
        assert_eq!(config.leader.poll_interval().unwrap(), Some(Duration::from_secs(90)));
        assert_eq!(config.conf_dir(), PathBuf::from("/data/indexsync/conf"));
        assert!(config.api.enabled);
    }

    #[test]
    fn test_missing_leader_url_is_fatal() {
        let toml = r#"
[node]
id = "follower-1"

[leader]
poll_interval = "00:00:10"
"#;
        let err = IndexSyncConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_bad_interval_rejected() {
        let mut leader = LeaderConfig::new("http://leader/replication");
        leader.poll_interval = Some("every minute".into());
        assert!(leader.validate().is_err());
    }

    #[test]
    fn test_zero_interval_disables_polling() {
        let mut leader = LeaderConfig::new("http://leader/replication");
        leader.poll_interval = Some("00:00:00".into());
        assert_eq!(leader.poll_interval().unwrap(), None);
    }

    #[test]
    fn test_sample_is_valid() {
        let config = IndexSyncConfig::from_str(&IndexSyncConfig::sample("node-7")).unwrap();
        assert_eq!(config.node.id, "node-7");
        assert_eq!(config.leader.poll_interval().unwrap(), Some(Duration::from_secs(60)));
    }
}
