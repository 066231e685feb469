//! Configuration for fleetconf nodes
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `FLEETCONF_*` environment variables. The binary applies CLI flags last.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`FLEETCONF_CLIENT_ADDR`, ...)
pub const ENV_PREFIX: &str = "FLEETCONF";

/// Role of a node in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Authoritative node, the only one accepting admin writes
    Master,
    /// Follower, pulls state from the master
    Slave,
}

impl NodeType {
    pub fn is_master(&self) -> bool {
        matches!(self, NodeType::Master)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Master => write!(f, "master"),
            NodeType::Slave => write!(f, "slave"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(NodeType::Master),
            "slave" | "follower" => Ok(NodeType::Slave),
            other => Err(Error::InvalidConfig(format!("unknown node type: {}", other))),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client/op API address (`host:port`), also this node's registry key
    #[serde(default = "default_client_addr")]
    pub client_addr: String,

    /// Node-to-node API address (`host:port`)
    #[serde(default = "default_node_addr")]
    pub node_addr: String,

    /// Role of this node
    #[serde(default = "default_node_type")]
    pub node_type: NodeType,

    /// Node address of the master (required on slaves)
    #[serde(default)]
    pub master_addr: Option<String>,

    /// RocksDB directory; in-memory store when absent
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Interval between staleness checks on slaves
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Upper bound for the retry backoff after failed pulls
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Timeout for peer version/pull/register calls
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Audit log file
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

fn default_client_addr() -> String {
    "127.0.0.1:17070".to_string()
}
fn default_node_addr() -> String {
    "127.0.0.1:17071".to_string()
}
fn default_node_type() -> NodeType {
    NodeType::Master
}
fn default_sync_interval() -> u64 {
    3_000
}
fn default_max_backoff() -> u64 {
    60_000
}
fn default_peer_timeout() -> u64 {
    5_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_audit_log() -> PathBuf {
    PathBuf::from("audit.log")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_addr: default_client_addr(),
            node_addr: default_node_addr(),
            node_type: default_node_type(),
            master_addr: None,
            db_path: None,
            sync_interval_ms: default_sync_interval(),
            max_backoff_ms: default_max_backoff(),
            peer_timeout_ms: default_peer_timeout(),
            log_level: default_log_level(),
            audit_log: default_audit_log(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(::config::Environment::with_prefix(ENV_PREFIX));

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Master node address, or this node's own when it is the master
    pub fn master_node_addr(&self) -> Option<&str> {
        match self.node_type {
            NodeType::Master => Some(self.node_addr.as_str()),
            NodeType::Slave => self.master_addr.as_deref(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.client_addr.trim().is_empty() {
            return Err(Error::InvalidConfig("client_addr cannot be empty".into()));
        }
        if self.node_addr.trim().is_empty() {
            return Err(Error::InvalidConfig("node_addr cannot be empty".into()));
        }
        if self.client_addr == self.node_addr {
            return Err(Error::InvalidConfig(
                "client_addr and node_addr must differ".into(),
            ));
        }
        if self.node_type == NodeType::Slave
            && self.master_addr.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(Error::InvalidConfig(
                "slave nodes require master_addr".into(),
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::InvalidConfig("sync_interval_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.sync_interval_ms {
            return Err(Error::InvalidConfig(
                "max_backoff_ms must be >= sync_interval_ms".into(),
            ));
        }
        if self.peer_timeout_ms == 0 {
            return Err(Error::InvalidConfig("peer_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid_master() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node_type, NodeType::Master);
        assert_eq!(config.master_node_addr(), Some("127.0.0.1:17071"));
    }

    #[test]
    fn test_slave_requires_master() {
        let config = Config {
            node_type: NodeType::Slave,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            node_type: NodeType::Slave,
            master_addr: Some("10.0.0.1:17071".into()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.master_node_addr(), Some("10.0.0.1:17071"));
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetconf.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
client_addr = "0.0.0.0:8080"
node_addr = "0.0.0.0:8081"
node_type = "slave"
master_addr = "10.1.1.1:8081"
sync_interval_ms = 500
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.client_addr, "0.0.0.0:8080");
        assert_eq!(config.node_type, NodeType::Slave);
        assert_eq!(config.master_addr.as_deref(), Some("10.1.1.1:8081"));
        assert_eq!(config.sync_interval(), Duration::from_millis(500));
        assert_eq!(config.peer_timeout_ms, 5_000);
    }

    #[test]
    fn test_node_type_parse() {
        assert_eq!("MASTER".parse::<NodeType>().unwrap(), NodeType::Master);
        assert_eq!("follower".parse::<NodeType>().unwrap(), NodeType::Slave);
        assert!("leader".parse::<NodeType>().is_err());
    }
}
