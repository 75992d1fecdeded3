//! Crawler configuration.
//!
//! Every section has defaults, so an empty TOML file (or none at all) is a
//! valid configuration:
//!
//! ```toml
//! [dht]
//! bind_addr = "0.0.0.0:6881"
//! snapshot_path = "routing.json"
//!
//! [collector]
//! max_pending = 2000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dht::{NodeId, TableConfig};

pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
    "dht.libtorrent.org:25401",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid node id {0:?}: expected 40 hex characters")]
    InvalidNodeId(String),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub dht: DhtConfig,
    pub collector: CollectorConfig,
    pub fetch: FetchConfig,
}

impl CrawlerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: CrawlerConfig = toml::from_str(content)?;
        config.dht.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub bind_addr: SocketAddr,
    /// Hex node id. A random one is used when unset, unless a snapshot
    /// supplies one.
    pub node_id: Option<String>,
    /// Nodes per bucket.
    pub k: usize,
    pub bootstrap_nodes: Vec<String>,
    pub liveness_interval_secs: u64,
    pub ping_timeout_ms: u64,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    /// Idle time after which the join loop queries known nodes on its own.
    pub join_interval_ms: u64,
    pub bucket_refresh_secs: u64,
    pub token_rotation_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6881)),
            node_id: None,
            k: 8,
            bootstrap_nodes: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            liveness_interval_secs: 15 * 60,
            ping_timeout_ms: 1000,
            snapshot_path: None,
            snapshot_interval_secs: 60,
            join_interval_ms: 2000,
            bucket_refresh_secs: 15 * 60,
            token_rotation_secs: 5 * 60,
        }
    }
}

impl DhtConfig {
    /// Checks the node id and rejects periods that a timer cannot tick at.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node_id()?;

        let periods = [
            ("dht.join_interval_ms", self.join_interval_ms),
            ("dht.snapshot_interval_secs", self.snapshot_interval_secs),
            ("dht.bucket_refresh_secs", self.bucket_refresh_secs),
            ("dht.token_rotation_secs", self.token_rotation_secs),
        ];
        match periods.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::ZeroInterval(*name)),
            None => Ok(()),
        }
    }

    pub fn node_id(&self) -> Result<Option<NodeId>, ConfigError> {
        self.node_id
            .as_deref()
            .map(|hex| NodeId::from_hex(hex).map_err(|_| ConfigError::InvalidNodeId(hex.into())))
            .transpose()
    }

    pub fn join_interval(&self) -> Duration {
        Duration::from_millis(self.join_interval_ms)
    }

    pub fn bucket_refresh(&self) -> Duration {
        Duration::from_secs(self.bucket_refresh_secs)
    }

    pub fn token_rotation(&self) -> Duration {
        Duration::from_secs(self.token_rotation_secs)
    }

    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            k: self.k,
            liveness_interval: Duration::from_secs(self.liveness_interval_secs),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            snapshot_path: self.snapshot_path.clone(),
            snapshot_interval: Duration::from_secs(self.snapshot_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Ceiling on concurrent metadata fetches. Requests beyond it are
    /// rejected, not queued.
    pub max_pending: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { max_pending: 5000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub dial_timeout_secs: u64,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Budget for the whole piece loop.
    pub fetch_timeout_secs: u64,
    pub max_metadata_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 10,
            write_timeout_ms: 1000,
            read_timeout_ms: 2000,
            fetch_timeout_secs: 20,
            max_metadata_size: 10 * 1024 * 1024,
        }
    }
}

impl FetchConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
