//! Node configuration: a TOML file plus `LATTICE_*` environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{PartitionAddr, PartitionScheme, Quorum};
use crate::core::{NodeId, PartitionId};
use crate::net::PoolConfig;
use crate::net::server::ServerConfig;
use crate::storage::FsConfig;
use crate::wal::WalConfig;
use crate::wire::CompressionMethod;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This process's name; also its partition id in `partitions`.
    pub node: String,
    pub listen_addr: String,
    pub data_dir: PathBuf,
    /// Partition id to storage endpoint. The entry matching `node` is this
    /// process. Empty means a standalone single-partition node.
    pub partitions: BTreeMap<String, String>,
    pub replication: ReplicationSection,
    pub wal: WalSection,
    pub storage: StorageSection,
    pub net: NetSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: "node-1".to_string(),
            listen_addr: "127.0.0.1:4650".to_string(),
            data_dir: PathBuf::from("lattice-data"),
            partitions: BTreeMap::new(),
            replication: ReplicationSection::default(),
            wal: WalSection::default(),
            storage: StorageSection::default(),
            net: NetSection::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    pub replicas: usize,
    pub quorum: QuorumSetting,
    pub repair_interval_ms: u64,
    pub peer_cooldown_ms: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            replicas: 1,
            quorum: QuorumSetting::Name("strict".to_string()),
            repair_interval_ms: 10_000,
            peer_cooldown_ms: 30_000,
        }
    }
}

/// `"strict"`, `"majority"`, or a fixed ack count.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuorumSetting {
    Count(usize),
    Name(String),
}

impl QuorumSetting {
    fn resolve(&self, replicas: usize) -> Result<Quorum, ConfigError> {
        match self {
            QuorumSetting::Count(n) => {
                if *n == 0 || *n > replicas {
                    return Err(invalid(format!(
                        "quorum {n} must be within 1..={replicas}"
                    )));
                }
                Ok(Quorum::Fixed(*n))
            }
            QuorumSetting::Name(name) => match name.as_str() {
                "strict" => Ok(Quorum::Strict),
                "majority" => Ok(Quorum::Majority),
                other => Err(invalid(format!(
                    "unknown quorum \"{other}\" (strict, majority, or a count)"
                ))),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSection {
    pub segment_max_bytes: u64,
    pub rotation_interval_ms: u64,
    pub fsync: bool,
}

impl Default for WalSection {
    fn default() -> Self {
        Self {
            segment_max_bytes: 16 * 1024 * 1024,
            rotation_interval_ms: 60_000,
            fsync: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Memory,
    Disk,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub mode: StorageMode,
    pub compression: CompressionMethod,
    /// How often disk chunks are folded into one; 0 disables the pass.
    pub consolidate_interval_ms: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            mode: StorageMode::Memory,
            compression: CompressionMethod::None,
            consolidate_interval_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSection {
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub keep_alive_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_frame_bytes: usize,
    pub max_connections: usize,
    /// Compress record streams on the wire.
    pub compression: CompressionMethod,
}

impl Default for NetSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            io_timeout_ms: 10_000,
            keep_alive_timeout_ms: 60_000,
            idle_timeout_ms: 90_000,
            max_frame_bytes: 16 * 1024 * 1024,
            max_connections: 64,
            compression: CompressionMethod::None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(node) = std::env::var("LATTICE_NODE")
            && !node.trim().is_empty()
        {
            self.node = node;
        }
        if let Ok(addr) = std::env::var("LATTICE_LISTEN_ADDR")
            && !addr.trim().is_empty()
        {
            self.listen_addr = addr;
        }
        if let Ok(dir) = std::env::var("LATTICE_DATA_DIR")
            && !dir.trim().is_empty()
        {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.trim().is_empty() {
            return Err(invalid("node name is empty"));
        }
        if !self.partitions.is_empty() && !self.partitions.contains_key(&self.node) {
            return Err(invalid(format!(
                "node \"{}\" is not in the partition table",
                self.node
            )));
        }
        let partition_count = self.partitions.len().max(1);
        if self.replication.replicas == 0 {
            return Err(invalid("replication.replicas must be at least 1"));
        }
        if self.replication.replicas > partition_count {
            return Err(invalid(format!(
                "replication.replicas {} exceeds the {} configured partitions",
                self.replication.replicas, partition_count
            )));
        }
        self.replication.quorum.resolve(self.replication.replicas)?;
        if self.net.max_frame_bytes == 0 {
            return Err(invalid("net.max_frame_bytes must be nonzero"));
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node.clone())
    }

    pub fn quorum(&self) -> Result<Quorum, ConfigError> {
        self.replication.quorum.resolve(self.replication.replicas)
    }

    /// The static partition scheme described by `partitions`; a standalone
    /// node when the table is empty.
    pub fn scheme(&self) -> PartitionScheme {
        let mut current = BTreeMap::new();
        if self.partitions.is_empty() {
            current.insert(PartitionId::new(self.node.clone()), PartitionAddr::Local);
        } else {
            for (id, endpoint) in &self.partitions {
                let addr = if *id == self.node {
                    PartitionAddr::Local
                } else {
                    PartitionAddr::Remote(endpoint.clone())
                };
                current.insert(PartitionId::new(id.clone()), addr);
            }
        }
        PartitionScheme::new(current)
    }

    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            segment_max_bytes: self.wal.segment_max_bytes,
            rotation_interval_ms: self.wal.rotation_interval_ms,
            fsync: self.wal.fsync,
            max_frame_bytes: self.net.max_frame_bytes,
        }
    }

    pub fn fs_config(&self) -> FsConfig {
        FsConfig {
            compression: self.storage.compression,
            max_frame_bytes: self.net.max_frame_bytes,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connect_timeout: Duration::from_millis(self.net.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.net.io_timeout_ms),
            keep_alive: Duration::from_millis(self.net.keep_alive_timeout_ms),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen_addr.clone(),
            max_frame_bytes: self.net.max_frame_bytes,
            io_timeout: Duration::from_millis(self.net.io_timeout_ms),
            idle_timeout: Duration::from_millis(self.net.idle_timeout_ms),
            max_connections: self.net.max_connections,
        }
    }

    pub fn repair_interval(&self) -> Duration {
        Duration::from_millis(self.replication.repair_interval_ms)
    }

    pub fn peer_cooldown(&self) -> Duration {
        Duration::from_millis(self.replication.peer_cooldown_ms)
    }
}
