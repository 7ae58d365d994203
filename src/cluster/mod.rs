//! Cluster storage: rendezvous-sharded fan-out over a set of partitions with
//! quorum writes, merged reads, health tracking, and background repair.

pub mod discovery;
pub mod partitions;
pub mod repair;
pub mod scheme;
pub mod shards;
pub mod storage;

pub use discovery::{ConstantDiscovery, DiscoveryError, DiscoveryService, ManualDiscovery};
pub use partitions::PartitionTable;
pub use repair::{RepairConfig, RepairEvent, RepairHandle};
pub use scheme::{PartitionAddr, PartitionScheme};
pub use shards::RendezvousSharder;
pub use storage::{ClusterConfig, ClusterStorage, Quorum, StorageProvider};
