#![forbid(unsafe_code)]

pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod net;
pub mod node;
pub mod rpc;
pub mod storage;
pub mod telemetry;
pub mod wal;
pub mod wire;

pub use error::{Error, ErrorKind};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch at crate root.
pub use crate::core::{
    CancelToken, Crdt, CrdtCodec, GSet, JsonCodec, Key, Lww, NodeId, PartitionId, Record, Stamp,
    Tombstone, stamp_now,
};
pub use crate::storage::{CrdtStorage, FsStorage, MapStorage, RecordStream, StorageError};
