//! Keyed mergeable storage: the interface every store in the system speaks,
//! local or remote, single or clustered.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::{CodecError, PartitionId, Record, Stamp, Tombstone};
use crate::error::ErrorKind;
use crate::wire::WireError;

pub mod fs;
pub mod map;
pub mod merge;

pub use fs::{FsConfig, FsStorage};
pub use map::MapStorage;
pub use merge::{FailurePolicy, MergeJoin, MergeSource, StreamEntry};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("transport error talking to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer {endpoint} refused the stream: {message}")]
    Refused { endpoint: String, message: String },

    #[error("quorum not reached: {acked} of {required} sessions acked ({})", attempted_summary(attempted))]
    Exhausted {
        required: usize,
        acked: usize,
        attempted: Vec<(PartitionId, String)>,
    },

    #[error("no sender available: {message}")]
    Unavailable { message: String },

    #[error("operation rejected: {message}")]
    Rejected { message: String },

    #[error("chunk id sequence corrupt at {path}: {reason}")]
    IdSequenceCorrupt { path: PathBuf, reason: String },

    #[error("storage is shut down")]
    Shutdown,
}

fn attempted_summary(attempted: &[(PartitionId, String)]) -> String {
    if attempted.is_empty() {
        return "no failed sessions".to_string();
    }
    attempted
        .iter()
        .map(|(partition, cause)| format!("{partition}: {cause}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::StorageFull => ErrorKind::Fatal,
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                    ErrorKind::Malformed
                }
                _ => ErrorKind::Transient,
            },
            StorageError::Codec(_) => ErrorKind::Malformed,
            StorageError::Wire(err) => err.kind(),
            StorageError::Transport { .. } => ErrorKind::Transient,
            StorageError::Refused { .. } => ErrorKind::Transient,
            StorageError::Exhausted { .. } => ErrorKind::Exhausted,
            StorageError::Unavailable { .. } => ErrorKind::Transient,
            StorageError::Rejected { .. } => ErrorKind::Conflict,
            StorageError::IdSequenceCorrupt { .. } => ErrorKind::Fatal,
            StorageError::Shutdown => ErrorKind::Shutdown,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: Some(path.into()),
            source,
        }
    }
}

/// Receiving half of an upload session. Records become visible atomically
/// when `complete` returns; a dropped or aborted sink leaves no trace.
pub trait UploadSink<K, S>: Send {
    fn accept(&mut self, record: Record<K, S>) -> Result<(), StorageError>;

    fn complete(self: Box<Self>) -> Result<(), StorageError>;

    fn abort(self: Box<Self>) {}
}

/// Receiving half of a remove session; same end-of-stream contract.
pub trait RemoveSink<K>: Send {
    fn accept(&mut self, tombstone: Tombstone<K>) -> Result<(), StorageError>;

    fn complete(self: Box<Self>) -> Result<(), StorageError>;

    fn abort(self: Box<Self>) {}
}

/// A key-ordered stream of records.
pub type RecordStream<K, S> = Box<dyn Iterator<Item = Result<Record<K, S>, StorageError>> + Send>;

/// The storage interface. Implementations merge records for the same key with
/// the state's join, so delivery is free to be at-least-once and unordered
/// across sessions.
pub trait CrdtStorage<K, S>: Send + Sync {
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StorageError>;

    /// Stream everything whose extraction at `since` is visible, ordered by
    /// key. The stream is consistent as of its start.
    fn download(&self, since: Option<Stamp>) -> Result<RecordStream<K, S>, StorageError>;

    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StorageError>;

    /// Approximate live-key count, when the implementation can answer
    /// locally.
    fn len(&self) -> Option<usize> {
        None
    }

    /// Cheap liveness check. Remote implementations round-trip a ping.
    fn probe(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Drive a whole record stream into a sink and complete it.
pub fn pipe_records<K, S>(
    stream: RecordStream<K, S>,
    mut sink: Box<dyn UploadSink<K, S>>,
) -> Result<(), StorageError> {
    for record in stream {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                sink.abort();
                return Err(err);
            }
        };
        if let Err(err) = sink.accept(record) {
            sink.abort();
            return Err(err);
        }
    }
    sink.complete()
}
