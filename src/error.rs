use thiserror::Error;

use crate::cluster::DiscoveryError;
use crate::config::ConfigError;
use crate::core::CodecError;
use crate::storage::StorageError;
use crate::wal::WalError;
use crate::wire::WireError;

/// How a surfaced error should be treated by the caller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// I/O, timeout, dead peer. Retried below the surface; seeing one here
    /// means the retry/quorum layer already gave up on this attempt.
    Transient,
    /// Framing or codec failure on incoming data. Never retried; the session
    /// that produced it is torn down.
    Malformed,
    /// The caller violated a precondition. Immediate, non-retriable.
    Conflict,
    /// Quorum not reachable within the replication policy.
    Exhausted,
    /// Requires operator action: disk full under the WAL, corrupted chunk id
    /// sequence. The node stops.
    Fatal,
    /// The node is stopping; outstanding operations are failed with this.
    Shutdown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Shutdown => "shutdown",
        }
    }
}

/// Crate-level convenience error: a thin wrapper over the subsystem errors,
/// each of which knows its own [`ErrorKind`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Fatal,
            Error::Codec(_) => ErrorKind::Malformed,
            Error::Wire(err) => err.kind(),
            Error::Wal(err) => err.kind(),
            Error::Storage(err) => err.kind(),
            Error::Discovery(err) => err.kind(),
        }
    }
}
