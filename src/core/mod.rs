//! Core data model: identifiers, stamps, records, the CRDT contract, and the
//! codec seam.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

mod codec;
mod crdt;
mod gset;
mod lww;

pub use codec::{CodecError, CrdtCodec, JsonCodec, decode_tombstone, encode_tombstone};
pub use crdt::Crdt;
pub use gset::GSet;
pub use lww::Lww;

/// Keys are opaque to the core: total-ordered, hashable, cheap to clone.
pub trait Key: Clone + Ord + Hash + Send + 'static {}

impl<T: Clone + Ord + Hash + Send + 'static> Key for T {}

/// Name of one node process. Appears in WAL segment file names.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// One storage endpoint in the cluster. Total order is the natural string
/// order and is stable across restarts; the sharder relies on it for ties.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionId({})", self.0)
    }
}

/// Producer-assigned timestamp in milliseconds since the epoch.
///
/// Stamps order tombstones against the states they shadow. Within one process
/// they are issued by [`stamp_now`] and never go backwards.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Stamp(u64);

impl Stamp {
    pub const ZERO: Stamp = Stamp(0);

    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One replicated fact: a key, a mergeable state, and the stamp its producer
/// assigned. Records with the same key are always mergeable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<K, S> {
    pub key: K,
    pub state: S,
    pub stamp: Stamp,
}

impl<K, S> Record<K, S> {
    pub fn new(key: K, state: S, stamp: Stamp) -> Self {
        Self { key, state, stamp }
    }
}

/// A deletion marker. Shadows every state of the same key with a stamp at or
/// below its own; later writes win over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone<K> {
    pub key: K,
    pub stamp: Stamp,
}

impl<K> Tombstone<K> {
    pub fn new(key: K, stamp: Stamp) -> Self {
        Self { key, stamp }
    }
}

struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn now(&self) -> Stamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .min(u128::from(u64::MAX)) as u64;
        let prev = self
            .last
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(wall.max(last.saturating_add(1)))
            })
            .unwrap_or(wall);
        Stamp(wall.max(prev.saturating_add(1)))
    }
}

static CLOCK: MonotonicClock = MonotonicClock::new();

/// Issue a stamp that is >= the wall clock and strictly greater than every
/// stamp previously issued by this process, even if the wall clock regressed.
pub fn stamp_now() -> Stamp {
    CLOCK.now()
}

/// Cooperative cancellation flag shared between an operation and its owner.
/// Cancellation is best-effort: already-applied effects stay applied.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
