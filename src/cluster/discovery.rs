//! Discovery: where the partition scheme comes from.
//!
//! `watch(prev)` blocks until the scheme differs from what the caller last
//! observed (comparing both `current` and `target`). A constant scheme
//! resolves exactly once; watching it again reports the service closed.

use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

use crate::error::ErrorKind;

use super::scheme::PartitionScheme;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery service closed")]
    Closed,
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Shutdown
    }
}

pub trait DiscoveryService: Send + Sync {
    /// Block until a scheme different from `prev` is available.
    fn watch(&self, prev: Option<&PartitionScheme>) -> Result<PartitionScheme, DiscoveryError>;
}

/// A scheme that never changes: the first watch resolves, any further watch
/// reports closure so watchers can stop.
pub struct ConstantDiscovery {
    scheme: PartitionScheme,
}

impl ConstantDiscovery {
    pub fn new(scheme: PartitionScheme) -> Self {
        Self { scheme }
    }
}

impl DiscoveryService for ConstantDiscovery {
    fn watch(&self, prev: Option<&PartitionScheme>) -> Result<PartitionScheme, DiscoveryError> {
        match prev {
            Some(prev) if *prev == self.scheme => Err(DiscoveryError::Closed),
            _ => Ok(self.scheme.clone()),
        }
    }
}

struct ManualState {
    scheme: Option<PartitionScheme>,
    closed: bool,
}

/// A discovery whose scheme is pushed by the owner; watchers block on a
/// condvar until `publish` moves the epoch past what they saw.
pub struct ManualDiscovery {
    state: Mutex<ManualState>,
    changed: Condvar,
}

impl ManualDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManualState {
                scheme: None,
                closed: false,
            }),
            changed: Condvar::new(),
        })
    }

    pub fn with_scheme(scheme: PartitionScheme) -> Arc<Self> {
        let discovery = Self::new();
        discovery.publish(scheme);
        discovery
    }

    pub fn publish(&self, scheme: PartitionScheme) {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if state.scheme.as_ref() != Some(&scheme) {
            state.scheme = Some(scheme);
            self.changed.notify_all();
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        state.closed = true;
        self.changed.notify_all();
    }
}

impl DiscoveryService for ManualDiscovery {
    fn watch(&self, prev: Option<&PartitionScheme>) -> Result<PartitionScheme, DiscoveryError> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        loop {
            if state.closed {
                return Err(DiscoveryError::Closed);
            }
            if let Some(scheme) = &state.scheme
                && prev != Some(scheme)
            {
                return Ok(scheme.clone());
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|err| err.into_inner());
        }
    }
}
