//! Anti-entropy repair.
//!
//! Each cycle pulls a peer's state since the last successful repair and
//! merges it into local storage; join being idempotent and commutative makes
//! the direction and ordering irrelevant. While the scheme carries a target,
//! the cycle also migrates each outgoing partition's content into the target
//! layout and reports completion so the discovery owner can retire
//! `current \ target`.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Sender, bounded};
use rand::seq::IndexedRandom;

use crate::core::{Crdt, Key, PartitionId, Stamp, stamp_now};
use crate::metrics;
use crate::storage::{CrdtStorage, StorageError, pipe_records};

use super::scheme::PartitionScheme;
use super::storage::ClusterStorage;

#[derive(Clone, Copy, Debug)]
pub struct RepairConfig {
    pub interval: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairEvent {
    /// Every outgoing partition has been migrated into the target layout;
    /// the scheme owner may promote the target.
    RebalanceComplete,
}

pub struct Repairer<K, S> {
    local_partition: PartitionId,
    local: Arc<dyn CrdtStorage<K, S>>,
    cluster: Arc<ClusterStorage<K, S>>,
    events: Option<Sender<RepairEvent>>,
    last_repair: Option<Stamp>,
    migrated: Option<PartitionScheme>,
}

impl<K: Key, S: Crdt> Repairer<K, S> {
    pub fn new(
        local_partition: PartitionId,
        local: Arc<dyn CrdtStorage<K, S>>,
        cluster: Arc<ClusterStorage<K, S>>,
        events: Option<Sender<RepairEvent>>,
    ) -> Self {
        Self {
            local_partition,
            local,
            cluster,
            events,
            last_repair: None,
            migrated: None,
        }
    }

    /// One full cycle: probe dead partitions, pull from one peer, advance
    /// the rebalance if one is underway. Errors are logged, not fatal; the
    /// next cycle retries.
    pub fn run_cycle(&mut self) {
        for partition in self.cluster.partitions().due_for_probe() {
            self.cluster.probe_partition(&partition);
        }

        if let Err(err) = self.pull_once() {
            tracing::warn!(error = %err, "repair pull failed");
        }

        let scheme = self.cluster.scheme();
        if scheme.is_rebalancing() {
            if self.migrated.as_ref() != Some(&scheme) {
                match self.migrate(&scheme) {
                    Ok(()) => {
                        self.migrated = Some(scheme);
                        if let Some(events) = &self.events {
                            let _ = events.send(RepairEvent::RebalanceComplete);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "rebalance migration failed");
                    }
                }
            }
        } else {
            self.migrated = None;
        }
    }

    fn pull_once(&mut self) -> Result<(), StorageError> {
        let scheme = self.cluster.scheme();
        let partitions = self.cluster.partitions();
        let peers: Vec<PartitionId> = scheme
            .read_set()
            .keys()
            .filter(|p| **p != self.local_partition && partitions.is_alive(p))
            .cloned()
            .collect();
        let Some(peer) = peers.choose(&mut rand::rng()) else {
            return Ok(());
        };
        let Some(store) = self.cluster.store(peer) else {
            return Ok(());
        };

        let cycle_start = stamp_now();
        let stream = match store.download(self.last_repair) {
            Ok(stream) => stream,
            Err(err) => {
                partitions.mark_dead(peer);
                return Err(err);
            }
        };
        let sink = self.local.upload()?;
        match pipe_records(stream, sink) {
            Ok(()) => {
                metrics::counter(
                    "repair_cycles",
                    1,
                    vec![("peer", peer.to_string())],
                );
                self.last_repair = Some(cycle_start);
                Ok(())
            }
            Err(err) => {
                partitions.mark_dead(peer);
                Err(err)
            }
        }
    }

    /// Push every outgoing partition's content through an upload routed over
    /// the target scheme. All-or-nothing per cycle: a failed partition keeps
    /// the whole migration pending.
    fn migrate(&self, scheme: &PartitionScheme) -> Result<(), StorageError> {
        for outgoing in scheme.outgoing() {
            let Some(store) = self.cluster.store(&outgoing) else {
                continue;
            };
            let stream = store.download(None)?;
            let sink = self
                .cluster
                .migration_sink()
                .ok_or_else(|| StorageError::Unavailable {
                    message: "rebalance ended mid-migration".to_string(),
                })?;
            pipe_records(stream, sink)?;
            tracing::info!(partition = %outgoing, "outgoing partition migrated");
        }
        Ok(())
    }
}

pub struct RepairHandle {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

impl RepairHandle {
    pub fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.join.join();
    }
}

/// Run the repairer on its own thread every `config.interval`.
pub fn start<K: Key, S: Crdt>(
    mut repairer: Repairer<K, S>,
    config: RepairConfig,
) -> std::io::Result<RepairHandle> {
    let (stop, stop_rx) = bounded::<()>(1);
    let join = std::thread::Builder::new()
        .name("repair".to_string())
        .spawn(move || {
            loop {
                crossbeam::select! {
                    recv(stop_rx) -> _ => break,
                    default(config.interval) => repairer.run_cycle(),
                }
            }
        })?;
    Ok(RepairHandle { stop, join })
}
