//! Cluster storage: one storage interface over all partitions.
//!
//! Uploads tee every record to the top-R partitions of its key, opening one
//! session per partition lazily; the outer session succeeds when at least W
//! of each key's replica set acked. Downloads merge one session per current
//! partition and tolerate as many failures as the quorum leaves room for.
//! Failed sessions mark their partition dead for a cooldown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use crate::core::{Crdt, Key, PartitionId, Record, Stamp, Tombstone};
use crate::storage::merge::{FailurePolicy, MergeJoin, MergeSource};
use crate::storage::{CrdtStorage, RecordStream, RemoveSink, StorageError, UploadSink};

use super::partitions::PartitionTable;
use super::scheme::{PartitionAddr, PartitionScheme};
use super::shards::RendezvousSharder;

/// How many of the R replica sessions must ack a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quorum {
    /// All R replicas (the default).
    Strict,
    /// `ceil(R/2) + 1`, capped at R.
    Majority,
    /// A fixed count, clamped to `1..=R`.
    Fixed(usize),
}

impl Quorum {
    pub fn required(&self, replicas: usize) -> usize {
        match self {
            Quorum::Strict => replicas,
            Quorum::Majority => (replicas.div_ceil(2) + 1).min(replicas),
            Quorum::Fixed(n) => (*n).clamp(1, replicas),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ClusterConfig {
    pub replicas: usize,
    pub quorum: Quorum,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replicas: 1,
            quorum: Quorum::Strict,
        }
    }
}

/// Builds the storage handle for a partition address. Local partitions get
/// the local store, remote ones a transport client.
pub type StorageProvider<K, S> =
    Arc<dyn Fn(&PartitionId, &PartitionAddr) -> Arc<dyn CrdtStorage<K, S>> + Send + Sync>;

struct Topology<K, S> {
    scheme: PartitionScheme,
    write_sharder: RendezvousSharder,
    stores: BTreeMap<PartitionId, Arc<dyn CrdtStorage<K, S>>>,
}

pub struct ClusterStorage<K, S> {
    provider: StorageProvider<K, S>,
    partitions: Arc<PartitionTable>,
    config: ClusterConfig,
    topology: RwLock<Topology<K, S>>,
}

impl<K: Key, S: Crdt> ClusterStorage<K, S> {
    pub fn new(
        scheme: PartitionScheme,
        provider: StorageProvider<K, S>,
        config: ClusterConfig,
        partitions: Arc<PartitionTable>,
    ) -> Self {
        let topology = build_topology(&scheme, &provider, config.replicas, &BTreeMap::new());
        Self {
            provider,
            partitions,
            config,
            topology: RwLock::new(topology),
        }
    }

    /// Swap in a new scheme (a discovery callback). Storage handles for
    /// unchanged addresses are reused.
    pub fn update_scheme(&self, scheme: PartitionScheme) {
        let mut topology = self.topology.write().unwrap_or_else(|err| err.into_inner());
        if topology.scheme == scheme {
            return;
        }
        tracing::info!(
            partitions = scheme.write_set().len(),
            rebalancing = scheme.is_rebalancing(),
            "partition scheme replaced"
        );
        let rebuilt =
            build_topology(&scheme, &self.provider, self.config.replicas, &topology.stores);
        *topology = rebuilt;
    }

    pub fn scheme(&self) -> PartitionScheme {
        self.topology
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .scheme
            .clone()
    }

    pub fn partitions(&self) -> Arc<PartitionTable> {
        Arc::clone(&self.partitions)
    }

    pub fn replicas(&self) -> usize {
        self.config.replicas
    }

    pub fn quorum_required(&self) -> usize {
        self.config.quorum.required(self.config.replicas)
    }

    pub fn store(&self, partition: &PartitionId) -> Option<Arc<dyn CrdtStorage<K, S>>> {
        self.topology
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .stores
            .get(partition)
            .cloned()
    }

    /// Probe a dead partition; revives it on success.
    pub fn probe_partition(&self, partition: &PartitionId) -> bool {
        let Some(store) = self.store(partition) else {
            return false;
        };
        match store.probe() {
            Ok(()) => {
                self.partitions.revive(partition);
                true
            }
            Err(err) => {
                tracing::debug!(%partition, error = %err, "probe failed");
                false
            }
        }
    }

    /// An upload sink routed over the target scheme only; used by the
    /// rebalance pass. `None` when the cluster is not rebalancing.
    pub fn migration_sink(&self) -> Option<Box<dyn UploadSink<K, S>>> {
        let topology = self.topology.read().unwrap_or_else(|err| err.into_inner());
        let target = topology.scheme.target.as_ref()?;
        let sharder = RendezvousSharder::new(target.keys().cloned(), self.config.replicas);
        Some(Box::new(ClusterUploadSink {
            stores: topology.stores.clone(),
            sharder,
            partitions: Arc::clone(&self.partitions),
            required: self.quorum_required(),
            slots: BTreeMap::new(),
            routes: BTreeSet::new(),
        }))
    }
}

fn build_topology<K: Key, S: Crdt>(
    scheme: &PartitionScheme,
    provider: &StorageProvider<K, S>,
    replicas: usize,
    reuse: &BTreeMap<PartitionId, Arc<dyn CrdtStorage<K, S>>>,
) -> Topology<K, S> {
    let write_set = scheme.write_set();
    let stores = write_set
        .iter()
        .map(|(id, addr)| {
            let store = reuse
                .get(id)
                .cloned()
                .unwrap_or_else(|| (provider)(id, addr));
            (id.clone(), store)
        })
        .collect();
    Topology {
        write_sharder: RendezvousSharder::new(write_set.keys().cloned(), replicas),
        scheme: scheme.clone(),
        stores,
    }
}

impl<K: Key, S: Crdt> CrdtStorage<K, S> for ClusterStorage<K, S> {
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StorageError> {
        let topology = self.topology.read().unwrap_or_else(|err| err.into_inner());
        Ok(Box::new(ClusterUploadSink {
            stores: topology.stores.clone(),
            sharder: topology.write_sharder.clone(),
            partitions: Arc::clone(&self.partitions),
            required: self.quorum_required(),
            slots: BTreeMap::new(),
            routes: BTreeSet::new(),
        }))
    }

    fn download(&self, since: Option<Stamp>) -> Result<RecordStream<K, S>, StorageError> {
        let topology = self.topology.read().unwrap_or_else(|err| err.into_inner());
        let required = self.quorum_required();
        let tolerated = self.config.replicas.saturating_sub(required);

        let mut sources = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        for (partition, _) in topology.scheme.read_set() {
            if !self.partitions.is_alive(partition) {
                failed.push((partition.to_string(), "partition is dead".to_string()));
                continue;
            }
            let Some(store) = topology.stores.get(partition) else {
                failed.push((partition.to_string(), "no storage handle".to_string()));
                continue;
            };
            match store.download(since) {
                Ok(stream) => sources.push(MergeSource::records(partition.to_string(), stream)),
                Err(err) => {
                    self.partitions.mark_dead(partition);
                    failed.push((partition.to_string(), err.to_string()));
                }
            }
        }
        drop(topology);

        if failed.len() > tolerated {
            return Err(StorageError::Exhausted {
                required,
                acked: sources.len(),
                attempted: failed
                    .into_iter()
                    .map(|(partition, cause)| (PartitionId::new(partition), cause))
                    .collect(),
            });
        }
        let budget = tolerated - failed.len();
        let merge = MergeJoin::new(
            sources,
            since,
            FailurePolicy::Tolerate { budget, required },
        )
        .with_prior_failures(failed);
        Ok(Box::new(merge))
    }

    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StorageError> {
        let topology = self.topology.read().unwrap_or_else(|err| err.into_inner());
        Ok(Box::new(ClusterRemoveSink {
            stores: topology.stores.clone(),
            sharder: topology.write_sharder.clone(),
            partitions: Arc::clone(&self.partitions),
            required: self.quorum_required(),
            slots: BTreeMap::new(),
            routes: BTreeSet::new(),
        }))
    }
}

enum UploadSlot<K, S> {
    Open(Box<dyn UploadSink<K, S>>),
    Failed(String),
}

struct ClusterUploadSink<K, S> {
    stores: BTreeMap<PartitionId, Arc<dyn CrdtStorage<K, S>>>,
    sharder: RendezvousSharder,
    partitions: Arc<PartitionTable>,
    required: usize,
    slots: BTreeMap<PartitionId, UploadSlot<K, S>>,
    routes: BTreeSet<Vec<PartitionId>>,
}

impl<K: Key, S: Crdt> ClusterUploadSink<K, S> {
    fn ensure_slot(&mut self, partition: &PartitionId) {
        if self.slots.contains_key(partition) {
            return;
        }
        let slot = if !self.partitions.is_alive(partition) {
            UploadSlot::Failed("partition is dead".to_string())
        } else {
            match self.stores.get(partition) {
                None => UploadSlot::Failed("no storage handle".to_string()),
                Some(store) => match store.upload() {
                    Ok(sink) => UploadSlot::Open(sink),
                    Err(err) => {
                        self.partitions.mark_dead(partition);
                        UploadSlot::Failed(err.to_string())
                    }
                },
            }
        };
        self.slots.insert(partition.clone(), slot);
    }
}

impl<K: Key, S: Crdt> UploadSink<K, S> for ClusterUploadSink<K, S> {
    fn accept(&mut self, record: Record<K, S>) -> Result<(), StorageError> {
        let route = self.sharder.top(&record.key);
        for partition in &route {
            self.ensure_slot(partition);
            let Some(UploadSlot::Open(sink)) = self.slots.get_mut(partition) else {
                continue;
            };
            if let Err(err) = sink.accept(record.clone()) {
                tracing::warn!(%partition, error = %err, "replica session failed");
                self.partitions.mark_dead(partition);
                self.slots
                    .insert(partition.clone(), UploadSlot::Failed(err.to_string()));
            }
        }
        self.routes.insert(route);
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), StorageError> {
        let mut acked: BTreeSet<PartitionId> = BTreeSet::new();
        let mut failures: Vec<(PartitionId, String)> = Vec::new();
        let partitions = self.partitions;
        for (partition, slot) in self.slots {
            match slot {
                UploadSlot::Open(sink) => match sink.complete() {
                    Ok(()) => {
                        acked.insert(partition);
                    }
                    Err(err) => {
                        partitions.mark_dead(&partition);
                        failures.push((partition, err.to_string()));
                    }
                },
                UploadSlot::Failed(message) => {
                    failures.push((partition, message));
                }
            }
        }

        for route in self.routes {
            let route_acks = route.iter().filter(|p| acked.contains(*p)).count();
            if route_acks < self.required {
                let attempted = failures
                    .iter()
                    .filter(|(p, _)| route.contains(p))
                    .cloned()
                    .collect();
                return Err(StorageError::Exhausted {
                    required: self.required,
                    acked: route_acks,
                    attempted,
                });
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {
        for (_, slot) in self.slots {
            if let UploadSlot::Open(sink) = slot {
                sink.abort();
            }
        }
    }
}

enum RemoveSlot<K> {
    Open(Box<dyn RemoveSink<K>>),
    Failed(String),
}

struct ClusterRemoveSink<K, S> {
    stores: BTreeMap<PartitionId, Arc<dyn CrdtStorage<K, S>>>,
    sharder: RendezvousSharder,
    partitions: Arc<PartitionTable>,
    required: usize,
    slots: BTreeMap<PartitionId, RemoveSlot<K>>,
    routes: BTreeSet<Vec<PartitionId>>,
}

impl<K: Key, S: Crdt> ClusterRemoveSink<K, S> {
    fn ensure_slot(&mut self, partition: &PartitionId) {
        if self.slots.contains_key(partition) {
            return;
        }
        let slot = if !self.partitions.is_alive(partition) {
            RemoveSlot::Failed("partition is dead".to_string())
        } else {
            match self.stores.get(partition) {
                None => RemoveSlot::Failed("no storage handle".to_string()),
                Some(store) => match store.remove() {
                    Ok(sink) => RemoveSlot::Open(sink),
                    Err(err) => {
                        self.partitions.mark_dead(partition);
                        RemoveSlot::Failed(err.to_string())
                    }
                },
            }
        };
        self.slots.insert(partition.clone(), slot);
    }
}

impl<K: Key, S: Crdt> RemoveSink<K> for ClusterRemoveSink<K, S> {
    fn accept(&mut self, tombstone: Tombstone<K>) -> Result<(), StorageError> {
        let route = self.sharder.top(&tombstone.key);
        for partition in &route {
            self.ensure_slot(partition);
            let Some(RemoveSlot::Open(sink)) = self.slots.get_mut(partition) else {
                continue;
            };
            if let Err(err) = sink.accept(tombstone.clone()) {
                tracing::warn!(%partition, error = %err, "replica remove session failed");
                self.partitions.mark_dead(partition);
                self.slots
                    .insert(partition.clone(), RemoveSlot::Failed(err.to_string()));
            }
        }
        self.routes.insert(route);
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), StorageError> {
        let mut acked: BTreeSet<PartitionId> = BTreeSet::new();
        let mut failures: Vec<(PartitionId, String)> = Vec::new();
        let partitions = self.partitions;
        for (partition, slot) in self.slots {
            match slot {
                RemoveSlot::Open(sink) => match sink.complete() {
                    Ok(()) => {
                        acked.insert(partition);
                    }
                    Err(err) => {
                        partitions.mark_dead(&partition);
                        failures.push((partition, err.to_string()));
                    }
                },
                RemoveSlot::Failed(message) => {
                    failures.push((partition, message));
                }
            }
        }
        // Removes are idempotent, so W acks per route are enough even when
        // some replicas were down; repair re-spreads the tombstones.
        for route in self.routes {
            let route_acks = route.iter().filter(|p| acked.contains(*p)).count();
            if route_acks < self.required {
                let attempted = failures
                    .iter()
                    .filter(|(p, _)| route.contains(p))
                    .cloned()
                    .collect();
                return Err(StorageError::Exhausted {
                    required: self.required,
                    acked: route_acks,
                    attempted,
                });
            }
        }
        if !failures.is_empty() {
            tracing::info!(
                failed = failures.len(),
                "remove reached quorum with partial failures"
            );
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {
        for (_, slot) in self.slots {
            if let RemoveSlot::Open(sink) = slot {
                sink.abort();
            }
        }
    }
}
