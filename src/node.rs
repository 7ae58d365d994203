//! Node assembly: local storage behind a server, a WAL in front of the
//! cluster, a repair loop, and a discovery watcher, started and stopped as
//! one unit.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, unbounded};

use crate::cluster::repair::{self, RepairConfig, Repairer};
use crate::cluster::{
    ClusterConfig, ClusterStorage, DiscoveryError, DiscoveryService, PartitionAddr,
    PartitionTable, RepairEvent, RepairHandle, StorageProvider,
};
use crate::config::{Config, StorageMode};
use crate::core::{Crdt, CrdtCodec, Key, PartitionId, Record, Stamp, Tombstone, stamp_now};
use crate::error::Error;
use crate::net::server::StorageServer;
use crate::net::{ConnectionPool, RemoteStorage, ServerHandle};
use crate::storage::{CrdtStorage, FsStorage, MapStorage, RecordStream};
use crate::wal::WriteAheadLog;

pub struct Node<K, S> {
    local_partition: PartitionId,
    local: Arc<dyn CrdtStorage<K, S>>,
    cluster: Arc<ClusterStorage<K, S>>,
    wal: WriteAheadLog<K, S>,
    server: Option<ServerHandle>,
    repair: Option<RepairHandle>,
    repair_events: Receiver<RepairEvent>,
    pool: Arc<ConnectionPool>,
    watcher: Option<JoinHandle<()>>,
    housekeeper: Option<Housekeeper>,
}

/// Periodic chunk consolidation for disk-backed local storage.
struct Housekeeper {
    stop: crossbeam::channel::Sender<()>,
    join: JoinHandle<()>,
}

impl Housekeeper {
    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.join.join();
    }
}

fn spawn_housekeeper<K: Key, S: Crdt, C: CrdtCodec<K, S>>(
    store: FsStorage<K, S, C>,
    interval: std::time::Duration,
) -> Housekeeper {
    let (stop, stop_rx) = crossbeam::channel::bounded::<()>(1);
    let join = std::thread::Builder::new()
        .name("storage-consolidate".to_string())
        .spawn(move || {
            loop {
                crossbeam::select! {
                    recv(stop_rx) -> _ => break,
                    default(interval) => {
                        if let Err(err) = store.consolidate() {
                            tracing::warn!(error = %err, "chunk consolidation failed");
                        }
                    }
                }
            }
        })
        .expect("spawning the consolidation thread");
    Housekeeper { stop, join }
}

impl<K: Key, S: Crdt> Node<K, S> {
    /// Bring the node up: recover the WAL into the cluster, serve local
    /// storage to peers, start repairing, and follow discovery.
    pub fn start<C>(
        config: &Config,
        codec: C,
        discovery: Arc<dyn DiscoveryService>,
    ) -> crate::Result<Self>
    where
        C: CrdtCodec<K, S>,
    {
        config.validate()?;
        let scheme = discovery.watch(None)?;
        if config.replication.replicas > scheme.current.len() {
            return Err(crate::config::ConfigError::Invalid {
                reason: format!(
                    "replication.replicas {} exceeds the {} discovered partitions",
                    config.replication.replicas,
                    scheme.current.len()
                ),
            }
            .into());
        }

        let local_partition = PartitionId::new(config.node.clone());
        let mut housekeeper = None;
        let local: Arc<dyn CrdtStorage<K, S>> = match config.storage.mode {
            StorageMode::Memory => Arc::new(MapStorage::new()),
            StorageMode::Disk => {
                let store = FsStorage::open(
                    config.data_dir.join("storage"),
                    codec.clone(),
                    config.fs_config(),
                )?;
                if config.storage.consolidate_interval_ms > 0 {
                    housekeeper = Some(spawn_housekeeper(
                        store.clone(),
                        std::time::Duration::from_millis(config.storage.consolidate_interval_ms),
                    ));
                }
                Arc::new(store)
            }
        };

        let pool = Arc::new(ConnectionPool::new(config.pool_config()));
        let partitions = Arc::new(PartitionTable::new(config.peer_cooldown()));
        let provider: StorageProvider<K, S> = {
            let local = Arc::clone(&local);
            let pool = Arc::clone(&pool);
            let codec = codec.clone();
            let compression = config.net.compression;
            let max_frame_bytes = config.net.max_frame_bytes;
            Arc::new(move |_id, addr| match addr {
                PartitionAddr::Local => Arc::clone(&local),
                PartitionAddr::Remote(endpoint) => Arc::new(RemoteStorage::new(
                    endpoint.clone(),
                    Arc::clone(&pool),
                    codec.clone(),
                    compression,
                    max_frame_bytes,
                )),
            })
        };

        let cluster = Arc::new(ClusterStorage::new(
            scheme.clone(),
            provider,
            ClusterConfig {
                replicas: config.replication.replicas,
                quorum: config.quorum()?,
            },
            partitions,
        ));

        let wal = WriteAheadLog::start(
            config.data_dir.join("wal"),
            config.node_id(),
            config.wal_config(),
            codec.clone(),
            Arc::clone(&cluster) as Arc<dyn CrdtStorage<K, S>>,
        )?;

        let server = StorageServer::new(Arc::clone(&local), codec, config.server_config())
            .start()?;

        let (events_tx, repair_events) = unbounded();
        let repairer = Repairer::new(
            local_partition.clone(),
            Arc::clone(&local),
            Arc::clone(&cluster),
            Some(events_tx),
        );
        let repair = repair::start(
            repairer,
            RepairConfig {
                interval: config.repair_interval(),
            },
        )
        .map_err(|err| crate::storage::StorageError::Io {
            path: None,
            source: err,
        })?;

        let watcher = spawn_watcher(Arc::downgrade(&cluster), discovery, scheme);

        tracing::info!(
            node = %config.node,
            listen = %server.local_addr(),
            partitions = cluster.scheme().current.len(),
            "node started"
        );

        Ok(Self {
            local_partition,
            local,
            cluster,
            wal,
            server: Some(server),
            repair: Some(repair),
            repair_events,
            pool,
            watcher: Some(watcher),
            housekeeper,
        })
    }

    pub fn local_partition(&self) -> &PartitionId {
        &self.local_partition
    }

    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().map(ServerHandle::local_addr)
    }

    pub fn local_storage(&self) -> &Arc<dyn CrdtStorage<K, S>> {
        &self.local
    }

    pub fn cluster(&self) -> &Arc<ClusterStorage<K, S>> {
        &self.cluster
    }

    pub fn repair_events(&self) -> &Receiver<RepairEvent> {
        &self.repair_events
    }

    /// Durable write: appended to the WAL now, replicated at the next flush
    /// or rotation.
    pub fn put(&self, key: K, state: S) -> crate::Result<Stamp> {
        Ok(self.wal.put(key, state)?)
    }

    /// Seal the WAL segment and replicate everything in it.
    pub fn flush(&self) -> crate::Result<()> {
        Ok(self.wal.flush()?)
    }

    /// Cluster-wide merged download.
    pub fn download(&self, since: Option<Stamp>) -> crate::Result<RecordStream<K, S>> {
        Ok(self.cluster.download(since)?)
    }

    /// Tombstone the given keys across their replica sets.
    pub fn remove(&self, keys: impl IntoIterator<Item = K>) -> crate::Result<()> {
        let mut sink = self.cluster.remove()?;
        for key in keys {
            sink.accept(Tombstone::new(key, stamp_now()))?;
        }
        Ok(sink.complete()?)
    }

    /// Upload pre-stamped records cluster-wide, bypassing the WAL. Used by
    /// ingest paths that already have durability.
    pub fn upload(&self, records: impl IntoIterator<Item = Record<K, S>>) -> crate::Result<()> {
        let mut sink = self.cluster.upload()?;
        for record in records {
            sink.accept(record)?;
        }
        Ok(sink.complete()?)
    }

    /// Orderly stop: final WAL flush, then repair, server, pool. Outstanding
    /// operations fail with a shutdown error.
    pub fn stop(mut self) -> crate::Result<()> {
        let result = self.wal.stop();
        if let Some(repair) = self.repair.take() {
            repair.stop();
        }
        if let Some(housekeeper) = self.housekeeper.take() {
            housekeeper.stop();
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        self.pool.close();
        if let Some(watcher) = self.watcher.take()
            && watcher.is_finished()
        {
            let _ = watcher.join();
        }
        tracing::info!("node stopped");
        result.map_err(Error::from)
    }
}

/// Follow discovery until the service closes or the cluster is dropped. The
/// thread holds only a weak handle so a stopped node does not linger.
fn spawn_watcher<K: Key, S: Crdt>(
    cluster: std::sync::Weak<ClusterStorage<K, S>>,
    discovery: Arc<dyn DiscoveryService>,
    initial: crate::cluster::PartitionScheme,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("discovery-watch".to_string())
        .spawn(move || {
            let mut prev = initial;
            loop {
                match discovery.watch(Some(&prev)) {
                    Ok(scheme) => {
                        let Some(cluster) = cluster.upgrade() else {
                            break;
                        };
                        cluster.update_scheme(scheme.clone());
                        prev = scheme;
                    }
                    Err(DiscoveryError::Closed) => break,
                }
            }
        })
        .expect("spawning the discovery watcher")
}
