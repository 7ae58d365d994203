//! Shared rigs for the integration tests: record builders, WAL file
//! crafting, and TCP-backed clusters on loopback.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lattice::cluster::{
    ClusterConfig, ClusterStorage, PartitionAddr, PartitionScheme, PartitionTable, Quorum,
    StorageProvider,
};
use lattice::core::{CrdtCodec, GSet, JsonCodec, NodeId, PartitionId, Record, Stamp};
use lattice::net::server::{ServerConfig, StorageServer};
use lattice::net::{ConnectionPool, PoolConfig, RemoteStorage, ServerHandle};
use lattice::storage::{CrdtStorage, MapStorage};
use lattice::wire::CompressionMethod;
use lattice::wire::frame::write_uvarint;

pub type TestKey = i64;
pub type TestState = GSet<i32>;
pub type TestStorage = MapStorage<TestKey, TestState>;
pub type TestCluster = ClusterStorage<TestKey, TestState>;

pub const MAX_FRAME: usize = 1024 * 1024;

pub fn record(key: TestKey, values: &[i32], stamp: u64) -> Record<TestKey, TestState> {
    Record::new(key, GSet::of(values.iter().copied()), Stamp::new(stamp))
}

pub fn upload_all(storage: &dyn CrdtStorage<TestKey, TestState>, records: Vec<Record<TestKey, TestState>>) {
    let mut sink = storage.upload().expect("upload session");
    for record in records {
        sink.accept(record).expect("accept record");
    }
    sink.complete().expect("complete upload");
}

pub fn download_all(
    storage: &dyn CrdtStorage<TestKey, TestState>,
) -> Vec<Record<TestKey, TestState>> {
    storage
        .download(None)
        .expect("download session")
        .collect::<Result<_, _>>()
        .expect("download stream")
}

/// Encode one record the way WAL segments and the wire carry it.
pub fn frame_bytes(record: &Record<TestKey, TestState>) -> Vec<u8> {
    let payload = JsonCodec.encode_record(record).expect("encode record");
    let mut frame = Vec::with_capacity(payload.len() + 4);
    write_uvarint(&mut frame, payload.len() as u64).expect("length prefix");
    frame.extend_from_slice(&payload);
    frame
}

/// Craft a sealed segment file holding the given records.
pub fn write_sealed_segment(
    dir: &Path,
    node: &NodeId,
    seq: u64,
    records: &[Record<TestKey, TestState>],
) {
    let mut buf = Vec::new();
    for record in records {
        buf.extend_from_slice(&frame_bytes(record));
    }
    std::fs::write(dir.join(format!("{node}_{seq}.wal.final")), buf).expect("write segment");
}

/// One storage partition served over loopback TCP.
pub struct TcpPartition {
    pub id: PartitionId,
    pub storage: Arc<TestStorage>,
    pub endpoint: String,
    handle: Option<ServerHandle>,
}

impl TcpPartition {
    pub fn spawn(id: &str) -> Self {
        let storage = Arc::new(TestStorage::new());
        let handle = StorageServer::new(
            Arc::clone(&storage) as Arc<dyn CrdtStorage<TestKey, TestState>>,
            JsonCodec,
            ServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                max_frame_bytes: MAX_FRAME,
                io_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_secs(5),
                max_connections: 16,
            },
        )
        .start()
        .expect("start partition server");
        let endpoint = handle.local_addr().to_string();
        Self {
            id: PartitionId::new(id),
            storage,
            endpoint,
            handle: Some(handle),
        }
    }

    /// Stop serving; in-flight sessions abort at their next frame.
    pub fn kill(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

impl Drop for TcpPartition {
    fn drop(&mut self) {
        self.kill();
    }
}

pub fn test_pool() -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(PoolConfig {
        connect_timeout: Duration::from_millis(500),
        io_timeout: Duration::from_secs(2),
        keep_alive: Duration::from_secs(30),
    }))
}

/// A cluster client routing to the given TCP partitions.
pub fn cluster_over(
    partitions: &[&TcpPartition],
    replicas: usize,
    quorum: Quorum,
    pool: Arc<ConnectionPool>,
) -> Arc<TestCluster> {
    let scheme = PartitionScheme::new(
        partitions
            .iter()
            .map(|p| (p.id.clone(), PartitionAddr::Remote(p.endpoint.clone())))
            .collect::<BTreeMap<_, _>>(),
    );
    let provider: StorageProvider<TestKey, TestState> = {
        let pool = Arc::clone(&pool);
        Arc::new(move |_id, addr| match addr {
            PartitionAddr::Local => unreachable!("tcp rigs have no local partition"),
            PartitionAddr::Remote(endpoint) => Arc::new(RemoteStorage::new(
                endpoint.clone(),
                Arc::clone(&pool),
                JsonCodec,
                CompressionMethod::None,
                MAX_FRAME,
            )),
        })
    };
    Arc::new(ClusterStorage::new(
        scheme,
        provider,
        ClusterConfig { replicas, quorum },
        Arc::new(PartitionTable::new(Duration::from_secs(60))),
    ))
}
