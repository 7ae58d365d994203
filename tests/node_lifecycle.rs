//! Whole-node lifecycle: standalone and two-node clusters built from
//! configuration.

use std::net::TcpListener;
use std::sync::Arc;

use lattice::CrdtStorage;
use lattice::cluster::ConstantDiscovery;
use lattice::config::{Config, StorageMode};
use lattice::core::{GSet, JsonCodec};
use lattice::node::Node;
use tempfile::TempDir;

type TestNode = Node<i64, GSet<i32>>;

fn base_config(dir: &TempDir, name: &str) -> Config {
    let mut config = Config::default();
    config.node = name.to_string();
    config.listen_addr = "127.0.0.1:0".to_string();
    config.data_dir = dir.path().join(name);
    config
}

fn start(config: &Config) -> TestNode {
    let discovery = Arc::new(ConstantDiscovery::new(config.scheme()));
    Node::start(config, JsonCodec, discovery).expect("node starts")
}

fn reserve_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn standalone_node_round_trips() {
    let dir = TempDir::new().unwrap();
    let node = start(&base_config(&dir, "solo"));

    node.put(1, GSet::of([1, 2])).unwrap();
    node.put(2, GSet::of([5])).unwrap();
    node.put(1, GSet::of([3])).unwrap();
    node.flush().unwrap();

    let records: Vec<_> = node
        .download(None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].state, GSet::of([1, 2, 3]));

    node.remove([1]).unwrap();
    let records: Vec<_> = node
        .download(None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, 2);

    node.stop().unwrap();
}

#[test]
fn disk_node_keeps_state_across_restarts() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir, "disk");
    config.storage.mode = StorageMode::Disk;

    {
        let node = start(&config);
        node.put(9, GSet::of([90, 91])).unwrap();
        node.flush().unwrap();
        node.stop().unwrap();
    }

    let node = start(&config);
    let records: Vec<_> = node
        .download(None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, GSet::of([90, 91]));
    node.stop().unwrap();
}

#[test]
fn flush_replicates_across_a_two_node_cluster() {
    let dir = TempDir::new().unwrap();
    let port_a = reserve_port();
    let port_b = reserve_port();
    let addr_a = format!("127.0.0.1:{port_a}");
    let addr_b = format!("127.0.0.1:{port_b}");

    let mut config_a = base_config(&dir, "a");
    config_a.listen_addr = addr_a.clone();
    config_a.partitions.insert("a".into(), addr_a.clone());
    config_a.partitions.insert("b".into(), addr_b.clone());
    config_a.replication.replicas = 2;

    let mut config_b = base_config(&dir, "b");
    config_b.listen_addr = addr_b.clone();
    config_b.partitions = config_a.partitions.clone();
    config_b.replication.replicas = 2;

    let node_b = start(&config_b);
    let node_a = start(&config_a);

    node_a.put(1, GSet::of([1])).unwrap();
    node_a.put(2, GSet::of([2])).unwrap();
    node_a.flush().unwrap();

    // Strict quorum over two replicas: both local stores hold both keys.
    assert_eq!(node_a.local_storage().len(), Some(2));
    assert_eq!(node_b.local_storage().len(), Some(2));

    // Either node serves the merged view.
    let via_b: Vec<_> = node_b
        .download(None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(via_b.len(), 2);

    node_a.stop().unwrap();
    node_b.stop().unwrap();
}
