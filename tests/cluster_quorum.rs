//! Quorum writes over real sockets: R = 3, W = 2.

mod fixtures;

use lattice::cluster::Quorum;
use lattice::core::GSet;
use lattice::storage::{CrdtStorage, StorageError};

use fixtures::{TcpPartition, cluster_over, download_all, record, test_pool, upload_all};

#[test]
fn one_dead_peer_is_tolerated_two_are_exhausted() {
    let mut a = TcpPartition::spawn("a");
    let mut b = TcpPartition::spawn("b");
    let c = TcpPartition::spawn("c");
    let pool = test_pool();
    let cluster = cluster_over(&[&a, &b, &c], 3, Quorum::Fixed(2), pool.clone());

    // Kill one of three peers mid-upload: the session opened, then dies
    // before the stream completes.
    let mut sink = cluster.upload().unwrap();
    sink.accept(record(1, &[1, 2], 1)).unwrap();
    a.kill();
    sink.accept(record(1, &[3], 2)).unwrap();
    sink.complete().unwrap();

    // Both surviving replicas hold the state.
    assert_eq!(download_all(b.storage.as_ref()).len(), 1);
    assert_eq!(download_all(c.storage.as_ref()).len(), 1);

    // Kill a second peer: quorum is out of reach.
    b.kill();
    let mut sink = cluster.upload().unwrap();
    sink.accept(record(2, &[9], 3)).unwrap();
    match sink.complete() {
        Err(StorageError::Exhausted {
            required,
            acked,
            attempted,
        }) => {
            assert_eq!(required, 2);
            assert_eq!(acked, 1);
            let named: Vec<String> = attempted.iter().map(|(p, _)| p.to_string()).collect();
            assert!(named.contains(&"a".to_string()), "attempted: {named:?}");
            assert!(named.contains(&"b".to_string()), "attempted: {named:?}");
        }
        other => panic!("expected exhausted, got {other:?}"),
    }

    pool.close();
}

#[test]
fn upload_reaches_every_live_replica() {
    let a = TcpPartition::spawn("a");
    let b = TcpPartition::spawn("b");
    let c = TcpPartition::spawn("c");
    let pool = test_pool();
    let cluster = cluster_over(&[&a, &b, &c], 3, Quorum::Strict, pool.clone());

    upload_all(
        cluster.as_ref(),
        vec![record(1, &[1], 1), record(2, &[2], 2), record(3, &[3], 3)],
    );

    for partition in [&a, &b, &c] {
        assert_eq!(download_all(partition.storage.as_ref()).len(), 3);
    }

    let merged = download_all(cluster.as_ref());
    assert_eq!(merged.len(), 3);
    assert_eq!(merged[0].state, GSet::of([1]));

    pool.close();
}

#[test]
fn download_tolerates_r_minus_w_dead_peers() {
    let a = TcpPartition::spawn("a");
    let b = TcpPartition::spawn("b");
    let mut c = TcpPartition::spawn("c");
    let pool = test_pool();
    let cluster = cluster_over(&[&a, &b, &c], 3, Quorum::Fixed(2), pool.clone());

    upload_all(cluster.as_ref(), vec![record(7, &[70, 71], 1)]);

    c.kill();
    cluster.partitions().mark_dead(&c.id);
    let records = download_all(cluster.as_ref());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, GSet::of([70, 71]));

    cluster.partitions().mark_dead(&b.id);
    assert!(matches!(
        cluster.download(None),
        Err(StorageError::Exhausted { .. })
    ));

    pool.close();
}

#[test]
fn removes_succeed_on_w_acks() {
    let a = TcpPartition::spawn("a");
    let b = TcpPartition::spawn("b");
    let mut c = TcpPartition::spawn("c");
    let pool = test_pool();
    let cluster = cluster_over(&[&a, &b, &c], 3, Quorum::Fixed(2), pool.clone());

    upload_all(cluster.as_ref(), vec![record(1, &[1], 1)]);
    c.kill();

    let mut sink = cluster.remove().unwrap();
    sink.accept(lattice::core::Tombstone::new(1, lattice::core::Stamp::new(9)))
        .unwrap();
    sink.complete().unwrap();

    assert!(download_all(a.storage.as_ref()).is_empty());
    assert!(download_all(b.storage.as_ref()).is_empty());

    pool.close();
}
