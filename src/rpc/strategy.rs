//! Thin request-routing fronts over the storage interface: dispatch by
//! request type, first available sender, or shard by request key.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use xxhash_rust::xxh3::Xxh3;

use crate::cluster::DiscoveryService;
use crate::core::{Crdt, Key, Record, Stamp, Tombstone};
use crate::storage::{CrdtStorage, StorageError};

#[derive(Clone, Debug)]
pub enum RpcRequest<K, S> {
    Upload(Vec<Record<K, S>>),
    Download { since: Option<Stamp> },
    Remove(Vec<Tombstone<K>>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Upload,
    Download,
    Remove,
}

impl<K, S> RpcRequest<K, S> {
    pub fn kind(&self) -> RequestKind {
        match self {
            RpcRequest::Upload(_) => RequestKind::Upload,
            RpcRequest::Download { .. } => RequestKind::Download,
            RpcRequest::Remove(_) => RequestKind::Remove,
        }
    }

    /// The key a sharding strategy routes on: the first key in the batch.
    pub fn shard_key(&self) -> Option<&K> {
        match self {
            RpcRequest::Upload(records) => records.first().map(|r| &r.key),
            RpcRequest::Remove(tombstones) => tombstones.first().map(|t| &t.key),
            RpcRequest::Download { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum RpcResponse<K, S> {
    Uploaded,
    Records(Vec<Record<K, S>>),
    Removed,
}

pub trait RpcSender<K, S>: Send + Sync {
    fn send(&self, request: RpcRequest<K, S>) -> Result<RpcResponse<K, S>, StorageError>;
}

/// A strategy yields a sender when it has somewhere to route to, and exposes
/// the discovery services beneath it so topology changes propagate.
pub trait RpcStrategy<K, S>: Send + Sync {
    fn sender(&self) -> Option<Arc<dyn RpcSender<K, S>>>;

    fn discovery(&self) -> Vec<Arc<dyn DiscoveryService>>;
}

/// The leaf strategy: a storage handle (usually the cluster) plus its
/// discovery.
pub struct StorageStrategy<K, S> {
    storage: Arc<dyn CrdtStorage<K, S>>,
    discovery: Vec<Arc<dyn DiscoveryService>>,
}

impl<K, S> StorageStrategy<K, S> {
    pub fn new(
        storage: Arc<dyn CrdtStorage<K, S>>,
        discovery: Vec<Arc<dyn DiscoveryService>>,
    ) -> Self {
        Self { storage, discovery }
    }
}

struct StorageSender<K, S> {
    storage: Arc<dyn CrdtStorage<K, S>>,
}

impl<K: Key, S: Crdt> RpcSender<K, S> for StorageSender<K, S> {
    fn send(&self, request: RpcRequest<K, S>) -> Result<RpcResponse<K, S>, StorageError> {
        match request {
            RpcRequest::Upload(records) => {
                let mut sink = self.storage.upload()?;
                for record in records {
                    sink.accept(record)?;
                }
                sink.complete()?;
                Ok(RpcResponse::Uploaded)
            }
            RpcRequest::Download { since } => {
                let records = self
                    .storage
                    .download(since)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RpcResponse::Records(records))
            }
            RpcRequest::Remove(tombstones) => {
                let mut sink = self.storage.remove()?;
                for tombstone in tombstones {
                    sink.accept(tombstone)?;
                }
                sink.complete()?;
                Ok(RpcResponse::Removed)
            }
        }
    }
}

impl<K: Key, S: Crdt> RpcStrategy<K, S> for StorageStrategy<K, S> {
    fn sender(&self) -> Option<Arc<dyn RpcSender<K, S>>> {
        Some(Arc::new(StorageSender {
            storage: Arc::clone(&self.storage),
        }))
    }

    fn discovery(&self) -> Vec<Arc<dyn DiscoveryService>> {
        self.discovery.clone()
    }
}

/// Route by request type; unknown types fall back to the default.
pub struct TypeDispatching<K, S> {
    routes: HashMap<RequestKind, Box<dyn RpcStrategy<K, S>>>,
    fallback: Option<Box<dyn RpcStrategy<K, S>>>,
}

impl<K, S> TypeDispatching<K, S> {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: None,
        }
    }

    pub fn on(mut self, kind: RequestKind, strategy: Box<dyn RpcStrategy<K, S>>) -> Self {
        self.routes.insert(kind, strategy);
        self
    }

    pub fn fallback(mut self, strategy: Box<dyn RpcStrategy<K, S>>) -> Self {
        self.fallback = Some(strategy);
        self
    }
}

impl<K, S> Default for TypeDispatching<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

struct DispatchSender<K, S> {
    routes: HashMap<RequestKind, Arc<dyn RpcSender<K, S>>>,
    fallback: Option<Arc<dyn RpcSender<K, S>>>,
}

impl<K: Key, S: Crdt> RpcSender<K, S> for DispatchSender<K, S> {
    fn send(&self, request: RpcRequest<K, S>) -> Result<RpcResponse<K, S>, StorageError> {
        let sender = self
            .routes
            .get(&request.kind())
            .or(self.fallback.as_ref())
            .ok_or_else(|| StorageError::Unavailable {
                message: format!("no route for {:?} requests", request.kind()),
            })?;
        sender.send(request)
    }
}

impl<K: Key, S: Crdt> RpcStrategy<K, S> for TypeDispatching<K, S> {
    fn sender(&self) -> Option<Arc<dyn RpcSender<K, S>>> {
        let mut routes = HashMap::new();
        for (kind, strategy) in &self.routes {
            routes.insert(*kind, strategy.sender()?);
        }
        let fallback = match &self.fallback {
            Some(strategy) => Some(strategy.sender()?),
            None => None,
        };
        if routes.is_empty() && fallback.is_none() {
            return None;
        }
        Some(Arc::new(DispatchSender { routes, fallback }))
    }

    fn discovery(&self) -> Vec<Arc<dyn DiscoveryService>> {
        let mut services = Vec::new();
        for strategy in self.routes.values() {
            services.extend(strategy.discovery());
        }
        if let Some(fallback) = &self.fallback {
            services.extend(fallback.discovery());
        }
        services
    }
}

/// The first child strategy with a live sender wins.
pub struct FirstAvailable<K, S> {
    children: Vec<Box<dyn RpcStrategy<K, S>>>,
}

impl<K, S> FirstAvailable<K, S> {
    pub fn new(children: Vec<Box<dyn RpcStrategy<K, S>>>) -> Self {
        Self { children }
    }
}

impl<K: Key, S: Crdt> RpcStrategy<K, S> for FirstAvailable<K, S> {
    fn sender(&self) -> Option<Arc<dyn RpcSender<K, S>>> {
        self.children.iter().find_map(|child| child.sender())
    }

    fn discovery(&self) -> Vec<Arc<dyn DiscoveryService>> {
        self.children
            .iter()
            .flat_map(|child| child.discovery())
            .collect()
    }
}

/// Hash the request key over the child list; a shard without a sender fails
/// the request rather than silently rerouting it.
pub struct ShardingByKey<K, S> {
    children: Vec<Box<dyn RpcStrategy<K, S>>>,
}

impl<K, S> ShardingByKey<K, S> {
    pub fn new(children: Vec<Box<dyn RpcStrategy<K, S>>>) -> Self {
        Self { children }
    }
}

struct ShardSender<K, S> {
    senders: Vec<Option<Arc<dyn RpcSender<K, S>>>>,
}

impl<K: Key, S: Crdt> RpcSender<K, S> for ShardSender<K, S> {
    fn send(&self, request: RpcRequest<K, S>) -> Result<RpcResponse<K, S>, StorageError> {
        let Some(key) = request.shard_key() else {
            return Err(StorageError::Rejected {
                message: "request carries no shard key".to_string(),
            });
        };
        let mut hasher = Xxh3::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.senders.len() as u64) as usize;
        match &self.senders[index] {
            Some(sender) => sender.send(request),
            None => Err(StorageError::Unavailable {
                message: format!("shard {index} has no sender"),
            }),
        }
    }
}

impl<K: Key, S: Crdt> RpcStrategy<K, S> for ShardingByKey<K, S> {
    fn sender(&self) -> Option<Arc<dyn RpcSender<K, S>>> {
        if self.children.is_empty() {
            return None;
        }
        Some(Arc::new(ShardSender {
            senders: self.children.iter().map(|child| child.sender()).collect(),
        }))
    }

    fn discovery(&self) -> Vec<Arc<dyn DiscoveryService>> {
        self.children
            .iter()
            .flat_map(|child| child.discovery())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GSet;
    use crate::storage::MapStorage;

    type Req = RpcRequest<i64, GSet<i32>>;

    fn storage_strategy() -> (Arc<MapStorage<i64, GSet<i32>>>, Box<dyn RpcStrategy<i64, GSet<i32>>>)
    {
        let storage = Arc::new(MapStorage::new());
        let strategy = StorageStrategy::new(
            Arc::clone(&storage) as Arc<dyn CrdtStorage<i64, GSet<i32>>>,
            Vec::new(),
        );
        (storage, Box::new(strategy))
    }

    struct NoSender;
    impl RpcStrategy<i64, GSet<i32>> for NoSender {
        fn sender(&self) -> Option<Arc<dyn RpcSender<i64, GSet<i32>>>> {
            None
        }
        fn discovery(&self) -> Vec<Arc<dyn DiscoveryService>> {
            Vec::new()
        }
    }

    #[test]
    fn storage_sender_round_trips() {
        let (storage, strategy) = storage_strategy();
        let sender = strategy.sender().unwrap();

        let response = sender
            .send(Req::Upload(vec![Record::new(
                1,
                GSet::of([1]),
                Stamp::new(1),
            )]))
            .unwrap();
        assert!(matches!(response, RpcResponse::Uploaded));
        assert_eq!(storage.live_len(), 1);

        match sender.send(Req::Download { since: None }).unwrap() {
            RpcResponse::Records(records) => assert_eq!(records.len(), 1),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn type_dispatch_prefers_the_routed_strategy() {
        let (upload_storage, upload_strategy) = storage_strategy();
        let (fallback_storage, fallback_strategy) = storage_strategy();
        let dispatch = TypeDispatching::new()
            .on(RequestKind::Upload, upload_strategy)
            .fallback(fallback_strategy);

        let sender = dispatch.sender().unwrap();
        sender
            .send(Req::Upload(vec![Record::new(1, GSet::of([1]), Stamp::new(1))]))
            .unwrap();
        sender
            .send(Req::Remove(vec![Tombstone::new(9, Stamp::new(1))]))
            .unwrap();

        assert_eq!(upload_storage.live_len(), 1);
        // The remove went through the fallback, not the upload route.
        assert_eq!(fallback_storage.live_len(), 0);
    }

    #[test]
    fn first_available_skips_dead_children() {
        let (storage, live) = storage_strategy();
        let chain = FirstAvailable::new(vec![Box::new(NoSender), live]);
        let sender = chain.sender().unwrap();
        sender
            .send(Req::Upload(vec![Record::new(3, GSet::of([3]), Stamp::new(1))]))
            .unwrap();
        assert_eq!(storage.live_len(), 1);
    }

    #[test]
    fn first_available_with_no_children_has_no_sender() {
        let chain: FirstAvailable<i64, GSet<i32>> = FirstAvailable::new(vec![Box::new(NoSender)]);
        assert!(chain.sender().is_none());
    }

    #[test]
    fn sharding_routes_consistently_and_fails_on_missing_shards() {
        let (left_storage, left) = storage_strategy();
        let (right_storage, right) = storage_strategy();
        let sharded = ShardingByKey::new(vec![left, right]);
        let sender = sharded.sender().unwrap();

        for key in 0..32i64 {
            sender
                .send(Req::Upload(vec![Record::new(
                    key,
                    GSet::of([key as i32]),
                    Stamp::new(1),
                )]))
                .unwrap();
        }
        assert_eq!(left_storage.live_len() + right_storage.live_len(), 32);
        assert!(left_storage.live_len() > 0);
        assert!(right_storage.live_len() > 0);

        let gappy = ShardingByKey::new(vec![
            Box::new(NoSender),
            Box::new(NoSender),
        ]);
        let sender = gappy.sender().unwrap();
        let mut saw_unavailable = false;
        for key in 0..8i64 {
            if matches!(
                sender.send(Req::Upload(vec![Record::new(
                    key,
                    GSet::of([1]),
                    Stamp::new(1)
                )])),
                Err(StorageError::Unavailable { .. })
            ) {
                saw_unavailable = true;
            }
        }
        assert!(saw_unavailable);

        assert!(matches!(
            sender.send(Req::Download { since: None }),
            Err(StorageError::Rejected { .. })
        ));
    }
}
