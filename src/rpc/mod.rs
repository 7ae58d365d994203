//! Request-level routing strategies composed over cluster storage.

pub mod strategy;

pub use strategy::{
    FirstAvailable, RequestKind, RpcRequest, RpcResponse, RpcSender, RpcStrategy, ShardingByKey,
    StorageStrategy, TypeDispatching,
};
