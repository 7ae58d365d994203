//! TCP transport: the storage protocol spoken between nodes, the connection
//! pool behind outbound sessions, and the server that answers them.

pub mod client;
pub mod pool;
pub mod server;

pub use client::RemoteStorage;
pub use pool::{ConnectionPool, PoolConfig, PooledStream};
pub use server::{ServerConfig, ServerHandle, StorageServer};
