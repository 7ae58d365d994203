//! Outbound connection pool.
//!
//! Idle connections live in an arena of slots keyed by connection id, with a
//! per-endpoint index into it; checked-out connections are only counted. On
//! close the idle side is dropped immediately and the close blocks until the
//! last in-use connection has drained back.

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::storage::StorageError;

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            io_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// A checked-out connection. Return it with [`ConnectionPool::check_in`] when
/// the session ended cleanly, or drop it and call
/// [`ConnectionPool::release_broken`].
#[derive(Debug)]
pub struct PooledStream {
    pub endpoint: String,
    pub stream: TcpStream,
}

struct IdleConn {
    endpoint: String,
    stream: TcpStream,
    since: Instant,
}

#[derive(Default)]
struct PoolInner {
    slots: Vec<Option<IdleConn>>,
    free: Vec<usize>,
    idle_by_endpoint: HashMap<String, Vec<usize>>,
    in_use: usize,
    closed: bool,
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    drained: Condvar,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            drained: Condvar::new(),
            config,
        }
    }

    /// Reuse a fresh idle connection to `endpoint` or dial a new one.
    /// Idle connections past the keep-alive age are dropped on the way.
    pub fn check_out(&self, endpoint: &str) -> Result<PooledStream, StorageError> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            if inner.closed {
                return Err(StorageError::Shutdown);
            }
            while let Some(id) = inner
                .idle_by_endpoint
                .get_mut(endpoint)
                .and_then(|ids| ids.pop())
            {
                let Some(conn) = inner.slots[id].take() else {
                    continue;
                };
                inner.free.push(id);
                if conn.since.elapsed() >= self.config.keep_alive {
                    // Expired while idle; the peer has likely dropped it too.
                    continue;
                }
                inner.in_use += 1;
                return Ok(PooledStream {
                    endpoint: conn.endpoint,
                    stream: conn.stream,
                });
            }
            inner.in_use += 1;
        }

        match self.connect(endpoint) {
            Ok(stream) => Ok(PooledStream {
                endpoint: endpoint.to_string(),
                stream,
            }),
            Err(err) => {
                self.release_broken();
                Err(StorageError::Transport {
                    endpoint: endpoint.to_string(),
                    source: err,
                })
            }
        }
    }

    fn connect(&self, endpoint: &str) -> std::io::Result<TcpStream> {
        let addr = endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {endpoint}"),
                )
            })?;
        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        stream.set_read_timeout(Some(self.config.io_timeout))?;
        stream.set_write_timeout(Some(self.config.io_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Return a connection whose session ended cleanly.
    pub fn check_in(&self, conn: PooledStream) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.in_use = inner.in_use.saturating_sub(1);
        if !inner.closed {
            let idle = IdleConn {
                endpoint: conn.endpoint.clone(),
                stream: conn.stream,
                since: Instant::now(),
            };
            let id = match inner.free.pop() {
                Some(id) => {
                    inner.slots[id] = Some(idle);
                    id
                }
                None => {
                    inner.slots.push(Some(idle));
                    inner.slots.len() - 1
                }
            };
            inner
                .idle_by_endpoint
                .entry(conn.endpoint)
                .or_default()
                .push(id);
        }
        if inner.in_use == 0 {
            self.drained.notify_all();
        }
    }

    /// Account for a checked-out connection that was dropped instead of
    /// returned.
    pub fn release_broken(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.in_use = inner.in_use.saturating_sub(1);
        if inner.in_use == 0 {
            self.drained.notify_all();
        }
    }

    /// Drop every idle connection, refuse new checkouts, and wait for the
    /// in-use ones to drain.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.closed = true;
        inner.slots.clear();
        inner.free.clear();
        inner.idle_by_endpoint.clear();
        while inner.in_use > 0 {
            inner = self
                .drained
                .wait(inner)
                .unwrap_or_else(|err| err.into_inner());
        }
    }

    pub fn idle_len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn in_use_len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pool_with_keep_alive(keep_alive: Duration) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_secs(1),
            keep_alive,
        })
    }

    #[test]
    fn connections_are_reused_after_check_in() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let pool = pool_with_keep_alive(Duration::from_secs(60));

        let conn = pool.check_out(&endpoint).unwrap();
        assert_eq!(pool.in_use_len(), 1);
        pool.check_in(conn);
        assert_eq!(pool.in_use_len(), 0);
        assert_eq!(pool.idle_len(), 1);

        let _conn = pool.check_out(&endpoint).unwrap();
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn expired_idle_connections_are_not_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let pool = pool_with_keep_alive(Duration::from_millis(0));

        let conn = pool.check_out(&endpoint).unwrap();
        pool.check_in(conn);
        assert_eq!(pool.idle_len(), 1);
        // Zero keep-alive: the idle connection is already expired, so this
        // checkout dials fresh and the stale slot is gone.
        let _conn = pool.check_out(&endpoint).unwrap();
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn close_refuses_new_checkouts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let pool = pool_with_keep_alive(Duration::from_secs(60));
        let conn = pool.check_out(&endpoint).unwrap();
        pool.check_in(conn);

        pool.close();
        assert!(matches!(
            pool.check_out(&endpoint),
            Err(StorageError::Shutdown)
        ));
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn close_waits_for_in_use_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let pool = std::sync::Arc::new(pool_with_keep_alive(Duration::from_secs(60)));

        let conn = pool.check_out(&endpoint).unwrap();
        let background = {
            let pool = std::sync::Arc::clone(&pool);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                drop(conn);
                pool.release_broken();
            })
        };
        pool.close();
        assert_eq!(pool.in_use_len(), 0);
        background.join().unwrap();
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_error() {
        let pool = pool_with_keep_alive(Duration::from_secs(60));
        // Reserved TEST-NET address; nothing listens there.
        let err = pool.check_out("192.0.2.1:9").unwrap_err();
        assert!(matches!(err, StorageError::Transport { .. }));
        assert_eq!(pool.in_use_len(), 0);
    }
}
