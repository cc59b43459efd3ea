//! The connection pool.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::time::Duration;
use tokio::time::Instant;

use crate::Connection;
use crate::Endpoint;

/// Configuration for the connection pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// The capacity of the pool for any single endpoint.
    pub max_connections_per_endpoint: usize,
    /// Pooled connections idle past this bound are closed by `cleanup_idle`.
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: 8,
            max_idle: Duration::from_secs(60),
        }
    }
}

struct PooledConnection {
    conn: Connection,
    last_used: Instant,
}

/// A per-endpoint pool of idle connections with LRU eviction on overflow.
///
/// Higher-level clients built atop the simulator check connections in after use; a checkout
/// hands back the most recently used connection. When an endpoint's pool is at capacity, the
/// least recently used connection is evicted and closed to make room.
pub struct ConnectionPool {
    config: Mutex<PoolConfig>,
    pools: Mutex<HashMap<Endpoint, VecDeque<PooledConnection>>>,
}

impl ConnectionPool {
    pub(crate) fn new() -> Self {
        Self {
            config: Mutex::new(PoolConfig::default()),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the pool configuration. Existing pools over the new capacity are trimmed, oldest
    /// first.
    pub fn configure(&self, config: PoolConfig) {
        *self.config.lock().unwrap() = config;
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.values_mut() {
            while pool.len() > config.max_connections_per_endpoint {
                if let Some(evicted) = pool.pop_front() {
                    evicted.conn.close();
                }
            }
        }
    }

    /// Check a connection in for reuse.
    ///
    /// A connection which is no longer open is discarded rather than pooled. If the endpoint's
    /// pool is full, the least recently used pooled connection is evicted and closed.
    pub fn checkin(&self, conn: Connection) {
        if !conn.is_open() {
            return;
        }
        let capacity = self.config.lock().unwrap().max_connections_per_endpoint;
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.entry(conn.peer().clone()).or_default();
        // Pools are kept ordered least recently used first.
        pool.push_back(PooledConnection {
            conn,
            last_used: Instant::now(),
        });
        while pool.len() > capacity {
            if let Some(evicted) = pool.pop_front() {
                tracing::trace!(peer=%evicted.conn.peer(), "evicting least recently used pooled connection");
                evicted.conn.close();
            }
        }
    }

    /// Check out the most recently used open connection for the endpoint, if any.
    pub fn checkout(&self, endpoint: &Endpoint) -> Option<Connection> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(endpoint)?;
        while let Some(pooled) = pool.pop_back() {
            if pooled.conn.is_open() {
                return Some(pooled.conn);
            }
            // Closed out from under the pool; skip past it.
        }
        None
    }

    /// The number of idle connections pooled for the endpoint.
    pub fn size(&self, endpoint: &Endpoint) -> usize {
        self.pools.lock().unwrap().get(endpoint).map(|pool| pool.len()).unwrap_or(0)
    }

    /// Close & drop pooled connections which have sat idle past the configured bound.
    pub fn cleanup_idle(&self) {
        let max_idle = self.config.lock().unwrap().max_idle;
        let now = Instant::now();
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.values_mut() {
            pool.retain(|pooled| {
                let stale = now.duration_since(pooled.last_used) > max_idle;
                if stale {
                    pooled.conn.close();
                }
                !stale
            });
        }
        pools.retain(|_, pool| !pool.is_empty());
    }

    /// Close & drop every pooled connection.
    pub(crate) fn clear(&self) {
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.values_mut() {
            for pooled in pool.iter() {
                pooled.conn.close();
            }
        }
        pools.clear();
    }
}
