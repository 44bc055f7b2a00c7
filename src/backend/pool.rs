//! Per-worker connection pool.
//!
//! One pool instance lives on each worker and is shared by the sessions
//! pinned there; all operations run on the owning worker thread. Per
//! server the pool tracks the idle connections, the endpoints waiting for
//! a slot and the in-use count. The invariant `in_use + idle <=
//! max_connections` is physical: a waiting endpoint holds nothing.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::PoolConfig;
use crate::topology::ServerId;

use super::connection::BackendConnection;

/// What a waiting endpoint receives when the pool wakes it
pub enum Grant {
    /// A released connection, handed off directly
    Pooled(BackendConnection),
    /// Permission to dial a new connection; the slot is already accounted
    Dial,
}

/// Outcome of asking the pool for a connection slot
pub enum Acquire {
    /// An idle connection was available
    Ready(BackendConnection),
    /// A slot was free; dial a new connection
    Dial,
    /// The cap is reached; wait for a grant (FIFO)
    Wait(oneshot::Receiver<Grant>),
}

struct ParkedConn {
    conn: BackendConnection,
    pooled_at: Instant,
}

#[derive(Default)]
struct ServerPool {
    idle: VecDeque<ParkedConn>,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    in_use: usize,
}

/// Pool of idle backend connections, keyed by server
pub struct ConnectionPool {
    config: PoolConfig,
    pools: RefCell<HashMap<ServerId, ServerPool>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: RefCell::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Ask for a connection to `server`. Never blocks; a `Wait` outcome
    /// carries the receiver the endpoint must await.
    pub fn acquire(&self, server: ServerId) -> Acquire {
        let mut pools = self.pools.borrow_mut();
        let pool = pools.entry(server).or_default();

        // Reuse an idle connection when one is still fresh enough
        while let Some(parked) = pool.idle.pop_front() {
            if self.expired(&parked) || parked.conn.is_broken() {
                debug!(server = %server, "Discarding stale pooled connection");
                continue;
            }
            let mut conn = parked.conn;
            conn.mark_pooled_reuse();
            pool.in_use += 1;
            return Acquire::Ready(conn);
        }

        if self.has_capacity(pool) {
            pool.in_use += 1;
            return Acquire::Dial;
        }

        let (tx, rx) = oneshot::channel();
        pool.waiters.push_back(tx);
        Acquire::Wait(rx)
    }

    /// Return a connection whose endpoint is done with it. With a waiter
    /// present the connection is handed off directly and stays in use;
    /// otherwise it is parked if `poolable` and capacity allows.
    pub fn release(&self, server: ServerId, conn: BackendConnection, poolable: bool) {
        let mut pools = self.pools.borrow_mut();
        let pool = pools.entry(server).or_default();

        if poolable && !conn.is_broken() {
            let mut conn = conn;
            if let Some(waiter) = Self::next_waiter(pool) {
                conn.mark_pooled_reuse();
                // Hand-off: the slot moves from one endpoint to another
                match waiter.send(Grant::Pooled(conn)) {
                    Ok(()) => return,
                    // Receiver vanished after the liveness check; park the
                    // connection instead
                    Err(Grant::Pooled(returned)) => conn = returned,
                    Err(Grant::Dial) => return,
                }
            }

            pool.in_use = pool.in_use.saturating_sub(1);
            if pool.idle.len() < self.config.persist_pool_max {
                pool.idle.push_back(ParkedConn {
                    conn,
                    pooled_at: Instant::now(),
                });
                debug!(server = %server, idle = pool.idle.len(), "Pooled connection");
                return;
            }
            debug!(server = %server, "Pool full, closing connection");
            return;
        }

        // Unpoolable close: the slot is freed, the next waiter may dial
        drop(conn);
        Self::slot_freed(pool);
    }

    /// A dial permitted by `Acquire::Dial` or `Grant::Dial` failed;
    /// give the slot back
    pub fn dial_failed(&self, server: ServerId) {
        let mut pools = self.pools.borrow_mut();
        let pool = pools.entry(server).or_default();
        Self::slot_freed(pool);
    }

    fn slot_freed(pool: &mut ServerPool) {
        pool.in_use = pool.in_use.saturating_sub(1);
        if let Some(waiter) = Self::next_waiter(pool) {
            pool.in_use += 1;
            if waiter.send(Grant::Dial).is_err() {
                pool.in_use = pool.in_use.saturating_sub(1);
            }
        }
    }

    fn next_waiter(pool: &mut ServerPool) -> Option<oneshot::Sender<Grant>> {
        while let Some(waiter) = pool.waiters.pop_front() {
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    fn has_capacity(&self, pool: &ServerPool) -> bool {
        self.config.max_connections == 0
            || pool.in_use + pool.idle.len() < self.config.max_connections
    }

    fn expired(&self, parked: &ParkedConn) -> bool {
        parked.pooled_at.elapsed() >= self.config.persist_max_time()
    }

    /// Close idle connections past their maximum age. Run from a worker
    /// delayed call at `persist_max_time / 10` granularity.
    pub fn sweep_expired(&self) {
        let mut pools = self.pools.borrow_mut();
        for (server, pool) in pools.iter_mut() {
            let before = pool.idle.len();
            pool.idle.retain(|parked| {
                !(parked.pooled_at.elapsed() >= self.config.persist_max_time())
            });
            let dropped = before - pool.idle.len();
            if dropped > 0 {
                debug!(server = %server, dropped, "Swept expired pooled connections");
            }
        }
    }

    pub fn idle_count(&self, server: ServerId) -> usize {
        self.pools
            .borrow()
            .get(&server)
            .map(|p| p.idle.len())
            .unwrap_or(0)
    }

    pub fn in_use_count(&self, server: ServerId) -> usize {
        self.pools
            .borrow()
            .get(&server)
            .map(|p| p.in_use)
            .unwrap_or(0)
    }

    pub fn waiter_count(&self, server: ServerId) -> usize {
        self.pools
            .borrow()
            .get(&server)
            .map(|p| p.waiters.len())
            .unwrap_or(0)
    }
}
