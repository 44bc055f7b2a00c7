pub mod connection;
pub mod endpoint;
pub mod pool;

pub use connection::{BackendConnection, BackendStream, ConnectionError, Connector, TcpConnector};
pub use endpoint::{Endpoint, EndpointState};
pub use pool::{Acquire, ConnectionPool, Grant};

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::topology::ServerId;

/// Cross-worker per-server counters used by the slave-selection criteria.
/// Relaxed atomics: the numbers steer load balancing, they are not
/// invariants.
#[derive(Default)]
pub struct ServerCounters {
    servers: Mutex<HashMap<ServerId, Arc<Counter>>>,
}

#[derive(Default)]
pub struct Counter {
    /// Open connections across the whole proxy
    connections: AtomicI64,
    /// Statements currently awaiting a reply
    current_ops: AtomicI64,
    /// Sessions of this router with a connection to the server
    router_connections: AtomicI64,
    /// Exponentially-weighted average response time, in microseconds
    avg_response_micros: AtomicU64,
}

impl ServerCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter(&self, server: ServerId) -> Arc<Counter> {
        self.servers.lock().entry(server).or_default().clone()
    }
}

impl Counter {
    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.router_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
        self.router_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn op_started(&self) {
        self.current_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn op_finished(&self, took: Duration) {
        self.current_ops.fetch_sub(1, Ordering::Relaxed);

        // EWMA with 1/8 gain, the usual smoothing for RTT-like figures
        let sample = took.as_micros() as u64;
        let prev = self.avg_response_micros.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            prev - prev / 8 + sample / 8
        };
        self.avg_response_micros.store(next, Ordering::Relaxed);
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn current_ops(&self) -> i64 {
        self.current_ops.load(Ordering::Relaxed)
    }

    pub fn router_connections(&self) -> i64 {
        self.router_connections.load(Ordering::Relaxed)
    }

    pub fn avg_response(&self) -> Duration {
        Duration::from_micros(self.avg_response_micros.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_ops() {
        let counters = ServerCounters::new();
        let counter = counters.counter(ServerId(1));

        counter.connection_opened();
        counter.op_started();
        assert_eq!(counter.connections(), 1);
        assert_eq!(counter.current_ops(), 1);

        counter.op_finished(Duration::from_micros(800));
        assert_eq!(counter.current_ops(), 0);
        assert_eq!(counter.avg_response(), Duration::from_micros(800));

        // Same counter instance is returned for the same server
        let again = counters.counter(ServerId(1));
        assert_eq!(again.connections(), 1);
        counter.connection_closed();
        assert_eq!(again.connections(), 0);
    }

    #[test]
    fn test_response_average_smooths() {
        let counter = Counter::default();
        counter.op_started();
        counter.op_finished(Duration::from_micros(1000));
        counter.op_started();
        counter.op_finished(Duration::from_micros(2000));

        let avg = counter.avg_response().as_micros();
        assert!(avg > 1000 && avg < 2000);
    }
}
