//! Read/write-split routing.
//!
//! The resolver turns a classified statement plus the topology snapshot
//! and the session's transactional context into a `RoutingPlan`; the
//! selection module picks among eligible slaves.

pub mod resolver;
pub mod selection;

pub use resolver::{resolve, RouteInput};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::ServerCounters;
use crate::topology::ServerId;

/// Where a statement is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    Master,
    Slave,
    /// Broadcast to every live backend; only the primary's reply reaches
    /// the client
    All,
    /// The server the previous statement used
    Last,
}

/// Why the plan chose its mode; used for logging and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCause {
    Read,
    Write,
    SessionWrite,
    TrxActive,
    ReadOnlyTrx,
    LockedToMaster,
    Hint,
    MultiStatement,
    StoredProcedure,
    PreparedStatement,
    MasterFunction,
    TmpTableRead,
    Unclassified,
}

/// The routing decision for one statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingPlan {
    /// Chosen backend; None when no acceptable target exists (mapped
    /// through `master_failure_mode` by the session)
    pub target: Option<ServerId>,
    pub mode: RouteMode,
    pub cause: RouteCause,
}

/// Routing hints attached to queued statements, e.g. by the causal-read
/// retry path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingHint {
    ToMaster,
    ToSlave,
    ToLast,
}

/// A MariaDB global transaction id: domain-server-sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gtid {
    pub domain: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl Gtid {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().splitn(3, '-');
        Some(Self {
            domain: parts.next()?.parse().ok()?,
            server_id: parts.next()?.parse().ok()?,
            sequence: parts.next()?.parse().ok()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether a server at `other` has replicated at least this position.
    /// Positions from different domains are not comparable.
    pub fn reached_by(&self, other: &Gtid) -> bool {
        self.domain == other.domain && other.sequence >= self.sequence
    }
}

impl std::fmt::Display for Gtid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.sequence)
    }
}

/// Router-wide counters, shared by every session of the service
#[derive(Debug, Default)]
pub struct RouterStats {
    pub n_sessions: AtomicU64,
    pub n_queries: AtomicU64,
    pub n_master: AtomicU64,
    pub n_slave: AtomicU64,
    pub n_all: AtomicU64,
    pub n_trx_replay: AtomicU64,
    pub n_ro_trx: AtomicU64,
    pub n_rw_trx: AtomicU64,
    pub n_ps_reused: AtomicU64,
}

impl RouterStats {
    pub fn record_plan(&self, plan: &RoutingPlan) {
        self.n_queries.fetch_add(1, Ordering::Relaxed);
        match plan.mode {
            RouteMode::Master | RouteMode::Last => self.n_master.fetch_add(1, Ordering::Relaxed),
            RouteMode::Slave => self.n_slave.fetch_add(1, Ordering::Relaxed),
            RouteMode::All => self.n_all.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// State shared by all sessions of one router service
pub struct RouterShared {
    pub stats: RouterStats,
    pub counters: Arc<ServerCounters>,
    /// Service-wide GTID position for causal_reads = global
    last_gtid: Mutex<Option<Gtid>>,
}

impl RouterShared {
    pub fn new(counters: Arc<ServerCounters>) -> Arc<Self> {
        Arc::new(Self {
            stats: RouterStats::default(),
            counters,
            last_gtid: Mutex::new(None),
        })
    }

    pub fn last_gtid(&self) -> Option<Gtid> {
        *self.last_gtid.lock()
    }

    pub fn set_last_gtid(&self, gtid: Gtid) {
        let mut guard = self.last_gtid.lock();
        // Never move the service-wide position backwards
        match *guard {
            Some(current) if current.domain == gtid.domain && current.sequence >= gtid.sequence => {
            }
            _ => *guard = Some(gtid),
        }
    }
}
