//! Backend topology.
//!
//! The router never probes servers itself; it consumes a read-mostly
//! snapshot of per-server role and reachability that an external monitor
//! (or, in the simplest deployment, the static configuration) publishes.
//! Snapshots are replaced wholesale and observed lock-free; a version
//! counter allows cheap change detection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u32);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Master,
    Slave,
    Unknown,
    /// Being emptied of connections; not eligible for new sessions
    Drained,
    Maintenance,
    Down,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub role: ServerRole,
    /// Servers with a lower rank are preferred; equal ranks compete
    pub rank: i64,
    /// Relative share of read traffic among equally-ranked candidates
    pub weight: u32,
    pub replication_lag: Option<Duration>,
    pub reachable: bool,
    /// Latest replicated GTID position, when the monitor reports one
    pub gtid_pos: Option<String>,
}

impl ServerInfo {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Eligible to receive new statements at all
    pub fn is_usable(&self) -> bool {
        self.reachable
            && matches!(self.role, ServerRole::Master | ServerRole::Slave | ServerRole::Unknown)
    }
}

/// One immutable topology snapshot
#[derive(Debug, Clone, Default)]
pub struct Topology {
    servers: Vec<ServerInfo>,
    version: u64,
}

impl Topology {
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self {
            servers,
            version: 0,
        }
    }

    pub fn from_config(configs: &[ServerConfig]) -> Self {
        let servers = configs
            .iter()
            .enumerate()
            .map(|(i, c)| ServerInfo {
                id: ServerId(i as u32),
                name: c.name.clone(),
                host: c.host.clone(),
                port: c.port,
                role: c.role,
                rank: c.rank,
                weight: c.weight,
                replication_lag: None,
                reachable: true,
                gtid_pos: None,
            })
            .collect();
        Self::new(servers)
    }

    pub fn servers(&self) -> &[ServerInfo] {
        &self.servers
    }

    pub fn get(&self, id: ServerId) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// The current master, if one is known and reachable
    pub fn master(&self) -> Option<ServerId> {
        self.servers
            .iter()
            .find(|s| s.role == ServerRole::Master && s.reachable)
            .map(|s| s.id)
    }

    pub fn replication_lag(&self, id: ServerId) -> Option<Duration> {
        self.get(id).and_then(|s| s.replication_lag)
    }

    pub fn is_reachable(&self, id: ServerId) -> bool {
        self.get(id).map(|s| s.reachable).unwrap_or(false)
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Shared handle: monitors publish through it, the router reads snapshots
/// lock-free
#[derive(Clone)]
pub struct TopologyHandle {
    snapshot: Arc<ArcSwap<Topology>>,
    version: Arc<AtomicU64>,
}

impl TopologyHandle {
    pub fn new(initial: Topology) -> Self {
        let version = Arc::new(AtomicU64::new(initial.version.max(1)));
        let mut initial = initial;
        initial.version = version.load(Ordering::Relaxed);
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(initial)),
            version,
        }
    }

    /// The current snapshot; cheap enough to call per statement
    pub fn snapshot(&self) -> Arc<Topology> {
        self.snapshot.load_full()
    }

    /// Replace the snapshot, bumping the version counter
    pub fn publish(&self, mut topology: Topology) {
        topology.version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.snapshot.store(Arc::new(topology));
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Publish a copy of the current snapshot with `mutate` applied
    pub fn update(&self, mutate: impl FnOnce(&mut Vec<ServerInfo>)) {
        let mut next = (**self.snapshot.load()).clone();
        mutate(&mut next.servers);
        self.publish(next);
    }
}
