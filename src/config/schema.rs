use std::time::Duration;

use serde::Deserialize;

use crate::classifier::SqlMode;
use crate::topology::ServerRole;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub backend: BackendAuth,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    4006
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of event-loop workers
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// Messages dispatched per loop iteration before timers run
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_events() -> usize {
    1024
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            max_events: default_max_events(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Total classification-cache budget, divided evenly among workers;
    /// zero disables the cache
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
    #[serde(default)]
    pub sql_mode: SqlMode,
}

fn default_cache_max_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: default_cache_max_bytes(),
            sql_mode: SqlMode::Default,
        }
    }
}

/// How slave candidates are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlaveSelection {
    AdaptiveRouting,
    #[default]
    LeastCurrentConnections,
    LeastRouterConnections,
    LeastGlobalConnections,
    LeastBehindMaster,
}

/// What happens to a session when no master is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    /// Close the session as soon as the master is lost
    #[default]
    Fail,
    /// Keep the session; writes get an error reply
    ErrorOnWrite,
    /// Keep the session; writes are deferred until a master returns
    FailOnWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CausalReadsMode {
    #[default]
    None,
    Local,
    Global,
    Universal,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrxChecksum {
    /// Checksum every reply
    #[default]
    Full,
    /// Checksum result sets and errors, ignore OK replies
    ResultOnly,
    /// Like result_only, also ignoring LAST_INSERT_ID() reads
    NoInsertId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub slave_selection: SlaveSelection,
    #[serde(default)]
    pub master_failure_mode: MasterFailureMode,
    /// Let the master serve reads alongside the slaves
    #[serde(default)]
    pub master_accept_reads: bool,
    /// Lock the session to the master after a multi-statement packet
    #[serde(default)]
    pub strict_multi_stmt: bool,
    /// Lock the session to the master after a stored-procedure call
    #[serde(default)]
    pub strict_sp_calls: bool,
    #[serde(default = "default_true")]
    pub retry_failed_reads: bool,
    /// Maximum tolerated slave lag in seconds; zero means unlimited
    #[serde(default)]
    pub max_slave_replication_lag: u64,
    #[serde(default = "default_slave_cap")]
    pub max_slave_connections: usize,
    #[serde(default = "default_slave_cap")]
    pub slave_connections: usize,
    #[serde(default)]
    pub causal_reads: CausalReadsMode,
    /// Seconds the GTID wait may take on a slave
    #[serde(default = "default_causal_reads_timeout")]
    pub causal_reads_timeout: u64,
    #[serde(default)]
    pub master_reconnection: bool,
    #[serde(default)]
    pub delayed_retry: bool,
    /// Seconds to keep retrying a failed statement
    #[serde(default = "default_delayed_retry_timeout")]
    pub delayed_retry_timeout: u64,
    #[serde(default)]
    pub transaction_replay: bool,
    /// Bytes of recorded statements after which replay is abandoned
    #[serde(default = "default_trx_max_size")]
    pub trx_max_size: u64,
    #[serde(default = "default_trx_max_attempts")]
    pub trx_max_attempts: u64,
    /// Seconds a replay may run; zero means the attempt cap governs alone
    #[serde(default)]
    pub trx_timeout: u64,
    #[serde(default)]
    pub trx_retry_on_deadlock: bool,
    #[serde(default)]
    pub trx_retry_on_mismatch: bool,
    #[serde(default)]
    pub trx_checksum: TrxChecksum,
    /// Start transactions optimistically on a slave
    #[serde(default)]
    pub optimistic_trx: bool,
    /// Open backend connections only when first needed
    #[serde(default)]
    pub lazy_connect: bool,
    /// Reuse identical prepared statements within a connection
    #[serde(default)]
    pub reuse_ps: bool,
}

fn default_true() -> bool {
    true
}

fn default_slave_cap() -> usize {
    255
}

fn default_causal_reads_timeout() -> u64 {
    10
}

fn default_delayed_retry_timeout() -> u64 {
    10
}

fn default_trx_max_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_trx_max_attempts() -> u64 {
    5
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            slave_selection: SlaveSelection::default(),
            master_failure_mode: MasterFailureMode::default(),
            master_accept_reads: false,
            strict_multi_stmt: false,
            strict_sp_calls: false,
            retry_failed_reads: true,
            max_slave_replication_lag: 0,
            max_slave_connections: default_slave_cap(),
            slave_connections: default_slave_cap(),
            causal_reads: CausalReadsMode::None,
            causal_reads_timeout: default_causal_reads_timeout(),
            master_reconnection: false,
            delayed_retry: false,
            delayed_retry_timeout: default_delayed_retry_timeout(),
            transaction_replay: false,
            trx_max_size: default_trx_max_size(),
            trx_max_attempts: default_trx_max_attempts(),
            trx_timeout: 0,
            trx_retry_on_deadlock: false,
            trx_retry_on_mismatch: false,
            trx_checksum: TrxChecksum::Full,
            optimistic_trx: false,
            lazy_connect: false,
            reuse_ps: false,
        }
    }
}

impl RouterConfig {
    pub fn max_slave_replication_lag(&self) -> Option<Duration> {
        (self.max_slave_replication_lag > 0)
            .then(|| Duration::from_secs(self.max_slave_replication_lag))
    }

    pub fn causal_reads_timeout(&self) -> Duration {
        Duration::from_secs(self.causal_reads_timeout)
    }

    pub fn delayed_retry_timeout(&self) -> Duration {
        Duration::from_secs(self.delayed_retry_timeout)
    }

    pub fn trx_timeout(&self) -> Option<Duration> {
        (self.trx_timeout > 0).then(|| Duration::from_secs(self.trx_timeout))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Idle connections kept per server per worker
    #[serde(default = "default_persist_pool_max")]
    pub persist_pool_max: usize,
    /// Seconds an idle pooled connection may live
    #[serde(default = "default_persist_max_time")]
    pub persist_max_time: u64,
    /// Connections per server per worker, idle and in use combined;
    /// zero means unlimited
    #[serde(default)]
    pub max_connections: usize,
}

fn default_persist_pool_max() -> usize {
    10
}

fn default_persist_max_time() -> u64 {
    3600
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            persist_pool_max: default_persist_pool_max(),
            persist_max_time: default_persist_max_time(),
            max_connections: 0,
        }
    }
}

impl PoolConfig {
    pub fn persist_max_time(&self) -> Duration {
        Duration::from_secs(self.persist_max_time)
    }
}

/// Credentials the proxy uses toward the backends
#[derive(Debug, Clone, Deserialize)]
pub struct BackendAuth {
    #[serde(default = "default_backend_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_backend_user() -> String {
    "proxy".to_string()
}

impl Default for BackendAuth {
    fn default() -> Self {
        Self {
            user: default_backend_user(),
            password: String::new(),
        }
    }
}

/// One backend server as seeded from configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    #[serde(default = "default_role")]
    pub role: ServerRole,
    #[serde(default)]
    pub rank: i64,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_role() -> ServerRole {
    ServerRole::Unknown
}

fn default_weight() -> u32 {
    1
}
