//! Server assembly: worker pool, per-worker service state and the accept
//! loop that pins each incoming client connection to one worker.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{ConnectionPool, Connector, ServerCounters};
use crate::classifier::{Analyzer, SqlParser, StmtCache};
use crate::config::Config;
use crate::router::RouterShared;
use crate::session::{Session, SessionContext};
use crate::topology::{Topology, TopologyHandle};
use crate::worker::{Action, ExecuteMode, Worker, WorkerCore, WorkerId};

/// Connection counter for session ids
static SESSION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Everything the sessions of one worker share; owned by the worker
pub struct WorkerServiceState {
    pub pool: Rc<ConnectionPool>,
    pub cache: Rc<RefCell<StmtCache>>,
    pub analyzer: Rc<Analyzer>,
}

pub struct Server {
    config: Arc<Config>,
    topology: TopologyHandle,
    shared: Arc<RouterShared>,
    connector: Arc<dyn Connector>,
    workers: Vec<Worker>,
    shutdown: CancellationToken,
}

impl Server {
    /// Spawn the worker pool and install per-worker state. Returns once
    /// every worker is ready to accept sessions.
    pub fn start(config: Config, connector: Arc<dyn Connector>) -> std::io::Result<Self> {
        let config = Arc::new(config);
        let topology = TopologyHandle::new(Topology::from_config(&config.servers));
        let shared = RouterShared::new(ServerCounters::new());

        let thread_count = config.worker.thread_count.max(1);
        let cache_share = config.classifier.cache_max_bytes / thread_count as u64;

        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let worker = Worker::spawn(WorkerId(i), config.worker.max_events)?;

            let config = config.clone();
            worker
                .handle()
                .call(
                    move |core| install_service_state(core, &config, cache_share),
                    ExecuteMode::Queued,
                )
                .map_err(|e| std::io::Error::other(e.to_string()))?;

            workers.push(worker);
        }

        info!(workers = thread_count, "Worker pool started");

        Ok(Self {
            config,
            topology,
            shared,
            connector,
            workers,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn topology(&self) -> TopologyHandle {
        self.topology.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept clients until shutdown, pinning sessions to workers round
    /// robin
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = format!(
            "{}:{}",
            self.config.listen.listen_addr, self.config.listen.listen_port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, "Proxy listening");

        let mut next_worker = 0usize;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let session_id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
                    let worker = &self.workers[next_worker % self.workers.len()];
                    next_worker = next_worker.wrapping_add(1);

                    info!(session_id, peer = %peer, worker = %worker.handle().id(), "New connection");

                    let ctx_parts = (
                        self.config.clone(),
                        self.topology.clone(),
                        self.shared.clone(),
                        self.connector.clone(),
                    );
                    let spawned = worker.handle().spawn(move |core| async move {
                        let (config, topology, shared, connector) = ctx_parts;
                        let Some(state) = core.service_state::<WorkerServiceState>() else {
                            error!(session_id, "Worker has no service state");
                            return;
                        };
                        let ctx = SessionContext {
                            config,
                            topology,
                            shared,
                            pool: state.pool.clone(),
                            connector,
                            cache: state.cache.clone(),
                            analyzer: state.analyzer.clone(),
                        };
                        if let Err(e) = Session::new(session_id, ctx).run(stream).await {
                            warn!(session_id, error = %e, "Session ended with error");
                        }
                    });
                    if let Err(e) = spawned {
                        error!(session_id, error = %e, "Failed to pin session to worker");
                    }
                }
            }
        }
    }

    /// Stop accepting and wind the workers down
    pub fn join(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            worker.join();
        }
        info!("Proxy shutdown complete");
    }
}

fn install_service_state(core: &Rc<WorkerCore>, config: &Arc<Config>, cache_share: u64) {
    let mut analyzer = Analyzer::new();
    analyzer.set_sql_mode(config.classifier.sql_mode);

    let state = Rc::new(WorkerServiceState {
        pool: Rc::new(ConnectionPool::new(config.pool.clone())),
        cache: Rc::new(RefCell::new(StmtCache::new(cache_share))),
        analyzer: Rc::new(analyzer),
    });

    // The pool expiry sweep runs as a worker delayed call
    let sweep_interval = (config.pool.persist_max_time() / 10).max(Duration::from_secs(1));
    let pool = state.pool.clone();
    core.delayed_call(sweep_interval, move |action| {
        if action == Action::Execute {
            pool.sweep_expired();
        }
        true
    });

    core.set_service_state(state);
}
