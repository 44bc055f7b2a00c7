//! The read/write-split session.
//!
//! One session per client connection, pinned to one worker for its whole
//! life. The session terminates the client protocol, classifies each
//! statement, resolves a routing plan, talks to backend endpoints and
//! forwards exactly one reply per statement back to the client, in
//! submission order.

pub mod causal;
pub mod history;
pub mod replay;
pub mod state;

pub use state::{PreparedInfo, SessionState, TrxEvent};

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::{ConnectionError, Connector, ConnectionPool, Endpoint, EndpointState};
use crate::classifier::{
    Analyzer, CacheProbe, ClassifiedStmt, CollectFlags, SqlParser, StmtCache, StmtOp, TypeMask,
};
use crate::config::{CausalReadsMode, Config, MasterFailureMode};
use crate::protocol::{
    is_err_packet, make_error, Command, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
    Packet, PacketCodec, ReplyTracker,
};
use crate::router::{
    resolve, Gtid, RouteCause, RouteInput, RouteMode, RouterShared, RoutingHint, RoutingPlan,
};
use crate::topology::{ServerId, TopologyHandle};
use crate::worker::clock::Stopwatch;

use causal::{add_prefix_wait_gtid, CausalState};
use history::SessionCommandHistory;
use replay::{include_in_checksum, ReplayBudget, Trx};

/// Advisory error for a transaction whose replay attempts are exhausted;
/// deliberately distinct from 1927
const ER_REPLAY_EXHAUSTED: u16 = 5801;

/// Everything a session borrows from its worker and service. Cheap to
/// clone; the Rc members are worker-local.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub topology: TopologyHandle,
    pub shared: Arc<RouterShared>,
    pub pool: Rc<ConnectionPool>,
    pub connector: Arc<dyn Connector>,
    pub cache: Rc<RefCell<StmtCache>>,
    pub analyzer: Rc<Analyzer>,
}

/// A statement waiting to be routed
#[derive(Debug, Clone)]
pub struct QueuedQuery {
    pub packet: Packet,
    pub hints: Vec<RoutingHint>,
    /// Already failed once on an untested pooled connection
    retried_pool: bool,
    /// Running retry budget for delayed retries
    retry_timer: Option<Stopwatch>,
}

impl QueuedQuery {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            hints: Vec::new(),
            retried_pool: false,
            retry_timer: None,
        }
    }

    fn with_hint(mut self, hint: RoutingHint) -> Self {
        self.hints.push(hint);
        self
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Backend error: {0}")]
    Backend(#[from] ConnectionError),

    #[error("Session closed: {0}")]
    Closed(String),
}

/// What `relay_reply` did with the backend's response
struct RelayOutcome {
    tracker: ReplyTracker,
    /// Reply payloads, for checksumming
    payloads: Vec<bytes::Bytes>,
    /// The reply was forwarded to the client
    forwarded: bool,
    /// A deadlock error was intercepted instead of forwarded
    deadlock_intercepted: bool,
    /// A causal-read timeout was resolved by requeueing on the master
    requeued_on_master: bool,
}

struct RelayOpts {
    /// Strip the leading GTID-wait result and renumber what follows
    causal_active: bool,
    /// Do not forward anything to the client
    suppress: bool,
    /// Intercept a leading deadlock error instead of forwarding it
    intercept_deadlock: bool,
    collect_rows: bool,
    /// The statement already went out through the endpoint's delayed
    /// write queue
    already_written: bool,
}

impl RelayOpts {
    fn plain() -> Self {
        Self {
            causal_active: false,
            suppress: false,
            intercept_deadlock: false,
            collect_rows: false,
            already_written: false,
        }
    }
}

pub struct Session {
    id: u32,
    ctx: SessionContext,
    state: SessionState,
    history: SessionCommandHistory,
    causal: CausalState,
    endpoints: HashMap<ServerId, Endpoint>,
    /// History position each endpoint has been caught up to
    replayed_positions: HashMap<ServerId, u64>,
    query_queue: VecDeque<QueuedQuery>,

    /// Statements of the open transaction, with their reply checksum
    trx: Trx,
    /// Replay baseline: copy of the transaction as originally executed
    orig_trx: Trx,
    replay_budget: ReplayBudget,
    can_replay_trx: bool,
    /// A transaction is running optimistically on a slave
    otrx_active: bool,

    /// Cached PREPARE responses for reuse_ps, keyed by the verbatim text
    ps_response_cache: HashMap<String, Vec<Packet>>,
    /// The unrewritten statement of an in-flight causal read, kept for the
    /// master retry after a wait timeout
    pending_causal_query: Option<QueuedQuery>,
    current_master: Option<ServerId>,
    rng: SmallRng,
}

impl Session {
    pub fn new(id: u32, ctx: SessionContext) -> Self {
        let causal = CausalState::new(ctx.config.router.causal_reads);
        let replay_budget = ReplayBudget::new(&ctx.config.router);
        Self {
            id,
            ctx,
            state: SessionState::new(),
            history: SessionCommandHistory::new(),
            causal,
            endpoints: HashMap::new(),
            replayed_positions: HashMap::new(),
            query_queue: VecDeque::new(),
            trx: Trx::new(),
            orig_trx: Trx::new(),
            replay_budget,
            can_replay_trx: true,
            otrx_active: false,
            ps_response_cache: HashMap::new(),
            pending_causal_query: None,
            current_master: None,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Drive the whole session over a client stream
    pub async fn run<S>(mut self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(stream, PacketCodec);

        let handshake = InitialHandshake::new(self.id);
        client.send(handshake.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;
        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("Invalid handshake response".into()))?;

        self.state.set_from_handshake(
            response.username.clone(),
            response.database.clone(),
            response.capability_flags,
            response.character_set,
        );

        client
            .send(OkPacket::new().encode(2, self.state.capability_flags))
            .await?;

        info!(
            session_id = self.id,
            username = %self.state.username,
            database = ?self.state.database,
            "Client authenticated"
        );
        self.ctx.shared.stats.n_sessions.fetch_add(1, Ordering::Relaxed);

        if !self.ctx.config.router.lazy_connect {
            // Eagerly bind the master and the configured number of slave
            // connections so connectivity problems surface before the
            // first statement and session commands reach every backend
            let topology = self.ctx.topology.snapshot();
            let mut targets: Vec<ServerId> = topology.master().into_iter().collect();
            targets.extend(
                topology
                    .servers()
                    .iter()
                    .filter(|s| s.role == crate::topology::ServerRole::Slave && s.reachable)
                    .take(self.ctx.config.router.slave_connections)
                    .map(|s| s.id),
            );
            for server in targets {
                if let Err(e) = self.prepare_endpoint(server).await {
                    warn!(
                        session_id = self.id,
                        server = %server,
                        error = %e,
                        "Eager backend connect failed"
                    );
                }
            }
        }

        let result = self.command_loop(&mut client).await;

        let normal_quit = matches!(result, Ok(()));
        if normal_quit {
            // Scrub session state off the connections the pool is about to
            // adopt; a failed reset marks the connection unpoolable
            for endpoint in self.endpoints.values_mut() {
                endpoint.reset_for_pool().await;
            }
        }
        self.teardown(normal_quit);
        result
    }

    fn teardown(&mut self, normal_quit: bool) {
        for (server, endpoint) in self.endpoints.iter_mut() {
            let counter = self.ctx.shared.counters.counter(*server);
            if endpoint.state() == EndpointState::Connected {
                counter.connection_closed();
            }
            endpoint.close(normal_quit);
        }
        self.endpoints.clear();

        let stats = &self.ctx.shared.stats;
        info!(
            session_id = self.id,
            normal_quit,
            sessions = stats.n_sessions.load(Ordering::Relaxed),
            queries = stats.n_queries.load(Ordering::Relaxed),
            to_master = stats.n_master.load(Ordering::Relaxed),
            to_slave = stats.n_slave.load(Ordering::Relaxed),
            fanned_out = stats.n_all.load(Ordering::Relaxed),
            trx_replays = stats.n_trx_replay.load(Ordering::Relaxed),
            ro_trx = stats.n_ro_trx.load(Ordering::Relaxed),
            rw_trx = stats.n_rw_trx.load(Ordering::Relaxed),
            ps_reused = stats.n_ps_reused.load(Ordering::Relaxed),
            "Session ended"
        );
    }

    async fn command_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let packet = match client.next().await {
                Some(Ok(p)) => p,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!(session_id = self.id, "Client disconnected");
                    return Err(SessionError::ClientDisconnected);
                }
            };

            if packet.command() == Some(Command::Quit) {
                debug!(session_id = self.id, "Client sent QUIT");
                return Ok(());
            }

            self.query_queue.push_back(QueuedQuery::new(packet));
            while let Some(query) = self.query_queue.pop_front() {
                self.route_query(client, query).await?;
            }
        }
    }

    /// Route one statement end to end: classify, plan, execute, reply
    pub async fn route_query<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        query: QueuedQuery,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state.load_data_active {
            return self.continue_load_data(client, query).await;
        }

        // Classification, through the per-worker cache
        let canonical = self.ctx.analyzer.canonical(&query.packet);
        let (probe, cached) = if canonical.is_empty() {
            (CacheProbe::Bypass, None)
        } else {
            let key = self
                .ctx
                .cache
                .borrow()
                .cache_key(&query.packet, &canonical);
            self.ctx.cache.borrow_mut().probe(key)
        };
        let stmt = cached
            .unwrap_or_else(|| self.ctx.analyzer.parse(&query.packet, CollectFlags::all()));

        // reuse_ps: an identical PREPARE is answered from the cached
        // response without a backend round trip. Keyed on the verbatim
        // text: canonicalisation would conflate different bodies under
        // the same statement name.
        let raw_sql = query.packet.sql().map(|s| s.to_string()).unwrap_or_default();
        if self.ctx.config.router.reuse_ps
            && stmt
                .type_mask
                .intersects(TypeMask::PREPARE_STMT | TypeMask::PREPARE_NAMED_STMT)
        {
            if let Some(reply) = self.ps_response_cache.get(&raw_sql).cloned() {
                self.ctx.cache.borrow_mut().store(probe, &stmt);
                self.finish_prepare_bookkeeping(&stmt, &query.packet);
                // The identical statement already ran on every connected
                // backend; fresh connections still need the replay
                let position = self.history.add(query.packet.clone());
                let connected: Vec<ServerId> = self
                    .endpoints
                    .iter()
                    .filter(|(_, e)| e.is_connected())
                    .map(|(id, _)| *id)
                    .collect();
                for server in connected {
                    self.history.ack(position, server, 0x00);
                }
                self.trim_history();
                for packet in reply {
                    client.send(packet).await?;
                }
                self.ctx.shared.stats.n_ps_reused.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = self.id, "Reused prepared statement");
                return Ok(());
            }
        }

        let event = self.state.on_route(stmt.type_mask);

        let plan = self.resolve_plan(&query, &stmt, event);

        // Post-dispatch cache write-back, exactly once per classified packet
        self.ctx.cache.borrow_mut().store(probe, &stmt);
        self.ctx.shared.stats.record_plan(&plan);

        debug!(
            session_id = self.id,
            op = ?stmt.op,
            mode = ?plan.mode,
            cause = ?plan.cause,
            target = ?plan.target,
            "Statement routed"
        );

        match plan.mode {
            RouteMode::All => {
                self.execute_session_command(client, query, &stmt, &plan, raw_sql)
                    .await
            }
            _ => {
                self.execute_single(client, query, &stmt, &plan, event)
                    .await
            }
        }
    }

    fn resolve_plan(
        &mut self,
        query: &QueuedQuery,
        stmt: &ClassifiedStmt,
        event: TrxEvent,
    ) -> RoutingPlan {
        let ps_read_only = stmt
            .prepared_name
            .as_deref()
            .and_then(|name| self.state.prepared.get(name))
            .map(|info| info.read_only);

        let input = RouteInput {
            stmt,
            command: query.packet.command(),
            hints: &query.hints,
            trx_open: self.state.trx_open,
            trx_read_only: self.state.trx_read_only,
            locked_to_master: self.state.locked_to_master,
            current_master: self.current_master,
            last_used: self.state.last_used,
            reads_tmp_table: self.state.reads_tmp_table(&stmt.tables),
            ps_read_only,
            required_gtid: self.causal.fast_required_gtid(),
        };

        let topology = self.ctx.topology.snapshot();
        let mut plan = resolve(
            &input,
            &self.ctx.config.router,
            &topology,
            &self.ctx.shared,
            &mut self.rng,
        );

        // An optimistic transaction may start on a slave instead
        if event == TrxEvent::Starting
            && self.ctx.config.router.optimistic_trx
            && self.ctx.config.router.transaction_replay
            && !self.state.trx_read_only
            && plan.mode == RouteMode::Master
        {
            let slave_input = RouteInput {
                trx_open: false,
                ..input
            };
            let optimistic = resolve(
                &slave_input,
                &self.ctx.config.router,
                &topology,
                &self.ctx.shared,
                &mut self.rng,
            );
            if let Some(target) = optimistic.target {
                if Some(target) != topology.master() {
                    self.otrx_active = true;
                    plan = RoutingPlan {
                        target: Some(target),
                        mode: RouteMode::Slave,
                        cause: plan.cause,
                    };
                }
            }
        }

        // Statements inside a transaction stay on the transaction's server
        if self.state.trx_open && event != TrxEvent::Starting {
            if let Some(pinned) = self.state.trx_target {
                if matches!(plan.mode, RouteMode::Master | RouteMode::Slave)
                    && topology.is_reachable(pinned)
                    && !(self.otrx_active && plan.mode == RouteMode::Master)
                {
                    plan.target = Some(pinned);
                }
            }
        }

        if plan.mode == RouteMode::Master || plan.mode == RouteMode::All {
            if let Some(target) = plan.target {
                self.current_master = Some(target);
            }
        }

        // Strictness locks are permanent for the session
        if matches!(plan.cause, RouteCause::MultiStatement)
            || (matches!(plan.cause, RouteCause::StoredProcedure)
                && self.ctx.config.router.strict_sp_calls)
        {
            self.state.locked_to_master = true;
        }

        plan
    }

    /// Fan a session-affecting statement out to every connected backend;
    /// the client receives the primary's reply
    async fn execute_session_command<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        query: QueuedQuery,
        stmt: &ClassifiedStmt,
        plan: &RoutingPlan,
        raw_sql: String,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(primary) = plan.target else {
            return self.handle_no_target(client, query, plan).await;
        };

        if let Err(e) = self.prepare_endpoint(primary).await {
            return self
                .handle_backend_failure(client, primary, query, e.into())
                .await;
        }

        let position = self.history.add(query.packet.clone());

        // Secondary backends first: their replies are compared, not
        // forwarded
        let secondaries: Vec<ServerId> = self
            .endpoints
            .iter()
            .filter(|(id, e)| **id != primary && e.is_connected())
            .map(|(id, _)| *id)
            .collect();

        let mut secondary_kinds: HashMap<ServerId, u8> = HashMap::new();
        for server in secondaries {
            let result = self
                .run_on_endpoint(server, query.packet.clone(), RelayOpts::plain())
                .await;
            match result {
                Ok(outcome) => {
                    let kind = outcome
                        .payloads
                        .first()
                        .and_then(|p| p.first().copied())
                        .unwrap_or(0x00);
                    secondary_kinds.insert(server, kind);
                }
                Err(_) => {
                    warn!(session_id = self.id, server = %server, "Session command failed on secondary, evicting");
                    self.evict_endpoint(server);
                }
            }
        }

        // The primary's reply is the one the client sees
        let outcome = match self.forward_on_endpoint(client, primary, query.packet.clone(), RelayOpts::plain()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return self.handle_backend_failure(client, primary, query, e).await;
            }
        };

        let primary_kind = outcome
            .payloads
            .first()
            .and_then(|p| p.first().copied())
            .unwrap_or(0x00);
        self.history.ack(position, primary, primary_kind);

        // Backends that answered differently no longer share session state
        for (server, kind) in secondary_kinds {
            if kind == primary_kind {
                self.history.ack(position, server, kind);
            } else {
                warn!(
                    session_id = self.id,
                    server = %server,
                    "Session command acknowledgement diverged, evicting backend"
                );
                self.evict_endpoint(server);
            }
        }
        self.trim_history();

        if outcome.tracker.error().is_none() {
            self.apply_session_side_effects(stmt, &query.packet, &raw_sql, &outcome);
        }
        self.finish_statement(primary, &outcome, TrxEvent::None);
        Ok(())
    }

    /// Execute a statement on a single backend
    async fn execute_single<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        query: QueuedQuery,
        stmt: &ClassifiedStmt,
        plan: &RoutingPlan,
        event: TrxEvent,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(target) = plan.target else {
            return self.handle_no_target(client, query, plan).await;
        };

        // A write arriving in an optimistic slave transaction forces the
        // migration to the master
        if self.otrx_active
            && plan.mode == RouteMode::Master
            && self.state.trx_target.is_some()
            && Some(target) != self.state.trx_target
        {
            return self.migrate_optimistic_trx(client, query).await;
        }

        // Only genuine reads are rewritten; transaction control routed to
        // a slave (e.g. START TRANSACTION READ ONLY) goes out untouched
        let causal_eligible = plan.mode == RouteMode::Slave && stmt.type_mask.is_read_only();
        let wants_probe = causal_eligible && self.causal.needs_gtid_probe();
        let wants_causal = causal_eligible && self.causal.should_do_causal_read(&self.ctx.shared);

        // Without a pending causal rewrite the statement can ride the
        // endpoint's delayed-write queue while the pool grants a slot
        let mut already_written = false;
        if wants_probe || wants_causal {
            if let Err(e) = self.prepare_endpoint(target).await {
                return self
                    .handle_backend_failure(client, target, query, e.into())
                    .await;
            }
        } else {
            match self.prepare_endpoint_buffering(target, &query.packet).await {
                Ok(written) => already_written = written,
                Err(e) => {
                    return self
                        .handle_backend_failure(client, target, query, e.into())
                        .await;
                }
            }
        }

        // Universal causal reads probe the master position once
        let mut wants_causal = wants_causal;
        if wants_probe {
            match self.run_gtid_probe().await {
                Ok(()) => {
                    wants_causal =
                        causal_eligible && self.causal.should_do_causal_read(&self.ctx.shared);
                }
                Err(e) => {
                    debug!(session_id = self.id, error = %e, "GTID probe failed");
                }
            }
        }

        // Rewrite slave reads to wait for the session's last write
        let mut causal_active = false;
        let mut outgoing = query.packet.clone();
        if wants_causal {
            if let Some(position) = self.causal.wait_position(&self.ctx.shared) {
                if let Some(rewritten) = add_prefix_wait_gtid(
                    &outgoing,
                    &position,
                    self.ctx.config.router.causal_reads_timeout,
                ) {
                    outgoing = rewritten;
                    causal_active = true;
                    self.pending_causal_query = Some(query.clone());
                }
            }
        }

        let intercept_deadlock = self.ctx.config.router.trx_retry_on_deadlock
            && self.ctx.config.router.transaction_replay
            && self.state.trx_open
            && self.can_replay_trx;

        let opts = RelayOpts {
            causal_active,
            suppress: false,
            intercept_deadlock,
            collect_rows: false,
            already_written,
        };

        let outcome = match self.forward_on_endpoint(client, target, outgoing, opts).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.pending_causal_query = None;
                return self.handle_backend_failure(client, target, query, e).await;
            }
        };
        self.pending_causal_query = None;

        if outcome.requeued_on_master {
            // The causal read timed out; the statement is already back in
            // the queue with a master hint
            return Ok(());
        }

        if outcome.deadlock_intercepted {
            debug!(session_id = self.id, "Deadlock inside transaction, replaying");
            return self.run_trx_replay(client, Some(query)).await;
        }

        // Record the statement for replay once its reply is known
        if self.ctx.config.router.transaction_replay && self.state.trx_open && self.can_replay_trx
        {
            self.record_trx_stmt(&query.packet, stmt, &outcome);
        }

        // Session-affecting statements that did not fan out (e.g. a SET
        // that also reads) still belong in the replay history
        if is_session_command(stmt.type_mask) && outcome.tracker.error().is_none() {
            let position = self.history.add(query.packet.clone());
            let kind = outcome
                .payloads
                .first()
                .and_then(|p| p.first().copied())
                .unwrap_or(0x00);
            self.history.ack(position, target, kind);
            self.trim_history();
            self.replayed_positions.insert(target, position);
        }

        self.apply_statement_side_effects(stmt, target, event, &outcome);
        self.finish_statement(target, &outcome, event);
        Ok(())
    }

    fn record_trx_stmt(&mut self, packet: &Packet, stmt: &ClassifiedStmt, outcome: &RelayOutcome) {
        let config = &self.ctx.config.router;
        if self.trx.size() + packet.wire_len() as u64 > config.trx_max_size {
            debug!(session_id = self.id, "Transaction too large to replay");
            self.can_replay_trx = false;
            self.trx.clear();
            return;
        }

        let checksummed = include_in_checksum(
            config.trx_checksum,
            &outcome.tracker,
            stmt.uses_function("last_insert_id"),
        );
        self.trx.add_stmt(packet.clone(), checksummed);
        if checksummed {
            for payload in &outcome.payloads {
                self.trx.add_result(payload);
            }
        }
    }

    /// Side effects that only apply to single-target statements
    fn apply_statement_side_effects(
        &mut self,
        stmt: &ClassifiedStmt,
        target: ServerId,
        event: TrxEvent,
        outcome: &RelayOutcome,
    ) {
        if outcome.tracker.error().is_some() {
            return;
        }

        if event == TrxEvent::Starting {
            self.state.trx_target = Some(target);
        }

        if stmt.type_mask.contains(TypeMask::CREATE_TMP_TABLE) {
            for table in &stmt.tables {
                self.state.add_tmp_table(table);
            }
        }
        if stmt.op == StmtOp::Drop {
            self.state.drop_tmp_tables(&stmt.tables);
        }
        if stmt.op == StmtOp::LoadLocal && outcome.tracker.is_local_infile() {
            self.state.load_data_active = true;
            self.state.last_used = Some(target);
        }
    }

    /// Session-state side effects of a successful session command
    fn apply_session_side_effects(
        &mut self,
        stmt: &ClassifiedStmt,
        packet: &Packet,
        raw_sql: &str,
        outcome: &RelayOutcome,
    ) {
        if stmt.op == StmtOp::ChangeDb {
            let db = match packet.command() {
                Some(Command::InitDb) => {
                    Some(String::from_utf8_lossy(&packet.payload[1..]).to_string())
                }
                _ => stmt.tables.first().cloned(),
            };
            if let Some(db) = db {
                self.state.change_database(db);
            }
        }

        self.finish_prepare_bookkeeping(stmt, packet);

        if stmt.type_mask.contains(TypeMask::DEALLOC_PREPARE) {
            if let Some(name) = &stmt.prepared_name {
                self.state.prepared.remove(name);
            }
        }

        // Remember the PREPARE response for reuse_ps
        if self.ctx.config.router.reuse_ps
            && stmt
                .type_mask
                .intersects(TypeMask::PREPARE_STMT | TypeMask::PREPARE_NAMED_STMT)
            && outcome.forwarded
        {
            self.ps_response_cache
                .insert(raw_sql.to_string(), outcome.payloads_as_packets());
        }
    }

    fn finish_prepare_bookkeeping(&mut self, stmt: &ClassifiedStmt, packet: &Packet) {
        if stmt.type_mask.contains(TypeMask::PREPARE_NAMED_STMT) {
            if let Some(name) = stmt.prepared_name.clone() {
                let read_only = self
                    .ctx
                    .analyzer
                    .get_preparable_stmt(packet)
                    .map(|inner| {
                        self.ctx
                            .analyzer
                            .parse(&inner, CollectFlags::empty())
                            .type_mask
                            .is_read_only()
                    })
                    .unwrap_or(false);
                self.state.prepared.insert(name, PreparedInfo { read_only });
            }
        }
    }

    /// Common completion bookkeeping for every statement
    fn finish_statement(&mut self, target: ServerId, outcome: &RelayOutcome, event: TrxEvent) {
        self.state.last_used = Some(target);

        if let Some(ok) = outcome.tracker.ok() {
            // GTID bookkeeping from the master's tracked variable
            if let Some(gtid) = ok.tracked_var("last_gtid").and_then(Gtid::parse) {
                if Some(target) == self.current_master {
                    if self.causal.mode() == CausalReadsMode::Fast {
                        self.causal.record_fast_gtid(gtid);
                    } else {
                        self.causal.record_write_gtid(gtid, &self.ctx.shared);
                    }
                }
            }
            self.state.on_server_status(ok.status_flags);
        }

        if event == TrxEvent::Ending && outcome.tracker.error().is_none() {
            let read_only = self.state.trx_read_only;
            self.state.finish_trx();
            self.otrx_active = false;
            self.trx.clear();
            self.orig_trx.clear();
            self.replay_budget.reset();
            self.can_replay_trx = true;
            let stats = &self.ctx.shared.stats;
            if read_only {
                stats.n_ro_trx.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.n_rw_trx.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn endpoint_entry(&mut self, server: ServerId) -> Result<&mut Endpoint, ConnectionError> {
        if !self.endpoints.contains_key(&server) {
            let topology = self.ctx.topology.snapshot();
            let info = topology
                .get(server)
                .ok_or_else(|| ConnectionError::Connect(format!("unknown server {server}")))?
                .clone();
            let endpoint = Endpoint::new(
                info,
                self.ctx.config.backend.clone(),
                self.state.database.clone(),
                self.ctx.pool.clone(),
                self.ctx.connector.clone(),
            );
            self.endpoints.insert(server, endpoint);
        }
        Ok(self.endpoints.get_mut(&server).expect("endpoint inserted"))
    }

    /// Ensure an endpoint to `server` exists and is connected, replaying
    /// the session-command history onto fresh connections
    async fn prepare_endpoint(&mut self, server: ServerId) -> Result<(), ConnectionError> {
        let endpoint = self.endpoint_entry(server)?;
        if endpoint.is_connected() {
            return Ok(());
        }

        endpoint.ensure_connected().await?;
        self.note_fresh_connection(server).await
    }

    /// Like `prepare_endpoint`, but while the pool keeps the endpoint
    /// waiting for a slot the statement is queued on it and flushed, in
    /// order, on the transition to Connected. Returns true when the packet
    /// has been written this way.
    ///
    /// Only sessions without recorded session commands take the buffered
    /// path: with history to replay, the replayed commands must reach the
    /// backend before the user's statement.
    async fn prepare_endpoint_buffering(
        &mut self,
        server: ServerId,
        packet: &Packet,
    ) -> Result<bool, ConnectionError> {
        let history_empty = self.history.is_empty();
        let endpoint = self.endpoint_entry(server)?;
        if endpoint.is_connected() {
            return Ok(false);
        }

        endpoint.connect().await?;
        if endpoint.state() == EndpointState::WaitingForConn && history_empty {
            endpoint.write(packet.clone()).await?;
            endpoint.continue_connecting().await?;
            self.note_fresh_connection(server).await?;
            return Ok(true);
        }

        endpoint.ensure_connected().await?;
        self.note_fresh_connection(server).await?;
        Ok(false)
    }

    /// Bookkeeping for a connection that just reached Connected
    async fn note_fresh_connection(&mut self, server: ServerId) -> Result<(), ConnectionError> {
        self.ctx
            .shared
            .counters
            .counter(server)
            .connection_opened();
        // Binary statement ids from the old connection are void
        self.ps_response_cache.clear();
        self.replay_history_onto(server).await
    }

    /// Replay recorded session commands onto a newly connected backend.
    /// A backend whose acknowledgements diverge from the recorded ones is
    /// evicted.
    async fn replay_history_onto(&mut self, server: ServerId) -> Result<(), ConnectionError> {
        let caught_up_to = self.replayed_positions.get(&server).copied();
        let entries: Vec<(u64, Packet, Option<u8>)> = self
            .history
            .entries_after(caught_up_to)
            .map(|e| (e.position, e.packet.clone(), e.reply_kind))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        debug!(
            session_id = self.id,
            server = %server,
            count = entries.len(),
            "Replaying session commands"
        );

        for (position, packet, expected_kind) in entries {
            let outcome = self
                .run_on_endpoint(server, packet, RelayOpts::plain())
                .await
                .map_err(|_| ConnectionError::Disconnected)?;

            let kind = outcome
                .payloads
                .first()
                .and_then(|p| p.first().copied())
                .unwrap_or(0x00);

            if let Some(expected) = expected_kind {
                if expected != kind {
                    warn!(
                        session_id = self.id,
                        server = %server,
                        position,
                        "Session command replay diverged, evicting backend"
                    );
                    self.evict_endpoint(server);
                    return Err(ConnectionError::Protocol(
                        "session command replay diverged".into(),
                    ));
                }
            }
            self.history.ack(position, server, kind);
            self.replayed_positions.insert(server, position);
        }
        self.trim_history();
        Ok(())
    }

    /// Drop history entries every server that could still need them has
    /// acknowledged; the list stays trimmed to the oldest unacked entry
    fn trim_history(&mut self) {
        let topology = self.ctx.topology.snapshot();
        let required: Vec<ServerId> = topology
            .servers()
            .iter()
            .filter(|s| s.is_usable())
            .map(|s| s.id)
            .collect();
        self.history.trim(&required);
    }

    fn evict_endpoint(&mut self, server: ServerId) {
        if let Some(mut endpoint) = self.endpoints.remove(&server) {
            if endpoint.state() == EndpointState::Connected {
                self.ctx
                    .shared
                    .counters
                    .counter(server)
                    .connection_closed();
            }
            endpoint.close(false);
        }
        self.replayed_positions.remove(&server);
        if self.state.trx_target == Some(server) {
            self.state.trx_target = None;
        }
    }

    /// Send a packet on an endpoint and read back the full reply without
    /// involving the client
    async fn run_on_endpoint(
        &mut self,
        server: ServerId,
        packet: Packet,
        opts: RelayOpts,
    ) -> Result<RelayOutcome, SessionError> {
        let opts = RelayOpts {
            suppress: true,
            ..opts
        };
        // The client is not touched on this path; a dummy sink is enough
        let mut sink: Option<&mut Framed<tokio::io::DuplexStream, PacketCodec>> = None;
        self.relay_reply_inner(&mut sink, server, packet, opts).await
    }

    /// Send a packet on an endpoint and stream the reply to the client
    async fn forward_on_endpoint<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        server: ServerId,
        packet: Packet,
        opts: RelayOpts,
    ) -> Result<RelayOutcome, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut sink = Some(client);
        self.relay_reply_inner(&mut sink, server, packet, opts).await
    }

    async fn relay_reply_inner<C>(
        &mut self,
        client: &mut Option<&mut Framed<C, PacketCodec>>,
        server: ServerId,
        packet: Packet,
        opts: RelayOpts,
    ) -> Result<RelayOutcome, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let counter = self.ctx.shared.counters.counter(server);
        let watch = Stopwatch::start();
        counter.op_started();
        let result = self
            .relay_reply_io(client, server, packet, opts)
            .await;
        counter.op_finished(watch.split());
        result
    }

    async fn relay_reply_io<C>(
        &mut self,
        client: &mut Option<&mut Framed<C, PacketCodec>>,
        server: ServerId,
        packet: Packet,
        opts: RelayOpts,
    ) -> Result<RelayOutcome, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let command = packet.command();
        let expects_response = command.map(|c| c.will_respond()).unwrap_or(true);

        let backend_caps = {
            let endpoint = self
                .endpoints
                .get_mut(&server)
                .ok_or(ConnectionError::Disconnected)?;
            if !opts.already_written {
                endpoint.write(packet).await?;
            }
            endpoint.capabilities().unwrap_or(0)
        };

        let mut tracker = ReplyTracker::for_command(backend_caps, command);
        if opts.collect_rows {
            tracker = tracker.collecting_rows();
        }
        let mut outcome = RelayOutcome {
            tracker,
            payloads: Vec::new(),
            forwarded: false,
            deadlock_intercepted: false,
            requeued_on_master: false,
        };

        if !expects_response {
            return Ok(outcome);
        }

        // The hidden GTID-wait result comes first on a causal read
        if opts.causal_active {
            let first = self.endpoint_recv(server).await?;
            if is_err_packet(&first.payload) {
                if self.state.trx_open && self.state.trx_read_only {
                    // Cannot retry inside a read-only transaction
                    if let Some(client) = client.as_deref_mut() {
                        client
                            .send(make_error(
                                1792,
                                "25006",
                                "Causal read timed out while in a read-only transaction, cannot retry command.",
                            ))
                            .await?;
                        outcome.forwarded = true;
                    }
                    outcome.tracker.observe(&first);
                    return Ok(outcome);
                }

                // Retry the original statement on the master; the failed
                // wait aborted the whole multi-statement packet, so no
                // further reply packets follow
                let original = self.pending_causal_query.take().ok_or_else(|| {
                    SessionError::Protocol("no pending causal query".into())
                })?;
                self.query_queue
                    .push_front(original.with_hint(RoutingHint::ToMaster));
                outcome.requeued_on_master = true;
                return Ok(outcome);
            }
            // Wait succeeded; the OK is discarded and the remaining
            // packets are renumbered from 1
        }

        let mut next_seq: u8 = 1;
        let mut first_packet = true;

        loop {
            let mut reply = self.endpoint_recv(server).await?;

            if first_packet
                && opts.intercept_deadlock
                && ErrPacket::parse(&reply.payload)
                    .map(|e| e.is_deadlock())
                    .unwrap_or(false)
            {
                outcome.tracker.observe(&reply);
                outcome.deadlock_intercepted = true;
                return Ok(outcome);
            }
            first_packet = false;

            let complete = outcome.tracker.observe(&reply);
            outcome.payloads.push(reply.payload.clone());

            if opts.causal_active {
                reply.sequence_id = next_seq;
                next_seq = next_seq.wrapping_add(1);
            }

            if !opts.suppress {
                if let Some(client) = client.as_deref_mut() {
                    client.send(reply).await?;
                    outcome.forwarded = true;
                }
            }

            if complete {
                return Ok(outcome);
            }
        }
    }

    async fn endpoint_recv(&mut self, server: ServerId) -> Result<Packet, ConnectionError> {
        let endpoint = self
            .endpoints
            .get_mut(&server)
            .ok_or(ConnectionError::Disconnected)?;
        endpoint.recv().await
    }

    /// Universal causal reads: fetch the master's GTID position once
    async fn run_gtid_probe(&mut self) -> Result<(), SessionError> {
        let Some(master) = self.ctx.topology.snapshot().master() else {
            return Ok(());
        };
        self.prepare_endpoint(master).await?;

        let probe = self.causal.probe_packet();
        let opts = RelayOpts {
            collect_rows: true,
            ..RelayOpts::plain()
        };
        let outcome = self.run_on_endpoint(master, probe, opts).await?;
        if let Some(row) = outcome.tracker.rows().first() {
            self.causal.complete_probe(row);
        }
        Ok(())
    }

    async fn continue_load_data<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        query: QueuedQuery,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(target) = self.state.last_used else {
            self.state.load_data_active = false;
            return Err(SessionError::Protocol("LOAD DATA without a target".into()));
        };

        let ends_transfer = query.packet.payload.is_empty();
        {
            let endpoint = self
                .endpoints
                .get_mut(&target)
                .ok_or(ConnectionError::Disconnected)?;
            endpoint.write(query.packet).await.map_err(SessionError::from)?;
        }

        if ends_transfer {
            // The backend acknowledges the whole transfer
            let reply = self.endpoint_recv(target).await?;
            client.send(reply).await?;
            self.state.load_data_active = false;
        }
        Ok(())
    }

    async fn handle_no_target<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        query: QueuedQuery,
        plan: &RoutingPlan,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let config = &self.ctx.config.router;
        warn!(
            session_id = self.id,
            mode = ?plan.mode,
            "No backend available for statement"
        );

        match config.master_failure_mode {
            MasterFailureMode::Fail => {
                client
                    .send(make_error(1045, "28000", "No master server available"))
                    .await?;
                Err(SessionError::Closed("master lost".into()))
            }
            MasterFailureMode::ErrorOnWrite => {
                client
                    .send(make_error(
                        1290,
                        "HY000",
                        "The cluster has no writable server, cannot execute this statement",
                    ))
                    .await?;
                Ok(())
            }
            MasterFailureMode::FailOnWrite => {
                // Keep the session; defer the statement and retry while the
                // retry budget lasts
                let mut query = query;
                let timer = query.retry_timer.get_or_insert_with(Stopwatch::start);
                if timer.split() < config.delayed_retry_timeout() {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    self.query_queue.push_front(query);
                    Ok(())
                } else {
                    client
                        .send(make_error(
                            1290,
                            "HY000",
                            "No writable server became available within the retry window",
                        ))
                        .await?;
                    Ok(())
                }
            }
        }
    }

    /// A backend transport failure during a statement; decide between
    /// retry, transaction replay and surfacing the error
    async fn handle_backend_failure<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        server: ServerId,
        query: QueuedQuery,
        error: SessionError,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let untested_pooled = self
            .endpoints
            .get(&server)
            .map(|e| e.is_untested_pooled())
            .unwrap_or(false);

        warn!(
            session_id = self.id,
            server = %server,
            error = %error,
            "Backend failure"
        );
        self.evict_endpoint(server);

        // A pooled connection that died on first use gets one transparent
        // retry on a fresh connection
        if untested_pooled {
            if query.retried_pool {
                client
                    .send(make_error(
                        1927,
                        "08S01",
                        "Connection was killed while reusing a pooled connection",
                    ))
                    .await?;
                return Ok(());
            }
            let mut query = query;
            query.retried_pool = true;
            self.query_queue.push_front(query);
            return Ok(());
        }

        if self.state.trx_open {
            if self.ctx.config.router.transaction_replay && self.can_replay_trx {
                return self.run_trx_replay(client, Some(query)).await;
            }
            client
                .send(make_error(
                    2013,
                    "HY000",
                    "Lost connection to backend server mid-transaction",
                ))
                .await?;
            return Err(SessionError::Closed("transaction interrupted".into()));
        }

        self.retry_or_surface(client, query).await
    }

    async fn retry_or_surface<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        query: QueuedQuery,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let config = &self.ctx.config.router;
        let stmt = self
            .ctx
            .analyzer
            .parse(&query.packet, CollectFlags::empty());
        let is_read = stmt.type_mask.is_read_only();

        let retryable = if is_read {
            config.retry_failed_reads
        } else {
            config.delayed_retry
        };

        if retryable {
            let mut query = query;
            let timer = query.retry_timer.get_or_insert_with(Stopwatch::start);
            if timer.split() < config.delayed_retry_timeout() {
                let backoff = if is_read { 100 } else { 500 };
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                self.query_queue.push_front(query);
                return Ok(());
            }
        }

        client
            .send(make_error(
                2013,
                "HY000",
                "Lost connection to backend server during query",
            ))
            .await?;
        Ok(())
    }

    /// Replay the recorded transaction on a fresh master connection
    async fn run_trx_replay<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        mut interrupted: Option<QueuedQuery>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if self.replay_budget.attempts() == 0 {
            self.orig_trx = self.trx.clone();
        }
        self.trx.clear();
        self.otrx_active = false;
        let overall = Stopwatch::start();

        loop {
            if !self.replay_budget.can_retry() {
                info!(
                    session_id = self.id,
                    attempts = self.replay_budget.attempts(),
                    "Transaction replay attempts exhausted"
                );
                client
                    .send(make_error(
                        ER_REPLAY_EXHAUSTED,
                        "HY000",
                        "Maximum number of transaction replay attempts exceeded",
                    ))
                    .await?;
                self.state.finish_trx();
                self.trx.clear();
                self.orig_trx.clear();
                self.replay_budget.reset();
                // The session itself survives
                return Ok(());
            }
            self.replay_budget.start_attempt();

            // A master to replay on, waiting out short outages
            let master = loop {
                if let Some(master) = self.ctx.topology.snapshot().master() {
                    break Some(master);
                }
                if overall.split() > self.ctx.config.router.delayed_retry_timeout() {
                    break None;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            };
            let Some(master) = master else {
                continue;
            };

            self.current_master = Some(master);
            self.state.trx_target = Some(master);

            if self.prepare_endpoint(master).await.is_err() {
                self.evict_endpoint(master);
                continue;
            }

            info!(
                session_id = self.id,
                attempt = self.replay_budget.attempts(),
                server = %master,
                "Replaying transaction"
            );

            match self.replay_stmts_on(master).await {
                Ok(replayed) => {
                    if replayed.checksum() == self.orig_trx.checksum() {
                        debug!(session_id = self.id, "Replay checksums match");
                        self.ctx
                            .shared
                            .stats
                            .n_trx_replay
                            .fetch_add(1, Ordering::Relaxed);
                        // Keep recording from the original baseline so a
                        // second failure can replay again
                        self.trx = self.orig_trx.clone();
                        if let Some(query) = interrupted.take() {
                            self.query_queue
                                .push_front(query.with_hint(RoutingHint::ToMaster));
                        }
                        return Ok(());
                    }

                    if self.ctx.config.router.trx_retry_on_mismatch
                        && self.replay_budget.can_retry()
                    {
                        debug!(session_id = self.id, "Replay checksum mismatch, retrying");
                        continue;
                    }

                    client
                        .send(make_error(
                            1927,
                            "08S01",
                            "Transaction checksum mismatch encountered when replaying transaction",
                        ))
                        .await?;
                    self.state.finish_trx();
                    self.trx.clear();
                    self.orig_trx.clear();
                    self.replay_budget.reset();
                    return Err(SessionError::Closed("replay checksum mismatch".into()));
                }
                Err(ReplayAttemptError::Deadlock) => {
                    if self.ctx.config.router.trx_retry_on_deadlock {
                        debug!(session_id = self.id, "Deadlock during replay, retrying");
                        continue;
                    }
                    client
                        .send(make_error(1213, "40001", "Deadlock found during transaction replay"))
                        .await?;
                    self.state.finish_trx();
                    self.replay_budget.reset();
                    return Ok(());
                }
                Err(ReplayAttemptError::Transport) => {
                    self.evict_endpoint(master);
                    continue;
                }
            }
        }
    }

    /// Replay the recorded statements on one backend, accumulating the
    /// reply checksum. Replies are never forwarded to the client.
    async fn replay_stmts_on(&mut self, server: ServerId) -> Result<Trx, ReplayAttemptError> {
        let mut replayed = Trx::new();
        let mut stmts = self.orig_trx.clone();

        while let Some(recorded) = stmts.pop_stmt() {
            let outcome = self
                .run_on_endpoint(server, recorded.packet.clone(), RelayOpts::plain())
                .await
                .map_err(|_| ReplayAttemptError::Transport)?;

            if let Some(error) = outcome.tracker.error() {
                if error.is_deadlock() {
                    return Err(ReplayAttemptError::Deadlock);
                }
            }

            if recorded.checksummed {
                for payload in &outcome.payloads {
                    replayed.add_result(payload);
                }
            }
        }
        Ok(replayed)
    }

    /// A write arrived in an optimistic slave transaction: roll the slave
    /// back and re-run the recorded transaction on the master
    async fn migrate_optimistic_trx<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        query: QueuedQuery,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(slave) = self.state.trx_target else {
            self.otrx_active = false;
            self.query_queue.push_front(query);
            return Ok(());
        };

        debug!(
            session_id = self.id,
            slave = %slave,
            "Optimistic transaction turned out to write, migrating to master"
        );

        let rollback = self
            .run_on_endpoint(slave, Packet::query("ROLLBACK"), RelayOpts::plain())
            .await;
        if rollback.is_err() {
            self.evict_endpoint(slave);
        }

        self.otrx_active = false;
        self.state.trx_target = None;
        self.run_trx_replay(client, Some(query)).await
    }
}

enum ReplayAttemptError {
    Transport,
    Deadlock,
}

/// Statements that mutate session state and must be replayed on every new
/// backend connection
fn is_session_command(mask: TypeMask) -> bool {
    mask.intersects(
        TypeMask::SESSION_WRITE
            | TypeMask::USERVAR_WRITE
            | TypeMask::GSYSVAR_WRITE
            | TypeMask::PREPARE_STMT
            | TypeMask::PREPARE_NAMED_STMT
            | TypeMask::DEALLOC_PREPARE
            | TypeMask::ENABLE_AUTOCOMMIT
            | TypeMask::DISABLE_AUTOCOMMIT,
    )
}

impl RelayOutcome {
    /// Rebuild the reply as packets with ascending sequence numbers,
    /// starting at 1 (the sequence a fresh request expects)
    fn payloads_as_packets(&self) -> Vec<Packet> {
        self.payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| Packet::new((i + 1) as u8, payload.clone()))
            .collect()
    }
}
