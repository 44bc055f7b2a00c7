//! Routing-plan resolution.
//!
//! Decides, for one classified statement, the route mode and the concrete
//! backend. The decision order mirrors the session contract: explicit
//! hints beat classification, session-affecting statements fan out to all
//! backends, open transactions pin to the master, and only clean reads are
//! eligible for slaves.

use rand::Rng;

use crate::classifier::{ClassifiedStmt, ParseStatus, StmtOp, TypeMask};
use crate::config::RouterConfig;
use crate::protocol::Command;
use crate::topology::{ServerId, Topology};

use super::selection::{select_slave, SlaveFilter};
use super::{Gtid, RouteCause, RouteMode, RouterShared, RoutingHint, RoutingPlan};

/// Session context the resolver needs for one statement
pub struct RouteInput<'a> {
    pub stmt: &'a ClassifiedStmt,
    pub command: Option<Command>,
    pub hints: &'a [RoutingHint],
    /// A transaction is open (or starting with this statement)
    pub trx_open: bool,
    pub trx_read_only: bool,
    pub locked_to_master: bool,
    pub current_master: Option<ServerId>,
    pub last_used: Option<ServerId>,
    /// The statement reads a table created with CREATE TEMPORARY TABLE
    pub reads_tmp_table: bool,
    /// For EXECUTE / COM_STMT_EXECUTE: whether the underlying prepared
    /// statement is a pure read
    pub ps_read_only: Option<bool>,
    /// Only slaves at or past this position may serve the read
    /// (causal_reads = fast)
    pub required_gtid: Option<Gtid>,
}

/// Resolve the routing plan for one statement
pub fn resolve(
    input: &RouteInput<'_>,
    config: &RouterConfig,
    topology: &Topology,
    shared: &RouterShared,
    rng: &mut impl Rng,
) -> RoutingPlan {
    let (mode, cause) = route_mode(input, config);
    let target = pick_target(mode, input, config, topology, shared, rng);
    RoutingPlan {
        target,
        mode,
        cause,
    }
}

fn route_mode(input: &RouteInput<'_>, config: &RouterConfig) -> (RouteMode, RouteCause) {
    let stmt = input.stmt;
    let mask = stmt.type_mask;

    if input.locked_to_master {
        return (RouteMode::Master, RouteCause::LockedToMaster);
    }

    // Hints override classification; a master hint wins outright
    for hint in input.hints {
        match hint {
            RoutingHint::ToMaster => return (RouteMode::Master, RouteCause::Hint),
            RoutingHint::ToSlave => return (RouteMode::Slave, RouteCause::Hint),
            RoutingHint::ToLast => return (RouteMode::Last, RouteCause::Hint),
        }
    }

    // Statements we could not interpret must see authoritative data
    if stmt.parse_status == ParseStatus::Invalid {
        return (RouteMode::Master, RouteCause::Unclassified);
    }

    // Text-protocol prepared statements are addressed by client-chosen
    // names, so their management can fan out and any backend can execute
    // later. Binary-protocol statement ids are backend-specific; those
    // stay on the master.
    if mask.intersects(TypeMask::PREPARE_NAMED_STMT | TypeMask::DEALLOC_PREPARE)
        && input.stmt.prepared_name.is_some()
    {
        return (RouteMode::All, RouteCause::PreparedStatement);
    }
    if mask.contains(TypeMask::PREPARE_STMT)
        || matches!(input.command, Some(Command::StmtClose) | Some(Command::StmtReset))
    {
        return (RouteMode::Master, RouteCause::PreparedStatement);
    }

    // Session state must be identical everywhere
    if mask.intersects(
        TypeMask::SESSION_WRITE
            | TypeMask::USERVAR_WRITE
            | TypeMask::GSYSVAR_WRITE
            | TypeMask::ENABLE_AUTOCOMMIT
            | TypeMask::DISABLE_AUTOCOMMIT,
    ) {
        // A session write that also reads cannot fan out; the master's
        // reply is the only one anyway
        if mask.contains(TypeMask::READ) {
            return (RouteMode::Master, RouteCause::SessionWrite);
        }
        return (RouteMode::All, RouteCause::SessionWrite);
    }

    if input.trx_open {
        if input.trx_read_only {
            return (RouteMode::Slave, RouteCause::ReadOnlyTrx);
        }
        return (RouteMode::Master, RouteCause::TrxActive);
    }

    if stmt.multi_stmt && config.strict_multi_stmt {
        return (RouteMode::Master, RouteCause::MultiStatement);
    }

    if stmt.op == StmtOp::Call {
        return (RouteMode::Master, RouteCause::StoredProcedure);
    }

    if input.reads_tmp_table || mask.contains(TypeMask::READ_TMP_TABLE) {
        return (RouteMode::Master, RouteCause::TmpTableRead);
    }

    // LAST_INSERT_ID() and friends only make sense where the write went
    if stmt.uses_function("last_insert_id") || stmt.uses_function("found_rows") {
        return (RouteMode::Master, RouteCause::MasterFunction);
    }

    if mask.contains(TypeMask::EXEC_STMT) {
        return match input.ps_read_only {
            Some(true) => (RouteMode::Slave, RouteCause::Read),
            _ => (RouteMode::Master, RouteCause::PreparedStatement),
        };
    }

    if mask.is_read_only() {
        return (RouteMode::Slave, RouteCause::Read);
    }

    (RouteMode::Master, RouteCause::Write)
}

fn pick_target(
    mode: RouteMode,
    input: &RouteInput<'_>,
    config: &RouterConfig,
    topology: &Topology,
    shared: &RouterShared,
    rng: &mut impl Rng,
) -> Option<ServerId> {
    match mode {
        RouteMode::Master | RouteMode::All => master_target(input, config, topology),
        RouteMode::Last => input
            .last_used
            .filter(|&id| topology.is_reachable(id))
            .or_else(|| master_target(input, config, topology)),
        RouteMode::Slave => {
            let filter = SlaveFilter {
                max_replication_lag: config.max_slave_replication_lag(),
                master_accept_reads: config.master_accept_reads,
                required_gtid: input.required_gtid,
                counters: &shared.counters,
            };
            select_slave(topology, config.slave_selection, &filter, rng)
                .map(|s| s.id)
                // No eligible slave: fall back to the master rather than
                // failing the read
                .or_else(|| master_target(input, config, topology))
        }
    }
}

fn master_target(
    input: &RouteInput<'_>,
    config: &RouterConfig,
    topology: &Topology,
) -> Option<ServerId> {
    if let Some(current) = input.current_master {
        if topology.is_reachable(current) && topology.master() == Some(current) {
            return Some(current);
        }
        // The master moved; only follow it when reconnection is allowed
        if !config.master_reconnection {
            return None;
        }
    }
    topology.master()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ServerCounters;
    use crate::classifier::{Analyzer, CollectFlags, SqlParser};
    use crate::protocol::Packet;
    use crate::topology::{ServerInfo, ServerRole};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn topology() -> Topology {
        Topology::new(vec![
            ServerInfo {
                id: ServerId(0),
                name: "db1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 3306,
                role: ServerRole::Master,
                rank: 0,
                weight: 1,
                replication_lag: None,
                reachable: true,
                gtid_pos: None,
            },
            ServerInfo {
                id: ServerId(1),
                name: "db2".to_string(),
                host: "127.0.0.1".to_string(),
                port: 3307,
                role: ServerRole::Slave,
                rank: 0,
                weight: 1,
                replication_lag: Some(Duration::ZERO),
                reachable: true,
                gtid_pos: None,
            },
        ])
    }

    fn classify(sql: &str) -> ClassifiedStmt {
        Analyzer::new().parse(&Packet::query(sql), CollectFlags::all())
    }

    fn input<'a>(stmt: &'a ClassifiedStmt) -> RouteInput<'a> {
        RouteInput {
            stmt,
            command: Some(Command::Query),
            hints: &[],
            trx_open: false,
            trx_read_only: false,
            locked_to_master: false,
            current_master: Some(ServerId(0)),
            last_used: None,
            reads_tmp_table: false,
            ps_read_only: None,
            required_gtid: None,
        }
    }

    fn resolve_sql(sql: &str) -> RoutingPlan {
        let stmt = classify(sql);
        let config = RouterConfig::default();
        let shared = RouterShared::new(ServerCounters::new());
        let mut rng = SmallRng::seed_from_u64(1);
        resolve(&input(&stmt), &config, &topology(), &shared, &mut rng)
    }

    #[test]
    fn test_plain_read_routes_to_slave() {
        let plan = resolve_sql("SELECT 1");
        assert_eq!(plan.mode, RouteMode::Slave);
        assert_eq!(plan.target, Some(ServerId(1)));
    }

    #[test]
    fn test_write_routes_to_master() {
        let plan = resolve_sql("INSERT INTO t VALUES (1)");
        assert_eq!(plan.mode, RouteMode::Master);
        assert_eq!(plan.target, Some(ServerId(0)));
        assert_eq!(plan.cause, RouteCause::Write);
    }

    #[test]
    fn test_session_write_fans_out() {
        let plan = resolve_sql("SET NAMES utf8");
        assert_eq!(plan.mode, RouteMode::All);
        assert_eq!(plan.target, Some(ServerId(0)));
        assert_eq!(plan.cause, RouteCause::SessionWrite);
    }

    #[test]
    fn test_select_for_update_routes_to_master() {
        let plan = resolve_sql("SELECT * FROM t WHERE id = 1 FOR UPDATE");
        assert_eq!(plan.mode, RouteMode::Master);
    }

    #[test]
    fn test_open_trx_pins_to_master() {
        let stmt = classify("SELECT 1");
        let config = RouterConfig::default();
        let shared = RouterShared::new(ServerCounters::new());
        let mut rng = SmallRng::seed_from_u64(1);
        let mut inp = input(&stmt);
        inp.trx_open = true;

        let plan = resolve(&inp, &config, &topology(), &shared, &mut rng);
        assert_eq!(plan.mode, RouteMode::Master);
        assert_eq!(plan.cause, RouteCause::TrxActive);
    }

    #[test]
    fn test_read_only_trx_routes_to_slave() {
        let stmt = classify("SELECT 1");
        let config = RouterConfig::default();
        let shared = RouterShared::new(ServerCounters::new());
        let mut rng = SmallRng::seed_from_u64(1);
        let mut inp = input(&stmt);
        inp.trx_open = true;
        inp.trx_read_only = true;

        let plan = resolve(&inp, &config, &topology(), &shared, &mut rng);
        assert_eq!(plan.mode, RouteMode::Slave);
        assert_eq!(plan.cause, RouteCause::ReadOnlyTrx);
    }

    #[test]
    fn test_master_hint_overrides_read() {
        let stmt = classify("SELECT 1");
        let config = RouterConfig::default();
        let shared = RouterShared::new(ServerCounters::new());
        let mut rng = SmallRng::seed_from_u64(1);
        let mut inp = input(&stmt);
        let hints = [RoutingHint::ToMaster];
        inp.hints = &hints;

        let plan = resolve(&inp, &config, &topology(), &shared, &mut rng);
        assert_eq!(plan.mode, RouteMode::Master);
        assert_eq!(plan.cause, RouteCause::Hint);
    }

    #[test]
    fn test_last_insert_id_routes_to_master() {
        let plan = resolve_sql("SELECT LAST_INSERT_ID()");
        assert_eq!(plan.mode, RouteMode::Master);
        assert_eq!(plan.cause, RouteCause::MasterFunction);
    }

    #[test]
    fn test_prepare_fans_out() {
        let plan = resolve_sql("PREPARE ps FROM 'SELECT 1'");
        assert_eq!(plan.mode, RouteMode::All);
        assert_eq!(plan.cause, RouteCause::PreparedStatement);
    }

    #[test]
    fn test_execute_follows_prepared_classification() {
        let stmt = classify("EXECUTE ps");
        let config = RouterConfig::default();
        let shared = RouterShared::new(ServerCounters::new());
        let mut rng = SmallRng::seed_from_u64(1);

        let mut inp = input(&stmt);
        inp.ps_read_only = Some(true);
        let plan = resolve(&inp, &config, &topology(), &shared, &mut rng);
        assert_eq!(plan.mode, RouteMode::Slave);

        let mut inp = input(&stmt);
        inp.ps_read_only = Some(false);
        let plan = resolve(&inp, &config, &topology(), &shared, &mut rng);
        assert_eq!(plan.mode, RouteMode::Master);
    }

    #[test]
    fn test_strict_multi_stmt() {
        let stmt = classify("SELECT 1; SELECT 2");
        let mut config = RouterConfig::default();
        let shared = RouterShared::new(ServerCounters::new());
        let mut rng = SmallRng::seed_from_u64(1);

        let plan = resolve(&input(&stmt), &config, &topology(), &shared, &mut rng);
        assert_eq!(plan.mode, RouteMode::Slave);

        config.strict_multi_stmt = true;
        let plan = resolve(&input(&stmt), &config, &topology(), &shared, &mut rng);
        assert_eq!(plan.mode, RouteMode::Master);
        assert_eq!(plan.cause, RouteCause::MultiStatement);
    }

    #[test]
    fn test_garbage_routes_to_master() {
        let plan = resolve_sql("FLARB THE GROBNITZ");
        assert_eq!(plan.mode, RouteMode::Master);
        assert_eq!(plan.cause, RouteCause::Unclassified);
    }

    #[test]
    fn test_no_master_yields_no_target() {
        let stmt = classify("INSERT INTO t VALUES (1)");
        let config = RouterConfig::default();
        let shared = RouterShared::new(ServerCounters::new());
        let mut rng = SmallRng::seed_from_u64(1);

        let mut servers = topology().servers().to_vec();
        servers[0].reachable = false;
        let down = Topology::new(servers);

        let mut inp = input(&stmt);
        inp.current_master = None;
        let plan = resolve(&inp, &config, &down, &shared, &mut rng);
        assert_eq!(plan.target, None);
        assert_eq!(plan.mode, RouteMode::Master);
    }

    #[test]
    fn test_tmp_table_read_routes_to_master() {
        let stmt = classify("SELECT * FROM scratch");
        let config = RouterConfig::default();
        let shared = RouterShared::new(ServerCounters::new());
        let mut rng = SmallRng::seed_from_u64(1);
        let mut inp = input(&stmt);
        inp.reads_tmp_table = true;

        let plan = resolve(&inp, &config, &topology(), &shared, &mut rng);
        assert_eq!(plan.mode, RouteMode::Master);
        assert_eq!(plan.cause, RouteCause::TmpTableRead);
    }
}
