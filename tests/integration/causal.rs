//! Causal reads: GTID capture from master OKs, the wait prefix on slave
//! reads, packet renumbering, the read-only-transaction timeout error and
//! the master retry.

use crate::common::{run_local, test_config, with_trx, Fixture, StubReply, StubServer};
use hermes::config::{CausalReadsMode, Config};

fn causal_config(mode: CausalReadsMode) -> Config {
    let mut config = test_config();
    config.router.causal_reads = mode;
    config.router.causal_reads_timeout = 1;
    config
}

fn gtid_master() -> std::sync::Arc<StubServer> {
    StubServer::new(with_trx(|sql| {
        if sql.starts_with("INSERT") {
            StubReply::OkTracked {
                last_gtid: Some("0-1-42".to_string()),
                in_trx: false,
            }
        } else if sql == "SELECT @@gtid_current_pos" {
            StubReply::Rows(vec!["0-1-42".to_string()])
        } else if sql.starts_with("SELECT") {
            StubReply::Rows(vec!["master".to_string()])
        } else {
            StubReply::Ok
        }
    }))
}

/// A slave that serves synced causal reads: OK for the wait, then the rows
fn synced_slave() -> std::sync::Arc<StubServer> {
    StubServer::new(with_trx(|sql| {
        if sql.contains("MASTER_GTID_WAIT") {
            StubReply::Seq(vec![
                StubReply::Ok,
                StubReply::Rows(vec!["slave".to_string()]),
            ])
        } else {
            StubReply::Rows(vec!["slave".to_string()])
        }
    }))
}

/// A slave whose GTID wait always times out
fn lagging_slave() -> std::sync::Arc<StubServer> {
    StubServer::new(with_trx(|sql| {
        if sql.contains("MASTER_GTID_WAIT") {
            StubReply::Err {
                code: 1969,
                state: "70100",
                msg: "Query execution was interrupted (max_statement_time exceeded)",
            }
        } else {
            StubReply::Rows(vec!["slave".to_string()])
        }
    }))
}

#[test]
fn test_local_causal_read_carries_wait_prefix() {
    run_local(async {
        let master = gtid_master();
        let slave = synced_slave();
        let fixture = Fixture::new(causal_config(CausalReadsMode::Local), master.clone(), slave.clone());

        let mut client = fixture.client().await;

        // Before any write, reads go out unmodified
        let reply = client.query("SELECT a FROM t").await;
        assert_eq!(reply.rows, vec!["slave"]);
        assert_eq!(slave.queries(), vec!["SELECT a FROM t"]);

        // The write captures the GTID position
        assert!(client.query("INSERT INTO t VALUES (1)").await.is_ok);

        // The next read waits for it
        let reply = client.query("SELECT a FROM t").await;
        assert_eq!(reply.rows, vec!["slave"]);

        let queries = slave.queries();
        let combined = queries.last().unwrap();
        assert!(
            combined.starts_with(
                "SET @hermes_gtid_sync=(SELECT CASE WHEN MASTER_GTID_WAIT('0-1-42', 1) = 0"
            ),
            "missing wait prefix: {combined}"
        );
        assert!(combined.ends_with("END);SELECT a FROM t"));

        // The hidden wait result is stripped and the packets renumbered
        // from 1
        for (i, packet) in reply.packets.iter().enumerate() {
            assert_eq!(packet.sequence_id as usize, i + 1, "bad renumbering");
        }
    });
}

#[test]
fn test_causal_timeout_retries_on_master() {
    run_local(async {
        let master = gtid_master();
        let slave = lagging_slave();
        let fixture = Fixture::new(causal_config(CausalReadsMode::Local), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        assert!(client.query("INSERT INTO t VALUES (1)").await.is_ok);

        // The slave cannot catch up in time; the statement is retried on
        // the master and the client sees exactly one reply
        let reply = client.query("SELECT a FROM t").await;
        assert!(reply.error.is_none());
        assert_eq!(reply.rows, vec!["master"]);

        let master_queries = master.queries();
        assert_eq!(master_queries.last().unwrap(), "SELECT a FROM t");
    });
}

#[test]
fn test_causal_timeout_in_read_only_trx_is_an_error() {
    run_local(async {
        let master = gtid_master();
        let slave = lagging_slave();
        let fixture = Fixture::new(causal_config(CausalReadsMode::Local), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        assert!(client.query("INSERT INTO t VALUES (1)").await.is_ok);
        assert!(client.query("START TRANSACTION READ ONLY").await.is_ok);

        let reply = client.query("SELECT a FROM t").await;
        let error = reply.error.expect("read-only causal timeout is an error");
        assert_eq!(error.error_code, 1792);
        assert_eq!(error.sql_state, "25006");

        // No retry on the master
        assert!(!master
            .queries()
            .iter()
            .any(|q| q == "SELECT a FROM t"));
    });
}

#[test]
fn test_global_mode_shares_position_between_sessions() {
    run_local(async {
        let master = gtid_master();
        let slave = synced_slave();
        let fixture = Fixture::new(causal_config(CausalReadsMode::Global), master, slave.clone());

        // One session writes
        let mut writer = fixture.client().await;
        assert!(writer.query("INSERT INTO t VALUES (1)").await.is_ok);

        // Another session's read must wait for the service-wide position
        let mut reader = fixture.client().await;
        let reply = reader.query("SELECT a FROM t").await;
        assert_eq!(reply.rows, vec!["slave"]);
        assert!(slave
            .queries()
            .last()
            .unwrap()
            .contains("MASTER_GTID_WAIT('0-1-42'"));
    });
}

#[test]
fn test_universal_mode_probes_master_first() {
    run_local(async {
        let master = gtid_master();
        let slave = synced_slave();
        let fixture = Fixture::new(
            causal_config(CausalReadsMode::Universal),
            master.clone(),
            slave.clone(),
        );

        let mut client = fixture.client().await;
        let reply = client.query("SELECT a FROM t").await;
        assert_eq!(reply.rows, vec!["slave"]);

        assert!(
            master
                .queries()
                .contains(&"SELECT @@gtid_current_pos".to_string()),
            "universal mode must probe the master"
        );
        assert!(slave
            .queries()
            .last()
            .unwrap()
            .contains("MASTER_GTID_WAIT('0-1-42'"));
    });
}

#[test]
fn test_fast_mode_routes_to_caught_up_replica_only() {
    run_local(async {
        let master = gtid_master();
        let slave = synced_slave();
        let fixture = Fixture::new(causal_config(CausalReadsMode::Fast), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        assert!(client.query("INSERT INTO t VALUES (1)").await.is_ok);

        // The replica lags: the read falls back to the master, unrewritten
        fixture
            .topology
            .update(|servers| servers[1].gtid_pos = Some("0-1-10".to_string()));
        let reply = client.query("SELECT a FROM t").await;
        assert_eq!(reply.rows, vec!["master"]);

        // The replica catches up: the read goes there, still unrewritten
        fixture
            .topology
            .update(|servers| servers[1].gtid_pos = Some("0-1-42".to_string()));
        let reply = client.query("SELECT a FROM t").await;
        assert_eq!(reply.rows, vec!["slave"]);
        assert!(!slave.queries().iter().any(|q| q.contains("MASTER_GTID_WAIT")));
    });
}
