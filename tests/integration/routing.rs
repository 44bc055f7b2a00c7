//! End-to-end routing behavior: reads to the slave, writes to the master,
//! session commands fanned out, transactions pinned, replies in order.

use crate::common::{run_local, test_config, with_trx, Fixture, StubReply, StubServer};

fn read_write_stubs() -> (std::sync::Arc<StubServer>, std::sync::Arc<StubServer>) {
    let master = StubServer::new(with_trx(|sql| {
        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            StubReply::Rows(vec!["master".to_string()])
        } else {
            StubReply::Ok
        }
    }));
    let slave = StubServer::new(with_trx(|sql| {
        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            StubReply::Rows(vec!["slave".to_string()])
        } else {
            StubReply::Ok
        }
    }));
    (master, slave)
}

#[test]
fn test_plain_read_routes_to_slave() {
    run_local(async {
        let (master, slave) = read_write_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        let reply = client.query("SELECT 1").await;

        assert!(reply.error.is_none());
        assert_eq!(reply.rows, vec!["slave"]);
        assert_eq!(slave.queries(), vec!["SELECT 1"]);
        assert!(master.queries().is_empty());
    });
}

#[test]
fn test_write_routes_to_master() {
    run_local(async {
        let (master, slave) = read_write_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        let reply = client.query("INSERT INTO t VALUES (1)").await;

        assert!(reply.is_ok);
        assert_eq!(master.queries(), vec!["INSERT INTO t VALUES (1)"]);
        assert!(slave.queries().is_empty());
    });
}

#[test]
fn test_session_command_fans_out() {
    run_local(async {
        let (master, slave) = read_write_stubs();
        let mut config = test_config();
        // Eager connections so the slave is attached before the SET
        config.router.lazy_connect = false;
        let fixture = Fixture::new(config, master.clone(), slave.clone());

        let mut client = fixture.client().await;
        let reply = client.query("SET NAMES utf8").await;

        assert!(reply.is_ok, "client must receive the primary's OK");
        assert_eq!(master.queries(), vec!["SET NAMES utf8"]);
        assert_eq!(slave.queries(), vec!["SET NAMES utf8"]);
    });
}

#[test]
fn test_session_commands_replayed_on_fresh_connection() {
    run_local(async {
        let (master, slave) = read_write_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;

        // Lazy connect: only the master sees the session command
        assert!(client.query("SET NAMES utf8").await.is_ok);
        assert_eq!(master.queries(), vec!["SET NAMES utf8"]);
        assert!(slave.queries().is_empty());

        // The first read opens the slave connection, which must be caught
        // up on the history before the user statement
        let reply = client.query("SELECT 1").await;
        assert_eq!(reply.rows, vec!["slave"]);
        assert_eq!(slave.queries(), vec!["SET NAMES utf8", "SELECT 1"]);
    });
}

#[test]
fn test_transaction_pins_reads_to_master() {
    run_local(async {
        let (master, slave) = read_write_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        assert!(client.query("BEGIN").await.is_ok);
        let reply = client.query("SELECT 1").await;
        assert_eq!(reply.rows, vec!["master"]);
        assert!(client.query("COMMIT").await.is_ok);

        assert_eq!(master.queries(), vec!["BEGIN", "SELECT 1", "COMMIT"]);
        assert!(slave.queries().is_empty());

        // After COMMIT reads go back to the slave
        let reply = client.query("SELECT 2").await;
        assert_eq!(reply.rows, vec!["slave"]);
    });
}

#[test]
fn test_replies_preserve_submission_order() {
    run_local(async {
        let master = StubServer::new(|sql| StubReply::Rows(vec![sql.to_string()]));
        let slave = StubServer::new(|sql| StubReply::Rows(vec![sql.to_string()]));
        let fixture = Fixture::new(test_config(), master, slave);

        let mut client = fixture.client().await;
        for i in 0..10 {
            let sql = format!("SELECT {i}");
            let reply = client.query(&sql).await;
            assert_eq!(reply.rows, vec![sql], "reply {i} out of order");
        }
    });
}

#[test]
fn test_select_for_update_goes_to_master() {
    run_local(async {
        let (master, slave) = read_write_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        let reply = client.query("SELECT * FROM t WHERE id = 1 FOR UPDATE").await;
        assert!(reply.error.is_none());
        assert_eq!(master.queries().len(), 1);
        assert!(slave.queries().is_empty());
    });
}

#[test]
fn test_unparseable_statement_goes_to_master() {
    run_local(async {
        let (master, slave) = read_write_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        let reply = client.query("FLARB THE GROBNITZ").await;
        assert!(reply.is_ok);
        assert_eq!(master.queries().len(), 1);
        assert!(slave.queries().is_empty());
    });
}

#[test]
fn test_backend_error_reply_is_forwarded() {
    run_local(async {
        let master = StubServer::new(|_| StubReply::Err {
            code: 1146,
            state: "42S02",
            msg: "Table 'shop.missing' doesn't exist",
        });
        let slave = StubServer::ok();
        let fixture = Fixture::new(test_config(), master, slave);

        let mut client = fixture.client().await;
        let reply = client.query("INSERT INTO missing VALUES (1)").await;
        let error = reply.error.expect("error must reach the client");
        assert_eq!(error.error_code, 1146);
        assert_eq!(error.sql_state, "42S02");

        // The session survives a statement error
        let reply = client.query("INSERT INTO missing VALUES (2)").await;
        assert!(reply.error.is_some());
    });
}
