//! Text-protocol prepared statements: fan-out, history replay onto fresh
//! backends, EXECUTE routing by the prepared statement's character, and
//! reuse of identical PREPAREs.

use crate::common::{run_local, test_config, Fixture, StubReply, StubServer};

fn echo_stubs() -> (std::sync::Arc<StubServer>, std::sync::Arc<StubServer>) {
    let master = StubServer::new(|sql| {
        if sql.starts_with("EXECUTE") || sql.starts_with("SELECT") {
            StubReply::Rows(vec!["master".to_string()])
        } else {
            StubReply::Ok
        }
    });
    let slave = StubServer::new(|sql| {
        if sql.starts_with("EXECUTE") || sql.starts_with("SELECT") {
            StubReply::Rows(vec!["slave".to_string()])
        } else {
            StubReply::Ok
        }
    });
    (master, slave)
}

#[test]
fn test_execute_of_read_only_prepare_runs_on_slave() {
    run_local(async {
        let (master, slave) = echo_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        assert!(client
            .query("PREPARE ps1 FROM 'SELECT * FROM t WHERE id = ?'")
            .await
            .is_ok);

        let reply = client.query("EXECUTE ps1").await;
        assert_eq!(reply.rows, vec!["slave"]);

        // The fresh slave connection was caught up on the PREPARE first
        assert_eq!(
            slave.queries(),
            vec!["PREPARE ps1 FROM 'SELECT * FROM t WHERE id = ?'", "EXECUTE ps1"]
        );
    });
}

#[test]
fn test_execute_of_write_prepare_stays_on_master() {
    run_local(async {
        let (master, slave) = echo_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        assert!(client
            .query("PREPARE ps2 FROM 'UPDATE t SET a = ?'")
            .await
            .is_ok);

        let reply = client.query("EXECUTE ps2").await;
        assert_eq!(reply.rows, vec!["master"]);
        assert!(slave.queries().is_empty());
    });
}

#[test]
fn test_reuse_ps_answers_identical_prepare_from_cache() {
    run_local(async {
        let (master, slave) = echo_stubs();
        let mut config = test_config();
        config.router.reuse_ps = true;
        let fixture = Fixture::new(config, master.clone(), slave);

        let mut client = fixture.client().await;
        assert!(client.query("PREPARE ps1 FROM 'SELECT 1'").await.is_ok);
        assert!(client.query("PREPARE ps1 FROM 'SELECT 1'").await.is_ok);

        let prepares = master
            .queries()
            .iter()
            .filter(|q| q.starts_with("PREPARE"))
            .count();
        assert_eq!(prepares, 1, "identical PREPARE must be served from cache");
    });
}

#[test]
fn test_deallocate_forgets_the_statement() {
    run_local(async {
        let (master, slave) = echo_stubs();
        let fixture = Fixture::new(test_config(), master.clone(), slave.clone());

        let mut client = fixture.client().await;
        assert!(client
            .query("PREPARE ps1 FROM 'SELECT * FROM t'")
            .await
            .is_ok);
        assert!(client.query("DEALLOCATE PREPARE ps1").await.is_ok);

        // With the statement forgotten, EXECUTE no longer counts as a
        // known read and is routed conservatively to the master
        let reply = client.query("EXECUTE ps1").await;
        assert_eq!(reply.rows, vec!["master"]);
    });
}
