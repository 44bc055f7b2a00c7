//! Transaction replay: mid-transaction backend failures are recovered by
//! replaying the recorded statements on a fresh master connection and
//! comparing reply checksums.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::{run_local, test_config, Fixture, StubReply, StubServer};
use hermes::config::Config;

fn replay_config() -> Config {
    let mut config = test_config();
    config.router.transaction_replay = true;
    config.router.trx_max_attempts = 2;
    config
}

#[test]
fn test_trx_replayed_after_master_flap() {
    run_local(async {
        let sleep_failed = Arc::new(AtomicBool::new(false));

        let flag = sleep_failed.clone();
        let master = StubServer::new(move |sql| match sql {
            "BEGIN" => StubReply::OkTracked {
                last_gtid: None,
                in_trx: true,
            },
            "INSERT INTO t VALUES (1)" => StubReply::OkTracked {
                last_gtid: Some("0-1-1".to_string()),
                in_trx: true,
            },
            "SELECT SLEEP(15)" => {
                if flag.swap(true, Ordering::SeqCst) {
                    StubReply::Rows(vec!["0".to_string()])
                } else {
                    // The master goes away mid-statement
                    StubReply::Disconnect
                }
            }
            "SELECT 2" => StubReply::Rows(vec!["2".to_string()]),
            _ => StubReply::Ok,
        });
        let slave = StubServer::ok();

        let fixture = Fixture::new(replay_config(), master.clone(), slave);
        let mut client = fixture.client().await;

        assert!(client.query("BEGIN").await.is_ok);
        assert!(client.query("INSERT INTO t VALUES (1)").await.is_ok);

        // The flap happens while this statement runs; the client still
        // gets its one reply, produced after the replay
        let reply = client.query("SELECT SLEEP(15)").await;
        assert!(reply.error.is_none(), "reply: {:?}", reply.error);
        assert_eq!(reply.rows, vec!["0"]);

        // The session carries on inside the replayed transaction
        let reply = client.query("SELECT 2").await;
        assert_eq!(reply.rows, vec!["2"]);
        assert!(client.query("COMMIT").await.is_ok);

        assert_eq!(master.dial_count(), 2, "replay opens a fresh connection");
        let queries = master.queries();
        // Original execution, then the replayed prefix, then the retried
        // statement
        assert_eq!(
            queries,
            vec![
                "BEGIN",
                "INSERT INTO t VALUES (1)",
                "SELECT SLEEP(15)",
                "BEGIN",
                "INSERT INTO t VALUES (1)",
                "SELECT SLEEP(15)",
                "SELECT 2",
                "COMMIT",
            ]
        );
    });
}

#[test]
fn test_replay_attempt_cap_exhausted() {
    run_local(async {
        let master = StubServer::new(|sql| match sql {
            "BEGIN" => StubReply::OkTracked {
                last_gtid: None,
                in_trx: true,
            },
            // Every attempt at the write kills the connection
            sql if sql.starts_with("INSERT") => StubReply::Disconnect,
            _ => StubReply::Ok,
        });
        let slave = StubServer::new(|_| StubReply::Rows(vec!["1".to_string()]));

        let fixture = Fixture::new(replay_config(), master.clone(), slave);
        let mut client = fixture.client().await;

        assert!(client.query("BEGIN").await.is_ok);

        let reply = client.query("INSERT INTO t VALUES (1)").await;
        let error = reply.error.expect("exhausted replay must surface an error");
        assert_ne!(error.error_code, 1927, "advisory code must be distinct");
        assert_eq!(error.error_code, 5801);

        // The session survives and can keep reading
        let reply = client.query("SELECT 1").await;
        assert_eq!(reply.rows, vec!["1"]);
    });
}

#[test]
fn test_deadlock_triggers_replay_when_configured() {
    run_local(async {
        let deadlocked = Arc::new(AtomicBool::new(false));

        let flag = deadlocked.clone();
        let master = StubServer::new(move |sql| match sql {
            "BEGIN" => StubReply::OkTracked {
                last_gtid: None,
                in_trx: true,
            },
            sql if sql.starts_with("UPDATE") => {
                if flag.swap(true, Ordering::SeqCst) {
                    StubReply::OkTracked {
                        last_gtid: None,
                        in_trx: true,
                    }
                } else {
                    StubReply::Err {
                        code: 1213,
                        state: "40001",
                        msg: "Deadlock found when trying to get lock",
                    }
                }
            }
            _ => StubReply::Ok,
        });
        let slave = StubServer::ok();

        let mut config = replay_config();
        config.router.trx_retry_on_deadlock = true;
        let fixture = Fixture::new(config, master.clone(), slave);
        let mut client = fixture.client().await;

        assert!(client.query("BEGIN").await.is_ok);
        // The deadlock is never surfaced: the transaction replays and the
        // retried statement succeeds
        let reply = client.query("UPDATE t SET a = 1").await;
        assert!(reply.error.is_none());
        assert!(client.query("COMMIT").await.is_ok);
    });
}

#[test]
fn test_checksum_mismatch_closes_session() {
    run_local(async {
        let insert_count = Arc::new(AtomicUsize::new(0));

        let count = insert_count.clone();
        let master = StubServer::new(move |sql| match sql {
            "BEGIN" => StubReply::OkTracked {
                last_gtid: None,
                in_trx: true,
            },
            sql if sql.starts_with("INSERT") => {
                // The replayed INSERT answers differently than the
                // original, so the checksums cannot match
                if count.fetch_add(1, Ordering::SeqCst) == 0 {
                    StubReply::OkTracked {
                        last_gtid: Some("0-1-5".to_string()),
                        in_trx: true,
                    }
                } else {
                    StubReply::Err {
                        code: 1062,
                        state: "23000",
                        msg: "Duplicate entry",
                    }
                }
            }
            sql if sql.starts_with("SELECT") => StubReply::Disconnect,
            _ => StubReply::Ok,
        });
        let slave = StubServer::ok();

        let fixture = Fixture::new(replay_config(), master.clone(), slave);
        let mut client = fixture.client().await;

        assert!(client.query("BEGIN").await.is_ok);
        assert!(client.query("INSERT INTO t VALUES (1)").await.is_ok);

        let reply = client.query("SELECT flap").await;
        let error = reply.error.expect("mismatch must surface an error");
        assert_eq!(error.error_code, 1927);
        assert_eq!(error.sql_state, "08S01");
    });
}
