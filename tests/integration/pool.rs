//! Pool hand-off behavior under a connection cap: a waiting endpoint
//! queues its write, is woken FIFO when the holder releases the
//! connection, and the buffered packet is flushed in order on the single
//! physical connection.

use std::sync::Arc;

use crate::common::{run_local, test_config, Fixture, StubReply, StubServer};

#[test]
fn test_pool_handoff_under_connection_cap() {
    run_local(async {
        let gate = Arc::new(tokio::sync::Notify::new());

        let gate_for_handler = gate.clone();
        let master = StubServer::new(move |sql| {
            if sql.contains("hold") {
                StubReply::WaitThen(gate_for_handler.clone(), Box::new(StubReply::Ok))
            } else {
                StubReply::Rows(vec![sql.to_string()])
            }
        });
        let slave = StubServer::ok();

        let mut config = test_config();
        config.pool.max_connections = 1;
        let fixture = Fixture::new(config, master.clone(), slave);

        let mut session_a = fixture.client().await;
        let mut session_b = fixture.client().await;

        // A occupies the only master slot; its statement parks on the stub
        let hold = tokio::task::spawn_local(async move {
            let reply = session_a.query("UPDATE t SET hold = 1").await;
            assert!(reply.is_ok);
            session_a.quit().await;
        });

        // Give A's statement time to reach the stub and block there
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(master.dial_count(), 1);

        // B's write must wait for the slot; its packet rides the delayed
        // write queue
        let waiter = tokio::task::spawn_local(async move {
            let reply = session_b.query("UPDATE t SET waiter = 1").await;
            assert_eq!(reply.rows, vec!["UPDATE t SET waiter = 1"]);
            session_b.quit().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Still only one physical connection, B has not been served
        assert_eq!(master.dial_count(), 1);
        assert_eq!(master.queries().len(), 1);

        // Release A; its quit hands the connection to B directly
        gate.notify_one();
        hold.await.unwrap();
        waiter.await.unwrap();

        // The hand-off reused the single connection and B's buffered
        // packet arrived after A's
        assert_eq!(master.dial_count(), 1);
        assert_eq!(
            master.queries(),
            vec!["UPDATE t SET hold = 1", "UPDATE t SET waiter = 1"]
        );
    });
}

#[test]
fn test_waiters_woken_in_fifo_order() {
    run_local(async {
        let gate = Arc::new(tokio::sync::Notify::new());

        let gate_for_handler = gate.clone();
        let master = StubServer::new(move |sql| {
            if sql.contains("hold") {
                StubReply::WaitThen(gate_for_handler.clone(), Box::new(StubReply::Ok))
            } else {
                StubReply::Rows(vec![sql.to_string()])
            }
        });
        let slave = StubServer::ok();

        let mut config = test_config();
        config.pool.max_connections = 1;
        let fixture = Fixture::new(config, master.clone(), slave);

        let mut holder = fixture.client().await;
        let mut first = fixture.client().await;
        let mut second = fixture.client().await;

        let hold = tokio::task::spawn_local(async move {
            assert!(holder.query("UPDATE t SET hold = 1").await.is_ok);
            holder.quit().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let first_task = tokio::task::spawn_local(async move {
            let reply = first.query("SELECT 'first' FOR UPDATE").await;
            assert!(reply.error.is_none());
            first.quit().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let second_task = tokio::task::spawn_local(async move {
            let reply = second.query("SELECT 'second' FOR UPDATE").await;
            assert!(reply.error.is_none());
            second.quit().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        gate.notify_one();
        hold.await.unwrap();
        first_task.await.unwrap();
        second_task.await.unwrap();

        let queries = master.queries();
        let first_pos = queries.iter().position(|q| q.contains("first")).unwrap();
        let second_pos = queries.iter().position(|q| q.contains("second")).unwrap();
        assert!(first_pos < second_pos, "waiters must be served FIFO");
        assert_eq!(master.dial_count(), 1, "the one connection is handed along");
    });
}

#[test]
fn test_idle_pooled_endpoint_buffers_and_reconnects() {
    run_local(async {
        use crate::common::StubConnector;
        use hermes::backend::{ConnectionPool, Endpoint, EndpointState};
        use hermes::config::{BackendAuth, PoolConfig};
        use hermes::protocol::Packet;
        use hermes::topology::{ServerId, ServerInfo, ServerRole};
        use std::rc::Rc;

        let master = StubServer::new(|sql| StubReply::Rows(vec![sql.to_string()]));
        let connector = StubConnector::new();
        connector.register(ServerId(0), master.clone());

        let pool = Rc::new(ConnectionPool::new(PoolConfig::default()));
        let info = ServerInfo {
            id: ServerId(0),
            name: "s1".to_string(),
            host: "stub".to_string(),
            port: 3306,
            role: ServerRole::Master,
            rank: 0,
            weight: 1,
            replication_lag: None,
            reachable: true,
            gtid_pos: None,
        };

        let mut endpoint = Endpoint::new(
            info,
            BackendAuth::default(),
            None,
            pool.clone(),
            connector,
        );

        endpoint.ensure_connected().await.unwrap();
        assert_eq!(endpoint.state(), EndpointState::Connected);

        // Lend the connection to the pool while idle
        assert!(endpoint.try_to_pool());
        assert_eq!(endpoint.state(), EndpointState::IdlePooled);
        assert_eq!(pool.idle_count(ServerId(0)), 1);

        // A write while pooled is buffered verbatim
        endpoint.write(Packet::query("SELECT 1")).await.unwrap();
        assert_eq!(endpoint.delayed_write_count(), 1);

        // Reconnecting takes the connection back and flushes the queue in
        // order
        endpoint.ensure_connected().await.unwrap();
        assert_eq!(endpoint.state(), EndpointState::Connected);
        assert_eq!(endpoint.delayed_write_count(), 0);

        let reply = endpoint.recv().await.unwrap();
        assert!(!reply.payload.is_empty());

        assert_eq!(master.dial_count(), 1, "the pooled connection was reused");
        assert_eq!(master.queries(), vec!["SELECT 1"]);
    });
}

#[test]
fn test_pooled_connection_reused_across_sessions() {
    run_local(async {
        let master = StubServer::new(|sql| StubReply::Rows(vec![sql.to_string()]));
        let slave = StubServer::ok();
        let fixture = Fixture::new(test_config(), master.clone(), slave);

        let mut first = fixture.client().await;
        assert!(first.query("UPDATE t SET a = 1").await.error.is_none());
        first.quit().await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let mut second = fixture.client().await;
        assert!(second.query("UPDATE t SET a = 2").await.error.is_none());
        second.quit().await;

        assert_eq!(
            master.dial_count(),
            1,
            "the second session must reuse the pooled connection"
        );
    });
}
