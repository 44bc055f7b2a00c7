//! In-process test harness: scripted backend stubs speaking the MySQL
//! wire protocol over in-memory duplex streams, plus a minimal test
//! client. Sessions run on a plain current-thread runtime with a LocalSet,
//! exactly as they would on a worker.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use hermes::backend::{BackendConnection, ConnectionError, ConnectionPool, Connector, ServerCounters};
use hermes::classifier::{Analyzer, StmtCache};
use hermes::config::{BackendAuth, Config, ServerConfig};
use hermes::protocol::{
    capabilities, EofPacket, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket, Packet,
    PacketCodec, ReplyTracker, SERVER_SESSION_STATE_CHANGED, SERVER_STATUS_AUTOCOMMIT,
    SERVER_STATUS_IN_TRANS,
};
use hermes::router::RouterShared;
use hermes::session::{Session, SessionContext};
use hermes::topology::{ServerId, ServerRole, Topology, TopologyHandle};

/// Capabilities the stub backend operates with
pub const STUB_CAPS: u32 = capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_SESSION_TRACK;

/// What a stub backend does with one statement
#[derive(Clone)]
pub enum StubReply {
    Ok,
    /// OK with session-tracked last_gtid and optional in-transaction flag
    OkTracked {
        last_gtid: Option<String>,
        in_trx: bool,
    },
    Err {
        code: u16,
        state: &'static str,
        msg: &'static str,
    },
    /// Single-column text result set
    Rows(Vec<String>),
    /// Several replies in sequence (multi-statement packets)
    Seq(Vec<StubReply>),
    /// Park until the notify fires, then answer with the inner reply
    WaitThen(Arc<tokio::sync::Notify>, Box<StubReply>),
    /// Drop the connection without answering
    Disconnect,
}

pub type StubHandler = dyn Fn(&str) -> StubReply + Send + Sync;

/// One scripted backend server
pub struct StubServer {
    pub handler: Arc<StubHandler>,
    /// Every COM_QUERY text received, across all connections
    pub log: Arc<Mutex<Vec<String>>>,
    /// Number of connections dialed
    pub dials: Arc<AtomicUsize>,
}

impl StubServer {
    pub fn new(handler: impl Fn(&str) -> StubReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            log: Arc::new(Mutex::new(Vec::new())),
            dials: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// A backend that answers OK to everything
    pub fn ok() -> Arc<Self> {
        Self::new(|_| StubReply::Ok)
    }

    pub fn queries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

/// Connector that dials stub servers over in-memory streams
pub struct StubConnector {
    servers: Mutex<HashMap<ServerId, Arc<StubServer>>>,
}

impl StubConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, id: ServerId, server: Arc<StubServer>) {
        self.servers.lock().insert(id, server);
    }
}

#[async_trait::async_trait]
impl Connector for StubConnector {
    async fn connect(
        &self,
        server: &hermes::topology::ServerInfo,
        auth: &BackendAuth,
        database: Option<&str>,
    ) -> Result<BackendConnection, ConnectionError> {
        let stub = self
            .servers
            .lock()
            .get(&server.id)
            .cloned()
            .ok_or_else(|| ConnectionError::Connect(format!("no stub for {}", server.id)))?;

        stub.dials.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        tokio::spawn(run_stub_server(theirs, stub));

        BackendConnection::establish(Box::new(ours), server.id, auth, database).await
    }
}

async fn run_stub_server(stream: DuplexStream, stub: Arc<StubServer>) {
    let mut framed = Framed::new(stream, PacketCodec);

    // Server side of the handshake
    let mut handshake = InitialHandshake::new(999);
    handshake.capability_flags |= capabilities::CLIENT_SESSION_TRACK;
    if framed.send(handshake.encode()).await.is_err() {
        return;
    }
    let Some(Ok(_response)) = framed.next().await else {
        return;
    };
    if framed
        .send(OkPacket::new().encode(2, STUB_CAPS))
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(packet)) = framed.next().await {
        let command = packet.payload.first().copied().unwrap_or(0);
        match command {
            0x01 => return, // COM_QUIT
            0x03 => {
                let sql = String::from_utf8_lossy(&packet.payload[1..]).to_string();
                stub.log.lock().push(sql.clone());
                let reply = (stub.handler)(&sql);
                if !send_reply(&mut framed, reply).await {
                    return;
                }
            }
            // COM_PING, COM_RESET_CONNECTION and anything else: plain OK
            _ => {
                if framed
                    .send(OkPacket::new().encode(1, STUB_CAPS))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Returns false when the connection should be dropped
async fn send_reply(framed: &mut Framed<DuplexStream, PacketCodec>, reply: StubReply) -> bool {
    let mut seq = 1u8;
    send_reply_seq(framed, reply, &mut seq).await
}

fn send_reply_seq<'a>(
    framed: &'a mut Framed<DuplexStream, PacketCodec>,
    reply: StubReply,
    seq: &'a mut u8,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>> {
    Box::pin(async move {
        match reply {
            StubReply::Ok => {
                let ok = OkPacket::new().encode(*seq, STUB_CAPS);
                *seq = seq.wrapping_add(1);
                framed.send(ok).await.is_ok()
            }
            StubReply::OkTracked { last_gtid, in_trx } => {
                let mut status = SERVER_STATUS_AUTOCOMMIT;
                if in_trx {
                    status |= SERVER_STATUS_IN_TRANS;
                }
                let mut ok = OkPacket {
                    status_flags: status,
                    ..OkPacket::new()
                };
                if let Some(gtid) = last_gtid {
                    ok.status_flags |= SERVER_SESSION_STATE_CHANGED;
                    ok.tracked_vars.push(("last_gtid".to_string(), gtid));
                }
                let packet = ok.encode(*seq, STUB_CAPS);
                *seq = seq.wrapping_add(1);
                framed.send(packet).await.is_ok()
            }
            StubReply::Err { code, state, msg } => {
                let err = ErrPacket::new(code, state, msg).encode(*seq, STUB_CAPS);
                *seq = seq.wrapping_add(1);
                framed.send(err).await.is_ok()
            }
            StubReply::Rows(values) => send_resultset(framed, &values, seq).await,
            StubReply::Seq(replies) => {
                for reply in replies {
                    if !send_reply_seq(framed, reply, seq).await {
                        return false;
                    }
                }
                true
            }
            StubReply::WaitThen(notify, inner) => {
                notify.notified().await;
                send_reply_seq(framed, *inner, seq).await
            }
            StubReply::Disconnect => false,
        }
    })
}

async fn send_resultset(
    framed: &mut Framed<DuplexStream, PacketCodec>,
    values: &[String],
    seq: &mut u8,
) -> bool {
    use bytes::BytesMut;
    use hermes::protocol::reply::{put_lenenc_int, put_lenenc_str};

    let mut packets = Vec::new();

    // Column count
    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, 1);
    packets.push(buf.freeze());

    // One minimal column definition
    let mut buf = BytesMut::new();
    for part in [&b"def"[..], b"", b"", b"", b"value", b""] {
        put_lenenc_str(&mut buf, part);
    }
    buf.extend_from_slice(&[0x0c, 0x21, 0, 0xFF, 0, 0, 0, 0xFD, 0, 0, 0, 0, 0]);
    packets.push(buf.freeze());

    // EOF after columns
    packets.push(EofPacket::default().encode(0).payload);

    for value in values {
        let mut buf = BytesMut::new();
        put_lenenc_str(&mut buf, value.as_bytes());
        packets.push(buf.freeze());
    }

    // Terminating EOF
    packets.push(EofPacket::default().encode(0).payload);

    for payload in packets {
        let packet = Packet::new(*seq, payload);
        *seq = seq.wrapping_add(1);
        if framed.send(packet).await.is_err() {
            return false;
        }
    }
    true
}

/// One reply as the test client sees it
pub struct ClientReply {
    pub packets: Vec<Packet>,
    pub error: Option<ErrPacket>,
    pub rows: Vec<String>,
    pub is_ok: bool,
}

/// Minimal MySQL client for driving a proxy session
pub struct TestClient {
    framed: Framed<DuplexStream, PacketCodec>,
}

impl TestClient {
    /// Complete the client side of the handshake
    pub async fn connect(stream: DuplexStream) -> Self {
        let mut framed = Framed::new(stream, PacketCodec);

        let packet = framed.next().await.unwrap().unwrap();
        let handshake = InitialHandshake::parse(&packet.payload).unwrap();

        let response = HandshakeResponse {
            capability_flags: capabilities::DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: hermes::protocol::compute_auth_response(
                "",
                &handshake.auth_plugin_data(),
            ),
            database: None,
            auth_plugin_name: handshake.auth_plugin_name.clone(),
        };
        framed.send(response.encode(1)).await.unwrap();

        let ok = framed.next().await.unwrap().unwrap();
        assert!(
            hermes::protocol::is_ok_packet(&ok.payload),
            "authentication should succeed"
        );

        Self { framed }
    }

    /// Send one statement and read its complete reply
    pub async fn query(&mut self, sql: &str) -> ClientReply {
        self.try_query(sql)
            .await
            .expect("session closed unexpectedly")
    }

    /// Like `query`, but None when the session closed the connection
    pub async fn try_query(&mut self, sql: &str) -> Option<ClientReply> {
        self.framed.send(Packet::query(sql)).await.ok()?;
        self.try_read_reply().await
    }

    pub async fn read_reply(&mut self) -> ClientReply {
        self.try_read_reply()
            .await
            .expect("reply should arrive")
    }

    async fn try_read_reply(&mut self) -> Option<ClientReply> {
        let mut tracker =
            ReplyTracker::new(capabilities::CLIENT_PROTOCOL_41).collecting_rows();
        let mut packets = Vec::new();

        loop {
            let packet = self.framed.next().await?.ok()?;
            let complete = tracker.observe(&packet);
            packets.push(packet);
            if complete {
                break;
            }
        }

        let rows = tracker
            .rows()
            .iter()
            .map(|payload| {
                let mut buf = payload.as_ref();
                hermes::protocol::reply::get_lenenc_int(&mut buf)
                    .and_then(|len| buf.get(..len as usize))
                    .map(|v| String::from_utf8_lossy(v).to_string())
                    .unwrap_or_default()
            })
            .collect();

        Some(ClientReply {
            error: tracker.error().cloned(),
            is_ok: tracker.is_ok(),
            rows,
            packets,
        })
    }

    pub async fn quit(mut self) {
        let _ = self.framed.send(Packet::new(0, vec![0x01])).await;
    }
}

/// A fully wired test fixture: topology, stub backends, worker-local state
pub struct Fixture {
    pub config: Arc<Config>,
    pub topology: TopologyHandle,
    pub shared: Arc<RouterShared>,
    pub connector: Arc<StubConnector>,
    pub pool: Rc<ConnectionPool>,
    pub cache: Rc<RefCell<StmtCache>>,
    pub analyzer: Rc<Analyzer>,
    next_session: std::cell::Cell<u32>,
}

impl Fixture {
    /// Master `s1` (ServerId 0) + slave `s2` (ServerId 1)
    pub fn new(mut config: Config, master: Arc<StubServer>, slave: Arc<StubServer>) -> Self {
        config.servers = vec![
            ServerConfig {
                name: "s1".to_string(),
                host: "stub".to_string(),
                port: 3306,
                role: ServerRole::Master,
                rank: 0,
                weight: 1,
            },
            ServerConfig {
                name: "s2".to_string(),
                host: "stub".to_string(),
                port: 3307,
                role: ServerRole::Slave,
                rank: 0,
                weight: 1,
            },
        ];

        let connector = StubConnector::new();
        connector.register(ServerId(0), master);
        connector.register(ServerId(1), slave);

        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: Config, connector: Arc<StubConnector>) -> Self {
        let config = Arc::new(config);
        let topology = TopologyHandle::new(Topology::from_config(&config.servers));
        let shared = RouterShared::new(ServerCounters::new());

        Self {
            pool: Rc::new(ConnectionPool::new(config.pool.clone())),
            cache: Rc::new(RefCell::new(StmtCache::new(
                config.classifier.cache_max_bytes,
            ))),
            analyzer: Rc::new(Analyzer::new()),
            config,
            topology,
            shared,
            connector,
            next_session: std::cell::Cell::new(1),
        }
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            config: self.config.clone(),
            topology: self.topology.clone(),
            shared: self.shared.clone(),
            pool: self.pool.clone(),
            connector: self.connector.clone(),
            cache: self.cache.clone(),
            analyzer: self.analyzer.clone(),
        }
    }

    /// Spawn a session on the current LocalSet and hand back the connected
    /// client
    pub async fn client(&self) -> TestClient {
        let (client_side, server_side) = tokio::io::duplex(1 << 16);
        let id = self.next_session.get();
        self.next_session.set(id + 1);

        let session = Session::new(id, self.context());
        tokio::task::spawn_local(async move {
            let _ = session.run(server_side).await;
        });

        TestClient::connect(client_side).await
    }
}

/// Run an async test body on a current-thread runtime with a LocalSet,
/// the same environment sessions have on a worker
pub fn run_local<F: std::future::Future<Output = ()>>(f: F) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(f));
}

/// Wrap a handler with realistic transaction-control replies: BEGIN-style
/// statements answer with the in-transaction flag set, as a real server
/// does
pub fn with_trx(
    f: impl Fn(&str) -> StubReply + Send + Sync + 'static,
) -> impl Fn(&str) -> StubReply + Send + Sync + 'static {
    move |sql| {
        let upper = sql.trim_start().to_ascii_uppercase();
        if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
            return StubReply::OkTracked {
                last_gtid: None,
                in_trx: true,
            };
        }
        f(sql)
    }
}

/// Base configuration for tests: small, deterministic, lazy connections
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.router.lazy_connect = true;
    config.router.delayed_retry_timeout = 1;
    config
}
