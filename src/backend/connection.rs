use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::config::BackendAuth;
use crate::protocol::{
    capabilities, compute_auth_response, is_err_packet, is_ok_packet, ErrPacket,
    HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};
use crate::topology::{ServerId, ServerInfo};

/// Stream a backend connection runs over. Boxed so tests can substitute an
/// in-memory duplex for a TCP socket.
pub trait BackendStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BackendStream for T {}

/// A live, authenticated backend connection
pub struct BackendConnection {
    framed: Framed<Box<dyn BackendStream>, PacketCodec>,
    server: ServerId,
    created_at: Instant,
    capabilities: u32,
    broken: bool,
    /// Set while a connection taken from the idle pool has not yet proven
    /// itself with a successful exchange
    fresh_from_pool: bool,
}

impl BackendConnection {
    /// Perform the client side of the MySQL handshake over an established
    /// stream
    pub async fn establish(
        stream: Box<dyn BackendStream>,
        server: ServerId,
        auth: &BackendAuth,
        database: Option<&str>,
    ) -> Result<Self, ConnectionError> {
        let mut framed = Framed::new(stream, PacketCodec);

        let handshake_packet = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let backend_handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| ConnectionError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server = %server,
            server_version = %backend_handshake.server_version,
            "Received backend handshake"
        );

        let auth_data = backend_handshake.auth_plugin_data();
        let auth_response = compute_auth_response(&auth.password, &auth_data);

        // Session tracking gives us last_gtid in OK packets; ask for it
        // when the backend offers it
        let wanted = capabilities::DEFAULT_CAPABILITIES | capabilities::CLIENT_SESSION_TRACK;
        let mut caps = wanted & backend_handshake.capability_flags;
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: auth.user.clone(),
            auth_response,
            database: database.map(|s| s.to_string()),
            auth_plugin_name: backend_handshake.auth_plugin_name.clone(),
        };

        framed
            .send(response.encode(1))
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        let reply = framed
            .next()
            .await
            .ok_or(ConnectionError::Disconnected)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            error!(
                server = %server,
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(ConnectionError::Auth(err.error_message));
        }

        if !is_ok_packet(&reply.payload) {
            return Err(ConnectionError::Protocol(
                "Expected OK packet from backend".into(),
            ));
        }

        Ok(Self {
            framed,
            server,
            created_at: Instant::now(),
            capabilities: caps,
            broken: false,
            fresh_from_pool: false,
        })
    }

    pub fn server(&self) -> ServerId {
        self.server
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn mark_pooled_reuse(&mut self) {
        self.fresh_from_pool = true;
    }

    /// True until a connection taken from the pool has completed one
    /// successful exchange
    pub fn is_untested_pooled(&self) -> bool {
        self.fresh_from_pool
    }

    pub async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match self.framed.send(packet).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.broken = true;
                Err(ConnectionError::Io(e.to_string()))
            }
        }
    }

    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(packet)) => {
                self.fresh_from_pool = false;
                Ok(packet)
            }
            Some(Err(e)) => {
                self.broken = true;
                Err(ConnectionError::Io(e.to_string()))
            }
            None => {
                self.broken = true;
                Err(ConnectionError::Disconnected)
            }
        }
    }

    /// COM_RESET_CONNECTION: clear session state before the connection is
    /// parked in the idle pool
    pub async fn reset(&mut self) -> bool {
        let reset = Packet::new(0, vec![0x1f]);
        if self.send(reset).await.is_err() {
            return false;
        }
        match self.recv().await {
            Ok(reply) => is_ok_packet(&reply.payload),
            Err(_) => false,
        }
    }
}

/// Dials and authenticates backend connections. Injected so tests can run
/// against in-memory backends.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        server: &ServerInfo,
        auth: &BackendAuth,
        database: Option<&str>,
    ) -> Result<BackendConnection, ConnectionError>;
}

/// The production connector: plain TCP
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        server: &ServerInfo,
        auth: &BackendAuth,
        database: Option<&str>,
    ) -> Result<BackendConnection, ConnectionError> {
        let addr = server.address();
        debug!(addr = %addr, "Connecting to backend");

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to connect to backend");
            ConnectionError::Connect(e.to_string())
        })?;

        BackendConnection::establish(Box::new(stream), server.id, auth, database).await
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection disconnected")]
    Disconnected,
}
