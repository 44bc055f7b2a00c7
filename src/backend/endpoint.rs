//! Per-session backend endpoint.
//!
//! An endpoint is the session-side handle to one backend server. It owns
//! the physical connection while in `Connected`, lends it to the worker's
//! pool while `IdlePooled`, and queues writes while `WaitingForConn` until
//! the pool grants a slot. Queued writes are flushed in order on the
//! transition to `Connected`; a flush failure poisons the endpoint
//! (`ConnectedFailed`) so the connection is never adopted by the pool.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::BackendAuth;
use crate::protocol::Packet;
use crate::topology::{ServerId, ServerInfo};

use super::connection::{BackendConnection, ConnectionError, Connector};
use super::pool::{Acquire, ConnectionPool, Grant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    NoConn,
    Connected,
    WaitingForConn,
    IdlePooled,
    ConnectedFailed,
}

pub struct Endpoint {
    info: ServerInfo,
    auth: BackendAuth,
    database: Option<String>,
    state: EndpointState,
    conn: Option<BackendConnection>,
    delayed_writes: VecDeque<Packet>,
    waiter: Option<oneshot::Receiver<Grant>>,
    pool: Rc<ConnectionPool>,
    connector: Arc<dyn Connector>,
}

impl Endpoint {
    pub fn new(
        info: ServerInfo,
        auth: BackendAuth,
        database: Option<String>,
        pool: Rc<ConnectionPool>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            info,
            auth,
            database,
            state: EndpointState::NoConn,
            conn: None,
            delayed_writes: VecDeque::new(),
            waiter: None,
            pool,
            connector,
        }
    }

    pub fn server(&self) -> ServerId {
        self.info.id
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == EndpointState::Connected
    }

    pub fn delayed_write_count(&self) -> usize {
        self.delayed_writes.len()
    }

    /// Capabilities of the live connection, if any
    pub fn capabilities(&self) -> Option<u32> {
        self.conn.as_ref().map(|c| c.capabilities())
    }

    /// The connection was taken from the pool and has not yet completed a
    /// successful exchange
    pub fn is_untested_pooled(&self) -> bool {
        self.conn
            .as_ref()
            .map(|c| c.is_untested_pooled())
            .unwrap_or(false)
    }

    /// Move towards `Connected` from `NoConn` or `IdlePooled`. May leave
    /// the endpoint in `WaitingForConn` when the pool is at its cap; the
    /// caller then queues writes and awaits `continue_connecting`.
    pub async fn connect(&mut self) -> Result<EndpointState, ConnectionError> {
        match self.state {
            EndpointState::Connected | EndpointState::WaitingForConn => Ok(self.state),
            EndpointState::ConnectedFailed => Err(ConnectionError::Disconnected),
            EndpointState::NoConn | EndpointState::IdlePooled => {
                match self.pool.acquire(self.info.id) {
                    Acquire::Ready(conn) => {
                        debug!(server = %self.info.id, "Reusing pooled connection");
                        self.adopt(conn).await?;
                        Ok(self.state)
                    }
                    Acquire::Dial => {
                        self.dial().await?;
                        Ok(self.state)
                    }
                    Acquire::Wait(rx) => {
                        debug!(server = %self.info.id, "Connection cap reached, waiting");
                        self.waiter = Some(rx);
                        self.state = EndpointState::WaitingForConn;
                        Ok(self.state)
                    }
                }
            }
        }
    }

    /// Await the pool grant while `WaitingForConn`. On success the queued
    /// writes have been flushed in order.
    pub async fn continue_connecting(&mut self) -> Result<(), ConnectionError> {
        if self.state != EndpointState::WaitingForConn {
            return Ok(());
        }

        let rx = self
            .waiter
            .take()
            .ok_or_else(|| ConnectionError::Protocol("no pending pool grant".into()))?;

        match rx.await {
            Ok(Grant::Pooled(conn)) => {
                debug!(server = %self.info.id, "Received pool hand-off");
                self.adopt(conn).await
            }
            Ok(Grant::Dial) => self.dial().await,
            Err(_) => {
                self.state = EndpointState::NoConn;
                Err(ConnectionError::Disconnected)
            }
        }
    }

    /// Connect fully, waiting out the pool if necessary
    pub async fn ensure_connected(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.state {
                EndpointState::Connected => return Ok(()),
                EndpointState::WaitingForConn => self.continue_connecting().await?,
                EndpointState::ConnectedFailed => return Err(ConnectionError::Disconnected),
                EndpointState::NoConn | EndpointState::IdlePooled => {
                    self.connect().await?;
                }
            }
        }
    }

    /// Write a packet. While the endpoint is waiting for a slot (or still
    /// pooled) the packet is buffered verbatim and flushed on connect.
    pub async fn write(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match self.state {
            EndpointState::Connected => {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or(ConnectionError::Disconnected)?;
                conn.send(packet).await
            }
            EndpointState::WaitingForConn | EndpointState::IdlePooled => {
                self.delayed_writes.push_back(packet);
                Ok(())
            }
            EndpointState::NoConn | EndpointState::ConnectedFailed => {
                Err(ConnectionError::Disconnected)
            }
        }
    }

    pub async fn recv(&mut self) -> Result<Packet, ConnectionError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(ConnectionError::Disconnected)?;
        conn.recv().await
    }

    /// Clear the connection's session state with COM_RESET_CONNECTION so
    /// the pool can adopt it without leaking this session's variables.
    /// A failed reset marks the connection broken; it will not pool.
    pub async fn reset_for_pool(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) if self.state == EndpointState::Connected => conn.reset().await,
            _ => false,
        }
    }

    /// Lend the connection to the pool while the session is idle on this
    /// backend. Returns false if there is nothing poolable.
    pub fn try_to_pool(&mut self) -> bool {
        if self.state != EndpointState::Connected {
            return false;
        }
        let Some(conn) = self.conn.take() else {
            return false;
        };
        if conn.is_broken() {
            self.conn = Some(conn);
            return false;
        }

        self.pool.release(self.info.id, conn, true);
        self.state = EndpointState::IdlePooled;
        true
    }

    /// Release the endpoint's resources. With `normal_quit` the connection
    /// is offered to the pool; a poisoned endpoint never pools.
    pub fn close(&mut self, normal_quit: bool) {
        match self.state {
            EndpointState::Connected => {
                if let Some(conn) = self.conn.take() {
                    let poolable = normal_quit && !conn.is_broken();
                    self.pool.release(self.info.id, conn, poolable);
                }
            }
            EndpointState::ConnectedFailed => {
                if let Some(conn) = self.conn.take() {
                    self.pool.release(self.info.id, conn, false);
                } else {
                    self.pool.dial_failed(self.info.id);
                }
            }
            EndpointState::WaitingForConn => {
                // A grant may already be in flight; give it back
                if let Some(mut rx) = self.waiter.take() {
                    match rx.try_recv() {
                        Ok(Grant::Pooled(conn)) => self.pool.release(self.info.id, conn, false),
                        Ok(Grant::Dial) => self.pool.dial_failed(self.info.id),
                        Err(_) => {}
                    }
                }
            }
            EndpointState::IdlePooled | EndpointState::NoConn => {}
        }
        self.delayed_writes.clear();
        self.state = EndpointState::NoConn;
    }

    async fn dial(&mut self) -> Result<(), ConnectionError> {
        match self
            .connector
            .connect(&self.info, &self.auth, self.database.as_deref())
            .await
        {
            Ok(conn) => self.adopt(conn).await,
            Err(e) => {
                self.pool.dial_failed(self.info.id);
                self.state = EndpointState::NoConn;
                Err(e)
            }
        }
    }

    /// Take ownership of a live connection and flush any queued writes in
    /// their original order
    async fn adopt(&mut self, conn: BackendConnection) -> Result<(), ConnectionError> {
        self.conn = Some(conn);
        self.state = EndpointState::Connected;

        while let Some(packet) = self.delayed_writes.pop_front() {
            let conn = self.conn.as_mut().ok_or(ConnectionError::Disconnected)?;
            if let Err(e) = conn.send(packet).await {
                // The replay failed mid-stream; this connection must not
                // be adopted by the pool on close
                self.state = EndpointState::ConnectedFailed;
                return Err(e);
            }
        }
        Ok(())
    }
}
