//! Composition root: accepts upgraded streams and runs their connections.
//!
//! A [`Handler`] owns the configuration, the event sink and the
//! [`ConnectionManager`]. For every upgraded WebSocket stream it assigns an
//! id, registers the connection, starts its heartbeat monitor and spawns its
//! read loop.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use socketry::{
//!     events::Callbacks,
//!     heartbeat::HeartbeatConfig,
//!     server::{Handler, HandlerConfig},
//! };
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> socketry::types::Result<()> {
//!     let mut callbacks: Callbacks<TcpStream> = Callbacks::new();
//!     callbacks.on_message(|conn, msg| async move {
//!         let _ = conn.send(&msg).await;
//!     });
//!
//!     let config = HandlerConfig::default().with_heartbeat(HeartbeatConfig::new(
//!         Duration::from_secs(15),
//!         Duration::from_secs(5),
//!         3,
//!     ));
//!
//!     let handler = Handler::new(config, callbacks)?;
//!     handler.listen("0.0.0.0:3001").await
//! }
//! ```

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    conn::{Connection, ConnectionId},
    events::EventSink,
    handle::ConnectionHandle,
    heartbeat::HeartbeatConfig,
    manager::{ConnectionManager, DEFAULT_SEND_TIMEOUT},
    types::{Error, Result},
    Socket,
};

/// Default deadline for the close handshake of a closing connection.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default deadline for a TCP client to complete the WebSocket handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings of a [`Handler`], fixed once the handler is built.
///
/// ## Fields
///
/// - `heartbeat`: liveness monitoring, `None` disables it.
/// - `send_timeout`: per-connection deadline for broadcast sends.
/// - `close_timeout`: deadline for sending the close frame on shutdown.
/// - `handshake_timeout`: deadline for the upgrade handshake in `serve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Heartbeat settings, `None` to disable heartbeats.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Per-connection deadline for broadcast sends.
    pub send_timeout: Duration,
    /// Deadline for the close handshake.
    pub close_timeout: Duration,
    /// Deadline for the WebSocket upgrade handshake of a TCP client.
    pub handshake_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            heartbeat: Some(HeartbeatConfig::default()),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl HandlerConfig {
    /// Enables heartbeats with `heartbeat`.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Disables heartbeats.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = None;
        self
    }

    /// Sets the per-connection broadcast send deadline.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Sets the close handshake deadline.
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Sets the upgrade handshake deadline used by `serve`.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Checks that every value is in range.
    pub fn validate(&self) -> Result<()> {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.validate()?;
        }
        if self.send_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "send_timeout must be greater than zero".into(),
            ));
        }
        if self.close_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "close_timeout must be greater than zero".into(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "handshake_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Accepts upgraded WebSocket streams and runs their connections.
///
/// Cheap to clone; clones share the same manager and connection ids.
pub struct Handler<T>
where
    T: Socket,
{
    inner: Arc<Inner<T>>,
}

struct Inner<T>
where
    T: Socket,
{
    config: HandlerConfig,
    sink: Arc<dyn EventSink<T>>,
    manager: ConnectionManager<T>,
    next_id: AtomicU64,
    tasks: TaskTracker,
}

impl<T> Clone for Handler<T>
where
    T: Socket,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Handler<T>
where
    T: Socket,
{
    /// Builds a handler from a validated configuration and an event sink.
    pub fn new<S>(config: HandlerConfig, sink: S) -> Result<Self>
    where
        S: EventSink<T>,
    {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                manager: ConnectionManager::new(config.send_timeout),
                config,
                sink: Arc::new(sink),
                next_id: AtomicU64::new(1),
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// The registry of open connections.
    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.inner.manager
    }

    /// The configuration this handler was built with.
    pub fn config(&self) -> &HandlerConfig {
        &self.inner.config
    }

    /// Takes over an upgraded WebSocket stream.
    ///
    /// The connection is registered before this returns, so it is already
    /// counted and reachable by broadcasts. Its connect event and read loop
    /// run on a task of their own.
    pub async fn accept(
        &self,
        websocket: WebSocketStream<T>,
        addr: SocketAddr,
    ) -> Result<ConnectionHandle<T>> {
        let id = ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let config = &self.inner.config;

        let mut conn = Connection::new(id, websocket, addr, self.inner.manager.clone());
        let handle = conn.handle().clone();

        if let Err(e) = self.inner.manager.register(handle.clone()).await {
            tracing::error!(conn_id = %id, error = %e, "connection id collision");
            if cfg!(debug_assertions) {
                panic!("{e}");
            }
            conn.abandon(config.close_timeout).await;
            return Err(e);
        }

        let span = tracing::info_span!("connection", conn_id = %id, %addr);
        if let Some(heartbeat) = config.heartbeat {
            conn.start_heartbeat(heartbeat, span.clone());
        }

        let sink = Arc::clone(&self.inner.sink);
        self.inner
            .tasks
            .spawn(conn.run(sink, config.close_timeout).instrument(span));

        Ok(handle)
    }

    /// Closes every connection and waits until their tasks have finished.
    pub async fn shutdown(&self) {
        let closed = self.inner.manager.close_all().await;
        tracing::info!(closed, "shutting down connections");

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }
}

impl Handler<TcpStream> {
    /// Binds `addr` and serves WebSocket clients until the process exits.
    pub async fn listen<A>(&self, addr: A) -> Result<()>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, CancellationToken::new()).await
    }

    /// Accepts TCP clients from `listener`, performs the WebSocket handshake
    /// and hands each upgraded stream to [`accept`](Self::accept).
    ///
    /// Returns after `shutdown` fires and every connection has closed.
    /// A failed or timed-out handshake only affects that client. Handshakes
    /// still running when `shutdown` fires are dropped.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "listening for websocket clients");

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept tcp connection");
                        continue;
                    }
                },
            };

            let handler = self.clone();
            let shutdown = shutdown.clone();
            self.inner
                .tasks
                .spawn(async move { handler.upgrade(stream, addr, shutdown).await });
        }

        self.shutdown().await;
        Ok(())
    }

    async fn upgrade(&self, stream: TcpStream, addr: SocketAddr, shutdown: CancellationToken) {
        let deadline = self.inner.config.handshake_timeout;
        let handshake = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(%addr, "handshake dropped by shutdown");
                return;
            }
            handshake = tokio::time::timeout(deadline, accept_async(stream)) => handshake,
        };

        let websocket = match handshake {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                let err = Error::UpgradeFailed(e.to_string());
                tracing::warn!(%addr, error = %err, "websocket handshake failed");
                return;
            }
            Err(_) => {
                let err = Error::UpgradeFailed(format!("no handshake within {deadline:?}"));
                tracing::warn!(%addr, error = %err, "websocket handshake timed out");
                return;
            }
        };

        if shutdown.is_cancelled() {
            tracing::debug!(%addr, "upgraded after shutdown, dropping");
            return;
        }

        let handle = match self.accept(websocket, addr).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "connection rejected");
                return;
            }
        };

        // shutdown may have fired while registering, after close_all ran
        if shutdown.is_cancelled() {
            handle.close();
        }
    }
}
