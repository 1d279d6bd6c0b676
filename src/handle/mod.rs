//! Connection handle and broadcast helpers.
//!
//! Provides `ConnectionHandle` for interacting with a live connection and
//! `Broadcaster` for sending messages to the other clients. Handles are
//! created by the server when a connection is accepted and passed to every
//! event callback. See `server::Handler` and `conn::Connection` for where
//! these are produced.
use std::{
    fmt::Debug,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{stream::SplitSink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message as Frame, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::{
    conn::{ConnState, ConnectionId},
    heartbeat::{HeartbeatState, Liveness},
    manager::{BroadcastReport, ConnectionManager},
    types::{DisconnectReason, Error, Message, Result, Value},
    Socket,
};

pub(crate) type Writer<T> = SplitSink<WebSocketStream<T>, Frame>;

/// Handle for interacting with a WebSocket connection.
///
/// `ConnectionHandle` is cheap to clone and can be shared between tasks.
/// The manager keeps one per registered connection; callbacks receive one
/// with every event.
///
/// ## Features
///
/// - **Send Messages**: Send text and binary messages to the client
/// - **Metadata**: Attach arbitrary key/value data to the connection
/// - **Connection Management**: Close the connection from the server side
/// - **Liveness**: Inspect the heartbeat state and missed pongs
///
/// ## Example
///
/// ```no_run
/// use socketry::events::Callbacks;
/// use tokio::net::TcpStream;
///
/// let mut callbacks: Callbacks<TcpStream> = Callbacks::new();
///
/// callbacks.on_connect(|conn| async move {
///     conn.set_metadata("joined_at", std::time::SystemTime::now());
///     let _ = conn.send_text("Welcome to the server!").await;
/// });
///
/// callbacks.on_message(|conn, msg| async move {
///     if let Some(text) = msg.as_text() {
///         let _ = conn.send_text(format!("Echo: {text}")).await;
///     }
/// });
/// ```
pub struct ConnectionHandle<T>
where
    T: Socket,
{
    pub(crate) inner: Arc<Shared<T>>,

    /// Broadcaster that can send messages to the other active clients.
    pub broadcast: Broadcaster<T>,
}

pub(crate) struct Shared<T>
where
    T: Socket,
{
    pub(crate) id: ConnectionId,
    pub(crate) addr: SocketAddr,
    pub(crate) writer: tokio::sync::Mutex<Writer<T>>,
    pub(crate) state: Mutex<ConnState>,
    pub(crate) metadata: DashMap<String, Value>,
    pub(crate) liveness: Liveness,
    pub(crate) shutdown: CancellationToken,
    pub(crate) close_reason: Mutex<Option<DisconnectReason>>,
    pub(crate) faults: mpsc::UnboundedSender<Error>,
}

impl<T> Clone for ConnectionHandle<T>
where
    T: Socket,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            broadcast: self.broadcast.clone(),
        }
    }
}

impl<T> Debug for ConnectionHandle<T>
where
    T: Socket,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T> ConnectionHandle<T>
where
    T: Socket,
{
    pub(crate) fn new(
        id: ConnectionId,
        addr: SocketAddr,
        writer: Writer<T>,
        faults: mpsc::UnboundedSender<Error>,
        manager: ConnectionManager<T>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                id,
                addr,
                writer: tokio::sync::Mutex::new(writer),
                state: Mutex::new(ConnState::Connecting),
                metadata: DashMap::new(),
                liveness: Liveness::new(),
                shutdown: CancellationToken::new(),
                close_reason: Mutex::new(None),
                faults,
            }),
            broadcast: Broadcaster {
                current_client_id: id,
                manager,
            },
        }
    }

    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the remote address of this connection.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Returns the current lifecycle state.
    ///
    /// # Example
    ///
    /// ```rust
    /// use socketry::conn::ConnState;
    /// use socketry::handle::ConnectionHandle;
    /// use tokio::net::TcpStream;
    ///
    /// fn describe(handle: &ConnectionHandle<TcpStream>) -> &'static str {
    ///     match handle.state() {
    ///         ConnState::Connecting => "connecting",
    ///         ConnState::Open => "open",
    ///         ConnState::Closing => "closing",
    ///         ConnState::Closed => "closed",
    ///     }
    /// }
    /// ```
    pub fn state(&self) -> ConnState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the connection is open and registered.
    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// Current state of the heartbeat monitor.
    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.inner.liveness.state()
    }

    /// Number of consecutive pings that went unanswered.
    pub fn missed_pongs(&self) -> u32 {
        self.inner.liveness.missed()
    }

    /// When the last pong was received, if any.
    pub fn last_pong(&self) -> Option<tokio::time::Instant> {
        self.inner.liveness.last_pong()
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// The write is visible to every `get_metadata` call that starts after
    /// this one returns.
    pub fn set_metadata<K, V>(&self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.inner.metadata.insert(key.into(), value.into());
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.inner.metadata.get(key).map(|v| v.value().clone())
    }

    /// Removes and returns the value stored under `key`.
    pub fn remove_metadata(&self, key: &str) -> Option<Value> {
        self.inner.metadata.remove(key).map(|(_, v)| v)
    }

    /// Keys currently present in the metadata store, in no particular order.
    pub fn metadata_keys(&self) -> Vec<String> {
        self.inner
            .metadata
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Sends a message to the client.
    ///
    /// Returns [`Error::ConnectionClosed`] once the connection has left the
    /// `Open` state.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed(self.id()));
        }
        self.send_frame(message.to_frame()).await
    }

    /// Sends a UTF-8 text message to the client.
    pub async fn send_text<S>(&self, text: S) -> Result<()>
    where
        S: Into<String>,
    {
        self.send(&Message::text(text)).await
    }

    /// Sends binary data to the client.
    pub async fn send_binary<B>(&self, data: B) -> Result<()>
    where
        B: Into<Bytes>,
    {
        self.send(&Message::binary(data)).await
    }

    /// Closes the connection from the server side.
    ///
    /// The connection is deregistered, the disconnect callback fires with
    /// [`DisconnectReason::ServerClosed`] and a close frame is sent to the
    /// client. Calling this more than once has no further effect.
    pub fn close(&self) {
        self.shutdown(DisconnectReason::ServerClosed);
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        writer.send(frame).await?;
        Ok(())
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn liveness(&self) -> &Liveness {
        &self.inner.liveness
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn manager(&self) -> &ConnectionManager<T> {
        &self.broadcast.manager
    }

    /// Records `reason` unless another one was recorded first.
    pub(crate) fn record_close(&self, reason: DisconnectReason) {
        let mut slot = self
            .inner
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub(crate) fn close_reason(&self) -> Option<DisconnectReason> {
        self.inner
            .close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Asks the connection task to shut down with `reason`.
    pub(crate) fn shutdown(&self, reason: DisconnectReason) {
        self.record_close(reason);
        self.inner.shutdown.cancel();
    }

    /// Hands a failure to the connection task, which reports it through the
    /// error callback and then closes the connection.
    pub(crate) fn report_fault(&self, fault: Error) {
        if let Err(e) = self.inner.faults.send(fault) {
            tracing::debug!(conn_id = %self.id(), error = %e.0, "fault after connection ended");
        }
    }
}

/// A helper to broadcast messages to the other connected clients.
#[derive(Debug)]
pub struct Broadcaster<T>
where
    T: Socket,
{
    pub(crate) current_client_id: ConnectionId,
    /// Registry of all active connections.
    pub(crate) manager: ConnectionManager<T>,
}

impl<T> Clone for Broadcaster<T>
where
    T: Socket,
{
    fn clone(&self) -> Self {
        Self {
            current_client_id: self.current_client_id,
            manager: self.manager.clone(),
        }
    }
}

impl<T> Broadcaster<T>
where
    T: Socket,
{
    /// Broadcast a UTF-8 text message to every connected client except the current one.
    pub async fn text<S>(&self, text: S) -> BroadcastReport
    where
        S: Into<String>,
    {
        self.others(Message::text(text)).await
    }

    /// Broadcast a UTF-8 text message to every connected client.
    pub async fn emit_text<S>(&self, text: S) -> BroadcastReport
    where
        S: Into<String>,
    {
        self.everyone(Message::text(text)).await
    }

    /// Broadcast a binary message to every connected client except the current one.
    pub async fn binary<B>(&self, bytes: B) -> BroadcastReport
    where
        B: Into<Bytes>,
    {
        self.others(Message::binary(bytes)).await
    }

    /// Broadcast a binary message to every connected client.
    pub async fn emit_binary<B>(&self, bytes: B) -> BroadcastReport
    where
        B: Into<Bytes>,
    {
        self.everyone(Message::binary(bytes)).await
    }

    async fn others(&self, message: Message) -> BroadcastReport {
        let me = self.current_client_id;
        self.send_filtered(&message, |h| h.id() != me).await
    }

    async fn everyone(&self, message: Message) -> BroadcastReport {
        self.send_filtered(&message, |_| true).await
    }

    async fn send_filtered<F>(&self, message: &Message, filter: F) -> BroadcastReport
    where
        F: Fn(&ConnectionHandle<T>) -> bool,
    {
        let never = CancellationToken::new();
        match self.manager.broadcast_filtered(&never, message, filter).await {
            Ok(report) => report,
            Err(e) => {
                tracing::debug!(
                    conn_id = %self.current_client_id,
                    error = %e,
                    "broadcast from connection did not run"
                );
                BroadcastReport::default()
            }
        }
    }
}
