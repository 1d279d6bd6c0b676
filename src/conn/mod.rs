//! A single WebSocket connection and its read loop.
//!
//! Every accepted stream becomes a `Connection`. The connection task owns the
//! read half of the stream; the write half lives behind the
//! [`ConnectionHandle`] so that callbacks, broadcasts and the heartbeat
//! monitor can all send.
//!
//! Events for one connection are always delivered from its own task, in this
//! order: one connect, then messages and errors in the order they happened,
//! then exactly one disconnect.

use std::{fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message as Frame},
    WebSocketStream,
};
use tracing::Instrument;

use crate::{
    events::EventSink,
    handle::ConnectionHandle,
    heartbeat::{self, HeartbeatConfig},
    manager::ConnectionManager,
    types::{CloseEvent, DisconnectReason, Error, Message, MessageType},
    Socket,
};

/// Opaque, process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw id.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted but not registered yet.
    Connecting,
    /// Registered and exchanging messages.
    Open,
    /// Deregistered, shutting down.
    Closing,
    /// Fully closed.
    Closed,
}

/// One accepted WebSocket connection.
pub struct Connection<T>
where
    T: Socket,
{
    handle: ConnectionHandle<T>,
    reader: SplitStream<WebSocketStream<T>>,
    faults: mpsc::UnboundedReceiver<Error>,
    heartbeat: Option<JoinHandle<()>>,
}

impl<T> Connection<T>
where
    T: Socket,
{
    pub(crate) fn new(
        id: ConnectionId,
        websocket: WebSocketStream<T>,
        addr: SocketAddr,
        manager: ConnectionManager<T>,
    ) -> Self {
        let (writer, reader) = websocket.split();
        let (fault_tx, faults) = mpsc::unbounded_channel();

        Self {
            handle: ConnectionHandle::new(id, addr, writer, fault_tx, manager),
            reader,
            faults,
            heartbeat: None,
        }
    }

    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Returns the remote address of this connection.
    pub fn addr(&self) -> SocketAddr {
        self.handle.addr()
    }

    /// Returns the shared handle of this connection.
    pub fn handle(&self) -> &ConnectionHandle<T> {
        &self.handle
    }

    pub(crate) fn start_heartbeat(&mut self, config: HeartbeatConfig, span: tracing::Span) {
        let monitor = heartbeat::run(self.handle.clone(), config).instrument(span);
        self.heartbeat = Some(tokio::spawn(monitor));
    }

    /// Drives the connection until it closes: fires the connect event, runs
    /// the read loop and tears the connection down.
    pub(crate) async fn run(mut self, sink: Arc<dyn EventSink<T>>, close_timeout: Duration) {
        tracing::info!(conn_id = %self.id(), addr = %self.addr(), "connection opened");

        sink.on_connect(self.handle.clone()).await;
        let reason = self.read_loop(sink.as_ref()).await;
        self.teardown(reason, sink.as_ref(), close_timeout).await;
    }

    async fn read_loop(&mut self, sink: &dyn EventSink<T>) -> DisconnectReason {
        let shutdown = self.handle.shutdown_token();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return self.handle.close_reason().unwrap_or(DisconnectReason::ServerClosed);
                }
                Some(fault) = self.faults.recv() => {
                    sink.on_error(self.handle.clone(), fault).await;
                    return DisconnectReason::SendFailed;
                }
                frame = self.reader.next() => match frame {
                    Some(Ok(Frame::Text(text))) => {
                        let message = Message::from_parts(MessageType::Text, Bytes::from(text));
                        sink.on_message(self.handle.clone(), message).await;
                    }
                    Some(Ok(Frame::Binary(bin))) => {
                        let message = Message::from_parts(MessageType::Binary, bin);
                        sink.on_message(self.handle.clone(), message).await;
                    }
                    Some(Ok(Frame::Pong(_))) => self.handle.liveness().observe_pong(),
                    // answered by the protocol layer
                    Some(Ok(Frame::Ping(_))) => {}
                    Some(Ok(Frame::Close(frame))) => {
                        let event = match frame {
                            None => CloseEvent::default(),
                            Some(frame) => {
                                CloseEvent::new(u16::from(frame.code), frame.reason.to_string())
                            }
                        };
                        return DisconnectReason::PeerClosed(event);
                    }
                    Some(Ok(Frame::Frame(_))) => {}
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                        return DisconnectReason::StreamEnded;
                    }
                    Some(Err(e)) => {
                        let reason = e.to_string();
                        sink.on_error(self.handle.clone(), Error::Protocol(e)).await;
                        return DisconnectReason::StreamError(reason);
                    }
                }
            }
        }
    }

    async fn teardown(
        mut self,
        reason: DisconnectReason,
        sink: &dyn EventSink<T>,
        close_timeout: Duration,
    ) {
        let handle = self.handle.clone();
        let id = handle.id();

        handle.record_close(reason.clone());
        let reason = handle.close_reason().unwrap_or(reason);

        handle.manager().deregister(id).await;
        handle.set_state(ConnState::Closing);

        // stops the heartbeat monitor
        handle.shutdown_token().cancel();
        if let Some(monitor) = self.heartbeat.take() {
            if let Err(e) = monitor.await {
                tracing::warn!(conn_id = %id, error = %e, "heartbeat task failed");
            }
        }

        sink.on_disconnect(handle.clone(), reason.clone()).await;

        self.faults.close();
        let close = async {
            let mut writer = handle.inner.writer.lock().await;
            let _ = writer.send(Frame::Close(None)).await;
            let _ = writer.close().await;
        };
        if tokio::time::timeout(close_timeout, close).await.is_err() {
            tracing::debug!(conn_id = %id, "close handshake timed out");
        }

        handle.set_state(ConnState::Closed);
        tracing::info!(conn_id = %id, %reason, "connection closed");
    }

    /// Closes a connection that was never registered, without firing events.
    pub(crate) async fn abandon(self, close_timeout: Duration) {
        let handle = self.handle.clone();
        handle.set_state(ConnState::Closing);

        let close = async {
            let mut writer = handle.inner.writer.lock().await;
            let _ = writer.send(Frame::Close(None)).await;
            let _ = writer.close().await;
        };
        let _ = tokio::time::timeout(close_timeout, close).await;

        handle.set_state(ConnState::Closed);
    }
}
