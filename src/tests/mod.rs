mod heartbeat_test;
mod types_test;

use std::{net::SocketAddr, time::Duration};

use futures::future::BoxFuture;
use tokio::{io::DuplexStream, sync::mpsc};
use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};

use crate::{
    conn::ConnectionId,
    events::EventSink,
    handle::ConnectionHandle,
    manager::ConnectionManager,
    server::{Handler, HandlerConfig},
    types::{DisconnectReason, Error, Message},
    Socket,
};

pub(crate) type Client = WebSocketStream<DuplexStream>;

/// Lifecycle event as observed by [`Recorder`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Connect(ConnectionId),
    Message(ConnectionId, Message),
    Error(ConnectionId, String),
    Disconnect(ConnectionId, DisconnectReason),
}

impl Event {
    pub(crate) fn id(&self) -> ConnectionId {
        match self {
            Event::Connect(id)
            | Event::Message(id, _)
            | Event::Error(id, _)
            | Event::Disconnect(id, _) => *id,
        }
    }
}

/// Event sink that forwards every event into a channel.
pub(crate) struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn record(&self, event: Event) -> BoxFuture<'static, ()> {
        let _ = self.tx.send(event);
        Box::pin(async {})
    }
}

impl<T: Socket> EventSink<T> for Recorder {
    fn on_connect(&self, conn: ConnectionHandle<T>) -> BoxFuture<'static, ()> {
        self.record(Event::Connect(conn.id()))
    }

    fn on_disconnect(
        &self,
        conn: ConnectionHandle<T>,
        reason: DisconnectReason,
    ) -> BoxFuture<'static, ()> {
        self.record(Event::Disconnect(conn.id(), reason))
    }

    fn on_message(&self, conn: ConnectionHandle<T>, message: Message) -> BoxFuture<'static, ()> {
        self.record(Event::Message(conn.id(), message))
    }

    fn on_error(&self, conn: ConnectionHandle<T>, error: Error) -> BoxFuture<'static, ()> {
        self.record(Event::Error(conn.id(), error.to_string()))
    }
}

pub(crate) fn test_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Server and client ends of an in-memory WebSocket.
pub(crate) async fn ws_pair(buffer: usize) -> (WebSocketStream<DuplexStream>, Client) {
    let (server, client) = tokio::io::duplex(buffer);
    let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
    (server, client)
}

pub(crate) fn recording_handler(
    config: HandlerConfig,
) -> (Handler<DuplexStream>, mpsc::UnboundedReceiver<Event>) {
    let (recorder, rx) = Recorder::new();
    let handler = Handler::new(config, recorder).expect("valid config");
    (handler, rx)
}

pub(crate) async fn connect(
    handler: &Handler<DuplexStream>,
    buffer: usize,
) -> (ConnectionHandle<DuplexStream>, Client) {
    let (server, client) = ws_pair(buffer).await;
    let handle = handler
        .accept(server, test_addr())
        .await
        .expect("connection accepted");
    (handle, client)
}

pub(crate) async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

/// Waits for the disconnect event of `id`, returning every event of `id`
/// seen on the way, the disconnect included.
pub(crate) async fn events_until_disconnect(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    id: ConnectionId,
) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        if event.id() != id {
            continue;
        }
        let done = matches!(event, Event::Disconnect(..));
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub(crate) async fn wait_for_count<T: Socket>(manager: &ConnectionManager<T>, expected: usize) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while manager.count().await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "count never reached {expected}");
}

pub(crate) async fn wait_closed<T: Socket>(handle: &ConnectionHandle<T>) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while handle.state() != crate::conn::ConnState::Closed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "connection {} never closed", handle.id());
}

pub(crate) fn quiet_config() -> HandlerConfig {
    HandlerConfig::default().without_heartbeat()
}
