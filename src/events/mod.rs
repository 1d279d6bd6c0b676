//! Lifecycle events and the callbacks that receive them.
//!
//! Events are delivered by direct calls on the connection's own task; there
//! is no queue in between. For a single connection the order is one
//! `on_connect`, then `on_message`/`on_error` in the order they happened,
//! then one `on_disconnect`. Different connections run in parallel, so a sink
//! shared between them must do its own synchronization.

use std::{future::Future, sync::Arc};

use futures::future::BoxFuture;

use crate::{
    handle::ConnectionHandle,
    types::{DisconnectReason, Error, Message},
    Socket,
};

/// Receiver of connection lifecycle events.
///
/// Each method returns a future that the connection task awaits before
/// reading the next frame, so a slow sink only delays its own connection.
pub trait EventSink<T>: Send + Sync + 'static
where
    T: Socket,
{
    /// A connection was registered and is open.
    fn on_connect(&self, conn: ConnectionHandle<T>) -> BoxFuture<'static, ()>;

    /// A connection closed. Fires exactly once, after every other event.
    fn on_disconnect(
        &self,
        conn: ConnectionHandle<T>,
        reason: DisconnectReason,
    ) -> BoxFuture<'static, ()>;

    /// A text or binary message arrived.
    fn on_message(&self, conn: ConnectionHandle<T>, message: Message) -> BoxFuture<'static, ()>;

    /// Reading from or writing to the connection failed.
    fn on_error(&self, conn: ConnectionHandle<T>, error: Error) -> BoxFuture<'static, ()>;
}

type ConnectCallback<T> = Arc<dyn Fn(ConnectionHandle<T>) -> BoxFuture<'static, ()> + Send + Sync>;
type DisconnectCallback<T> =
    Arc<dyn Fn(ConnectionHandle<T>, DisconnectReason) -> BoxFuture<'static, ()> + Send + Sync>;
type MessageCallback<T> =
    Arc<dyn Fn(ConnectionHandle<T>, Message) -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorCallback<T> =
    Arc<dyn Fn(ConnectionHandle<T>, Error) -> BoxFuture<'static, ()> + Send + Sync>;

/// [`EventSink`] built from async closures.
///
/// Configure before first accept: the handler takes ownership of the
/// callbacks, so they cannot change while connections are being served.
/// Unset callbacks do nothing.
///
/// ## Example
///
/// ```
/// use socketry::events::Callbacks;
/// use tokio::net::TcpStream;
///
/// let mut callbacks: Callbacks<TcpStream> = Callbacks::new();
///
/// callbacks.on_connect(|conn| async move {
///     println!("client connected: {}", conn.id());
/// });
///
/// callbacks.on_disconnect(|conn, reason| async move {
///     println!("client disconnected: {} ({reason})", conn.id());
/// });
/// ```
pub struct Callbacks<T>
where
    T: Socket,
{
    on_connect: Option<ConnectCallback<T>>,
    on_disconnect: Option<DisconnectCallback<T>>,
    on_message: Option<MessageCallback<T>>,
    on_error: Option<ErrorCallback<T>>,
}

impl<T> Default for Callbacks<T>
where
    T: Socket,
{
    fn default() -> Self {
        Self {
            on_connect: None,
            on_disconnect: None,
            on_message: None,
            on_error: None,
        }
    }
}

impl<T> Callbacks<T>
where
    T: Socket,
{
    /// Creates a set of callbacks that ignore every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the callback fired when a connection opens.
    pub fn on_connect<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ConnectionHandle<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |conn: ConnectionHandle<T>| -> BoxFuture<'static, ()> {
            Box::pin(handler(conn))
        }));
    }

    /// Sets the callback fired when a connection closes.
    pub fn on_disconnect<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ConnectionHandle<T>, DisconnectReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(
            move |conn: ConnectionHandle<T>, reason: DisconnectReason| -> BoxFuture<'static, ()> {
                Box::pin(handler(conn, reason))
            },
        ));
    }

    /// Sets the callback fired for each text or binary message.
    pub fn on_message<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ConnectionHandle<T>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_message = Some(Arc::new(
            move |conn: ConnectionHandle<T>, msg: Message| -> BoxFuture<'static, ()> {
                Box::pin(handler(conn, msg))
            },
        ));
    }

    /// Sets the callback fired when a connection reports an error.
    pub fn on_error<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ConnectionHandle<T>, Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(
            move |conn: ConnectionHandle<T>, err: Error| -> BoxFuture<'static, ()> {
                Box::pin(handler(conn, err))
            },
        ));
    }
}

impl<T> EventSink<T> for Callbacks<T>
where
    T: Socket,
{
    fn on_connect(&self, conn: ConnectionHandle<T>) -> BoxFuture<'static, ()> {
        match &self.on_connect {
            Some(cb) => cb(conn),
            None => Box::pin(async {}),
        }
    }

    fn on_disconnect(
        &self,
        conn: ConnectionHandle<T>,
        reason: DisconnectReason,
    ) -> BoxFuture<'static, ()> {
        match &self.on_disconnect {
            Some(cb) => cb(conn, reason),
            None => Box::pin(async {}),
        }
    }

    fn on_message(&self, conn: ConnectionHandle<T>, message: Message) -> BoxFuture<'static, ()> {
        match &self.on_message {
            Some(cb) => cb(conn, message),
            None => Box::pin(async {}),
        }
    }

    fn on_error(&self, conn: ConnectionHandle<T>, error: Error) -> BoxFuture<'static, ()> {
        match &self.on_error {
            Some(cb) => cb(conn, error),
            None => Box::pin(async {}),
        }
    }
}
