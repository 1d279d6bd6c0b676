//! Registry of live connections.
//!
//! `ConnectionManager` tracks every open connection of a handler and can
//! broadcast a message to all of them, or to a filtered subset. It is cheap
//! to clone; clones share the same registry.
//!
//! The registry is guarded by a single mutex. A connection is present in it
//! exactly while its state is `Open`: the transitions into and out of `Open`
//! happen while the lock is held.

use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    conn::{ConnState, ConnectionId},
    handle::ConnectionHandle,
    types::{DisconnectReason, Error, Message, Result},
    Socket,
};

/// Default deadline for a single per-connection send during a broadcast.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

type Registry<T> = Arc<Mutex<HashMap<ConnectionId, ConnectionHandle<T>>>>;

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections selected when the broadcast started.
    pub targets: usize,
    /// Connections the message was written to.
    pub delivered: usize,
    /// Connections that had already closed by the time of the send.
    pub skipped: usize,
    /// Connections whose send failed or timed out. Each of them is closed.
    pub failed: usize,
}

enum Delivery {
    Delivered,
    Skipped,
    Failed,
}

/// Shared registry of open connections.
///
/// ## Example
///
/// ```no_run
/// use socketry::{events::Callbacks, server::{Handler, HandlerConfig}, types::Message};
/// use tokio::net::TcpStream;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> socketry::types::Result<()> {
/// let handler: Handler<TcpStream> = Handler::new(HandlerConfig::default(), Callbacks::new())?;
/// let manager = handler.manager().clone();
///
/// let report = manager
///     .broadcast(&CancellationToken::new(), &Message::text("hello"))
///     .await?;
/// println!("delivered to {} of {}", report.delivered, manager.count().await);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager<T>
where
    T: Socket,
{
    clients: Registry<T>,
    send_timeout: Duration,
}

impl<T> Clone for ConnectionManager<T>
where
    T: Socket,
{
    fn clone(&self) -> Self {
        Self {
            clients: Arc::clone(&self.clients),
            send_timeout: self.send_timeout,
        }
    }
}

impl<T> Debug for ConnectionManager<T>
where
    T: Socket,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl<T> Default for ConnectionManager<T>
where
    T: Socket,
{
    fn default() -> Self {
        Self::new(DEFAULT_SEND_TIMEOUT)
    }
}

impl<T> ConnectionManager<T>
where
    T: Socket,
{
    /// Creates an empty manager whose broadcasts give each connection
    /// `send_timeout` to accept the message.
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            send_timeout,
        }
    }

    /// Per-connection send deadline used by broadcasts.
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Adds a connection and marks it `Open`.
    ///
    /// Fails with [`Error::AlreadyRegistered`] if a connection with the same
    /// id is present; the registered connection is left untouched.
    pub async fn register(&self, handle: ConnectionHandle<T>) -> Result<()> {
        let mut clients = self.clients.lock().await;
        let id = handle.id();
        if clients.contains_key(&id) {
            return Err(Error::AlreadyRegistered(id));
        }
        handle.set_state(ConnState::Open);
        clients.insert(id, handle);
        tracing::debug!(conn_id = %id, total = clients.len(), "connection registered");
        Ok(())
    }

    /// Removes a connection, returning whether it was present.
    ///
    /// The removed connection moves to `Closing` and shuts down. Calling this
    /// for an unknown or already removed id is a no-op.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut clients = self.clients.lock().await;
            let removed = clients.remove(&id);
            if let Some(handle) = &removed {
                handle.set_state(ConnState::Closing);
                tracing::debug!(conn_id = %id, total = clients.len(), "connection deregistered");
            }
            removed
        };

        match removed {
            Some(handle) => {
                handle.shutdown(DisconnectReason::ServerClosed);
                true
            }
            None => false,
        }
    }

    /// Closes the connection with `id`. Same as [`deregister`](Self::deregister).
    pub async fn close(&self, id: ConnectionId) -> bool {
        self.deregister(id).await
    }

    /// Closes every registered connection.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = {
            let clients = self.clients.lock().await;
            clients.keys().copied().collect()
        };

        let mut closed = 0;
        for id in ids {
            if self.deregister(id).await {
                closed += 1;
            }
        }
        closed
    }

    /// Number of registered connections.
    pub async fn count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Returns the handle of the connection with `id`.
    pub async fn lookup(&self, id: ConnectionId) -> Option<ConnectionHandle<T>> {
        self.clients.lock().await.get(&id).cloned()
    }

    /// Ids of all registered connections, in no particular order.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.clients.lock().await.keys().copied().collect()
    }

    /// Sends `message` to every registered connection.
    ///
    /// Sends run concurrently and each is bounded by the send timeout, so a
    /// slow client cannot hold up the others. A failed or timed-out send is
    /// reported to that connection's error callback and the connection is
    /// closed; it does not fail the broadcast. The only error returned is
    /// [`Error::BroadcastCancelled`], when `cancel` fires before every send
    /// has finished. Sends still in flight at that point are abandoned.
    pub async fn broadcast(
        &self,
        cancel: &CancellationToken,
        message: &Message,
    ) -> Result<BroadcastReport> {
        self.broadcast_filtered(cancel, message, |_| true).await
    }

    /// Like [`broadcast`](Self::broadcast), limited to the connections for
    /// which `filter` returns true.
    ///
    /// `filter` runs while the registry is locked and must not block.
    pub async fn broadcast_filtered<F>(
        &self,
        cancel: &CancellationToken,
        message: &Message,
        filter: F,
    ) -> Result<BroadcastReport>
    where
        F: Fn(&ConnectionHandle<T>) -> bool,
    {
        if cancel.is_cancelled() {
            return Err(Error::BroadcastCancelled);
        }

        let targets: Vec<ConnectionHandle<T>> = {
            let clients = self.clients.lock().await;
            clients.values().filter(|h| filter(h)).cloned().collect()
        };

        let mut report = BroadcastReport {
            targets: targets.len(),
            ..BroadcastReport::default()
        };
        if targets.is_empty() {
            return Ok(report);
        }

        let sends = targets.iter().map(|h| self.deliver(h, message));
        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(targets = report.targets, "broadcast cancelled");
                return Err(Error::BroadcastCancelled);
            }
            outcomes = join_all(sends) => outcomes,
        };

        for outcome in outcomes {
            match outcome {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Skipped => report.skipped += 1,
                Delivery::Failed => report.failed += 1,
            }
        }

        tracing::debug!(
            targets = report.targets,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "broadcast finished"
        );
        Ok(report)
    }

    async fn deliver(&self, handle: &ConnectionHandle<T>, message: &Message) -> Delivery {
        if !handle.is_open() {
            return Delivery::Skipped;
        }

        let fault = match tokio::time::timeout(self.send_timeout, handle.send(message)).await {
            Ok(Ok(())) => return Delivery::Delivered,
            Ok(Err(Error::ConnectionClosed(_))) => return Delivery::Skipped,
            Ok(Err(e)) => Error::SendFailed {
                id: handle.id(),
                reason: e.to_string(),
            },
            Err(_) => Error::SendTimedOut {
                id: handle.id(),
                after: self.send_timeout,
            },
        };

        tracing::warn!(conn_id = %handle.id(), error = %fault, "broadcast send failed");
        handle.report_fault(fault);
        Delivery::Failed
    }
}
