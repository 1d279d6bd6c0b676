//! # socketry
//!
//! A WebSocket connection manager built on `tokio` and `tokio-tungstenite`.
//!
//! socketry takes over already upgraded WebSocket streams and keeps track of
//! them: it delivers messages and lifecycle events to your callbacks, pings
//! every client to detect dead peers, stores per-connection metadata and
//! broadcasts messages to all or some of the live connections.
//!
//! ## Modules
//!
//! - [`server`]: the [`Handler`](server::Handler) that accepts streams
//! - [`manager`]: the registry of open connections and broadcast
//! - [`conn`] / [`handle`]: a single connection and its shared handle
//! - [`heartbeat`]: ping/pong liveness monitoring
//! - [`events`]: the [`EventSink`](events::EventSink) trait and callbacks
//! - [`types`]: messages, metadata values and errors
//!
//! ## Example
//!
//! ```no_run
//! use socketry::{events::Callbacks, server::{Handler, HandlerConfig}};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> socketry::types::Result<()> {
//!     let mut callbacks: Callbacks<TcpStream> = Callbacks::new();
//!
//!     callbacks.on_connect(|conn| async move {
//!         println!("connected: {}", conn.id());
//!     });
//!
//!     callbacks.on_message(|conn, msg| async move {
//!         conn.broadcast.text(msg.as_text().unwrap_or_default()).await;
//!     });
//!
//!     let handler = Handler::new(HandlerConfig::default(), callbacks)?;
//!     handler.listen("0.0.0.0:3001").await
//! }
//! ```

use std::fmt::Debug;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod conn;
pub mod events;
pub mod handle;
pub mod heartbeat;
pub mod manager;
pub mod server;
pub mod types;

#[cfg(feature = "bench")]
pub mod bench_support;

#[cfg(test)]
mod tests;

pub use conn::{ConnState, ConnectionId};
pub use events::{Callbacks, EventSink};
pub use handle::ConnectionHandle;
pub use heartbeat::HeartbeatConfig;
pub use manager::{BroadcastReport, ConnectionManager};
pub use server::{Handler, HandlerConfig};
pub use types::{DisconnectReason, Error, Message, MessageType, Result, Value};

/// Transport a WebSocket stream can run over.
///
/// Implemented for every `AsyncRead + AsyncWrite` type that can move between
/// tasks, such as `tokio::net::TcpStream` or `tokio::io::DuplexStream`.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static {}
