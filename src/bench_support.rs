#![cfg(feature = "bench")]

//! Internal helpers for Criterion benchmarks.
//!
//! These helpers construct in-memory connections backed by
//! `tokio::io::DuplexStream`, allowing the benchmarks to exercise the
//! broadcast path without binding real sockets. The client side of every
//! connection is drained in the background so writes never stall.

use std::net::SocketAddr;

use tokio::io::DuplexStream;
use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};

use crate::{
    events::Callbacks,
    server::{Handler, HandlerConfig},
    ConnectionManager,
};

/// Stream type used for in-process benchmarking.
pub type BenchStream = DuplexStream;

#[derive(Clone)]
/// Context wrapping a [`ConnectionManager`] seeded with mock clients.
pub struct BroadcastContext {
    /// Handler owning the connections.
    pub handler: Handler<BenchStream>,
    /// Manager instance that benchmarks invoke.
    pub manager: ConnectionManager<BenchStream>,
}

impl BroadcastContext {
    /// Creates a context populated with `client_count` clients.
    pub async fn with_clients(client_count: usize) -> Self {
        let config = HandlerConfig::default().without_heartbeat();
        let handler = match Handler::new(config, Callbacks::new()) {
            Ok(handler) => handler,
            Err(e) => panic!("bench handler config rejected: {e}"),
        };

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        for _ in 0..client_count {
            let (server, client) = tokio::io::duplex(1024 * 1024);
            let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
            let _ = handler.accept(server, addr).await;

            tokio::spawn(drain(client));
        }

        Self {
            manager: handler.manager().clone(),
            handler,
        }
    }
}

async fn drain(client: DuplexStream) {
    use futures::StreamExt;

    let mut ws = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
    while let Some(Ok(_)) = ws.next().await {}
}
