use std::{env, str::FromStr, time::Duration, time::SystemTime};

use socketry::{
    events::Callbacks,
    heartbeat::HeartbeatConfig,
    manager::ConnectionManager,
    server::{Handler, HandlerConfig},
    types::Message,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// Logs the number of open connections every `every` until `stop` fires.
async fn report_stats(
    manager: ConnectionManager<TcpStream>,
    stop: CancellationToken,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let active = manager.count().await;
                tracing::info!(active, "connection stats");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr: String = env_or("SOCKETRY_ADDR", "0.0.0.0:3001".to_string());
    let heartbeat = HeartbeatConfig::new(
        Duration::from_secs(env_or("SOCKETRY_HEARTBEAT_INTERVAL_SECS", 15)),
        Duration::from_secs(env_or("SOCKETRY_HEARTBEAT_TIMEOUT_SECS", 5)),
        env_or("SOCKETRY_HEARTBEAT_MAX_MISSED", 3),
    );

    let mut callbacks: Callbacks<TcpStream> = Callbacks::new();

    callbacks.on_connect(|conn| async move {
        tracing::info!(conn_id = %conn.id(), addr = %conn.addr(), "client connected");
        conn.set_metadata("joined_at", SystemTime::now());
    });

    callbacks.on_disconnect(|conn, reason| async move {
        let joined_at = conn.get_metadata("joined_at").and_then(|v| v.as_time());
        let connected_for = joined_at.and_then(|t| t.elapsed().ok());
        tracing::info!(conn_id = %conn.id(), %reason, ?connected_for, "client disconnected");
    });

    callbacks.on_message(|conn, msg| async move {
        tracing::info!(
            conn_id = %conn.id(),
            data = %String::from_utf8_lossy(msg.data()),
            "message received"
        );
    });

    callbacks.on_error(|conn, err| async move {
        tracing::warn!(conn_id = %conn.id(), error = %err, "connection error");
    });

    let handler = Handler::new(HandlerConfig::default().with_heartbeat(heartbeat), callbacks)?;
    let shutdown = CancellationToken::new();

    // every line typed on stdin is broadcast to all clients
    let manager = handler.manager().clone();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            match manager.broadcast(&stop, &Message::text(line)).await {
                Ok(report) => tracing::info!(
                    delivered = report.delivered,
                    failed = report.failed,
                    "broadcast sent"
                ),
                Err(e) => tracing::warn!(error = %e, "broadcast failed"),
            }
        }
    });

    tokio::spawn(report_stats(
        handler.manager().clone(),
        shutdown.clone(),
        Duration::from_secs(30),
    ));

    let stop = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
        }
        stop.cancel();
    });

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("websocket endpoint: ws://{}", listener.local_addr()?);
    handler.serve(listener, shutdown).await?;

    Ok(())
}
