//! Ping/pong liveness monitoring.
//!
//! A half-open TCP connection can stay readable forever without the peer
//! sending anything, so every connection gets its own monitor task that
//! pings the peer on a fixed interval and force-closes the connection once
//! too many pings in a row go unanswered.
//!
//! The monitor moves through [`HeartbeatState`]:
//!
//! - `Idle`: no monitor was started for the connection.
//! - `Active`: pings are being sent.
//! - `Failed`: `max_missed` consecutive pongs were missed, the connection is
//!   being closed with [`DisconnectReason::HeartbeatTimeout`].
//! - `Stopped`: the connection closed for another reason.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as Frame;

use crate::{
    handle::ConnectionHandle,
    types::{DisconnectReason, Error, Result},
    Socket,
};

/// Heartbeat settings shared by every connection of a handler.
///
/// ## Fields
///
/// - `interval`: time between two pings.
/// - `timeout`: how long to wait for the pong of a ping.
/// - `max_missed`: consecutive missed pongs before the connection is closed.
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use socketry::heartbeat::HeartbeatConfig;
///
/// let config = HeartbeatConfig::new(Duration::from_secs(15), Duration::from_secs(5), 3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between two pings.
    pub interval: Duration,
    /// Maximum wait for a pong.
    pub timeout: Duration,
    /// Consecutive missed pongs before forced closure.
    pub max_missed: u32,
}

impl HeartbeatConfig {
    /// Creates a heartbeat configuration.
    pub fn new(interval: Duration, timeout: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            timeout,
            max_missed,
        }
    }

    /// Checks that every value is in range.
    ///
    /// A `timeout` that is not shorter than `interval` is accepted but logged,
    /// since a ping round then overlaps the next tick.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat interval must be greater than zero".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat timeout must be greater than zero".into(),
            ));
        }
        if self.max_missed == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat max_missed must be at least 1".into(),
            ));
        }
        if self.timeout >= self.interval {
            tracing::warn!(
                interval = ?self.interval,
                timeout = ?self.timeout,
                "heartbeat timeout is not shorter than the interval"
            );
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), Duration::from_secs(5), 3)
    }
}

/// State of a connection's heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// No monitor started.
    Idle,
    /// Pings are being sent.
    Active,
    /// Too many pongs were missed.
    Failed,
    /// The connection closed normally.
    Stopped,
}

/// Liveness bookkeeping for one connection.
#[derive(Debug)]
pub(crate) struct Liveness {
    last_pong: Mutex<Option<Instant>>,
    missed: AtomicU32,
    state: Mutex<HeartbeatState>,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            last_pong: Mutex::new(None),
            missed: AtomicU32::new(0),
            state: Mutex::new(HeartbeatState::Idle),
        }
    }

    pub(crate) fn observe_pong(&self) {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    pub(crate) fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn missed(&self) -> u32 {
        self.missed.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> HeartbeatState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: HeartbeatState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn answered_since(&self, sent_at: Instant) -> bool {
        self.last_pong().is_some_and(|pong| pong >= sent_at)
    }

    /// Resets the counter if a (possibly late) pong arrived after `sent_at`.
    pub(crate) fn forgive_late_pong(&self, sent_at: Instant) {
        if self.answered_since(sent_at) {
            self.missed.store(0, Ordering::Release);
        }
    }

    /// Settles a ping round and returns the missed count afterwards.
    pub(crate) fn settle(&self, sent_at: Instant) -> u32 {
        if self.answered_since(sent_at) {
            self.missed.store(0, Ordering::Release);
            0
        } else {
            self.missed.fetch_add(1, Ordering::AcqRel) + 1
        }
    }
}

/// Runs the heartbeat monitor of `handle` until the connection shuts down
/// or the peer misses `max_missed` pongs in a row.
pub(crate) async fn run<T: Socket>(handle: ConnectionHandle<T>, config: HeartbeatConfig) {
    let liveness = handle.liveness();
    let shutdown = handle.shutdown_token();

    liveness.set_state(HeartbeatState::Active);

    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut previous_ping: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(sent_at) = previous_ping {
            liveness.forgive_late_pong(sent_at);
        }

        let sent_at = Instant::now();
        previous_ping = Some(sent_at);

        let ping = tokio::time::timeout(
            config.timeout,
            handle.send_frame(Frame::Ping(Vec::new().into())),
        );
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            sent = ping => match sent {
                Ok(Ok(())) => tracing::trace!(conn_id = %handle.id(), "ping sent"),
                Ok(Err(e)) => tracing::debug!(conn_id = %handle.id(), error = %e, "ping failed"),
                Err(_) => tracing::debug!(conn_id = %handle.id(), "ping write timed out"),
            },
        }

        let remaining = config.timeout.saturating_sub(sent_at.elapsed());
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(remaining) => {}
        }

        let missed = liveness.settle(sent_at);
        if missed == 0 {
            continue;
        }

        tracing::debug!(conn_id = %handle.id(), missed, "pong not received in time");

        if missed >= config.max_missed {
            liveness.set_state(HeartbeatState::Failed);
            tracing::warn!(
                conn_id = %handle.id(),
                error = %Error::HeartbeatTimeout { id: handle.id(), missed },
                "closing unresponsive connection"
            );
            handle.shutdown(DisconnectReason::HeartbeatTimeout { missed });
            return;
        }
    }

    liveness.set_state(HeartbeatState::Stopped);
}
