#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::{io::DuplexStream, time::Instant};

    use crate::{
        heartbeat::{HeartbeatConfig, HeartbeatState, Liveness},
        server::{Handler, HandlerConfig},
        tests::{
            connect, events_until_disconnect, quiet_config, recording_handler, wait_closed,
            Event, Recorder,
        },
        types::{DisconnectReason, Error},
    };

    fn fast_heartbeat() -> HandlerConfig {
        HandlerConfig::default().with_heartbeat(HeartbeatConfig::new(
            Duration::from_secs(1),
            Duration::from_millis(300),
            2,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_closed() {
        let (handler, mut rx) = recording_handler(fast_heartbeat());
        let started = Instant::now();

        // the client is never polled, so pings stay unanswered
        let (handle, _client) = connect(&handler, 64 * 1024).await;
        assert_eq!(handler.manager().count().await, 1);

        let events = events_until_disconnect(&mut rx, handle.id()).await;
        let elapsed = started.elapsed();

        assert_eq!(
            events.last(),
            Some(&Event::Disconnect(
                handle.id(),
                DisconnectReason::HeartbeatTimeout { missed: 2 }
            ))
        );
        assert!(
            elapsed >= Duration::from_secs(2) && elapsed <= Duration::from_secs(3),
            "closed after {elapsed:?}"
        );

        wait_closed(&handle).await;
        assert_eq!(handle.heartbeat_state(), HeartbeatState::Failed);
        assert_eq!(handler.manager().count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_peer_stays_open() {
        let (handler, _rx) = recording_handler(fast_heartbeat());
        let (handle, mut client) = connect(&handler, 64 * 1024).await;

        // reading lets the client answer pings
        tokio::spawn(async move { while let Some(Ok(_)) = client.next().await {} });

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(handle.is_open());
        assert_eq!(handle.missed_pongs(), 0);
        assert!(handle.last_pong().is_some());
        assert_eq!(handle.heartbeat_state(), HeartbeatState::Active);
        assert_eq!(handler.manager().count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_normal_close() {
        let (handler, mut rx) = recording_handler(fast_heartbeat());
        let (handle, _client) = connect(&handler, 64 * 1024).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.close();

        let events = events_until_disconnect(&mut rx, handle.id()).await;
        assert_eq!(
            events.last(),
            Some(&Event::Disconnect(handle.id(), DisconnectReason::ServerClosed))
        );
        wait_closed(&handle).await;
        assert_eq!(handle.heartbeat_state(), HeartbeatState::Stopped);
    }

    #[tokio::test]
    async fn test_disabled_heartbeat_stays_idle() {
        let (handler, _rx) = recording_handler(quiet_config());
        let (handle, _client) = connect(&handler, 1024).await;

        assert_eq!(handle.heartbeat_state(), HeartbeatState::Idle);
        assert_eq!(handle.missed_pongs(), 0);
        assert!(handle.last_pong().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_counts_and_forgives() {
        let liveness = Liveness::new();
        assert_eq!(liveness.state(), HeartbeatState::Idle);

        let first_ping = Instant::now();
        assert_eq!(liveness.settle(first_ping), 1);

        // pong for the first ping arrives after its round was settled
        tokio::time::advance(Duration::from_millis(50)).await;
        liveness.observe_pong();
        liveness.forgive_late_pong(first_ping);
        assert_eq!(liveness.missed(), 0);

        tokio::time::advance(Duration::from_millis(50)).await;
        let second_ping = Instant::now();
        assert_eq!(liveness.settle(second_ping), 1);
        liveness.forgive_late_pong(second_ping);
        assert_eq!(liveness.missed(), 1);

        tokio::time::advance(Duration::from_millis(50)).await;
        let third_ping = Instant::now();
        assert_eq!(liveness.settle(third_ping), 2);

        tokio::time::advance(Duration::from_millis(10)).await;
        liveness.observe_pong();
        assert_eq!(liveness.settle(third_ping), 0);
        assert!(liveness.last_pong().is_some());
    }

    #[test]
    fn test_config_validation() {
        let ok = HeartbeatConfig::new(Duration::from_secs(15), Duration::from_secs(5), 3);
        assert!(ok.validate().is_ok());
        assert_eq!(HeartbeatConfig::default(), ok);

        let zero_interval = HeartbeatConfig::new(Duration::ZERO, Duration::from_secs(1), 3);
        assert!(matches!(
            zero_interval.validate(),
            Err(Error::InvalidConfig(_))
        ));

        let zero_timeout = HeartbeatConfig::new(Duration::from_secs(1), Duration::ZERO, 3);
        assert!(matches!(zero_timeout.validate(), Err(Error::InvalidConfig(_))));

        let no_misses = HeartbeatConfig::new(Duration::from_secs(1), Duration::from_millis(10), 0);
        assert!(matches!(no_misses.validate(), Err(Error::InvalidConfig(_))));

        // overlapping rounds are only warned about
        let overlapping = HeartbeatConfig::new(Duration::from_secs(1), Duration::from_secs(2), 1);
        assert!(overlapping.validate().is_ok());
    }

    #[test]
    fn test_handler_rejects_invalid_heartbeat() {
        let config = HandlerConfig::default().with_heartbeat(HeartbeatConfig::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
            0,
        ));

        let (recorder, _rx) = Recorder::new();
        let built = Handler::<DuplexStream>::new(config, recorder);
        assert!(matches!(built, Err(Error::InvalidConfig(_))));
    }
}
