#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use bytes::Bytes;

    use crate::{
        conn::ConnectionId,
        server::HandlerConfig,
        types::{CloseEvent, DisconnectReason, Error, Message, MessageType, Value},
    };

    #[test]
    fn test_message_constructors() {
        let text = Message::text("hello");
        assert_eq!(text.kind(), MessageType::Text);
        assert_eq!(text.as_text(), Some("hello"));
        assert_eq!(text.data(), b"hello");
        assert_eq!(text.len(), 5);
        assert!(!text.is_empty());

        let binary = Message::binary(vec![0u8, 159, 146, 150]);
        assert_eq!(binary.kind(), MessageType::Binary);
        assert_eq!(binary.as_text(), None);
        assert_eq!(binary.bytes(), Bytes::from_static(&[0, 159, 146, 150]));

        assert!(Message::text("").is_empty());
    }

    #[test]
    fn test_message_rejects_invalid_utf8_text() {
        let err = Message::new(MessageType::Text, vec![0u8, 159, 146, 150]).unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8));

        let ok = Message::new(MessageType::Binary, vec![0u8, 159, 146, 150]).unwrap();
        assert_eq!(ok.len(), 4);

        let text = Message::new(MessageType::Text, "héllo").unwrap();
        assert_eq!(text, Message::text("héllo"));
    }

    #[test]
    fn test_frames_share_the_message_buffer() {
        use tokio_tungstenite::tungstenite::Message as Frame;

        let text = Message::text("shared payload");
        match text.to_frame() {
            Frame::Text(frame) => {
                assert_eq!(frame.as_str(), "shared payload");
                assert_eq!(frame.as_str().as_ptr(), text.data().as_ptr());
            }
            other => panic!("expected text frame, got {other:?}"),
        }

        let binary = Message::binary(vec![1u8, 2, 3]);
        match binary.to_frame() {
            Frame::Binary(frame) => assert_eq!(frame.as_ptr(), binary.data().as_ptr()),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[test]
    fn test_close_event() {
        let default = CloseEvent::default();
        assert_eq!(default.code, 1000);
        assert_eq!(default.reason, "Normal closure");
        assert_eq!(
            default.to_string(),
            "CloseEvent { code: 1000, reason: Normal closure }"
        );

        let away = CloseEvent::new(1001, "going away");
        assert_eq!(away.code, 1001);
        assert_eq!(away.reason, "going away");
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::StreamEnded.to_string(), "stream ended");
        assert_eq!(DisconnectReason::ServerClosed.to_string(), "closed by server");
        assert_eq!(
            DisconnectReason::HeartbeatTimeout { missed: 3 }.to_string(),
            "heartbeat timeout after 3 missed pongs"
        );
        assert_eq!(
            DisconnectReason::PeerClosed(CloseEvent::new(1001, "bye")).to_string(),
            "peer closed (CloseEvent { code: 1001, reason: bye })"
        );
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from("ada").as_str(), Some("ada"));
        assert_eq!(Value::from(String::from("ada")), Value::Text("ada".into()));
        assert_eq!(Value::from(7i32).as_i64(), Some(7));
        assert_eq!(Value::from(7u32), Value::Int(7));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from(1.5f64), Value::Float(1.5));
        assert_eq!(Value::from(vec![1u8, 2]), Value::Bytes(Bytes::from_static(&[1, 2])));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));

        let now = SystemTime::now();
        assert_eq!(Value::from(now).as_time(), Some(now));

        assert_eq!(Value::from(1i64).as_str(), None);
        assert_eq!(Value::Null.as_bool(), None);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(12);
        assert_eq!(id.to_string(), "conn-12");
        assert_eq!(id.as_u64(), 12);
        assert!(ConnectionId::new(1) < id);
    }

    #[test]
    fn test_error_display() {
        let id = ConnectionId::new(3);
        assert_eq!(
            Error::AlreadyRegistered(id).to_string(),
            "connection conn-3 is already registered"
        );
        assert_eq!(
            Error::SendTimedOut {
                id,
                after: Duration::from_millis(500)
            }
            .to_string(),
            "send to conn-3 timed out after 500ms"
        );
        assert_eq!(Error::BroadcastCancelled.to_string(), "broadcast cancelled");

        let io: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(io, Error::Io(_)));
        assert_eq!(io.to_string(), "pipe");
    }

    #[test]
    fn test_handler_config_validation() {
        let config = HandlerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.heartbeat.is_some());
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.close_timeout, Duration::from_secs(1));

        assert!(HandlerConfig::default().without_heartbeat().heartbeat.is_none());

        let no_deadline = HandlerConfig::default().with_send_timeout(Duration::ZERO);
        assert!(matches!(no_deadline.validate(), Err(Error::InvalidConfig(_))));

        let no_close = HandlerConfig::default().with_close_timeout(Duration::ZERO);
        assert!(matches!(no_close.validate(), Err(Error::InvalidConfig(_))));

        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        let no_handshake = HandlerConfig::default().with_handshake_timeout(Duration::ZERO);
        assert!(matches!(no_handshake.validate(), Err(Error::InvalidConfig(_))));
    }
}
