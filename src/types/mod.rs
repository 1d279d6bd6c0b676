#![warn(missing_docs)]

//! Value types shared across the crate: messages, close information,
//! metadata values and the crate error type.

use std::{fmt::Display, time::Duration, time::SystemTime};

use bytes::Bytes;
use thiserror::Error;

use crate::conn::ConnectionId;

/// Kind tag of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

/// A text or binary data message.
///
/// Messages are immutable values. A `Text` message always carries valid
/// UTF-8, which is checked at construction.
///
/// ## Example
///
/// ```
/// use socketry::types::{Message, MessageType};
///
/// let msg = Message::text("hello");
/// assert_eq!(msg.kind(), MessageType::Text);
/// assert_eq!(msg.as_text(), Some("hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    data: Bytes,
}

impl Message {
    /// Creates a text message.
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self {
            kind: MessageType::Text,
            data: Bytes::from(text.into()),
        }
    }

    /// Creates a binary message.
    pub fn binary<B: Into<Bytes>>(data: B) -> Self {
        Self {
            kind: MessageType::Binary,
            data: data.into(),
        }
    }

    /// Creates a message from a kind tag and raw bytes.
    ///
    /// Fails with [`Error::InvalidUtf8`] when `kind` is `Text` and the
    /// payload is not valid UTF-8.
    pub fn new<B: Into<Bytes>>(kind: MessageType, data: B) -> Result<Self> {
        let data = data.into();
        if kind == MessageType::Text && std::str::from_utf8(&data).is_err() {
            return Err(Error::InvalidUtf8);
        }
        Ok(Self { kind, data })
    }

    /// The kind tag.
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload as `Bytes`, cheap to clone.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Payload as text, `None` for binary messages.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageType::Text => std::str::from_utf8(&self.data).ok(),
            MessageType::Binary => None,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wraps already validated bytes without copying them.
    pub(crate) fn from_parts(kind: MessageType, data: Bytes) -> Self {
        Self { kind, data }
    }

    /// Frame sharing this message's buffer.
    pub(crate) fn to_frame(&self) -> tokio_tungstenite::tungstenite::Message {
        use tokio_tungstenite::tungstenite::{Message as Frame, Utf8Bytes};

        match self.kind {
            MessageType::Text => match Utf8Bytes::try_from(self.data.clone()) {
                Ok(text) => Frame::Text(text),
                // text messages are checked at construction
                Err(_) => Frame::Text(String::from_utf8_lossy(&self.data).into_owned().into()),
            },
            MessageType::Binary => Frame::Binary(self.data.clone()),
        }
    }
}

/// Close code and reason sent by a peer.
///
/// ## Fields
///
/// - `code`: The close code.
/// - `reason`: The close reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// The close code.
    pub code: u16,
    /// The close reason.
    pub reason: String,
}

impl CloseEvent {
    pub(crate) fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl Default for CloseEvent {
    fn default() -> Self {
        Self::new(1000, "Normal closure")
    }
}

impl Display for CloseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CloseEvent {{ code: {}, reason: {} }}",
            self.code, self.reason
        )
    }
}

/// Why a connection was closed, passed to the disconnect callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a close frame.
    PeerClosed(CloseEvent),
    /// The stream ended without a close frame.
    StreamEnded,
    /// Reading from the stream failed.
    StreamError(String),
    /// Too many consecutive pings went unanswered.
    HeartbeatTimeout {
        /// Number of missed pongs at the time of closure.
        missed: u32,
    },
    /// A send to this connection failed or timed out.
    SendFailed,
    /// Closed through the manager or a handle.
    ServerClosed,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerClosed(ev) => write!(f, "peer closed ({ev})"),
            DisconnectReason::StreamEnded => write!(f, "stream ended"),
            DisconnectReason::StreamError(e) => write!(f, "stream error: {e}"),
            DisconnectReason::HeartbeatTimeout { missed } => {
                write!(f, "heartbeat timeout after {missed} missed pongs")
            }
            DisconnectReason::SendFailed => write!(f, "send failed"),
            DisconnectReason::ServerClosed => write!(f, "closed by server"),
        }
    }
}

/// A metadata value stored on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    Text(String),
    /// Raw bytes.
    Bytes(Bytes),
    /// Point in time.
    Time(SystemTime),
}

impl Value {
    /// Returns the string if this is a `Text` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is an `Int` value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean if this is a `Bool` value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the timestamp if this is a `Time` value.
    pub fn as_time(&self) -> Option<SystemTime> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v.into())
    }
}

impl From<SystemTime> for Value {
    fn from(v: SystemTime) -> Self {
        Value::Time(v)
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(v: Option<V>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Errors produced by socketry.
#[derive(Debug, Error)]
pub enum Error {
    /// The WebSocket handshake did not complete.
    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Writing to a connection failed.
    #[error("send to {id} failed: {reason}")]
    SendFailed {
        /// Target connection.
        id: ConnectionId,
        /// Underlying failure.
        reason: String,
    },

    /// Writing to a connection did not finish within the send deadline.
    #[error("send to {id} timed out after {after:?}")]
    SendTimedOut {
        /// Target connection.
        id: ConnectionId,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// A connection stopped answering pings.
    #[error("heartbeat timeout on {id} after {missed} missed pongs")]
    HeartbeatTimeout {
        /// The failed connection.
        id: ConnectionId,
        /// Number of missed pongs.
        missed: u32,
    },

    /// A connection with the same id is already registered.
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    /// The broadcast was cancelled by its caller.
    #[error("broadcast cancelled")]
    BroadcastCancelled,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A text payload was not valid UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    /// The connection is no longer open.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// WebSocket protocol error.
    #[error(transparent)]
    Protocol(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
