//! Transport capability traits for Breaker.
//!
//! The hub never speaks a wire protocol itself. Everything it needs from a
//! duplex stream is captured by [`Connection`]: read one frame, write one
//! frame, cap the inbound frame size, and close. Read and write deadlines are
//! applied by the pumps with `tokio::time` timeouts around these calls.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Close codes the hub cares about (RFC 6455, section 7.4.1).
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (tab closed, server restart).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Connection dropped without a close frame. Never sent on the wire.
    pub const ABNORMAL: u16 = 1006;
    /// Message exceeded the receiver's limit.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Unexpected server condition.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Counter for ensuring unique IDs even within the same nanosecond.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The kind of data frame used for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Text frames.
    #[default]
    Text,
    /// Binary frames.
    Binary,
}

/// Payload of a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code.
    pub code: u16,
    /// Human readable reason, possibly empty.
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure with no reason.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "")
    }
}

/// A single frame on a duplex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application text frame.
    Text(Bytes),
    /// Application binary frame.
    Binary(Bytes),
    /// Keepalive ping.
    Ping(Bytes),
    /// Liveness answer.
    Pong(Bytes),
    /// Close frame.
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Build an application frame of the given kind.
    #[must_use]
    pub fn data(kind: FrameKind, payload: Bytes) -> Self {
        match kind {
            FrameKind::Text => Self::Text(payload),
            FrameKind::Binary => Self::Binary(payload),
        }
    }

    /// Whether this is an application (text or binary) frame.
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Binary(_))
    }

    /// Payload length in bytes. Close frames report their reason length.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Text(p) | Self::Binary(p) | Self::Ping(p) | Self::Pong(p) => p.len(),
            Self::Close(close) => close.as_ref().map_or(0, |c| c.reason.len()),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed on this side.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer closed the connection.
    #[error("Peer closed connection (code: {code:?}, reason: {reason:?})")]
    PeerClosed {
        /// Close code, `None` when the stream ended without a close frame.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },

    /// An inbound frame exceeded the read limit.
    #[error("Frame size {size} exceeds read limit {limit}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A read or write deadline passed.
    #[error("Deadline exceeded")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether this error is a closure the hub should report.
    ///
    /// Only a normal or going-away close from the peer is routine, along with
    /// local closes, read deadlines and read-limit violations. Abnormal
    /// closures (1006, a stream that ends without a close frame, a reset
    /// socket) and every other close code are unexpected.
    #[must_use]
    pub fn is_unexpected_close(&self) -> bool {
        match self {
            Self::PeerClosed { code, .. } => !matches!(
                code,
                Some(close_code::NORMAL | close_code::GOING_AWAY)
            ),
            Self::Io(_) | Self::SendFailed(_) | Self::ReceiveFailed(_) | Self::Other(_) => true,
            Self::ConnectionClosed | Self::FrameTooLarge { .. } | Self::Timeout => false,
        }
    }
}

/// An active duplex connection.
///
/// Implementations must allow one task to be parked in [`recv`](Self::recv)
/// while another calls [`send`](Self::send) or [`close`](Self::close).
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Set the maximum inbound frame size in bytes.
    ///
    /// Larger frames make [`recv`](Self::recv) fail with
    /// [`TransportError::FrameTooLarge`].
    fn set_read_limit(&self, limit: usize);

    /// Receive the next frame.
    ///
    /// A close frame from the peer surfaces as [`TransportError::PeerClosed`];
    /// a local close as [`TransportError::ConnectionClosed`].
    async fn recv(&self) -> Result<Frame, TransportError>;

    /// Send one frame.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_expected_closures_are_not_reported() {
        for code in [close_code::NORMAL, close_code::GOING_AWAY] {
            let err = TransportError::PeerClosed {
                code: Some(code),
                reason: String::new(),
            };
            assert!(!err.is_unexpected_close(), "code {}", code);
        }
        assert!(!TransportError::ConnectionClosed.is_unexpected_close());
        assert!(!TransportError::Timeout.is_unexpected_close());
        assert!(!TransportError::FrameTooLarge { size: 9, limit: 8 }.is_unexpected_close());
    }

    #[test]
    fn test_unexpected_closures_are_reported() {
        for code in [
            None,
            Some(close_code::ABNORMAL),
            Some(close_code::PROTOCOL_ERROR),
            Some(close_code::INTERNAL_ERROR),
        ] {
            let err = TransportError::PeerClosed {
                code,
                reason: String::new(),
            };
            assert!(err.is_unexpected_close(), "code {:?}", code);
        }
        assert!(TransportError::SendFailed("broken".into()).is_unexpected_close());
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::PermissionDenied,
        ] {
            assert!(
                TransportError::Io(io::Error::from(kind)).is_unexpected_close(),
                "{:?}",
                kind
            );
        }
    }

    #[test]
    fn test_frame_helpers() {
        let text = Frame::data(FrameKind::Text, Bytes::from_static(b"hi"));
        assert_eq!(text, Frame::Text(Bytes::from_static(b"hi")));
        assert!(text.is_data());
        assert_eq!(text.payload_len(), 2);

        let binary = Frame::data(FrameKind::Binary, Bytes::from_static(b"abc"));
        assert!(matches!(binary, Frame::Binary(_)));
        assert!(!Frame::Ping(Bytes::new()).is_data());
        assert_eq!(Frame::Close(Some(CloseFrame::normal())).payload_len(), 0);
    }
}
