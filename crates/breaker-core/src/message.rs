//! Message type for Breaker.
//!
//! A message is an opaque payload. The hub never looks inside it; the extra
//! fields exist for logging and tracing only.

use crate::client::ClientId;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let timestamp = now_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// An immutable message to broadcast.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Client whose read pump produced this message, if any.
    pub source: Option<ClientId>,
    /// Raw payload (shared, cloning is cheap).
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch when the message was created.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            source: None,
            payload: payload.into(),
            timestamp: (now_nanos() / 1_000_000) as u64,
        }
    }

    /// Tag the message with the client it came from.
    #[must_use]
    pub fn with_source(mut self, source: ClientId) -> Self {
        self.source = Some(source);
        self
    }

    /// Get the raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Bytes> for Message {
    fn from(payload: Bytes) -> Self {
        Self::new(payload)
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<String> for Message {
    fn from(payload: String) -> Self {
        Self::new(payload)
    }
}

impl From<&'static str> for Message {
    fn from(payload: &'static str) -> Self {
        Self::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(b"hello".to_vec());
        assert_eq!(&msg.payload()[..], b"hello");
        assert_eq!(msg.len(), 5);
        assert!(msg.source.is_none());
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_message_with_source() {
        let source = ClientId::next();
        let msg = Message::from("data").with_source(source);
        assert_eq!(msg.source, Some(source));
    }

    #[test]
    fn test_empty_message() {
        assert!(Message::new(Bytes::new()).is_empty());
        assert!(!Message::from("x").is_empty());
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
    }
}
