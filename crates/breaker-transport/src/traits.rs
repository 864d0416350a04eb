//! Listener-side transport abstraction.
//!
//! [`Connection`] itself lives in `breaker-core`, next to the hub that
//! consumes it. This module adds [`Transport`], the thing that produces
//! connections.

use async_trait::async_trait;
use std::sync::Arc;

pub use breaker_core::transport::{Connection, ConnectionId, TransportError};

/// A transport that can accept connections.
///
/// Transports own the handshake for their protocol and hand back
/// connections ready to be registered with a hub.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// Waits until a peer has connected and completed the handshake.
    async fn accept(&self) -> Result<Arc<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}
