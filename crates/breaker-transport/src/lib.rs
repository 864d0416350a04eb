//! # breaker-transport
//!
//! WebSocket transports for the Breaker hub.
//!
//! The hub consumes any [`Connection`]. This crate provides the two the
//! server needs:
//!
//! - **WebSocketConnection** - a tokio-tungstenite stream, accepted by the
//!   standalone [`WebSocketTransport`] listener
//! - **AxumConnection** - a socket upgraded by an axum handler
//!
//! Both split the socket into read and write halves so a pump parked in
//! `recv` never holds up the other pump's writes.
//!
//! ```rust,ignore
//! use breaker_transport::{Transport, WebSocketTransport};
//!
//! let transport = WebSocketTransport::bind(addr).await?;
//! while let Ok(conn) = transport.accept().await {
//!     hub.register(conn).await?;
//! }
//! ```

pub mod split;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod axum_ws;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use split::{SplitConnection, WireMessage};
pub use traits::{Connection, ConnectionId, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use axum_ws::AxumConnection;
#[cfg(feature = "websocket")]
pub use websocket::{protocol_config, WebSocketConfig, WebSocketConnection, WebSocketTransport};
