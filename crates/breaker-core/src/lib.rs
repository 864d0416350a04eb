//! # breaker-core
//!
//! Hub event loop, client pumps, and message types for the Breaker
//! websocket broadcast hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Single event loop owning the client registry
//! - **Client** - Per-connection read and write pumps with keepalive
//! - **Message** - Opaque broadcast payload
//! - **Connection** - The narrow transport capability the hub consumes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ register   ┌─────────────┐  outbound  ┌─────────────┐
//! │ Connection  │───────────▶│  Hub loop   │───────────▶│ Write pump  │
//! └─────────────┘            └─────────────┘            └─────────────┘
//!        │                          ▲
//!        ▼                          │ broadcast / unregister
//! ┌─────────────┐                   │
//! │  Read pump  │───────────────────┘
//! └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use breaker_core::{memory, Hub, HubConfig};
//!
//! # async fn run() -> Result<(), breaker_core::HubError> {
//! let hub = Hub::new(HubConfig::default())?;
//! let (conn, mut peer) = memory::pair();
//! let client = hub.register(conn).await?;
//!
//! hub.broadcast("hello").await?;
//! assert_eq!(peer.recv_data().await.unwrap(), "hello");
//!
//! hub.unregister(&client).await?;
//! hub.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod memory;
pub mod message;
pub mod transport;

pub use client::{Client, ClientId, PumpContext};
pub use config::{ErrorHandler, HubConfig, KeepaliveConfig, SlowConsumerPolicy};
pub use error::HubError;
pub use hub::{Hub, HubStats};
pub use message::Message;
pub use transport::{
    close_code, CloseFrame, Connection, ConnectionId, Frame, FrameKind, TransportError,
};
