//! WebSocket transport implementation.
//!
//! This module provides a WebSocket-based transport using tokio-tungstenite.

use async_trait::async_trait;
use breaker_core::config::DEFAULT_MAX_READ_LIMIT;
use breaker_core::transport::{close_code, CloseFrame, Frame};
use bytes::Bytes;
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{
        error::{CapacityError, ProtocolError},
        protocol::{
            frame::coding::CloseCode, CloseFrame as WsCloseFrame,
            WebSocketConfig as ProtocolConfig,
        },
        Error as WsError, Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info};

use crate::split::{SplitConnection, WireMessage};
use crate::traits::{Connection, Transport, TransportError};

/// A tokio-tungstenite websocket as a hub connection.
pub type WebSocketConnection<S = TcpStream> = SplitConnection<WebSocketStream<S>, Message>;

/// Map a tungstenite error onto the transport taxonomy.
pub(crate) fn map_ws_error(err: WsError, fallback: fn(String) -> TransportError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::PeerClosed {
                code: Some(close_code::ABNORMAL),
                reason: String::new(),
            }
        }
        WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
            TransportError::FrameTooLarge {
                size,
                limit: max_size,
            }
        }
        WsError::Io(e) => TransportError::Io(e),
        other => fallback(other.to_string()),
    }
}

/// Text frames must carry UTF-8; anything else goes out as binary.
pub(crate) fn text_or_binary(payload: &Bytes) -> Result<String, Vec<u8>> {
    String::from_utf8(payload.to_vec()).map_err(|e| e.into_bytes())
}

impl WireMessage for Message {
    type Error = WsError;

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(payload) => match text_or_binary(&payload) {
                Ok(text) => Message::Text(text),
                Err(bytes) => Message::Binary(bytes),
            },
            Frame::Binary(payload) => Message::Binary(payload.to_vec()),
            Frame::Ping(payload) => Message::Ping(payload.to_vec()),
            Frame::Pong(payload) => Message::Pong(payload.to_vec()),
            Frame::Close(close) => Message::Close(close.map(|c| WsCloseFrame {
                code: CloseCode::from(c.code),
                reason: Cow::Owned(c.reason),
            })),
        }
    }

    fn into_frame(self) -> Option<Frame> {
        let frame = match self {
            Message::Text(text) => Frame::Text(Bytes::from(text)),
            Message::Binary(data) => Frame::Binary(Bytes::from(data)),
            Message::Ping(data) => Frame::Ping(Bytes::from(data)),
            Message::Pong(data) => Frame::Pong(Bytes::from(data)),
            Message::Close(close) => Frame::Close(
                close.map(|c| CloseFrame::new(u16::from(c.code), c.reason.into_owned())),
            ),
            // Raw frame, only produced when writing
            Message::Frame(_) => return None,
        };
        Some(frame)
    }

    fn map_error(err: WsError, fallback: fn(String) -> TransportError) -> TransportError {
        map_ws_error(err, fallback)
    }
}

/// Protocol settings that make tungstenite itself refuse frames and
/// messages over `read_limit`, before their payload is read.
#[must_use]
pub fn protocol_config(read_limit: usize) -> ProtocolConfig {
    ProtocolConfig {
        max_message_size: Some(read_limit),
        max_frame_size: Some(read_limit),
        ..ProtocolConfig::default()
    }
}

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Largest inbound frame or message, in bytes. Should match the hub's
    /// `max_read_limit`.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_message_size: DEFAULT_MAX_READ_LIMIT,
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!(
            addr = ?listener.local_addr().ok(),
            "WebSocket transport listening"
        );

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        debug!(%addr, "Accepted TCP connection");

        let conn = upgrade_to_websocket(stream, self.config.max_message_size)
            .await
            .map_err(|e| {
                error!(%addr, error = %e, "WebSocket handshake failed");
                e
            })?;
        conn.set_read_limit(self.config.max_message_size);

        debug!(%addr, connection = %conn.id(), "WebSocket handshake completed");
        Ok(Arc::new(conn))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Run the server side of the websocket handshake on an accepted stream.
///
/// Frames larger than `read_limit` are rejected by the protocol layer as
/// their header arrives.
///
/// # Errors
///
/// Returns an error if the peer address is unavailable or the handshake
/// fails.
pub async fn upgrade_to_websocket(
    stream: TcpStream,
    read_limit: usize,
) -> Result<WebSocketConnection, TransportError> {
    let addr = stream.peer_addr().map_err(TransportError::Io)?;

    let ws_stream = accept_async_with_config(stream, Some(protocol_config(read_limit)))
        .await
        .map_err(|e| TransportError::Other(format!("WebSocket handshake failed: {}", e)))?;

    Ok(SplitConnection::new(ws_stream, Some(addr)))
}
