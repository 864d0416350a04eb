//! Adapter for sockets upgraded by an axum handler.

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message, WebSocket};
use breaker_core::transport::{CloseFrame, Frame};
use bytes::Bytes;
use std::borrow::Cow;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::split::{SplitConnection, WireMessage};
use crate::traits::TransportError;
use crate::websocket::{map_ws_error, text_or_binary};

/// An axum websocket as a hub connection.
pub type AxumConnection = SplitConnection<WebSocket, Message>;

impl WireMessage for Message {
    type Error = axum::Error;

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(payload) => match text_or_binary(&payload) {
                Ok(text) => Message::Text(text),
                Err(bytes) => Message::Binary(bytes),
            },
            Frame::Binary(payload) => Message::Binary(payload.to_vec()),
            Frame::Ping(payload) => Message::Ping(payload.to_vec()),
            Frame::Pong(payload) => Message::Pong(payload.to_vec()),
            Frame::Close(close) => Message::Close(close.map(|c| AxumCloseFrame {
                code: c.code,
                reason: Cow::Owned(c.reason),
            })),
        }
    }

    fn into_frame(self) -> Option<Frame> {
        Some(match self {
            Message::Text(text) => Frame::Text(Bytes::from(text)),
            Message::Binary(data) => Frame::Binary(Bytes::from(data)),
            Message::Ping(data) => Frame::Ping(Bytes::from(data)),
            Message::Pong(data) => Frame::Pong(Bytes::from(data)),
            Message::Close(close) => {
                Frame::Close(close.map(|c| CloseFrame::new(c.code, c.reason.into_owned())))
            }
        })
    }

    /// axum wraps the tungstenite error; unwrap it to classify closures the
    /// same way as a bare tungstenite socket.
    fn map_error(err: axum::Error, fallback: fn(String) -> TransportError) -> TransportError {
        match err.into_inner().downcast::<WsError>() {
            Ok(ws) => map_ws_error(*ws, fallback),
            Err(other) => fallback(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breaker_core::transport::close_code;
    use tokio_tungstenite::tungstenite::error::{CapacityError, ProtocolError};

    #[test]
    fn test_frames_convert_to_axum_messages() {
        assert_eq!(
            Message::from_frame(Frame::Text(Bytes::from_static(b"hi"))),
            Message::Text("hi".into())
        );
        assert_eq!(
            Message::from_frame(Frame::Text(Bytes::from_static(&[0xc3]))),
            Message::Binary(vec![0xc3])
        );
        assert_eq!(
            Message::Close(Some(AxumCloseFrame {
                code: close_code::GOING_AWAY,
                reason: "bye".into(),
            }))
            .into_frame(),
            Some(Frame::Close(Some(CloseFrame::new(close_code::GOING_AWAY, "bye"))))
        );
    }

    #[test]
    fn test_wrapped_reset_is_a_reported_abnormal_close() {
        let err = axum::Error::new(WsError::Protocol(
            ProtocolError::ResetWithoutClosingHandshake,
        ));
        let mapped = Message::map_error(err, TransportError::ReceiveFailed);
        assert!(matches!(
            mapped,
            TransportError::PeerClosed {
                code: Some(close_code::ABNORMAL),
                ..
            }
        ));
        assert!(mapped.is_unexpected_close());
    }

    #[test]
    fn test_wrapped_capacity_error_is_frame_too_large() {
        let err = axum::Error::new(WsError::Capacity(CapacityError::MessageTooLong {
            size: 4096,
            max_size: 512,
        }));
        let mapped = Message::map_error(err, TransportError::ReceiveFailed);
        assert!(matches!(
            mapped,
            TransportError::FrameTooLarge {
                size: 4096,
                limit: 512
            }
        ));
        assert!(!mapped.is_unexpected_close());
    }

    #[test]
    fn test_unknown_error_uses_fallback() {
        let err = axum::Error::new(std::io::Error::other("boom"));
        assert!(matches!(
            Message::map_error(err, TransportError::SendFailed),
            TransportError::SendFailed(_)
        ));
    }
}
