//! In-memory transport.
//!
//! [`MemoryConnection`] implements [`Connection`] over tokio channels. Its
//! [`MemoryPeer`] plays the remote end: it injects inbound frames, observes
//! every frame the hub writes, and can hang up with a close code. Useful for
//! tests, benchmarks and in-process consumers.

use crate::transport::{CloseFrame, Connection, ConnectionId, Frame, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::trace;

/// Create a connected pair.
#[must_use]
pub fn pair() -> (Arc<MemoryConnection>, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (closed, _) = watch::channel(false);

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        inbound: Mutex::new(inbound_rx),
        outbound: outbound_tx,
        read_limit: AtomicUsize::new(usize::MAX),
        is_open: AtomicBool::new(true),
        closed,
        close_calls: AtomicUsize::new(0),
    };
    let peer = MemoryPeer {
        inbound: inbound_tx,
        outbound: outbound_rx,
    };

    (Arc::new(conn), peer)
}

async fn closed_locally(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// The local side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    outbound: mpsc::UnboundedSender<Frame>,
    read_limit: AtomicUsize,
    is_open: AtomicBool,
    closed: watch::Sender<bool>,
    close_calls: AtomicUsize,
}

impl MemoryConnection {
    /// Number of times [`Connection::close`] has been called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// The read limit currently in force.
    #[must_use]
    pub fn read_limit(&self) -> usize {
        self.read_limit.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::SeqCst);
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        tokio::select! {
            () = closed_locally(&mut closed) => Err(TransportError::ConnectionClosed),
            frame = inbound.recv() => match frame {
                None => Err(TransportError::PeerClosed {
                    code: None,
                    reason: String::new(),
                }),
                Some(Frame::Close(close)) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    let (code, reason) = close.map_or((None, String::new()), |c| (Some(c.code), c.reason));
                    Err(TransportError::PeerClosed { code, reason })
                }
                Some(frame) => {
                    let limit = self.read_limit();
                    if frame.is_data() && frame.payload_len() > limit {
                        return Err(TransportError::FrameTooLarge {
                            size: frame.payload_len(),
                            limit,
                        });
                    }
                    Ok(frame)
                }
            },
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::PeerClosed {
                code: None,
                reason: "peer dropped".into(),
            })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        trace!(connection = %self.id, "Closing memory connection");
        // The peer may already be gone; closing still succeeds locally.
        let _ = self.outbound.send(Frame::Close(Some(CloseFrame::normal())));
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// The remote side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    /// Deliver a frame to the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is gone.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.inbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Deliver a text frame.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_text(&self, payload: impl Into<Bytes>) -> Result<(), TransportError> {
        self.send(Frame::Text(payload.into()))
    }

    /// Hang up with the given close code.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn close(&self, code: u16) -> Result<(), TransportError> {
        self.send(Frame::Close(Some(CloseFrame::new(code, ""))))
    }

    /// Wait for the next frame written by the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Take the next written frame if one is ready.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    /// Wait for the next application payload, skipping pings.
    ///
    /// Returns `None` when the connection sends a close frame or goes away.
    pub async fn recv_data(&mut self) -> Option<Bytes> {
        loop {
            match self.outbound.recv().await? {
                Frame::Text(payload) | Frame::Binary(payload) => return Some(payload),
                Frame::Close(_) => return None,
                Frame::Ping(_) | Frame::Pong(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::close_code;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (conn, mut peer) = pair();

        peer.send_text("inbound").unwrap();
        assert_eq!(
            conn.recv().await.unwrap(),
            Frame::Text(Bytes::from_static(b"inbound"))
        );

        conn.send(Frame::Binary(Bytes::from_static(b"outbound")))
            .await
            .unwrap();
        assert_eq!(peer.recv_data().await.unwrap(), "outbound");
    }

    #[tokio::test]
    async fn test_read_limit() {
        let (conn, peer) = pair();
        conn.set_read_limit(4);

        peer.send_text("1234").unwrap();
        assert!(conn.recv().await.is_ok());

        peer.send_text("12345").unwrap();
        assert!(matches!(
            conn.recv().await,
            Err(TransportError::FrameTooLarge { size: 5, limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_peer_close_code() {
        let (conn, peer) = pair();
        peer.close(close_code::GOING_AWAY).unwrap();

        match conn.recv().await {
            Err(TransportError::PeerClosed { code, .. }) => {
                assert_eq!(code, Some(close_code::GOING_AWAY));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_peer_drop_ends_stream() {
        let (conn, peer) = pair();
        drop(peer);
        assert!(matches!(
            conn.recv().await,
            Err(TransportError::PeerClosed { code: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_wakes_reader() {
        let (conn, mut peer) = pair();

        let reader = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.recv().await })
        };
        tokio::task::yield_now().await;

        conn.close().await.unwrap();
        conn.close().await.unwrap();

        assert!(matches!(
            reader.await.unwrap(),
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(conn.close_count(), 2);
        assert_eq!(peer.recv().await, Some(Frame::Close(Some(CloseFrame::normal()))));
        assert!(peer.try_recv().is_none());
        assert!(matches!(
            conn.send(Frame::Text(Bytes::new())).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
