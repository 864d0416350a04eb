//! A [`Connection`] over any split-able websocket.
//!
//! Both websocket libraries the server touches expose a socket that is a
//! `Stream` of messages and a `Sink` of messages. [`SplitConnection`] splits
//! such a socket into halves, each behind its own lock, and translates
//! between the library's message type and [`Frame`] through
//! [`WireMessage`].

use async_trait::async_trait;
use breaker_core::transport::{CloseFrame, Connection, ConnectionId, Frame, TransportError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

/// A websocket library's message type.
pub trait WireMessage: Send + Sized + 'static {
    /// The library's error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Convert an outbound frame.
    fn from_frame(frame: Frame) -> Self;

    /// Convert an inbound message. `None` for messages with no frame
    /// equivalent, which are skipped.
    fn into_frame(self) -> Option<Frame>;

    /// Classify a library error. `fallback` wraps errors with no better
    /// mapping and depends on the direction of the failed call.
    fn map_error(err: Self::Error, fallback: fn(String) -> TransportError) -> TransportError;
}

/// A websocket split into separately locked read and write halves.
pub struct SplitConnection<T, M> {
    id: ConnectionId,
    sink: Mutex<SplitSink<T, M>>,
    stream: Mutex<SplitStream<T>>,
    remote_addr: Option<SocketAddr>,
    read_limit: AtomicUsize,
    is_open: AtomicBool,
    closed: watch::Sender<bool>,
}

impl<T, M> fmt::Debug for SplitConnection<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("is_open", &self.is_open.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

async fn closed_locally(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

impl<T, M> SplitConnection<T, M>
where
    T: Stream<Item = Result<M, M::Error>> + Sink<M, Error = M::Error> + Unpin + Send + 'static,
    M: WireMessage,
{
    /// Wrap an established websocket.
    #[must_use]
    pub fn new(socket: T, remote_addr: Option<SocketAddr>) -> Self {
        let (sink, stream) = socket.split();
        let (closed, _) = watch::channel(false);

        Self {
            id: ConnectionId::generate(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            remote_addr,
            read_limit: AtomicUsize::new(usize::MAX),
            is_open: AtomicBool::new(true),
            closed,
        }
    }

    /// Mark the connection closed, wake any parked reader and send the close
    /// frame. Only the first call does anything.
    async fn close_with(&self, close: Option<CloseFrame>) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }
        self.closed.send_replace(true);
        debug!(connection = %self.id, ?close, "Closing websocket");

        let mut sink = self.sink.lock().await;
        match sink.send(M::from_frame(Frame::Close(close))).await {
            Ok(()) => Ok(()),
            Err(e) => match M::map_error(e, TransportError::SendFailed) {
                // The peer got there first.
                TransportError::ConnectionClosed => Ok(()),
                err => Err(err),
            },
        }
    }

    fn closed_by_peer(&self, code: Option<u16>, reason: String) -> TransportError {
        self.is_open.store(false, Ordering::SeqCst);
        trace!(connection = %self.id, ?code, "Peer closed websocket");
        TransportError::PeerClosed { code, reason }
    }
}

#[async_trait]
impl<T, M> Connection for SplitConnection<T, M>
where
    T: Stream<Item = Result<M, M::Error>> + Sink<M, Error = M::Error> + Unpin + Send + 'static,
    M: WireMessage,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::SeqCst);
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut closed = self.closed.subscribe();
        let mut stream = self.stream.lock().await;

        loop {
            let next = tokio::select! {
                () = closed_locally(&mut closed) => return Err(TransportError::ConnectionClosed),
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(M::map_error(e, TransportError::ReceiveFailed));
                }
                None => return Err(self.closed_by_peer(None, String::new())),
            };

            match message.into_frame() {
                Some(Frame::Close(close)) => {
                    let (code, reason) =
                        close.map_or((None, String::new()), |c| (Some(c.code), c.reason));
                    return Err(self.closed_by_peer(code, reason));
                }
                Some(frame) => {
                    let limit = self.read_limit.load(Ordering::SeqCst);
                    if frame.is_data() && frame.payload_len() > limit {
                        return Err(TransportError::FrameTooLarge {
                            size: frame.payload_len(),
                            limit,
                        });
                    }
                    return Ok(frame);
                }
                None => {}
            }
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if let Frame::Close(close) = frame {
            return self.close_with(close).await;
        }
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(M::from_frame(frame))
            .await
            .map_err(|e| M::map_error(e, TransportError::SendFailed))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_with(Some(CloseFrame::normal())).await
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}
