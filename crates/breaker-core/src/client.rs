//! Connected clients and their pump pair.
//!
//! Every registered connection gets two tasks:
//!
//! - the **read pump** pulls frames off the transport and hands each data
//!   frame to the hub as a broadcast, refreshing its read deadline on pongs;
//! - the **write pump** drains the client's outbound queue to the transport
//!   and pings the peer on a fixed interval.
//!
//! Either pump ending on a transport failure asks the hub to unregister the
//! client. The hub closes the outbound queue and the connection, which stops
//! the other pump.
//!
//! ```text
//!            ┌────────────┐  broadcast   ┌──────────┐
//! transport ─▶ read pump  ├─────────────▶│          │
//!            └────────────┘              │   hub    │
//!            ┌────────────┐   outbound   │  event   │
//! transport ◀─ write pump │◀─────────────┤   loop   │
//!            └────────────┘              └──────────┘
//! ```

use crate::config::KeepaliveConfig;
use crate::error::HubError;
use crate::message::Message;
use crate::transport::{CloseFrame, Connection, ConnectionId, Frame, FrameKind, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) fn next() -> Self {
        Self(CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// What a client's pumps need from their hub.
///
/// Pumps only ever see this trait, never the hub itself.
#[async_trait]
pub trait PumpContext: Send + Sync + 'static {
    /// Submit a message for broadcast to every client.
    async fn broadcast(&self, message: Message) -> Result<(), HubError>;

    /// Ask the hub to drop a client.
    async fn unregister(&self, client: ClientId) -> Result<(), HubError>;

    /// Hand an error to the hub's error handler.
    fn report_error(&self, error: HubError);

    /// Maximum inbound frame size.
    fn max_read_limit(&self) -> usize;

    /// Keepalive timings.
    fn keepalive(&self) -> KeepaliveConfig;

    /// Frame kind for outbound messages.
    fn frame_kind(&self) -> FrameKind;
}

/// A client registered with a hub.
///
/// Cloning is cheap; all clones refer to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: ClientId,
    hub_id: u64,
    conn: Arc<dyn Connection>,
    done: watch::Receiver<bool>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("connection", self.inner.conn.id())
            .finish()
    }
}

impl Client {
    /// Build a client and the pumps that will serve it.
    pub(crate) fn new(
        hub_id: u64,
        conn: Arc<dyn Connection>,
        outbound: mpsc::Receiver<Arc<Message>>,
    ) -> (Self, Pumps) {
        let id = ClientId::next();
        let (done_tx, done_rx) = watch::channel(false);

        let client = Self {
            inner: Arc::new(ClientInner {
                id,
                hub_id,
                conn: Arc::clone(&conn),
                done: done_rx,
            }),
        };
        let pumps = Pumps {
            id,
            conn,
            outbound,
            done: done_tx,
        };

        (client, pumps)
    }

    /// Get the client's identity.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Get the underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.conn
    }

    /// Get the underlying connection's identifier.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.inner.conn.id()
    }

    pub(crate) fn hub_id(&self) -> u64 {
        self.inner.hub_id
    }

    /// Whether both pumps have finished.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Wait until both pumps have finished.
    pub async fn closed(&self) {
        let mut done = self.inner.done.clone();
        // An error means the supervisor is gone, which also means done.
        let _ = done.wait_for(|done| *done).await;
    }
}

/// The not-yet-started pump pair of a client.
pub(crate) struct Pumps {
    id: ClientId,
    conn: Arc<dyn Connection>,
    outbound: mpsc::Receiver<Arc<Message>>,
    done: watch::Sender<bool>,
}

impl Pumps {
    /// Start both pumps under a supervisor.
    ///
    /// A panicking pump is reported as a fault and the client is
    /// unregistered, which brings the other pump down too.
    pub(crate) fn spawn(self, ctx: Arc<dyn PumpContext>) {
        let Pumps {
            id,
            conn,
            outbound,
            done,
        } = self;

        let mut read = tokio::spawn(read_pump(id, Arc::clone(&conn), Arc::clone(&ctx)));
        let mut write = tokio::spawn(write_pump(id, conn, outbound, Arc::clone(&ctx)));

        tokio::spawn(async move {
            let read_finished_first = tokio::select! {
                result = &mut read => {
                    supervise(id, &*ctx, "read pump", result).await;
                    true
                }
                result = &mut write => {
                    supervise(id, &*ctx, "write pump", result).await;
                    false
                }
            };
            if read_finished_first {
                supervise(id, &*ctx, "write pump", write.await).await;
            } else {
                supervise(id, &*ctx, "read pump", read.await).await;
            }

            done.send_replace(true);
            debug!(client = %id, "Client pumps finished");
        });
    }
}

async fn supervise(
    id: ClientId,
    ctx: &dyn PumpContext,
    pump: &'static str,
    result: Result<(), JoinError>,
) {
    let Err(e) = result else { return };
    if !e.is_panic() {
        return;
    }
    let payload = e.into_panic();
    ctx.report_error(HubError::panic(pump, payload.as_ref()));
    if let Err(e) = ctx.unregister(id).await {
        debug!(client = %id, error = %e, "Unregister after pump fault failed");
    }
}

/// Log or report a transport error that ended a pump.
fn pump_failed(id: ClientId, ctx: &dyn PumpContext, pump: &'static str, err: TransportError) {
    if err.is_unexpected_close() {
        ctx.report_error(HubError::transport(pump, err));
    } else {
        debug!(client = %id, pump, error = %err, "Connection ended");
    }
}

async fn read_pump(id: ClientId, conn: Arc<dyn Connection>, ctx: Arc<dyn PumpContext>) {
    let pong_wait = ctx.keepalive().pong_wait;
    conn.set_read_limit(ctx.max_read_limit());
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = match time::timeout_at(deadline, conn.recv()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                pump_failed(id, &*ctx, "read pump", e);
                break;
            }
            Err(_) => {
                pump_failed(id, &*ctx, "read pump", TransportError::Timeout);
                break;
            }
        };

        match frame {
            Frame::Text(payload) | Frame::Binary(payload) => {
                if payload.is_empty() {
                    trace!(client = %id, "Skipping empty frame");
                    continue;
                }
                match ctx.broadcast(Message::new(payload).with_source(id)).await {
                    Ok(()) => {}
                    Err(HubError::Closed) => break,
                    Err(e) => ctx.report_error(e),
                }
            }
            Frame::Pong(_) => {
                deadline = Instant::now() + pong_wait;
                trace!(client = %id, "Pong received");
            }
            // Answered by the transport.
            Frame::Ping(_) => {}
            Frame::Close(close) => {
                let (code, reason) =
                    close.map_or((None, String::new()), |c| (Some(c.code), c.reason));
                pump_failed(id, &*ctx, "read pump", TransportError::PeerClosed { code, reason });
                break;
            }
        }
    }

    if let Err(e) = ctx.unregister(id).await {
        debug!(client = %id, error = %e, "Unregister from read pump failed");
    }
}

async fn write_frame(
    conn: &dyn Connection,
    frame: Frame,
    write_wait: Duration,
) -> Result<(), TransportError> {
    time::timeout(write_wait, conn.send(frame))
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn write_pump(
    id: ClientId,
    conn: Arc<dyn Connection>,
    mut outbound: mpsc::Receiver<Arc<Message>>,
    ctx: Arc<dyn PumpContext>,
) {
    let keepalive = ctx.keepalive();
    let kind = ctx.frame_kind();
    let mut ticker = time::interval_at(
        Instant::now() + keepalive.ping_interval,
        keepalive.ping_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failed = loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    // The hub dropped us and is closing the connection.
                    let close = Frame::Close(Some(CloseFrame::normal()));
                    let _ = write_frame(&*conn, close, keepalive.write_wait).await;
                    break false;
                };
                let frame = Frame::data(kind, message.payload().clone());
                if let Err(e) = write_frame(&*conn, frame, keepalive.write_wait).await {
                    pump_failed(id, &*ctx, "write pump", e);
                    break true;
                }
            }
            _ = ticker.tick() => {
                match write_frame(&*conn, Frame::Ping(Bytes::new()), keepalive.write_wait).await {
                    Ok(()) => trace!(client = %id, "Ping sent"),
                    // Closed locally: the hub is already tearing us down.
                    Err(TransportError::ConnectionClosed) => break true,
                    Err(e) => {
                        ctx.report_error(HubError::transport("write pump ping", e));
                        break true;
                    }
                }
            }
        }
    };

    // Release the queue first so the event loop never waits on a reader
    // that is itself waiting on the event loop.
    drop(outbound);
    if failed {
        if let Err(e) = ctx.unregister(id).await {
            debug!(client = %id, error = %e, "Unregister from write pump failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{self, MemoryPeer};
    use crate::transport::close_code;
    use std::sync::Mutex;

    struct RecordingContext {
        keepalive: KeepaliveConfig,
        read_limit: usize,
        broadcasts: Mutex<Vec<Message>>,
        unregistered: Mutex<Vec<ClientId>>,
        errors: Mutex<Vec<String>>,
    }

    impl RecordingContext {
        fn new(keepalive: KeepaliveConfig) -> Arc<Self> {
            Arc::new(Self {
                keepalive,
                read_limit: 64,
                broadcasts: Mutex::new(Vec::new()),
                unregistered: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PumpContext for RecordingContext {
        async fn broadcast(&self, message: Message) -> Result<(), HubError> {
            self.broadcasts.lock().unwrap().push(message);
            Ok(())
        }

        async fn unregister(&self, client: ClientId) -> Result<(), HubError> {
            self.unregistered.lock().unwrap().push(client);
            Ok(())
        }

        fn report_error(&self, error: HubError) {
            self.errors.lock().unwrap().push(error.to_string());
        }

        fn max_read_limit(&self) -> usize {
            self.read_limit
        }

        fn keepalive(&self) -> KeepaliveConfig {
            self.keepalive
        }

        fn frame_kind(&self) -> FrameKind {
            FrameKind::Text
        }
    }

    fn start(ctx: &Arc<RecordingContext>) -> (Client, mpsc::Sender<Arc<Message>>, MemoryPeer) {
        let (conn, peer) = memory::pair();
        let (tx, rx) = mpsc::channel(8);
        let (client, pumps) = Client::new(0, conn, rx);
        pumps.spawn(Arc::clone(ctx) as Arc<dyn PumpContext>);
        (client, tx, peer)
    }

    #[tokio::test]
    async fn test_read_pump_broadcasts_with_source() {
        let ctx = RecordingContext::new(KeepaliveConfig::default());
        let (client, tx, peer) = start(&ctx);

        peer.send_text("hello").unwrap();
        peer.close(close_code::NORMAL).unwrap();
        drop(tx);
        client.closed().await;

        let broadcasts = ctx.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(&broadcasts[0].payload()[..], b"hello");
        assert_eq!(broadcasts[0].source, Some(client.id()));
        assert_eq!(*ctx.unregistered.lock().unwrap(), vec![client.id()]);
        assert!(ctx.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_pump_sets_limit_and_skips_empty_frames() {
        let ctx = RecordingContext::new(KeepaliveConfig::default());
        let (conn, peer) = memory::pair();
        let (tx, rx) = mpsc::channel(8);
        let (client, pumps) = Client::new(0, Arc::clone(&conn) as Arc<dyn Connection>, rx);
        pumps.spawn(Arc::clone(&ctx) as Arc<dyn PumpContext>);

        peer.send_text(Bytes::new()).unwrap();
        peer.close(close_code::GOING_AWAY).unwrap();
        drop(tx);
        client.closed().await;

        assert_eq!(conn.read_limit(), 64);
        assert!(ctx.broadcasts.lock().unwrap().is_empty());
        assert!(ctx.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_close_is_reported() {
        let ctx = RecordingContext::new(KeepaliveConfig::default());
        let (client, tx, peer) = start(&ctx);

        peer.close(close_code::INTERNAL_ERROR).unwrap();
        drop(tx);
        client.closed().await;

        let errors = ctx.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("read pump"));
        assert!(errors[0].contains("1011"));
    }

    #[tokio::test]
    async fn test_write_pump_drains_queue_then_closes() {
        let ctx = RecordingContext::new(KeepaliveConfig::default());
        let (client, tx, mut peer) = start(&ctx);

        tx.send(Arc::new(Message::from("one"))).await.unwrap();
        tx.send(Arc::new(Message::from("two"))).await.unwrap();
        assert_eq!(peer.recv_data().await.unwrap(), "one");
        assert_eq!(peer.recv_data().await.unwrap(), "two");

        drop(tx);
        assert_eq!(peer.recv().await, Some(Frame::Close(Some(CloseFrame::normal()))));

        // The write pump ended because the queue closed, not on failure.
        tokio::task::yield_now().await;
        assert!(ctx.unregistered.lock().unwrap().is_empty());
        assert!(!client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_pump_pings_on_interval() {
        let keepalive = KeepaliveConfig {
            ping_interval: Duration::from_millis(50),
            pong_wait: Duration::from_millis(60),
            write_wait: Duration::from_millis(15),
        };
        let ctx = RecordingContext::new(keepalive);
        let (_client, _tx, mut peer) = start(&ctx);

        time::sleep(Duration::from_millis(40)).await;
        assert!(peer.try_recv().is_none());

        time::sleep(Duration::from_millis(15)).await;
        assert_eq!(peer.try_recv(), Some(Frame::Ping(Bytes::new())));
    }

    #[tokio::test]
    async fn test_ping_failure_is_reported() {
        let keepalive = KeepaliveConfig {
            ping_interval: Duration::from_millis(10),
            pong_wait: Duration::from_secs(5),
            write_wait: Duration::from_secs(1),
        };
        let ctx = RecordingContext::new(keepalive);
        let (client, _tx, peer) = start(&ctx);

        // Without a peer every write fails.
        drop(peer);
        client.closed().await;

        let errors = ctx.errors.lock().unwrap();
        assert!(errors.iter().any(|e| e.contains("write pump ping")));
        assert!(ctx.unregistered.lock().unwrap().contains(&client.id()));
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("client-"));
    }
}
