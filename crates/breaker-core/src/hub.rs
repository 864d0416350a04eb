//! The hub: a single event loop that owns the client registry.
//!
//! Registration, unregistration and broadcasts are all messages to one
//! task. Nothing else ever touches the registry, so it needs no lock.
//! Register and unregister are rendezvous hand-offs: the caller waits until
//! the loop has taken the event. Broadcasts go through a bounded queue.
//!
//! A panic while handling one event is caught, reported, and the loop moves
//! on to the next event with its registry intact.

use crate::client::{Client, ClientId, PumpContext};
use crate::config::{HubConfig, KeepaliveConfig, SlowConsumerPolicy};
use crate::error::HubError;
use crate::message::Message;
use crate::transport::{Connection, FrameKind, TransportError};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

static HUB_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Membership changes, sent on the control channel.
enum Control {
    Register {
        id: ClientId,
        entry: ClientEntry,
        accepted: oneshot::Sender<()>,
    },
    Unregister {
        id: ClientId,
        accepted: oneshot::Sender<()>,
    },
}

/// What the loop keeps per registered client.
struct ClientEntry {
    conn: Arc<dyn Connection>,
    /// The only sender of the client's outbound queue. Dropping it closes
    /// the queue.
    outbound: mpsc::Sender<Arc<Message>>,
}

enum Event {
    Control(Control),
    Broadcast(Arc<Message>),
    Shutdown,
}

#[derive(Debug, Default)]
struct StatsCounters {
    clients: AtomicUsize,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    faults: AtomicU64,
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of registered clients.
    pub clients: usize,
    /// Broadcasts fanned out so far.
    pub broadcasts: u64,
    /// Messages placed on client queues.
    pub delivered: u64,
    /// Deliveries skipped because a queue was full.
    pub dropped: u64,
    /// Faults recovered by the event loop.
    pub faults: u64,
}

struct HubShared {
    id: u64,
    config: HubConfig,
    control: mpsc::Sender<Control>,
    broadcast: mpsc::Sender<Arc<Message>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<StatsCounters>,
}

impl HubShared {
    fn report(&self, error: HubError) {
        (self.config.error_handler)(&error);
    }

    async fn submit(
        &self,
        control: Control,
        accepted: oneshot::Receiver<()>,
    ) -> Result<(), HubError> {
        self.control
            .send(control)
            .await
            .map_err(|_| HubError::Closed)?;
        accepted.await.map_err(|_| HubError::Closed)
    }

    async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let control = Control::Unregister {
            id,
            accepted: accepted_tx,
        };
        self.submit(control, accepted_rx).await
    }

    async fn broadcast(&self, message: Message) -> Result<(), HubError> {
        if message.is_empty() {
            return Err(HubError::InvalidArgument("message payload is empty"));
        }
        self.broadcast
            .send(Arc::new(message))
            .await
            .map_err(|_| HubError::Closed)
    }
}

/// The view of the hub handed to client pumps.
struct HubContext(Arc<HubShared>);

#[async_trait]
impl PumpContext for HubContext {
    async fn broadcast(&self, message: Message) -> Result<(), HubError> {
        self.0.broadcast(message).await
    }

    async fn unregister(&self, client: ClientId) -> Result<(), HubError> {
        self.0.unregister(client).await
    }

    fn report_error(&self, error: HubError) {
        self.0.report(error);
    }

    fn max_read_limit(&self) -> usize {
        self.0.config.max_read_limit
    }

    fn keepalive(&self) -> KeepaliveConfig {
        self.0.config.keepalive
    }

    fn frame_kind(&self) -> FrameKind {
        self.0.config.frame_kind
    }
}

/// A broadcast hub.
///
/// Cloning is cheap; all clones drive the same event loop.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    /// Validate the configuration and start the event loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        config.validate()?;

        let id = HUB_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::channel(1);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(StatsCounters::default());

        info!(hub = id, ?config, "Starting hub");

        let event_loop = EventLoop {
            hub_id: id,
            config: config.clone(),
            registry: HashMap::new(),
            control: control_rx,
            broadcast: broadcast_rx,
            shutdown: shutdown_rx,
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(event_loop.run());

        Ok(Self {
            shared: Arc::new(HubShared {
                id,
                config,
                control: control_tx,
                broadcast: broadcast_tx,
                shutdown: shutdown_tx,
                task: Mutex::new(Some(task)),
                stats,
            }),
        })
    }

    /// Register a connection and start serving it.
    ///
    /// Returns once the event loop has accepted the client. The pumps start
    /// right after, so the client's own disconnect can never reach the loop
    /// before its registration.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidArgument`] if the connection is no longer
    /// open, or [`HubError::Closed`] if the hub has shut down.
    pub async fn register(&self, conn: Arc<dyn Connection>) -> Result<Client, HubError> {
        if !conn.is_open() {
            return Err(HubError::InvalidArgument("connection is not open"));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.shared.config.outbound_capacity);
        let (client, pumps) = Client::new(self.shared.id, conn, outbound_rx);

        let (accepted_tx, accepted_rx) = oneshot::channel();
        let control = Control::Register {
            id: client.id(),
            entry: ClientEntry {
                conn: Arc::clone(client.connection()),
                outbound: outbound_tx,
            },
            accepted: accepted_tx,
        };
        self.shared.submit(control, accepted_rx).await?;

        pumps.spawn(Arc::new(HubContext(Arc::clone(&self.shared))));
        Ok(client)
    }

    /// Ask the event loop to remove a client.
    ///
    /// Returns once the loop has taken the request; removal happens right
    /// after. Unregistering a client that is already gone is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidArgument`] if the client belongs to another
    /// hub, or [`HubError::Closed`] if the hub has shut down.
    pub async fn unregister(&self, client: &Client) -> Result<(), HubError> {
        if client.hub_id() != self.shared.id {
            return Err(HubError::InvalidArgument(
                "client belongs to a different hub",
            ));
        }
        self.shared.unregister(client.id()).await
    }

    /// Queue a message for every registered client.
    ///
    /// Waits while the broadcast queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidArgument`] for an empty payload, or
    /// [`HubError::Closed`] if the hub has shut down.
    pub async fn broadcast(&self, message: impl Into<Message>) -> Result<(), HubError> {
        self.shared.broadcast(message.into()).await
    }

    /// Maximum inbound frame size for clients of this hub.
    #[must_use]
    pub fn max_read_limit(&self) -> usize {
        self.shared.config.max_read_limit
    }

    /// The configuration this hub was started with.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let stats = &self.shared.stats;
        HubStats {
            clients: stats.clients.load(Ordering::Relaxed),
            broadcasts: stats.broadcasts.load(Ordering::Relaxed),
            delivered: stats.delivered.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            faults: stats.faults.load(Ordering::Relaxed),
        }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Stop the event loop and wait for it to exit.
    ///
    /// Every client still registered has its queue and connection closed.
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);

        let task = self
            .shared
            .task
            .lock()
            .ok()
            .and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    self.shared
                        .report(HubError::panic("hub shutdown", e.into_panic().as_ref()));
                }
            }
        }
    }
}

/// Resolves once shutdown is requested or every hub handle is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// The single owner of the registry.
struct EventLoop {
    hub_id: u64,
    config: HubConfig,
    registry: HashMap<ClientId, ClientEntry>,
    control: mpsc::Receiver<Control>,
    broadcast: mpsc::Receiver<Arc<Message>>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<StatsCounters>,
}

impl EventLoop {
    async fn run(mut self) {
        debug!(hub = self.hub_id, "Hub event loop started");

        loop {
            let event = tokio::select! {
                _ = stopped(&mut self.shutdown) => Event::Shutdown,
                Some(control) = self.control.recv() => Event::Control(control),
                Some(message) = self.broadcast.recv() => Event::Broadcast(message),
                else => Event::Shutdown,
            };
            if matches!(event, Event::Shutdown) {
                break;
            }

            let outcome = AssertUnwindSafe(self.dispatch(event)).catch_unwind().await;
            if let Err(panic) = outcome {
                self.recovered(panic.as_ref());
            }
        }

        // Refuse new work, then release everyone still registered.
        self.control.close();
        self.broadcast.close();
        let remaining: Vec<ClientId> = self.registry.keys().copied().collect();
        for id in remaining {
            let outcome = AssertUnwindSafe(self.remove(id)).catch_unwind().await;
            if let Err(panic) = outcome {
                self.recovered(panic.as_ref());
            }
        }

        info!(hub = self.hub_id, "Hub event loop stopped");
    }

    fn report(&self, error: HubError) {
        (self.config.error_handler)(&error);
    }

    fn recovered(&self, panic: &(dyn std::any::Any + Send)) {
        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        self.stats
            .clients
            .store(self.registry.len(), Ordering::Relaxed);
        warn!(
            hub = self.hub_id,
            clients = self.registry.len(),
            "Recovered from fault in hub event loop"
        );
        self.report(HubError::panic("hub event loop", panic));
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Control(Control::Register {
                id,
                entry,
                accepted,
            }) => {
                if accepted.send(()).is_err() {
                    // The caller gave up; its pumps will never start.
                    debug!(hub = self.hub_id, client = %id, "Registration abandoned");
                    self.close_connection(&*entry.conn).await;
                    return;
                }
                let connection = entry.conn.id().clone();
                self.registry.entry(id).or_insert(entry);
                self.stats
                    .clients
                    .store(self.registry.len(), Ordering::Relaxed);
                debug!(
                    hub = self.hub_id,
                    client = %id,
                    connection = %connection,
                    clients = self.registry.len(),
                    "Client registered"
                );
            }
            Event::Control(Control::Unregister { id, accepted }) => {
                let _ = accepted.send(());
                self.remove(id).await;
            }
            Event::Broadcast(message) => self.fan_out(message).await,
            Event::Shutdown => {}
        }
    }

    async fn remove(&mut self, id: ClientId) {
        let Some(ClientEntry { conn, outbound }) = self.registry.remove(&id) else {
            trace!(hub = self.hub_id, client = %id, "Client already unregistered");
            return;
        };
        self.stats
            .clients
            .store(self.registry.len(), Ordering::Relaxed);

        // Closes the client's queue; its write pump sees the end and stops.
        drop(outbound);

        self.close_connection(&*conn).await;

        debug!(
            hub = self.hub_id,
            client = %id,
            connection = %conn.id(),
            clients = self.registry.len(),
            "Client unregistered"
        );
    }

    async fn close_connection(&self, conn: &dyn Connection) {
        match time::timeout(self.config.keepalive.write_wait, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report(HubError::transport("hub close", e)),
            Err(_) => self.report(HubError::transport("hub close", TransportError::Timeout)),
        }
    }

    async fn fan_out(&mut self, message: Arc<Message>) {
        let mut delivered = 0_u64;
        let mut dropped = 0_u64;

        for (id, entry) in &self.registry {
            match self.config.slow_consumer {
                SlowConsumerPolicy::Block => {
                    if entry.outbound.send(Arc::clone(&message)).await.is_ok() {
                        delivered += 1;
                    } else {
                        trace!(client = %id, "Outbound queue closed, client is leaving");
                    }
                }
                SlowConsumerPolicy::DropNewest => {
                    match entry.outbound.try_send(Arc::clone(&message)) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {
                            dropped += 1;
                            warn!(
                                client = %id,
                                message = message.id,
                                "Outbound queue full, dropping message"
                            );
                        }
                        Err(TrySendError::Closed(_)) => {
                            trace!(client = %id, "Outbound queue closed, client is leaving");
                        }
                    }
                }
            }
        }

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.stats.dropped.fetch_add(dropped, Ordering::Relaxed);
        trace!(
            hub = self.hub_id,
            message = message.id,
            bytes = message.len(),
            recipients = delivered,
            "Broadcast fanned out"
        );
    }
}
