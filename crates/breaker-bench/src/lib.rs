//! Shared setup for the Breaker benchmarks.

use breaker_core::memory::{self, MemoryPeer};
use breaker_core::{Client, Hub, HubConfig, HubError};
use bytes::Bytes;

/// A hub with in-memory clients attached.
pub struct Fixture {
    /// The hub under test.
    pub hub: Hub,
    /// Remote ends, one per client.
    pub peers: Vec<MemoryPeer>,
    /// Keeps the registrations alive.
    pub clients: Vec<Client>,
}

impl Fixture {
    /// Start a hub and register `clients` in-memory connections.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub rejects the configuration or a
    /// registration.
    pub async fn new(config: HubConfig, clients: usize) -> Result<Self, HubError> {
        let hub = Hub::new(config)?;
        let mut fixture = Self {
            hub,
            peers: Vec::with_capacity(clients),
            clients: Vec::with_capacity(clients),
        };

        for _ in 0..clients {
            let (conn, peer) = memory::pair();
            fixture.clients.push(fixture.hub.register(conn).await?);
            fixture.peers.push(peer);
        }
        Ok(fixture)
    }

    /// Broadcast one payload and wait until every peer has it.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub refuses the broadcast.
    pub async fn round_trip(&mut self, payload: Bytes) -> Result<usize, HubError> {
        self.hub.broadcast(payload).await?;

        let mut received = 0;
        for peer in &mut self.peers {
            if peer.recv_data().await.is_some() {
                received += 1;
            }
        }
        Ok(received)
    }
}
