//! SFU Peer management
//!
//! A peer is one signaling connection inside one room. It exclusively owns
//! its transports, producers and consumers; other peers only affect them
//! through room-level close operations.

use chrono::{DateTime, Utc};
use huddle_proto::{
    ConsumerId, Notification, PeerDetail, PeerId, PeerSummary, ProducerId, RoomId,
    ServerFrame, TransportId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::media::{Consumer, Producer, Transport};

/// Frame queue of one connection.
///
/// A notification that does not fit evicts the connection: its client can
/// no longer reconcile its view of the room and has to join again.
#[derive(Debug, Clone)]
pub struct Outbox {
    frames: mpsc::Sender<ServerFrame>,
    evicted: CancellationToken,
}

impl Outbox {
    #[must_use]
    pub fn new(frames: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            frames,
            evicted: CancellationToken::new(),
        }
    }

    pub fn evict(&self) {
        self.evicted.cancel();
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Resolves once the connection has been evicted
    pub async fn evicted(&self) {
        self.evicted.cancelled().await;
    }
}

impl From<mpsc::Sender<ServerFrame>> for Outbox {
    fn from(frames: mpsc::Sender<ServerFrame>) -> Self {
        Self::new(frames)
    }
}

/// SFU Peer - represents a joined participant
pub struct SfuPeer {
    /// Peer ID (the connection id)
    pub id: PeerId,

    /// Display name
    pub name: String,

    /// Room this peer belongs to
    pub room_id: RoomId,

    pub joined_at: DateTime<Utc>,

    transports: RwLock<HashMap<TransportId, Transport>>,
    producers: RwLock<HashMap<ProducerId, Producer>>,
    consumers: RwLock<HashMap<ConsumerId, Consumer>>,

    /// Outbound frames for this peer's connection.
    /// Shared with the connection's response path.
    outbox: Outbox,

    stats: RwLock<PeerStats>,
}

/// Owned resources of a peer, taken out at teardown
pub struct PeerResources {
    pub transports: Vec<Transport>,
    pub producers: Vec<Producer>,
    pub consumers: Vec<Consumer>,
}

impl SfuPeer {
    #[must_use]
    pub fn new(
        id: PeerId,
        name: String,
        room_id: RoomId,
        outbox: impl Into<Outbox>,
    ) -> Self {
        Self {
            id,
            name,
            room_id,
            joined_at: Utc::now(),
            transports: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            outbox: outbox.into(),
            stats: RwLock::new(PeerStats::default()),
        }
    }

    /// Queue a notification for this peer.
    /// Returns false if the queue is closed, or full; a full queue evicts
    /// the connection.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.outbox.frames.try_send(ServerFrame::notification(notification)) {
            Ok(()) => {
                self.stats.write().notifications_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.stats.write().notifications_dropped += 1;
                if !self.outbox.is_evicted() {
                    warn!(peer_id = %self.id, ?frame, "Notification queue full, evicting connection");
                    self.outbox.evict();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    // Transports

    pub fn add_transport(&self, transport: Transport) {
        self.transports.write().insert(transport.id.clone(), transport);
    }

    #[must_use]
    pub fn transport(&self, transport_id: &TransportId) -> Option<Transport> {
        self.transports.read().get(transport_id).cloned()
    }

    pub fn mark_transport_connected(&self, transport_id: &TransportId) -> bool {
        self.transports
            .write()
            .get_mut(transport_id)
            .map(|t| t.connected = true)
            .is_some()
    }

    // Producers

    pub fn add_producer(&self, producer: Producer) {
        self.producers.write().insert(producer.id.clone(), producer);
    }

    #[must_use]
    pub fn producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.producers.read().get(producer_id).cloned()
    }

    #[must_use]
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.producers.read().keys().cloned().collect()
    }

    pub fn remove_producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.producers.write().remove(producer_id)
    }

    pub fn set_producer_paused(&self, producer_id: &ProducerId, paused: bool) -> bool {
        self.producers
            .write()
            .get_mut(producer_id)
            .map(|p| p.paused = paused)
            .is_some()
    }

    // Consumers

    /// Consumer currently bound to `producer_id`, if any
    #[must_use]
    pub fn consumer_for(&self, producer_id: &ProducerId) -> Option<Consumer> {
        self.consumers
            .read()
            .values()
            .find(|c| &c.producer_id == producer_id)
            .cloned()
    }

    /// Insert unless a consumer for the same producer already exists.
    /// On conflict the existing record is returned and nothing is inserted.
    pub fn insert_consumer_if_absent(&self, consumer: Consumer) -> Result<(), Consumer> {
        let mut consumers = self.consumers.write();
        if let Some(existing) = consumers
            .values()
            .find(|c| c.producer_id == consumer.producer_id)
        {
            return Err(existing.clone());
        }
        consumers.insert(consumer.id.clone(), consumer);
        Ok(())
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Consumer> {
        self.consumers.read().get(consumer_id).cloned()
    }

    pub fn set_consumer_paused(&self, consumer_id: &ConsumerId, paused: bool) -> bool {
        self.consumers
            .write()
            .get_mut(consumer_id)
            .map(|c| c.paused = paused)
            .is_some()
    }

    /// Remove every consumer bound to `producer_id`
    pub fn remove_consumers_of(&self, producer_id: &ProducerId) -> Vec<Consumer> {
        let mut consumers = self.consumers.write();
        let ids: Vec<ConsumerId> = consumers
            .values()
            .filter(|c| &c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();
        ids.iter().filter_map(|id| consumers.remove(id)).collect()
    }

    /// Take every owned resource out of the peer
    pub fn take_resources(&self) -> PeerResources {
        PeerResources {
            consumers: self.consumers.write().drain().map(|(_, c)| c).collect(),
            producers: self.producers.write().drain().map(|(_, p)| p).collect(),
            transports: self.transports.write().drain().map(|(_, t)| t).collect(),
        }
    }

    // Snapshots

    #[must_use]
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            producers: self.producers.read().values().map(Producer::summary).collect(),
        }
    }

    #[must_use]
    pub fn detail(&self) -> PeerDetail {
        let producers = self.producers.read();
        PeerDetail {
            id: self.id.clone(),
            name: self.name.clone(),
            producers_count: producers.len(),
            consumers_count: self.consumers.read().len(),
            transports_count: self.transports.read().len(),
            producers: producers.values().map(Producer::summary).collect(),
        }
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    #[must_use]
    pub fn get_stats(&self) -> PeerStats {
        self.stats.read().clone()
    }
}

impl Drop for SfuPeer {
    fn drop(&mut self) {
        let stats = self.stats.read();
        debug!(
            peer_id = %self.id,
            room_id = %self.room_id,
            notifications_sent = stats.notifications_sent,
            notifications_dropped = stats.notifications_dropped,
            joined_secs = (Utc::now() - self.joined_at).num_seconds(),
            "SfuPeer dropped"
        );
    }
}

/// Peer statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeerStats {
    /// Notifications queued to this peer
    pub notifications_sent: u64,

    /// Notifications dropped because the queue was full
    pub notifications_dropped: u64,
}
