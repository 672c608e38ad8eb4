//! SFU Room management
//!
//! A room holds its peers and the media router all of their transports live
//! on. Operations that touch more than one peer (consuming another peer's
//! producer, closing a producer that others consume, tearing a peer down)
//! are implemented here so the cross-peer bookkeeping stays in one place.

use chrono::{DateTime, Utc};
use huddle_proto::{
    MediaKind, Notification, PeerId, PeerSummary, ProducerId, RoomId, RoomInfo, RoomListing,
    TrackType, TransportDescriptor, TransportDirection, TransportId,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::MediaRouter;
use crate::error::{Result, SfuError};
use crate::media::{Consumer, Producer, Transport};
use crate::peer::SfuPeer;

struct RoomPeers {
    map: HashMap<PeerId, Arc<SfuPeer>>,
    /// Set once the room has been garbage collected; no peer may join after
    closed: bool,
}

/// Result of a consume request
#[derive(Debug, Clone)]
pub enum ConsumeOutcome {
    Created(Consumer),
    /// The peer already had a consumer for this producer
    Existing(Consumer),
}

impl ConsumeOutcome {
    #[must_use]
    pub const fn consumer(&self) -> &Consumer {
        match self {
            Self::Created(consumer) | Self::Existing(consumer) => consumer,
        }
    }
}

pub struct SfuRoom {
    pub id: RoomId,
    pub router: Arc<dyn MediaRouter>,
    pub created_at: DateTime<Utc>,
    peers: RwLock<RoomPeers>,
}

impl SfuRoom {
    pub fn new(id: RoomId, router: Arc<dyn MediaRouter>) -> Self {
        Self {
            id,
            router,
            created_at: Utc::now(),
            peers: RwLock::new(RoomPeers {
                map: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Add a peer. `max_peers` of 0 means unlimited.
    pub fn add_peer(&self, peer: Arc<SfuPeer>, max_peers: usize) -> Result<()> {
        let mut peers = self.peers.write();
        if peers.closed {
            return Err(SfuError::RoomClosed(self.id.clone()));
        }
        if max_peers > 0 && peers.map.len() >= max_peers {
            return Err(SfuError::PeerLimit(self.id.clone()));
        }
        peers.map.insert(peer.id.clone(), peer);
        Ok(())
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<Arc<SfuPeer>> {
        self.peers.write().map.remove(peer_id)
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<SfuPeer>> {
        self.peers.read().map.get(peer_id).cloned()
    }

    pub fn require_peer(&self, peer_id: &PeerId) -> Result<Arc<SfuPeer>> {
        self.peer(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<SfuPeer>> {
        self.peers.read().map.values().cloned().collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().map.is_empty()
    }

    /// Close the room if it has no peers left. Returns true if it was closed.
    ///
    /// Called under the manager's map entry so that a concurrent join either
    /// lands before this check or observes the closed flag and retries.
    pub fn close_if_empty(&self) -> bool {
        let mut peers = self.peers.write();
        if !peers.map.is_empty() {
            return false;
        }
        if !peers.closed {
            peers.closed = true;
            self.router.close();
            debug!(room_id = %self.id, "Room closed");
        }
        true
    }

    /// Send a notification to every peer except `except`.
    /// Returns the number of peers it was queued for.
    pub fn broadcast(&self, except: Option<&PeerId>, notification: &Notification) -> usize {
        self.peers()
            .iter()
            .filter(|peer| except != Some(&peer.id))
            .filter(|peer| peer.notify(notification.clone()))
            .count()
    }

    /// Find a producer anywhere in the room, with its owner
    #[must_use]
    pub fn find_producer(&self, producer_id: &ProducerId) -> Option<(Arc<SfuPeer>, Producer)> {
        self.peers
            .read()
            .map
            .values()
            .find_map(|peer| peer.producer(producer_id).map(|p| (Arc::clone(peer), p)))
    }

    /// Every peer other than `peer_id`, with their producers
    #[must_use]
    pub fn snapshot_excluding(&self, peer_id: &PeerId) -> Vec<PeerSummary> {
        self.peers
            .read()
            .map
            .values()
            .filter(|peer| &peer.id != peer_id)
            .map(|peer| peer.summary())
            .collect()
    }

    #[must_use]
    pub fn info(&self) -> RoomInfo {
        let peers = self.peers.read();
        RoomInfo {
            room_id: self.id.clone(),
            peers_count: peers.map.len(),
            peers: peers.map.values().map(|peer| peer.detail()).collect(),
        }
    }

    #[must_use]
    pub fn listing(&self) -> RoomListing {
        RoomListing {
            id: self.id.clone(),
            peers_count: self.peer_count(),
            created_at: self.created_at,
        }
    }

    pub async fn create_transport(
        &self,
        peer: &SfuPeer,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor> {
        let descriptor = self.router.create_transport(direction).await?;
        peer.add_transport(Transport {
            id: descriptor.id.clone(),
            direction,
            connected: false,
        });
        debug!(
            room_id = %self.id,
            peer_id = %peer.id,
            transport_id = %descriptor.id,
            ?direction,
            "Transport created"
        );
        Ok(descriptor)
    }

    pub async fn connect_transport(
        &self,
        peer: &SfuPeer,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<()> {
        let transport = peer
            .transport(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        if transport.connected {
            return Err(SfuError::InvalidRequest(format!(
                "transport {transport_id} is already connected"
            )));
        }
        self.router
            .connect_transport(transport_id, dtls_parameters)
            .await?;
        peer.mark_transport_connected(transport_id);
        Ok(())
    }

    /// Create a producer on one of the peer's send transports.
    /// Announcing it is left to the caller.
    pub async fn produce(
        &self,
        peer: &SfuPeer,
        transport_id: &TransportId,
        kind: MediaKind,
        track_type: TrackType,
        media_parameters: Value,
    ) -> Result<Producer> {
        let transport = peer
            .transport(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        if transport.direction != TransportDirection::Send {
            return Err(SfuError::InvalidRequest(format!(
                "transport {transport_id} is not a send transport"
            )));
        }

        let producer_id = self
            .router
            .produce(transport_id, kind, media_parameters)
            .await?;
        let producer = Producer {
            id: producer_id,
            kind,
            track_type,
            paused: false,
        };
        peer.add_producer(producer.clone());

        info!(
            room_id = %self.id,
            peer_id = %peer.id,
            producer_id = %producer.id,
            kind = %kind,
            ?track_type,
            "Producer created"
        );
        Ok(producer)
    }

    /// Create a consumer of `producer_id` for `peer`.
    ///
    /// At most one consumer per (producer, peer) pair exists at any time: if
    /// one is already registered it is returned instead, and a consumer that
    /// loses a creation race is closed before returning the winner.
    pub async fn consume(
        &self,
        peer: &Arc<SfuPeer>,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: Value,
    ) -> Result<ConsumeOutcome> {
        let transport = peer
            .transport(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        if transport.direction != TransportDirection::Recv {
            return Err(SfuError::InvalidRequest(format!(
                "transport {transport_id} is not a receive transport"
            )));
        }

        let (owner, producer) = self
            .find_producer(producer_id)
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.clone()))?;
        if owner.id == peer.id {
            return Err(SfuError::InvalidRequest(
                "cannot consume own producer".to_string(),
            ));
        }

        if let Some(existing) = peer.consumer_for(producer_id) {
            debug!(
                room_id = %self.id,
                peer_id = %peer.id,
                producer_id = %producer_id,
                consumer_id = %existing.id,
                "Consumer already exists, reusing"
            );
            return Ok(ConsumeOutcome::Existing(existing));
        }

        let params = self
            .router
            .consume(transport_id, producer_id, capabilities)
            .await?;

        // The producer or the consuming peer may have gone away while the
        // engine call was suspended.
        if self.find_producer(producer_id).is_none() {
            self.router.close_consumer(&params.id);
            return Err(SfuError::ProducerNotFound(producer_id.clone()));
        }
        if !self
            .peer(&peer.id)
            .is_some_and(|current| Arc::ptr_eq(&current, peer))
        {
            self.router.close_consumer(&params.id);
            return Err(SfuError::PeerNotFound(peer.id.clone()));
        }

        let consumer = Consumer {
            id: params.id,
            producer_id: producer_id.clone(),
            transport_id: transport_id.clone(),
            kind: params.kind,
            track_type: producer.track_type,
            media_parameters: params.media_parameters,
            paused: true,
        };

        match peer.insert_consumer_if_absent(consumer.clone()) {
            Ok(()) => {
                info!(
                    room_id = %self.id,
                    peer_id = %peer.id,
                    producer_id = %producer_id,
                    consumer_id = %consumer.id,
                    "Consumer created"
                );
                Ok(ConsumeOutcome::Created(consumer))
            }
            Err(existing) => {
                self.router.close_consumer(&consumer.id);
                debug!(
                    room_id = %self.id,
                    peer_id = %peer.id,
                    producer_id = %producer_id,
                    "Concurrent consume lost the race, closed duplicate consumer"
                );
                Ok(ConsumeOutcome::Existing(existing))
            }
        }
    }

    pub async fn set_producer_paused(
        &self,
        owner: &SfuPeer,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<()> {
        if owner.producer(producer_id).is_none() {
            return Err(SfuError::ProducerNotFound(producer_id.clone()));
        }
        self.router.set_producer_paused(producer_id, paused).await?;
        owner.set_producer_paused(producer_id, paused);

        let notification = if paused {
            Notification::ProducerPaused {
                producer_id: producer_id.clone(),
                peer_id: owner.id.clone(),
            }
        } else {
            Notification::ProducerResumed {
                producer_id: producer_id.clone(),
                peer_id: owner.id.clone(),
            }
        };
        self.broadcast(Some(&owner.id), &notification);
        Ok(())
    }

    /// Close a producer owned by `owner`.
    ///
    /// Every consumer bound to it is closed on every other peer, then the
    /// other peers are told the producer is gone.
    pub fn close_producer(&self, owner: &SfuPeer, producer_id: &ProducerId) -> Result<Producer> {
        let producer = owner
            .remove_producer(producer_id)
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.clone()))?;
        self.router.close_producer(producer_id);

        let notification = Notification::ProducerClosed {
            producer_id: producer_id.clone(),
            peer_id: owner.id.clone(),
        };
        for peer in self.peers().iter().filter(|peer| peer.id != owner.id) {
            let closed = peer.remove_consumers_of(producer_id);
            if !closed.is_empty() {
                debug!(
                    room_id = %self.id,
                    peer_id = %peer.id,
                    producer_id = %producer_id,
                    consumers = closed.len(),
                    "Closed consumers of closed producer"
                );
            }
            peer.notify(notification.clone());
        }

        info!(
            room_id = %self.id,
            peer_id = %owner.id,
            producer_id = %producer_id,
            "Producer closed"
        );
        Ok(producer)
    }

    /// Release everything a departing peer owns.
    ///
    /// Notifications go out before any state is discarded: first one
    /// `producer-closed` per producer, then `peer-left`. The peer itself is
    /// still a member when this returns; removing it is up to the caller.
    pub fn teardown_peer(&self, peer: &SfuPeer) {
        for producer_id in peer.producer_ids() {
            // Only fails if the producer vanished concurrently
            let _ = self.close_producer(peer, &producer_id);
        }

        self.broadcast(
            Some(&peer.id),
            &Notification::PeerLeft {
                id: peer.id.clone(),
            },
        );

        let resources = peer.take_resources();
        for consumer in &resources.consumers {
            self.router.close_consumer(&consumer.id);
        }
        for producer in &resources.producers {
            self.router.close_producer(&producer.id);
        }
        for transport in &resources.transports {
            self.router.close_transport(&transport.id);
        }

        debug!(
            room_id = %self.id,
            peer_id = %peer.id,
            transports = resources.transports.len(),
            consumers = resources.consumers.len(),
            "Peer resources released"
        );
    }
}
