//! Screen-share sessions
//!
//! A share is an ordinary producer with [`TrackType::Screen`], plus a
//! per-room session record. At most one session exists per room. The slot is
//! reserved through the map entry before the producer is created, so two
//! concurrent `start-share` requests can never both reach the engine.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_proto::{
    MediaKind, Notification, PeerId, ProducerId, RoomId, ShareStatus, TrackType, TransportId,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SfuError};
use crate::peer::SfuPeer;
use crate::room::{ConsumeOutcome, SfuRoom};

#[derive(Debug, Clone)]
pub struct ScreenShareSession {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    /// `None` while the producer is being created
    pub producer_id: Option<ProducerId>,
    pub started_at: DateTime<Utc>,
}

impl ScreenShareSession {
    fn status(&self) -> ShareStatus {
        ShareStatus {
            active: self.producer_id.is_some(),
            producer_id: self.producer_id.clone(),
            peer_id: self.producer_id.as_ref().map(|_| self.peer_id.clone()),
        }
    }
}

#[derive(Default)]
pub struct ScreenShareManager {
    sessions: DashMap<RoomId, ScreenShareSession>,
}

impl ScreenShareManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a share for `peer` in `room`.
    ///
    /// Fails with [`SfuError::ShareAlreadyActive`] if any share (active or
    /// still starting) exists in the room; the existing session is untouched.
    pub async fn start_share(
        &self,
        room: &SfuRoom,
        peer: &SfuPeer,
        transport_id: &TransportId,
        media_parameters: Value,
    ) -> Result<ProducerId> {
        match self.sessions.entry(room.id.clone()) {
            Entry::Occupied(_) => {
                debug!(room_id = %room.id, peer_id = %peer.id, "Share already active");
                return Err(SfuError::ShareAlreadyActive(room.id.clone()));
            }
            Entry::Vacant(entry) => {
                entry.insert(ScreenShareSession {
                    room_id: room.id.clone(),
                    peer_id: peer.id.clone(),
                    producer_id: None,
                    started_at: Utc::now(),
                });
            }
        }

        let producer = match room
            .produce(
                peer,
                transport_id,
                MediaKind::Video,
                TrackType::Screen,
                media_parameters,
            )
            .await
        {
            Ok(producer) => producer,
            Err(e) => {
                self.release_reservation(&room.id, &peer.id);
                return Err(e);
            }
        };

        let activated = self
            .sessions
            .get_mut(&room.id)
            .filter(|session| session.peer_id == peer.id && session.producer_id.is_none())
            .map(|mut session| session.producer_id = Some(producer.id.clone()))
            .is_some();
        if !activated {
            // The sharer left while the producer was being created
            let _ = room.close_producer(peer, &producer.id);
            return Err(SfuError::ShareNotFound(room.id.clone()));
        }

        room.broadcast(
            Some(&peer.id),
            &Notification::ShareStarted {
                peer_id: peer.id.clone(),
                producer_id: producer.id.clone(),
            },
        );
        info!(
            room_id = %room.id,
            peer_id = %peer.id,
            producer_id = %producer.id,
            "Screen share started"
        );
        Ok(producer.id)
    }

    /// Stop the share owned by `peer`, closing its producer and every
    /// consumer bound to it.
    pub fn stop_share(
        &self,
        room: &SfuRoom,
        peer: &SfuPeer,
        producer_id: &ProducerId,
    ) -> Result<()> {
        let owned = |session: &ScreenShareSession| {
            session.peer_id == peer.id && session.producer_id.as_ref() == Some(producer_id)
        };
        let Some((_, session)) = self.sessions.remove_if(&room.id, |_, s| owned(s)) else {
            return Err(SfuError::ShareNotFound(room.id.clone()));
        };

        self.finish(room, peer, &session, producer_id);
        Ok(())
    }

    /// Consume the active share of the room.
    pub async fn consume_share(
        &self,
        room: &SfuRoom,
        peer: &Arc<SfuPeer>,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: Value,
    ) -> Result<ConsumeOutcome> {
        if self.active_producer(&room.id).as_ref() != Some(producer_id) {
            return Err(SfuError::ShareNotFound(room.id.clone()));
        }

        room.consume(peer, transport_id, producer_id, capabilities)
            .await
    }

    #[must_use]
    pub fn status(&self, room_id: &RoomId) -> ShareStatus {
        self.sessions
            .get(room_id)
            .map(|session| session.status())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn active_producer(&self, room_id: &RoomId) -> Option<ProducerId> {
        self.sessions
            .get(room_id)
            .and_then(|session| session.producer_id.clone())
    }

    /// True if `producer_id` is the active share of the room
    #[must_use]
    pub fn is_share_producer(&self, room_id: &RoomId, producer_id: &ProducerId) -> bool {
        self.active_producer(room_id).as_ref() == Some(producer_id)
    }

    /// Called before a peer is torn down. Stops the peer's share if it
    /// owns one; consumers the peer held are closed by the room teardown.
    pub fn on_peer_leaving(&self, room: &SfuRoom, peer: &SfuPeer) {
        if let Some((_, session)) = self
            .sessions
            .remove_if(&room.id, |_, s| s.peer_id == peer.id)
        {
            match session.producer_id.clone() {
                Some(producer_id) => self.finish(room, peer, &session, &producer_id),
                None => debug!(room_id = %room.id, peer_id = %peer.id, "Share reservation dropped"),
            }
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn release_reservation(&self, room_id: &RoomId, peer_id: &PeerId) {
        self.sessions
            .remove_if(room_id, |_, s| &s.peer_id == peer_id && s.producer_id.is_none());
    }

    fn finish(
        &self,
        room: &SfuRoom,
        peer: &SfuPeer,
        session: &ScreenShareSession,
        producer_id: &ProducerId,
    ) {
        room.broadcast(
            Some(&peer.id),
            &Notification::ShareStopped {
                peer_id: peer.id.clone(),
                producer_id: producer_id.clone(),
            },
        );
        // Already gone if the owner closed it through close-producer
        let _ = room.close_producer(peer, producer_id);

        info!(
            room_id = %room.id,
            peer_id = %peer.id,
            producer_id = %producer_id,
            duration_secs = (Utc::now() - session.started_at).num_seconds(),
            "Screen share stopped"
        );
    }
}
