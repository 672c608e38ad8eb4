//! SFU Manager - Top-level orchestration for multi-room SFU management
//!
//! This module provides:
//! - Room creation on first join and removal as soon as the last peer leaves
//! - Resource limit enforcement
//! - The peer to room membership index
//! - Ordered teardown of departing peers

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_proto::{Notification, PeerId, PeerSummary, RoomId, RoomListing};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::{Result, SfuError};
use crate::peer::{Outbox, SfuPeer};
use crate::room::SfuRoom;

/// Everything a peer gets back from joining
pub struct JoinedRoom {
    pub room: Arc<SfuRoom>,
    pub peer: Arc<SfuPeer>,
    /// Other peers already in the room, with their producers
    pub peers: Vec<PeerSummary>,
}

/// SFU Manager - manages multiple rooms and provides top-level orchestration
pub struct SfuManager {
    config: Arc<SfuConfig>,
    engine: Arc<dyn MediaEngine>,

    /// Active rooms
    rooms: DashMap<RoomId, Arc<SfuRoom>>,

    /// Which room each joined peer is in
    peer_rooms: DashMap<PeerId, RoomId>,
}

impl SfuManager {
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Self {
        info!(
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            codecs = config.media_codecs.len(),
            "SFU Manager initialized"
        );

        Self {
            config: Arc::new(config),
            engine,
            rooms: DashMap::new(),
            peer_rooms: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Get or create a room
    pub async fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        if let Some(room) = self.rooms.get(room_id) {
            debug!(room_id = %room_id, "Room already exists");
            return Ok(Arc::clone(room.value()));
        }

        // Enforce room limit (0 = unlimited)
        if self.config.max_rooms > 0 && self.rooms.len() >= self.config.max_rooms {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::RoomLimit);
        }

        // The router is created outside the map entry so no shard lock is
        // held across the await. A loser of a creation race closes its router.
        let router = self.engine.create_router(room_id).await?;
        match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => {
                router.close();
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                let room = Arc::new(SfuRoom::new(room_id.clone(), router));
                entry.insert(Arc::clone(&room));
                info!(
                    room_id = %room_id,
                    total_rooms = self.rooms.len(),
                    "Created new room"
                );
                Ok(room)
            }
        }
    }

    pub fn get_room(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        self.rooms
            .get(room_id)
            .map(|room| Arc::clone(room.value()))
            .ok_or_else(|| SfuError::RoomNotFound(room_id.clone()))
    }

    /// The room a peer is currently in
    #[must_use]
    pub fn room_of(&self, peer_id: &PeerId) -> Option<Arc<SfuRoom>> {
        let room_id = self.peer_rooms.get(peer_id)?.value().clone();
        self.rooms.get(&room_id).map(|room| Arc::clone(room.value()))
    }

    /// The room and peer record of a joined peer
    pub fn membership(&self, peer_id: &PeerId) -> Result<(Arc<SfuRoom>, Arc<SfuPeer>)> {
        let room = self
            .room_of(peer_id)
            .ok_or_else(|| SfuError::NotInRoom(peer_id.clone()))?;
        let peer = room
            .peer(peer_id)
            .ok_or_else(|| SfuError::NotInRoom(peer_id.clone()))?;
        Ok((room, peer))
    }

    /// Join `peer_id` to a room, creating the room if needed.
    ///
    /// A peer that is already in a room (the same one or another) leaves it
    /// first, with the usual notifications, so joining is idempotent.
    pub async fn join_room(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        name: String,
        outbox: impl Into<Outbox>,
    ) -> Result<JoinedRoom> {
        if self.peer_rooms.contains_key(peer_id) {
            debug!(peer_id = %peer_id, room_id = %room_id, "Peer rejoining, leaving previous room");
            self.leave_room(peer_id);
        }

        let peer = Arc::new(SfuPeer::new(
            peer_id.clone(),
            name,
            room_id.clone(),
            outbox,
        ));

        // A room that was closed between lookup and insert is gone from the
        // map by the time add_peer sees the flag, so one retry gets a fresh one.
        let mut attempts = 0;
        let room = loop {
            attempts += 1;
            let room = self.get_or_create_room(room_id).await?;
            match room.add_peer(Arc::clone(&peer), self.config.max_peers_per_room) {
                Ok(()) => break room,
                Err(SfuError::RoomClosed(_)) if attempts < 2 => {}
                Err(SfuError::PeerLimit(id)) => {
                    warn!(
                        room_id = %id,
                        max_peers = self.config.max_peers_per_room,
                        "Peer limit reached for room"
                    );
                    return Err(SfuError::PeerLimit(id));
                }
                Err(e) => return Err(e),
            }
        };
        self.peer_rooms.insert(peer_id.clone(), room_id.clone());

        let peers = room.snapshot_excluding(peer_id);
        room.broadcast(
            Some(peer_id),
            &Notification::PeerJoined {
                id: peer.id.clone(),
                name: peer.name.clone(),
            },
        );

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            peer_count = room.peer_count(),
            "Added peer to room"
        );

        Ok(JoinedRoom { room, peer, peers })
    }

    /// Remove a peer from its room, if it is in one.
    ///
    /// Other peers receive one `producer-closed` per departing producer and
    /// then `peer-left`. The room is dropped immediately once empty.
    /// Returns the room the peer was in.
    pub fn leave_room(&self, peer_id: &PeerId) -> Option<RoomId> {
        let (_, room_id) = self.peer_rooms.remove(peer_id)?;
        let Some(room) = self.rooms.get(&room_id).map(|r| Arc::clone(r.value())) else {
            debug!(room_id = %room_id, "Room not found when removing peer");
            return Some(room_id);
        };

        if let Some(peer) = room.peer(peer_id) {
            room.teardown_peer(&peer);
            room.remove_peer(peer_id);
        }

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            peer_count = room.peer_count(),
            "Removed peer from room"
        );

        if self
            .rooms
            .remove_if(&room_id, |_, room| room.close_if_empty())
            .is_some()
        {
            info!(
                room_id = %room_id,
                total_rooms = self.rooms.len(),
                "Removed empty room"
            );
        }

        Some(room_id)
    }

    /// Listing of every active room
    #[must_use]
    pub fn rooms_info(&self) -> Vec<RoomListing> {
        let mut rooms: Vec<RoomListing> =
            self.rooms.iter().map(|room| room.value().listing()).collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rooms
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peer_rooms.len()
    }
}
