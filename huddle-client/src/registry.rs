//! Track registry
//!
//! One arena of [`TrackInfo`] records keyed by [`TrackId`], plus secondary
//! indices by producer id, consumer id and [`TrackSlot`]. Every mutation goes
//! through a `&mut self` method that updates the arena and all indices
//! together, so callers never observe a half-applied change.

use huddle_proto::{ConsumerId, MediaKind, PeerId, ProducerId, TrackType};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::track::{MediaTrack, TrackId, TrackInfo, TrackOrigin, TrackSlot};

/// Insert rejected because an index already points at `0`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("track already registered as {0}")]
pub struct DuplicateTrack(pub TrackId);

#[derive(Default)]
pub struct TrackRegistry {
    next_id: u64,
    tracks: HashMap<TrackId, TrackInfo>,
    by_producer: HashMap<ProducerId, TrackId>,
    by_consumer: HashMap<ConsumerId, TrackId>,
    by_slot: HashMap<TrackSlot, TrackId>,
}

impl TrackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locally captured track sent through `producer_id`
    pub fn add_local(
        &mut self,
        peer_id: PeerId,
        track_type: TrackType,
        producer_id: ProducerId,
        track: Arc<dyn MediaTrack>,
    ) -> Result<TrackId, DuplicateTrack> {
        self.insert(
            peer_id,
            track_type,
            TrackOrigin::Local { producer_id },
            track,
        )
    }

    /// Register the receiving end of `consumer_id`
    pub fn add_remote(
        &mut self,
        peer_id: PeerId,
        track_type: TrackType,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        track: Arc<dyn MediaTrack>,
    ) -> Result<TrackId, DuplicateTrack> {
        self.insert(
            peer_id,
            track_type,
            TrackOrigin::Remote {
                consumer_id,
                producer_id,
            },
            track,
        )
    }

    fn insert(
        &mut self,
        peer_id: PeerId,
        track_type: TrackType,
        origin: TrackOrigin,
        track: Arc<dyn MediaTrack>,
    ) -> Result<TrackId, DuplicateTrack> {
        let kind = track.kind();
        let slot = TrackSlot {
            peer_id: peer_id.clone(),
            kind,
            track_type,
        };
        let producer_id = match &origin {
            TrackOrigin::Local { producer_id } | TrackOrigin::Remote { producer_id, .. } => {
                producer_id.clone()
            }
        };

        if let Some(existing) = self.by_producer.get(&producer_id) {
            return Err(DuplicateTrack(*existing));
        }
        if let TrackOrigin::Remote { consumer_id, .. } = &origin {
            if let Some(existing) = self.by_consumer.get(consumer_id) {
                return Err(DuplicateTrack(*existing));
            }
        }
        if let Some(existing) = self.by_slot.get(&slot) {
            return Err(DuplicateTrack(*existing));
        }

        self.next_id += 1;
        let id = TrackId::new(self.next_id);

        self.by_producer.insert(producer_id, id);
        if let TrackOrigin::Remote { consumer_id, .. } = &origin {
            self.by_consumer.insert(consumer_id.clone(), id);
        }
        self.by_slot.insert(slot, id);
        self.tracks.insert(
            id,
            TrackInfo {
                id,
                peer_id,
                kind,
                track_type,
                origin,
                track,
            },
        );
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: TrackId) -> Option<&TrackInfo> {
        self.tracks.get(&id)
    }

    #[must_use]
    pub fn by_producer(&self, producer_id: &ProducerId) -> Option<&TrackInfo> {
        self.by_producer
            .get(producer_id)
            .and_then(|id| self.tracks.get(id))
    }

    #[must_use]
    pub fn by_consumer(&self, consumer_id: &ConsumerId) -> Option<&TrackInfo> {
        self.by_consumer
            .get(consumer_id)
            .and_then(|id| self.tracks.get(id))
    }

    #[must_use]
    pub fn by_slot(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        track_type: TrackType,
    ) -> Option<&TrackInfo> {
        let slot = TrackSlot {
            peer_id: peer_id.clone(),
            kind,
            track_type,
        };
        self.by_slot.get(&slot).and_then(|id| self.tracks.get(id))
    }

    /// Remove a record and every index entry pointing at it
    pub fn remove(&mut self, id: TrackId) -> Option<TrackInfo> {
        let info = self.tracks.remove(&id)?;
        self.by_producer.remove(info.producer_id());
        if let Some(consumer_id) = info.consumer_id() {
            self.by_consumer.remove(consumer_id);
        }
        self.by_slot.remove(&info.slot());
        Some(info)
    }

    pub fn remove_by_producer(&mut self, producer_id: &ProducerId) -> Option<TrackInfo> {
        let id = *self.by_producer.get(producer_id)?;
        self.remove(id)
    }

    /// Remove every remote track received from `peer_id`
    pub fn remove_by_peer(&mut self, peer_id: &PeerId) -> Vec<TrackInfo> {
        self.remove_matching(|info| &info.peer_id == peer_id && !info.is_local())
    }

    /// Remove every track of `peer_id` with the given type
    pub fn remove_by_type(&mut self, peer_id: &PeerId, track_type: TrackType) -> Vec<TrackInfo> {
        self.remove_matching(|info| &info.peer_id == peer_id && info.track_type == track_type)
    }

    fn remove_matching(&mut self, predicate: impl Fn(&TrackInfo) -> bool) -> Vec<TrackInfo> {
        let ids: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|info| predicate(info))
            .map(|info| info.id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Swap the physical track of a record, keeping its id and indices.
    /// The new track inherits the enabled state. Returns the old track.
    pub fn replace(
        &mut self,
        id: TrackId,
        track: Arc<dyn MediaTrack>,
    ) -> Option<Arc<dyn MediaTrack>> {
        let info = self.tracks.get_mut(&id)?;
        track.set_enabled(info.track.is_enabled());
        Some(std::mem::replace(&mut info.track, track))
    }

    pub fn set_enabled(&mut self, id: TrackId, enabled: bool) -> Option<&TrackInfo> {
        let info = self.tracks.get(&id)?;
        info.track.set_enabled(enabled);
        Some(info)
    }

    /// Drop the producer index entry if it points at a missing record.
    /// Returns true if an entry was dropped.
    pub fn drop_dangling_producer(&mut self, producer_id: &ProducerId) -> bool {
        let dangling = self
            .by_producer
            .get(producer_id)
            .is_some_and(|id| !self.tracks.contains_key(id));
        if dangling {
            self.by_producer.remove(producer_id);
            debug!(producer_id = %producer_id, "Dropped dangling producer index entry");
        }
        dangling
    }

    /// Drop consumer and slot index entries that point at missing records.
    /// Returns the number of entries dropped.
    pub fn drop_dangling_entries(&mut self) -> usize {
        let tracks = &self.tracks;
        let before = self.by_consumer.len() + self.by_slot.len();
        self.by_consumer.retain(|_, id| tracks.contains_key(id));
        self.by_slot.retain(|_, id| tracks.contains_key(id));
        before - (self.by_consumer.len() + self.by_slot.len())
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackInfo> {
        self.tracks.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Remove everything, returning the records
    pub fn clear(&mut self) -> Vec<TrackInfo> {
        self.by_producer.clear();
        self.by_consumer.clear();
        self.by_slot.clear();
        self.tracks.drain().map(|(_, info)| info).collect()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_producer_index(&mut self, producer_id: ProducerId) {
        self.by_producer.insert(producer_id, TrackId::new(u64::MAX));
    }
}
