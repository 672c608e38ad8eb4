//! Duplicate detection for remote producers
//!
//! Producer notifications can arrive twice, or race a retry of our own, so
//! every consume is checked against the in-flight set and the registry
//! before any signaling happens.

use huddle_proto::{MediaKind, PeerId, ProducerId, TrackType};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::registry::TrackRegistry;
use crate::track::TrackId;

/// Result of [`DuplicateValidator::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Nothing known about this producer; go ahead
    Proceed,
    /// A consume for this producer is already being processed
    InFlight,
    /// The producer already has a track
    AlreadyConsumed(TrackId),
    /// The (peer, kind, track type) slot is taken by another producer's track
    SlotTaken(TrackId),
}

impl Validation {
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        !matches!(self, Self::Proceed)
    }

    #[must_use]
    pub const fn existing_track(&self) -> Option<TrackId> {
        match self {
            Self::AlreadyConsumed(id) | Self::SlotTaken(id) => Some(*id),
            Self::Proceed | Self::InFlight => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DuplicateValidator {
    in_flight: HashSet<ProducerId>,
}

impl DuplicateValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks, in order: in flight, already consumed, slot taken
    #[must_use]
    pub fn validate(
        &self,
        registry: &TrackRegistry,
        producer_id: &ProducerId,
        peer_id: &PeerId,
        kind: MediaKind,
        track_type: TrackType,
    ) -> Validation {
        if self.in_flight.contains(producer_id) {
            debug!(producer_id = %producer_id, "Producer already being processed");
            return Validation::InFlight;
        }
        if let Some(existing) = registry.by_producer(producer_id) {
            debug!(producer_id = %producer_id, track_id = %existing.id, "Producer already has a track");
            return Validation::AlreadyConsumed(existing.id);
        }
        if let Some(existing) = registry.by_slot(peer_id, kind, track_type) {
            warn!(
                producer_id = %producer_id,
                peer_id = %peer_id,
                kind = %kind,
                ?track_type,
                track_id = %existing.id,
                "Track slot already taken"
            );
            return Validation::SlotTaken(existing.id);
        }
        Validation::Proceed
    }

    /// Mark a producer as in flight. Returns false if it already was.
    pub fn begin(&mut self, producer_id: &ProducerId) -> bool {
        self.in_flight.insert(producer_id.clone())
    }

    pub fn finish(&mut self, producer_id: &ProducerId) {
        self.in_flight.remove(producer_id);
    }

    #[must_use]
    pub fn is_in_flight(&self, producer_id: &ProducerId) -> bool {
        self.in_flight.contains(producer_id)
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    /// Repair local state that would poison a fresh consume of `producer_id`:
    /// index entries pointing at missing records, and a record whose
    /// physical track has already ended. Never fails; returns whether
    /// anything was repaired.
    pub fn detect_and_repair_inconsistency(
        &self,
        registry: &mut TrackRegistry,
        producer_id: &ProducerId,
    ) -> bool {
        let mut repaired = registry.drop_dangling_producer(producer_id);
        repaired |= registry.drop_dangling_entries() > 0;

        let ended = registry
            .by_producer(producer_id)
            .filter(|info| !info.is_local() && info.track.is_ended())
            .map(|info| info.id);
        if let Some(id) = ended {
            registry.remove(id);
            repaired = true;
        }

        if repaired {
            warn!(producer_id = %producer_id, "Repaired inconsistent track state");
        }
        repaired
    }
}
