//! Track records

use huddle_proto::{ConsumerId, MediaKind, PeerId, ProducerId, TrackType};
use std::fmt;
use std::sync::Arc;

/// Synthetic id of a registered track, unique within one registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

impl TrackId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

/// A physical media track (camera, microphone, screen capture, or the
/// receiving end of a consumer)
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn kind(&self) -> MediaKind;

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    fn stop(&self);

    fn is_ended(&self) -> bool;
}

/// Where a track's media comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOrigin {
    /// Captured here and sent through `producer_id`
    Local { producer_id: ProducerId },
    /// Received through `consumer_id`, which forwards `producer_id`
    Remote {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
}

/// Duplicate-check key: one track per (peer, kind, track type)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackSlot {
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub track_type: TrackType,
}

#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: TrackId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub track_type: TrackType,
    pub origin: TrackOrigin,
    pub track: Arc<dyn MediaTrack>,
}

impl TrackInfo {
    #[must_use]
    pub const fn producer_id(&self) -> &ProducerId {
        match &self.origin {
            TrackOrigin::Local { producer_id } | TrackOrigin::Remote { producer_id, .. } => {
                producer_id
            }
        }
    }

    #[must_use]
    pub const fn consumer_id(&self) -> Option<&ConsumerId> {
        match &self.origin {
            TrackOrigin::Remote { consumer_id, .. } => Some(consumer_id),
            TrackOrigin::Local { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.origin, TrackOrigin::Local { .. })
    }

    #[must_use]
    pub fn slot(&self) -> TrackSlot {
        TrackSlot {
            peer_id: self.peer_id.clone(),
            kind: self.kind,
            track_type: self.track_type,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.track.is_enabled()
    }
}
