//! Bookkeeping records for transports, producers and consumers
//!
//! These are plain data holders. The engine objects they mirror live behind
//! the room's [`crate::engine::MediaRouter`] and are addressed by id.

use huddle_proto::{
    ConsumerDescriptor, ConsumerId, MediaKind, ProducerId, ProducerSummary, TrackType,
    TransportDirection, TransportId,
};
use serde_json::Value;

/// A directional media pipe owned by one peer
#[derive(Debug, Clone)]
pub struct Transport {
    pub id: TransportId,
    pub direction: TransportDirection,
    /// Set by the first successful connect; a transport connects once
    pub connected: bool,
}

/// A media source contributed by a peer
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub track_type: TrackType,
    pub paused: bool,
}

impl Producer {
    #[must_use]
    pub fn summary(&self) -> ProducerSummary {
        ProducerSummary {
            producer_id: self.id.clone(),
            kind: self.kind,
            track_type: self.track_type,
            paused: self.paused,
        }
    }
}

/// Forwarding of one producer to the peer that owns this record
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub track_type: TrackType,
    pub media_parameters: Value,
    pub paused: bool,
}

impl Consumer {
    #[must_use]
    pub fn descriptor(&self) -> ConsumerDescriptor {
        ConsumerDescriptor {
            consumer_id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.kind,
            track_type: self.track_type,
            media_parameters: self.media_parameters.clone(),
            paused: self.paused,
        }
    }
}
