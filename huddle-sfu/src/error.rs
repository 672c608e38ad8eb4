use huddle_proto::{
    ConsumerId, ErrorBody, ErrorCode, PeerId, ProducerId, RoomId, TransportId,
};
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Peer {0} has not joined a room")]
    NotInRoom(PeerId),

    #[error("Screen share already active in room {0}")]
    ShareAlreadyActive(RoomId),

    #[error("No active screen share in room {0}")]
    ShareNotFound(RoomId),

    #[error("Maximum number of rooms reached")]
    RoomLimit,

    #[error("Maximum number of peers reached for room {0}")]
    PeerLimit(RoomId),

    #[error("Room {0} was closed")]
    RoomClosed(RoomId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Media engine error: {0}")]
    Engine(EngineError),
}

/// Unknown ids reported by the engine are the same not-found failures the
/// registry reports; an engine object can vanish while a call is suspended.
impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownTransport(id) => Self::TransportNotFound(id),
            EngineError::UnknownProducer(id) => Self::ProducerNotFound(id),
            EngineError::UnknownConsumer(id) => Self::ConsumerNotFound(id),
            other => Self::Engine(other),
        }
    }
}

impl SfuError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::RoomNotFound(_) => ErrorCode::RoomNotFound,
            Self::PeerNotFound(_) => ErrorCode::PeerNotFound,
            Self::TransportNotFound(_) => ErrorCode::TransportNotFound,
            Self::ProducerNotFound(_) => ErrorCode::ProducerNotFound,
            Self::ConsumerNotFound(_) => ErrorCode::ConsumerNotFound,
            Self::NotInRoom(_) => ErrorCode::NotInRoom,
            Self::ShareAlreadyActive(_) => ErrorCode::ShareAlreadyActive,
            Self::ShareNotFound(_) => ErrorCode::ShareNotFound,
            Self::RoomLimit => ErrorCode::RoomLimit,
            Self::PeerLimit(_) => ErrorCode::PeerLimit,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Engine(_) => ErrorCode::MediaEngine,
            Self::RoomClosed(_) => ErrorCode::Internal,
        }
    }
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
