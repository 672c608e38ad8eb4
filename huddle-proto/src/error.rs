use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes carried by [`crate::ServerFrame::Error`]
///
/// The code, not the message, is what clients use to decide retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    RoomNotFound,
    PeerNotFound,
    TransportNotFound,
    ProducerNotFound,
    ConsumerNotFound,
    ShareNotFound,
    NotInRoom,
    ShareAlreadyActive,
    RoomLimit,
    PeerLimit,
    MediaEngine,
    InvalidRequest,
    Internal,
}

impl ErrorCode {
    /// Unknown room/peer/transport/producer/consumer
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RoomNotFound
                | Self::PeerNotFound
                | Self::TransportNotFound
                | Self::ProducerNotFound
                | Self::ConsumerNotFound
                | Self::ShareNotFound
                | Self::NotInRoom
        )
    }

    /// HTTP-like status used by clients that classify by status code
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::RoomNotFound
            | Self::PeerNotFound
            | Self::TransportNotFound
            | Self::ProducerNotFound
            | Self::ConsumerNotFound
            | Self::ShareNotFound => 404,
            Self::NotInRoom => 403,
            Self::ShareAlreadyActive => 409,
            Self::RoomLimit | Self::PeerLimit => 429,
            Self::InvalidRequest => 400,
            Self::MediaEngine => 503,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RoomNotFound => "room-not-found",
            Self::PeerNotFound => "peer-not-found",
            Self::TransportNotFound => "transport-not-found",
            Self::ProducerNotFound => "producer-not-found",
            Self::ConsumerNotFound => "consumer-not-found",
            Self::ShareNotFound => "share-not-found",
            Self::NotInRoom => "not-in-room",
            Self::ShareAlreadyActive => "share-already-active",
            Self::RoomLimit => "room-limit",
            Self::PeerLimit => "peer-limit",
            Self::MediaEngine => "media-engine",
            Self::InvalidRequest => "invalid-request",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error payload returned to the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
