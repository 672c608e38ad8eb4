use huddle_proto::{ErrorBody, ErrorCode, ProducerId, TransportState};
use std::time::Duration;
use thiserror::Error;

use crate::track::TrackId;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Server rejected request ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Receive transport is unusable (state {0})")]
    TransportUnhealthy(TransportState),

    #[error("Failed to recover producer {producer_id} after {attempts} attempts: {source}")]
    RetryExhausted {
        producer_id: ProducerId,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Operation for producer {0} was cancelled")]
    Cancelled(ProducerId),

    #[error("Operation for producer {producer_id} did not finish in {timeout:?}")]
    OperationTimeout {
        producer_id: ProducerId,
        timeout: Duration,
        /// Last failure seen before the deadline, if any
        #[source]
        last_error: Option<Box<ClientError>>,
    },

    #[error("Session not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Track not found: {0}")]
    TrackNotFound(TrackId),

    #[error("Media already has a track: {0}")]
    DuplicateTrack(TrackId),

    #[error("Unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: String,
    },

    #[error("{0}")]
    Other(String),
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        Self::Remote {
            code: body.code,
            message: body.message,
        }
    }
}

/// How the consume pipeline treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unknown room/peer/transport/producer; surfaced at once, never retried
    NotFound,
    /// The media is already consumed; resolved as a no-op
    Duplicate,
    /// Transient negotiation failure; handed to the recovery manager
    Retryable,
    /// Everything else, including an exhausted retry budget
    Fatal,
}

const DUPLICATE_MARKERS: &[&str] = &[
    "duplicate a=msid",
    "already consumed",
    "consumer already exists",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "transport",
    "websocket",
    "ice",
    "dtls",
    "temporary",
    "busy",
    "unavailable",
    "server error",
];

impl ClientError {
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::Transport(_) => ErrorClass::Retryable,
            Self::Server { status, .. } => classify_status(*status),
            Self::Remote { code, .. } if code.is_not_found() => ErrorClass::NotFound,
            Self::Remote { code, .. } => classify_status(code.status()),
            Self::DuplicateTrack(_) => ErrorClass::Duplicate,
            Self::Other(message) => classify_message(message),
            Self::TransportUnhealthy(_)
            | Self::RetryExhausted { .. }
            | Self::Cancelled(_)
            | Self::OperationTimeout { .. }
            | Self::NotInitialized(_)
            | Self::TrackNotFound(_)
            | Self::UnexpectedResponse { .. } => ErrorClass::Fatal,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Retryable
    }
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        404 => ErrorClass::NotFound,
        408 | 429 | 500..=599 => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

/// Fallback for errors that only carry a message
fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    if DUPLICATE_MARKERS.iter().any(|m| message.contains(m)) {
        ErrorClass::Duplicate
    } else if message.contains("not found") {
        ErrorClass::NotFound
    } else if TRANSIENT_MARKERS.iter().any(|m| message.contains(m)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
