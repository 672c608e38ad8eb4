//! Huddle client media layer
//!
//! Turns room notifications into at most one receiving track per remote
//! producer, and publishes local tracks.
//!
//! - **`MediaSession`**: joins a room, publishes local tracks, consumes remote ones
//! - **`TrackRegistry`**: track records with producer, consumer and slot indices
//! - **`DuplicateValidator`**: rejects consumes of media that is already handled
//! - **`RecoveryManager`**: bounded, cancellable retry of failed consumes
//! - **`SignalingClient`** / **`ChannelSignaling`**: correlated request/response signaling
//! - **`MediaDevice`**: the local WebRTC stack, kept behind traits

pub mod config;
pub mod error;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod track;
pub mod transport;
pub mod validator;

#[cfg(test)]
mod testing;

pub use config::{RecoveryConfig, SessionConfig};
pub use error::{ClientError, ErrorClass, Result};
pub use recovery::{RecoveryManager, RecoveryTarget};
pub use registry::{DuplicateTrack, TrackRegistry};
pub use session::{ConsumeOutcome, MediaSession, RemoteProducer, LOCAL_PEER};
pub use signaling::{ChannelSignaling, SignalingClient};
pub use track::{MediaTrack, TrackId, TrackInfo, TrackOrigin, TrackSlot};
pub use transport::{MediaDevice, ReceiveTransport, SendTransport};
pub use validator::{DuplicateValidator, Validation};
