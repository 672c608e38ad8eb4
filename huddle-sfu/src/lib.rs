//! Huddle SFU (Selective Forwarding Unit) signaling core
//!
//! Every participant sends its media once to the server, which forwards it
//! to every other participant in the room. This crate holds the registry
//! that makes that work: rooms, peers, and each peer's transports, producers
//! and consumers, plus the signaling handlers that mutate it.
//!
//! ## Architecture
//!
//! - **`SignalingService`** / **`Connection`**: request handling, one connection per socket
//! - **`SfuManager`**: rooms by id, created on first join and dropped when empty
//! - **`SfuRoom`**: peers of one room and the media router they share
//! - **`SfuPeer`**: one participant and the media objects it owns
//! - **`ScreenShareManager`**: at most one active screen share per room
//! - **`MediaEngine`** / **`MediaRouter`**: the packet-forwarding backend,
//!   with [`LocalEngine`] as an in-process implementation
//!
//! ## Guarantees
//!
//! - A peer has at most one consumer per producer, even under racing requests
//! - Departing peers are announced (`producer-closed`, then `peer-left`)
//!   before their state is released
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_sfu::{LocalEngine, SfuConfig, SignalingService};
//!
//! let config = SfuConfig::default();
//! let engine = Arc::new(LocalEngine::new(&config));
//! let service = SignalingService::new(config, engine);
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(256);
//! let connection = service.connect(tx);
//! let reply = connection.handle_frame(frame).await;
//! ```

mod config;
pub mod engine;
mod error;
mod manager;
mod media;
mod peer;
mod pending;
mod room;
mod screen_share;
mod signaling;

pub use config::{CodecConfig, SfuConfig};
pub use engine::{ConsumerParams, EngineError, LocalEngine, MediaEngine, MediaRouter};
pub use error::{Result, SfuError};
pub use manager::{JoinedRoom, SfuManager};
pub use media::{Consumer, Producer, Transport};
pub use peer::{Outbox, PeerResources, PeerStats, SfuPeer};
pub use pending::{PendingConsumes, PendingGuard};
pub use room::{ConsumeOutcome, SfuRoom};
pub use screen_share::{ScreenShareManager, ScreenShareSession};
pub use signaling::{Connection, SignalingService};
