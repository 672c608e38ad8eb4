//! Huddle Protocol Definitions
//!
//! This crate contains the signaling wire format shared by the SFU server
//! and the client consumption layer. Frames are JSON text messages:
//!
//! - client to server: [`ClientFrame`] carrying a request id and a [`ClientRequest`]
//! - server to client: [`ServerFrame`], either a correlated response, a
//!   correlated error, or an uncorrelated room [`Notification`]

mod error;
mod ids;
mod message;
mod media;

pub use error::{ErrorBody, ErrorCode};
pub use ids::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
pub use media::{MediaKind, TrackType, TransportDirection, TransportState};
pub use message::{
    ClientFrame, ClientRequest, ConsumerDescriptor, Notification, PeerDetail, PeerSummary,
    ProducerSummary, Response, RoomInfo, RoomListing, ServerFrame, ShareStatus,
    TransportDescriptor,
};
