//! Media engine abstraction
//!
//! Rooms never touch RTP, DTLS or ICE themselves. Each room owns one
//! [`MediaRouter`] obtained from a [`MediaEngine`], and all transport,
//! producer and consumer creation goes through it. The engine assigns the
//! ids; the registry only keeps bookkeeping records keyed by them.
//!
//! Creation and negotiation calls are async. Close calls are synchronous and
//! infallible so that peer teardown never suspends half way.

mod local;

pub use local::LocalEngine;

use async_trait::async_trait;
use huddle_proto::{
    ConsumerId, MediaKind, ProducerId, RoomId, TransportDescriptor, TransportDirection,
    TransportId,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown transport {0}")]
    UnknownTransport(TransportId),

    #[error("unknown producer {0}")]
    UnknownProducer(ProducerId),

    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    #[error("transport {0} has the wrong direction for this operation")]
    WrongDirection(TransportId),

    #[error("cannot consume producer {producer_id}: {reason}")]
    CannotConsume {
        producer_id: ProducerId,
        reason: String,
    },

    #[error("router is closed")]
    RouterClosed,

    #[error("{0}")]
    Other(String),
}

/// Engine-side parameters of a freshly created consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub media_parameters: Value,
}

/// Factory of per-room routing contexts
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    async fn create_router(&self, room_id: &RoomId) -> Result<Arc<dyn MediaRouter>, EngineError>;
}

/// Routing context of one room
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &str;

    /// Capabilities announced to joining peers
    fn capabilities(&self) -> Value;

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        media_parameters: Value,
    ) -> Result<ProducerId, EngineError>;

    /// Create a consumer. Consumers always start paused.
    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: Value,
    ) -> Result<ConsumerParams, EngineError>;

    async fn set_producer_paused(
        &self,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<(), EngineError>;

    async fn set_consumer_paused(
        &self,
        consumer_id: &ConsumerId,
        paused: bool,
    ) -> Result<(), EngineError>;

    fn close_consumer(&self, consumer_id: &ConsumerId);

    /// Close a producer and every engine-side consumer bound to it
    fn close_producer(&self, producer_id: &ProducerId);

    fn close_transport(&self, transport_id: &TransportId);

    fn close(&self);
}
