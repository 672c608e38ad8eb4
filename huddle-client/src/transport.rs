//! Local media device abstraction
//!
//! The browser-side (or native) WebRTC stack is opaque to the session: it
//! loads the router capabilities, builds transports from server descriptors,
//! turns local tracks into producer parameters and turns consumer
//! descriptors into receiving tracks.

use async_trait::async_trait;
use huddle_proto::{
    ConsumerDescriptor, ConsumerId, ProducerId, TransportDescriptor, TransportId, TransportState,
};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::track::MediaTrack;

#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the routing capabilities received on join
    async fn load(&self, routing_capabilities: &Value) -> Result<()>;

    /// Receive capabilities sent along with every consume request
    fn capabilities(&self) -> Value;

    async fn create_send_transport(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Arc<dyn SendTransport>>;

    async fn create_receive_transport(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Arc<dyn ReceiveTransport>>;
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn state(&self) -> TransportState;

    /// Local DTLS parameters for `connect-transport`
    fn dtls_parameters(&self) -> Value;

    /// Prepare a sender for `track`, returning its media parameters
    async fn prepare(&self, track: &Arc<dyn MediaTrack>) -> Result<Value>;

    /// Attach the prepared sender of `track` to its server-side producer
    fn bind(&self, producer_id: &ProducerId, track: &Arc<dyn MediaTrack>);

    /// Swap the track sent through `producer_id`
    async fn replace_track(
        &self,
        producer_id: &ProducerId,
        track: Arc<dyn MediaTrack>,
    ) -> Result<()>;

    fn set_paused(&self, producer_id: &ProducerId, paused: bool);

    fn close_producer(&self, producer_id: &ProducerId);

    fn close(&self);
}

#[async_trait]
pub trait ReceiveTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// `Closed` once closed
    fn state(&self) -> TransportState;

    /// Local DTLS parameters for `connect-transport`
    fn dtls_parameters(&self) -> Value;

    /// Build the receiving track of a consumer created server-side
    async fn consume(&self, descriptor: &ConsumerDescriptor) -> Result<Arc<dyn MediaTrack>>;

    fn close_consumer(&self, consumer_id: &ConsumerId);

    fn close(&self);
}
