//! Media stack stand-ins for sessions driven against the in-process SFU

use async_trait::async_trait;
use huddle_client::{MediaDevice, MediaTrack, ReceiveTransport, Result, SendTransport};
use huddle_proto::{
    ConsumerDescriptor, ConsumerId, MediaKind, ProducerId, TransportDescriptor, TransportId,
    TransportState,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct StubTrack {
    kind: MediaKind,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl StubTrack {
    pub fn new(kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for StubTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

fn dtls() -> Value {
    json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "00" }] })
}

pub struct StubSend {
    id: TransportId,
    closed: AtomicBool,
}

#[async_trait]
impl SendTransport for StubSend {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn state(&self) -> TransportState {
        if self.closed.load(Ordering::SeqCst) {
            TransportState::Closed
        } else {
            TransportState::Connected
        }
    }

    fn dtls_parameters(&self) -> Value {
        dtls()
    }

    async fn prepare(&self, track: &Arc<dyn MediaTrack>) -> Result<Value> {
        Ok(json!({ "kind": track.kind(), "encodings": [{ "ssrc": 2222 }] }))
    }

    fn bind(&self, _producer_id: &ProducerId, _track: &Arc<dyn MediaTrack>) {}

    async fn replace_track(
        &self,
        _producer_id: &ProducerId,
        _track: Arc<dyn MediaTrack>,
    ) -> Result<()> {
        Ok(())
    }

    fn set_paused(&self, _producer_id: &ProducerId, _paused: bool) {}

    fn close_producer(&self, _producer_id: &ProducerId) {}

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct StubRecv {
    id: TransportId,
    state: Mutex<TransportState>,
    pub closed_consumers: Mutex<Vec<ConsumerId>>,
}

#[async_trait]
impl ReceiveTransport for StubRecv {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn dtls_parameters(&self) -> Value {
        dtls()
    }

    async fn consume(&self, descriptor: &ConsumerDescriptor) -> Result<Arc<dyn MediaTrack>> {
        Ok(StubTrack::new(descriptor.kind))
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.closed_consumers.lock().push(consumer_id.clone());
    }

    fn close(&self) {
        *self.state.lock() = TransportState::Closed;
    }
}

#[derive(Default)]
pub struct StubDevice {
    capabilities: Mutex<Value>,
    recv: Mutex<Option<Arc<StubRecv>>>,
}

impl StubDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn recv(&self) -> Arc<StubRecv> {
        self.recv.lock().clone().expect("receive transport not created")
    }
}

#[async_trait]
impl MediaDevice for StubDevice {
    async fn load(&self, routing_capabilities: &Value) -> Result<()> {
        *self.capabilities.lock() = routing_capabilities.clone();
        Ok(())
    }

    fn capabilities(&self) -> Value {
        self.capabilities.lock().clone()
    }

    async fn create_send_transport(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Arc<dyn SendTransport>> {
        Ok(Arc::new(StubSend {
            id: descriptor.id.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_receive_transport(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Arc<dyn ReceiveTransport>> {
        let transport = Arc::new(StubRecv {
            id: descriptor.id.clone(),
            state: Mutex::new(TransportState::Connected),
            closed_consumers: Mutex::new(Vec::new()),
        });
        *self.recv.lock() = Some(Arc::clone(&transport));
        Ok(transport)
    }
}
