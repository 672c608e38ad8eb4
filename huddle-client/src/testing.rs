//! In-memory fakes of the media stack and the signaling server

use async_trait::async_trait;
use huddle_proto::{
    ClientRequest, ConsumerDescriptor, ConsumerId, ErrorBody, ErrorCode, MediaKind, PeerSummary,
    ProducerId, Response, TrackType, TransportDescriptor, TransportDirection, TransportId,
    TransportState,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::signaling::SignalingClient;
use crate::track::MediaTrack;
use crate::transport::{MediaDevice, ReceiveTransport, SendTransport};

#[derive(Debug)]
pub struct FakeTrack {
    kind: MediaKind,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl FakeTrack {
    pub fn new(kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for FakeTrack {
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

#[derive(Default)]
pub struct FakeSendTransport {
    id: TransportId,
    pub bound: Mutex<HashMap<ProducerId, Arc<dyn MediaTrack>>>,
    pub paused: Mutex<HashSet<ProducerId>>,
    pub closed_producers: Mutex<Vec<ProducerId>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl SendTransport for FakeSendTransport {
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
        Ok(json!({ "kind": track.kind(), "encodings": [{ "ssrc": 1111 }] }))
    }

    fn bind(&self, producer_id: &ProducerId, track: &Arc<dyn MediaTrack>) {
        self.bound.lock().insert(producer_id.clone(), Arc::clone(track));
    }

    async fn replace_track(
        &self,
        producer_id: &ProducerId,
        track: Arc<dyn MediaTrack>,
    ) -> Result<()> {
        let mut bound = self.bound.lock();
        let slot = bound
            .get_mut(producer_id)
            .ok_or_else(|| ClientError::Transport(format!("no sender for {producer_id}")))?;
        *slot = track;
        Ok(())
    }

    fn set_paused(&self, producer_id: &ProducerId, paused: bool) {
        let mut set = self.paused.lock();
        if paused {
            set.insert(producer_id.clone());
        } else {
            set.remove(producer_id);
        }
    }

    fn close_producer(&self, producer_id: &ProducerId) {
        self.bound.lock().remove(producer_id);
        self.closed_producers.lock().push(producer_id.clone());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeReceiveTransport {
    id: TransportId,
    pub state: Mutex<TransportState>,
    /// Upcoming consume calls that fail with a transport error
    pub failures: AtomicUsize,
    pub consumed: Mutex<Vec<ConsumerId>>,
    pub closed_consumers: Mutex<Vec<ConsumerId>>,
}

#[async_trait]
impl ReceiveTransport for FakeReceiveTransport {
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
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::Transport("ICE connection failed".to_string()));
        }
        self.consumed.lock().push(descriptor.consumer_id.clone());
        Ok(FakeTrack::new(descriptor.kind))
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.closed_consumers.lock().push(consumer_id.clone());
    }

    fn close(&self) {
        *self.state.lock() = TransportState::Closed;
    }
}

#[derive(Default)]
pub struct FakeDevice {
    capabilities: Mutex<Value>,
    pub send: Mutex<Option<Arc<FakeSendTransport>>>,
    pub recv: Mutex<Option<Arc<FakeReceiveTransport>>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn send(&self) -> Arc<FakeSendTransport> {
        self.send.lock().clone().expect("send transport not created")
    }

    pub fn recv(&self) -> Arc<FakeReceiveTransport> {
        self.recv.lock().clone().expect("receive transport not created")
    }
}

#[async_trait]
impl MediaDevice for FakeDevice {
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
        let transport = Arc::new(FakeSendTransport {
            id: descriptor.id.clone(),
            ..FakeSendTransport::default()
        });
        *self.send.lock() = Some(Arc::clone(&transport));
        Ok(transport)
    }

    async fn create_receive_transport(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Arc<dyn ReceiveTransport>> {
        let transport = Arc::new(FakeReceiveTransport {
            id: descriptor.id.clone(),
            state: Mutex::new(TransportState::Connected),
            ..FakeReceiveTransport::default()
        });
        *self.recv.lock() = Some(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Scripted signaling server. Producers must be offered before they can be
/// consumed; unknown producers are answered with `producer-not-found`.
#[derive(Default)]
pub struct ScriptedSignaling {
    pub requests: Mutex<Vec<ClientRequest>>,
    pub snapshot: Mutex<Vec<PeerSummary>>,
    offers: Mutex<HashMap<ProducerId, (MediaKind, TrackType)>>,
    /// Errors returned by upcoming consume requests, in order
    pub consume_errors: Mutex<Vec<ClientError>>,
    /// Fail every consume request with a timeout
    pub consume_always_times_out: AtomicBool,
    /// Time a consume request takes before it is answered
    pub consume_latency: Mutex<Duration>,
    next_producer: AtomicUsize,
}

impl ScriptedSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn offer(&self, producer_id: &str, kind: MediaKind, track_type: TrackType) {
        self.offers
            .lock()
            .insert(ProducerId::from(producer_id), (kind, track_type));
    }

    pub fn count(&self, name: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.name() == name)
            .count()
    }

    fn next_local_producer(&self) -> ProducerId {
        let n = self.next_producer.fetch_add(1, Ordering::SeqCst) + 1;
        ProducerId::from(format!("local-{n}"))
    }

    fn transport(direction: TransportDirection) -> Response {
        let id = match direction {
            TransportDirection::Send => "send-transport",
            TransportDirection::Recv => "recv-transport",
        };
        Response::TransportCreated(TransportDescriptor {
            id: TransportId::from(id),
            direction,
            ice_parameters: json!({}),
            ice_candidates: json!([]),
            dtls_parameters: dtls(),
        })
    }

    async fn consume(&self, producer_id: ProducerId) -> Result<Response> {
        let latency = *self.consume_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.consume_always_times_out.load(Ordering::SeqCst) {
            return Err(ClientError::Timeout(Duration::from_secs(10)));
        }
        {
            let mut errors = self.consume_errors.lock();
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        let Some((kind, track_type)) = self.offers.lock().get(&producer_id).copied() else {
            return Err(ErrorBody::new(ErrorCode::ProducerNotFound, format!("{producer_id}")).into());
        };
        Ok(Response::Consumed(ConsumerDescriptor {
            consumer_id: ConsumerId::from(format!("c-{producer_id}")),
            producer_id,
            kind,
            track_type,
            media_parameters: json!({}),
            paused: true,
        }))
    }
}

#[async_trait]
impl SignalingClient for ScriptedSignaling {
    async fn request(&self, request: ClientRequest) -> Result<Response> {
        self.requests.lock().push(request.clone());
        match request {
            ClientRequest::Join { .. } => Ok(Response::Joined {
                routing_capabilities: json!({ "codecs": [{ "kind": "audio" }, { "kind": "video" }] }),
                peers: self.snapshot.lock().clone(),
            }),
            ClientRequest::Leave => Ok(Response::Left),
            ClientRequest::CreateSendTransport { .. } => {
                Ok(Self::transport(TransportDirection::Send))
            }
            ClientRequest::CreateReceiveTransport { .. } => {
                Ok(Self::transport(TransportDirection::Recv))
            }
            ClientRequest::ConnectTransport { transport_id, .. } => {
                Ok(Response::TransportConnected { transport_id })
            }
            ClientRequest::Produce { .. } => Ok(Response::Produced {
                producer_id: self.next_local_producer(),
            }),
            ClientRequest::StartShare { .. } => Ok(Response::ShareStarted {
                producer_id: self.next_local_producer(),
            }),
            ClientRequest::Consume { producer_id, .. }
            | ClientRequest::ConsumeShare { producer_id, .. } => self.consume(producer_id).await,
            ClientRequest::ResumeConsumer { consumer_id } => {
                Ok(Response::ConsumerResumed { consumer_id })
            }
            ClientRequest::PauseConsumer { consumer_id } => {
                Ok(Response::ConsumerPaused { consumer_id })
            }
            _ => Ok(Response::Ack),
        }
    }
}
