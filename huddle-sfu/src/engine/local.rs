//! In-process media engine
//!
//! Keeps the same bookkeeping a real forwarding engine would (transports,
//! producers, consumers and their bindings) and enforces the same
//! preconditions, but moves no packets. Used as the default engine of the
//! server binary and as the engine of the registry tests.

use async_trait::async_trait;
use huddle_proto::{
    ConsumerId, MediaKind, ProducerId, RoomId, TransportDescriptor, TransportDirection,
    TransportId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{ConsumerParams, EngineError, MediaEngine, MediaRouter};
use crate::config::{CodecConfig, SfuConfig};

pub struct LocalEngine {
    codecs: Vec<CodecConfig>,
    announced_ip: String,
    port_range: (u16, u16),
    next_port: Arc<AtomicU16>,
    latency: Duration,
}

impl LocalEngine {
    #[must_use]
    pub fn new(config: &SfuConfig) -> Self {
        Self {
            codecs: config.media_codecs.clone(),
            announced_ip: config.announced_ip.clone(),
            port_range: (config.rtc_min_port, config.rtc_max_port),
            next_port: Arc::new(AtomicU16::new(config.rtc_min_port)),
            latency: Duration::ZERO,
        }
    }

    /// Delay every async engine call, to exercise interleavings in tests
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(&self, room_id: &RoomId) -> Result<Arc<dyn MediaRouter>, EngineError> {
        let router = LocalRouter {
            id: Uuid::new_v4().to_string(),
            capabilities: capabilities_from(&self.codecs),
            announced_ip: self.announced_ip.clone(),
            port_range: self.port_range,
            next_port: Arc::clone(&self.next_port),
            latency: self.latency,
            state: Mutex::new(RouterState::default()),
        };
        debug!(room_id = %room_id, router_id = %router.id, "Local router created");
        Ok(Arc::new(router))
    }
}

fn capabilities_from(codecs: &[CodecConfig]) -> Value {
    let codecs: Vec<Value> = codecs
        .iter()
        .enumerate()
        .map(|(index, codec)| {
            let mut entry = json!({
                "kind": codec.kind,
                "mimeType": codec.mime_type,
                "clockRate": codec.clock_rate,
                "preferredPayloadType": 100 + index,
            });
            if let Some(channels) = codec.channels {
                entry["channels"] = json!(channels);
            }
            entry
        })
        .collect();

    json!({ "codecs": codecs, "headerExtensions": [] })
}

struct LocalTransport {
    direction: TransportDirection,
    connected: bool,
}

struct LocalProducer {
    transport_id: TransportId,
    kind: MediaKind,
    media_parameters: Value,
    paused: bool,
}

struct LocalConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Default)]
struct RouterState {
    closed: bool,
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
}

impl RouterState {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::RouterClosed)
        } else {
            Ok(())
        }
    }

    fn transport(
        &self,
        transport_id: &TransportId,
        direction: TransportDirection,
    ) -> Result<&LocalTransport, EngineError> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.clone()))?;
        if transport.direction != direction {
            return Err(EngineError::WrongDirection(transport_id.clone()));
        }
        Ok(transport)
    }

    fn remove_consumers_of_producer(&mut self, producer_id: &ProducerId) {
        self.consumers.retain(|_, c| &c.producer_id != producer_id);
    }
}

pub struct LocalRouter {
    id: String,
    capabilities: Value,
    announced_ip: String,
    port_range: (u16, u16),
    next_port: Arc<AtomicU16>,
    latency: Duration,
    state: Mutex<RouterState>,
}

impl LocalRouter {
    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn allocate_port(&self) -> u16 {
        let (min, max) = self.port_range;
        let span = u32::from(max - min) + 1;
        let offset = u32::from(self.next_port.fetch_add(1, Ordering::Relaxed).wrapping_sub(min));
        // offset % span < span <= u16::MAX + 1, so the sum fits
        min + (offset % span) as u16
    }
}

#[async_trait]
impl MediaRouter for LocalRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Value {
        self.capabilities.clone()
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError> {
        self.simulate_latency().await;

        let id = TransportId::new(Uuid::new_v4().to_string());
        let port = self.allocate_port();

        let mut state = self.state.lock();
        state.ensure_open()?;
        state.transports.insert(
            id.clone(),
            LocalTransport {
                direction,
                connected: false,
            },
        );

        Ok(TransportDescriptor {
            id,
            direction,
            ice_parameters: json!({
                "usernameFragment": nanoid::nanoid!(16),
                "password": nanoid::nanoid!(32),
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079_u32,
                "ip": self.announced_ip,
                "port": port,
                "protocol": "udp",
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": Uuid::new_v4().simple().to_string(),
                }],
            }),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        self.simulate_latency().await;

        if !dtls_parameters.is_object() {
            return Err(EngineError::Other(
                "dtls parameters must be an object".to_string(),
            ));
        }

        let mut state = self.state.lock();
        state.ensure_open()?;
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.clone()))?;
        if transport.connected {
            return Err(EngineError::Other(format!(
                "transport {transport_id} is already connected"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        media_parameters: Value,
    ) -> Result<ProducerId, EngineError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        state.ensure_open()?;
        state.transport(transport_id, TransportDirection::Send)?;

        let id = ProducerId::new(Uuid::new_v4().to_string());
        state.producers.insert(
            id.clone(),
            LocalProducer {
                transport_id: transport_id.clone(),
                kind,
                media_parameters,
                paused: false,
            },
        );
        Ok(id)
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: Value,
    ) -> Result<ConsumerParams, EngineError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        state.ensure_open()?;
        state.transport(transport_id, TransportDirection::Recv)?;

        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.clone()))?;

        let supported = capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs.iter().any(|codec| {
                    codec.get("kind").and_then(Value::as_str) == Some(producer.kind.as_str())
                })
            });
        if !supported {
            return Err(EngineError::CannotConsume {
                producer_id: producer_id.clone(),
                reason: format!("no {} codec in capabilities", producer.kind),
            });
        }

        let params = ConsumerParams {
            id: ConsumerId::new(Uuid::new_v4().to_string()),
            kind: producer.kind,
            media_parameters: producer.media_parameters.clone(),
        };
        state.consumers.insert(
            params.id.clone(),
            LocalConsumer {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                paused: true,
            },
        );
        Ok(params)
    }

    async fn set_producer_paused(
        &self,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.clone()))?;
        producer.paused = paused;
        Ok(())
    }

    async fn set_consumer_paused(
        &self,
        consumer_id: &ConsumerId,
        paused: bool,
    ) -> Result<(), EngineError> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::UnknownConsumer(consumer_id.clone()))?;
        consumer.paused = paused;
        Ok(())
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.state.lock().consumers.remove(consumer_id);
    }

    fn close_producer(&self, producer_id: &ProducerId) {
        let mut state = self.state.lock();
        if state.producers.remove(producer_id).is_some() {
            state.remove_consumers_of_producer(producer_id);
        }
    }

    fn close_transport(&self, transport_id: &TransportId) {
        let mut state = self.state.lock();
        if state.transports.remove(transport_id).is_none() {
            return;
        }

        let closed_producers: Vec<ProducerId> = state
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &closed_producers {
            state.producers.remove(producer_id);
            state.remove_consumers_of_producer(producer_id);
        }
        state.consumers.retain(|_, c| &c.transport_id != transport_id);
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.transports.clear();
        state.producers.clear();
        state.consumers.clear();
        debug!(router_id = %self.id, "Local router closed");
    }
}

#[cfg(test)]
impl LocalRouter {
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (
            state.transports.len(),
            state.producers.len(),
            state.consumers.len(),
        )
    }

    pub(crate) fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.state.lock().consumers.get(consumer_id).map(|c| c.paused)
    }
}
