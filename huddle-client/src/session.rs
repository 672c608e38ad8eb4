//! Media session
//!
//! One [`MediaSession`] is one client's view of one joined room. It owns
//! the track registry, the duplicate validator and the recovery manager,
//! and drives every produce and consume handshake through a
//! [`SignalingClient`] and a [`MediaDevice`].
//!
//! Consumes are serialized: the join snapshot, announced producers and
//! explicit [`MediaSession::consume_remote`] calls all take the same queue,
//! so at most one consume handshake runs at a time. Removals
//! (`producer-closed`, `peer-left`, `share-stopped`) never wait for the
//! queue; they cancel any recovery of the affected producers at once.

use async_trait::async_trait;
use huddle_proto::{
    ClientRequest, MediaKind, Notification, PeerId, ProducerId, Response, RoomId, ServerFrame,
    TrackType, TransportId, TransportState,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{RecoveryConfig, SessionConfig};
use crate::error::{ClientError, ErrorClass, Result};
use crate::recovery::{RecoveryManager, RecoveryTarget};
use crate::registry::{DuplicateTrack, TrackRegistry};
use crate::signaling::{ChannelSignaling, SignalingClient};
use crate::track::{MediaTrack, TrackId, TrackInfo};
use crate::transport::{MediaDevice, ReceiveTransport, SendTransport};
use crate::validator::{DuplicateValidator, Validation};

/// Peer id under which local tracks are registered
pub const LOCAL_PEER: &str = "local";

/// A producer of another peer, as announced by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProducer {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub track_type: TrackType,
    pub paused: bool,
}

/// Result of one consume operation
#[derive(Debug)]
pub enum ConsumeOutcome {
    /// A new remote track was registered
    Created(TrackId),
    /// The producer was already consumed or being consumed; nothing changed
    Duplicate(Option<TrackId>),
    /// The producer is unavailable to this session until announced again
    Unavailable(ClientError),
}

impl ConsumeOutcome {
    #[must_use]
    pub const fn track_id(&self) -> Option<TrackId> {
        match self {
            Self::Created(id) | Self::Duplicate(Some(id)) => Some(*id),
            Self::Duplicate(None) | Self::Unavailable(_) => None,
        }
    }

    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Default)]
struct SessionState {
    room_id: Option<RoomId>,
    send: Option<Arc<dyn SendTransport>>,
    recv: Option<Arc<dyn ReceiveTransport>>,
    peers: HashMap<PeerId, String>,
    /// Remote producers still wanted; removal aborts their consume
    producers: HashMap<ProducerId, RemoteProducer>,
    registry: TrackRegistry,
    validator: DuplicateValidator,
}

pub struct MediaSession {
    config: SessionConfig,
    signaling: Arc<dyn SignalingClient>,
    device: Arc<dyn MediaDevice>,
    recovery: RecoveryManager,
    local_peer: PeerId,
    state: Mutex<SessionState>,
    consume_queue: tokio::sync::Mutex<()>,
}

impl MediaSession {
    #[must_use]
    pub fn new(
        config: SessionConfig,
        recovery: RecoveryConfig,
        signaling: Arc<dyn SignalingClient>,
        device: Arc<dyn MediaDevice>,
    ) -> Arc<Self> {
        let budget = recovery.worst_case_duration(config.request_timeout());
        if config.operation_timeout() < budget {
            warn!(
                operation_timeout = ?config.operation_timeout(),
                ?budget,
                "Operation timeout can cut recovery short"
            );
        }
        Arc::new(Self {
            config,
            signaling,
            device,
            recovery: RecoveryManager::new(recovery),
            local_peer: PeerId::from(LOCAL_PEER),
            state: Mutex::new(SessionState::default()),
            consume_queue: tokio::sync::Mutex::new(()),
        })
    }

    /// Join `room_id`, open both transports and consume every producer in
    /// the join snapshot. Rejoining tears down the previous local state.
    pub async fn join(
        &self,
        room_id: RoomId,
        name: &str,
    ) -> Result<Vec<(RemoteProducer, ConsumeOutcome)>> {
        let _queue = self.consume_queue.lock().await;
        if self.state.lock().room_id.is_some() {
            self.teardown_local();
        }

        let response = self
            .signaling
            .request(ClientRequest::Join {
                room_id: room_id.clone(),
                name: name.to_string(),
            })
            .await?;
        let (routing_capabilities, peers) = match response {
            Response::Joined {
                routing_capabilities,
                peers,
            } => (routing_capabilities, peers),
            other => return Err(unexpected("join", &other)),
        };

        self.device.load(&routing_capabilities).await?;
        let send = self.open_send_transport(&room_id).await?;
        let recv = self.open_receive_transport(&room_id).await?;

        let snapshot: Vec<RemoteProducer> = peers
            .iter()
            .flat_map(|peer| {
                peer.producers.iter().map(|producer| RemoteProducer {
                    producer_id: producer.producer_id.clone(),
                    peer_id: peer.id.clone(),
                    kind: producer.kind,
                    track_type: producer.track_type,
                    paused: producer.paused,
                })
            })
            .collect();

        {
            let mut state = self.state.lock();
            state.room_id = Some(room_id.clone());
            state.send = Some(send);
            state.recv = Some(recv);
            state.peers = peers
                .iter()
                .map(|peer| (peer.id.clone(), peer.name.clone()))
                .collect();
            for producer in &snapshot {
                state
                    .producers
                    .insert(producer.producer_id.clone(), producer.clone());
            }
        }
        info!(
            room_id = %room_id,
            peers = peers.len(),
            producers = snapshot.len(),
            "Joined room"
        );

        let mut outcomes = Vec::with_capacity(snapshot.len());
        for producer in snapshot {
            let outcome = self.consume_queued(&producer).await;
            outcomes.push((producer, outcome));
        }
        Ok(outcomes)
    }

    /// Leave the room. Local state is torn down even if the request fails.
    pub async fn leave(&self) -> Result<()> {
        let result = self.signaling.request(ClientRequest::Leave).await;
        self.teardown_local();
        match result? {
            Response::Left | Response::Ack => Ok(()),
            other => Err(unexpected("leave", &other)),
        }
    }

    async fn open_send_transport(&self, room_id: &RoomId) -> Result<Arc<dyn SendTransport>> {
        let request = ClientRequest::CreateSendTransport {
            room_id: room_id.clone(),
        };
        let descriptor = match self.signaling.request(request).await? {
            Response::TransportCreated(descriptor) => descriptor,
            other => return Err(unexpected("create-send-transport", &other)),
        };
        let transport = self.device.create_send_transport(&descriptor).await?;
        self.connect_transport(transport.id(), transport.dtls_parameters())
            .await?;
        Ok(transport)
    }

    async fn open_receive_transport(
        &self,
        room_id: &RoomId,
    ) -> Result<Arc<dyn ReceiveTransport>> {
        let request = ClientRequest::CreateReceiveTransport {
            room_id: room_id.clone(),
        };
        let descriptor = match self.signaling.request(request).await? {
            Response::TransportCreated(descriptor) => descriptor,
            other => return Err(unexpected("create-receive-transport", &other)),
        };
        let transport = self.device.create_receive_transport(&descriptor).await?;
        self.connect_transport(transport.id(), transport.dtls_parameters())
            .await?;
        Ok(transport)
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<()> {
        let request = ClientRequest::ConnectTransport {
            transport_id: transport_id.clone(),
            dtls_parameters,
        };
        match self.signaling.request(request).await? {
            Response::TransportConnected { .. } | Response::Ack => Ok(()),
            other => Err(unexpected("connect-transport", &other)),
        }
    }

    /// Publish a local track. A track for the same (kind, track type) slot
    /// is reused: its media is swapped instead of producing twice. Audio
    /// starts disabled.
    pub async fn add_local_track(
        &self,
        track: Arc<dyn MediaTrack>,
        track_type: TrackType,
    ) -> Result<TrackId> {
        let kind = track.kind();
        let (room_id, send, existing) = {
            let state = self.state.lock();
            let room_id = state.room_id.clone().ok_or(ClientError::NotInitialized("room"))?;
            let send = state
                .send
                .clone()
                .ok_or(ClientError::NotInitialized("send transport"))?;
            let existing = state
                .registry
                .by_slot(&self.local_peer, kind, track_type)
                .map(|info| info.id);
            (room_id, send, existing)
        };

        if let Some(id) = existing {
            debug!(track_id = %id, %kind, %track_type, "Reusing local track slot");
            self.replace_local_track(id, track).await?;
            return Ok(id);
        }

        let send_state = send.state();
        if send_state.is_unusable() {
            return Err(ClientError::TransportUnhealthy(send_state));
        }

        if kind == MediaKind::Audio {
            track.set_enabled(false);
        }

        let media_parameters = send.prepare(&track).await?;
        let transport_id = send.id().clone();
        let producer_id = if track_type == TrackType::Screen {
            let request = ClientRequest::StartShare {
                room_id,
                transport_id,
                media_parameters,
            };
            match self.signaling.request(request).await? {
                Response::ShareStarted { producer_id } => producer_id,
                other => return Err(unexpected("start-share", &other)),
            }
        } else {
            let request = ClientRequest::Produce {
                room_id,
                transport_id,
                kind,
                track_type,
                media_parameters,
            };
            match self.signaling.request(request).await? {
                Response::Produced { producer_id } => producer_id,
                other => return Err(unexpected("produce", &other)),
            }
        };
        send.bind(&producer_id, &track);

        let registered = self.state.lock().registry.add_local(
            self.local_peer.clone(),
            track_type,
            producer_id.clone(),
            track,
        );
        match registered {
            Ok(id) => {
                info!(track_id = %id, producer_id = %producer_id, %kind, %track_type, "Local track published");
                Ok(id)
            }
            Err(DuplicateTrack(existing)) => {
                warn!(producer_id = %producer_id, track_id = %existing, "Local slot taken concurrently, closing new producer");
                send.close_producer(&producer_id);
                self.close_producer_remote(&producer_id, track_type).await?;
                Err(ClientError::DuplicateTrack(existing))
            }
        }
    }

    /// Swap the media of a local track. The old track is stopped only after
    /// the sender carries the new one.
    pub async fn replace_local_track(&self, id: TrackId, track: Arc<dyn MediaTrack>) -> Result<()> {
        let (producer_id, send) = self.local_producer(id)?;
        send.replace_track(&producer_id, Arc::clone(&track)).await?;

        let previous = self.state.lock().registry.replace(id, track);
        if let Some(previous) = previous {
            previous.stop();
        }
        debug!(track_id = %id, producer_id = %producer_id, "Local track replaced");
        Ok(())
    }

    /// Mute or unmute a local track; the producer is paused accordingly so
    /// other peers can mirror the state
    pub async fn set_local_enabled(&self, id: TrackId, enabled: bool) -> Result<()> {
        let (producer_id, send) = self.local_producer(id)?;
        self.state.lock().registry.set_enabled(id, enabled);
        send.set_paused(&producer_id, !enabled);

        let request = if enabled {
            ClientRequest::ResumeProducer {
                producer_id: producer_id.clone(),
            }
        } else {
            ClientRequest::PauseProducer {
                producer_id: producer_id.clone(),
            }
        };
        let name = request.name();
        match self.signaling.request(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }

    /// Stop a local track and close its producer
    pub async fn remove_local_track(&self, id: TrackId) -> Result<()> {
        let (info, send) = {
            let mut state = self.state.lock();
            if !state.registry.get(id).is_some_and(TrackInfo::is_local) {
                return Err(ClientError::TrackNotFound(id));
            }
            let info = state.registry.remove(id).ok_or(ClientError::TrackNotFound(id))?;
            (info, state.send.clone())
        };

        info.track.stop();
        if let Some(send) = send {
            send.close_producer(info.producer_id());
        }
        self.close_producer_remote(info.producer_id(), info.track_type)
            .await
    }

    async fn close_producer_remote(
        &self,
        producer_id: &ProducerId,
        track_type: TrackType,
    ) -> Result<()> {
        let room_id = self.state.lock().room_id.clone();
        let request = match (track_type, room_id) {
            (TrackType::Screen, Some(room_id)) => ClientRequest::StopShare {
                room_id,
                producer_id: producer_id.clone(),
            },
            _ => ClientRequest::CloseProducer {
                producer_id: producer_id.clone(),
            },
        };
        let name = request.name();
        match self.signaling.request(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }

    fn local_producer(&self, id: TrackId) -> Result<(ProducerId, Arc<dyn SendTransport>)> {
        let state = self.state.lock();
        let info = state
            .registry
            .get(id)
            .filter(|info| info.is_local())
            .ok_or(ClientError::TrackNotFound(id))?;
        let send = state
            .send
            .clone()
            .ok_or(ClientError::NotInitialized("send transport"))?;
        Ok((info.producer_id().clone(), send))
    }

    /// Consume a remote producer
    pub async fn consume_remote(&self, producer: RemoteProducer) -> ConsumeOutcome {
        self.state
            .lock()
            .producers
            .insert(producer.producer_id.clone(), producer.clone());
        let _queue = self.consume_queue.lock().await;
        self.consume_queued(&producer).await
    }

    /// Consume a producer recorded by [`Self::handle_notification`]. Gives
    /// `Unavailable(Cancelled)` if it was closed in the meantime.
    pub async fn consume_announced(&self, producer: RemoteProducer) -> ConsumeOutcome {
        let _queue = self.consume_queue.lock().await;
        self.consume_queued(&producer).await
    }

    /// Validate, then run the handshake (with recovery) under the operation
    /// timeout. Caller holds the consume queue.
    async fn consume_queued(&self, producer: &RemoteProducer) -> ConsumeOutcome {
        let producer_id = &producer.producer_id;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.validator.validate(
                &state.registry,
                producer_id,
                &producer.peer_id,
                producer.kind,
                producer.track_type,
            ) {
                Validation::Proceed => {
                    state.validator.begin(producer_id);
                }
                validation => return ConsumeOutcome::Duplicate(validation.existing_track()),
            }
        }

        let timeout = self.config.operation_timeout();
        let last_error = Mutex::new(None);
        let consume = self.run_consume(producer, &last_error);
        let outcome = match tokio::time::timeout(timeout, consume).await {
            Ok(Ok(track_id)) => ConsumeOutcome::Created(track_id),
            Ok(Err(ClientError::DuplicateTrack(existing))) => ConsumeOutcome::Duplicate(Some(existing)),
            Ok(Err(e)) if e.classify() == ErrorClass::Duplicate => ConsumeOutcome::Duplicate(None),
            Ok(Err(e)) => {
                warn!(producer_id = %producer_id, peer_id = %producer.peer_id, error = %e, "Producer unavailable");
                ConsumeOutcome::Unavailable(e)
            }
            Err(_) => {
                self.recovery.cancel(producer_id);
                let last_error = last_error.lock().take().map(Box::new);
                warn!(producer_id = %producer_id, ?timeout, ?last_error, "Consume operation timed out");
                ConsumeOutcome::Unavailable(ClientError::OperationTimeout {
                    producer_id: producer_id.clone(),
                    timeout,
                    last_error,
                })
            }
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.validator.finish(producer_id);
        if matches!(outcome, ConsumeOutcome::Unavailable(_)) {
            state
                .validator
                .detect_and_repair_inconsistency(&mut state.registry, producer_id);
        }
        outcome
    }

    /// First handshake, then recovery. Every failure is recorded in
    /// `last_error` so a timed out operation can still report its cause.
    async fn run_consume(
        &self,
        producer: &RemoteProducer,
        last_error: &Mutex<Option<ClientError>>,
    ) -> Result<TrackId> {
        match self.consume_once(producer).await {
            Err(e) if e.is_retryable() => {
                warn!(producer_id = %producer.producer_id, error = %e, "Consume failed, starting recovery");
                *last_error.lock() = Some(e.clone());
                let target = ConsumeRetry {
                    session: self,
                    producer,
                    last_error,
                };
                self.recovery
                    .recover(&target, &producer.producer_id, e)
                    .await
            }
            result => result,
        }
    }

    /// One full consume handshake: server consumer, local track,
    /// registration, resume
    async fn consume_once(&self, producer: &RemoteProducer) -> Result<TrackId> {
        let producer_id = &producer.producer_id;
        let (room_id, recv) = {
            let state = self.state.lock();
            if !state.producers.contains_key(producer_id) {
                return Err(ClientError::Cancelled(producer_id.clone()));
            }
            let room_id = state.room_id.clone().ok_or(ClientError::NotInitialized("room"))?;
            let recv = state
                .recv
                .clone()
                .ok_or(ClientError::NotInitialized("receive transport"))?;
            (room_id, recv)
        };

        let transport_id = recv.id().clone();
        let capabilities = self.device.capabilities();
        let request = if producer.track_type == TrackType::Screen {
            ClientRequest::ConsumeShare {
                room_id,
                transport_id,
                producer_id: producer_id.clone(),
                capabilities,
            }
        } else {
            ClientRequest::Consume {
                room_id,
                transport_id,
                producer_id: producer_id.clone(),
                capabilities,
            }
        };
        let descriptor = match self.signaling.request(request).await? {
            Response::Consumed(descriptor) => descriptor,
            Response::ConsumePending { .. } => {
                return Err(ClientError::Other(format!(
                    "consume of {producer_id} is busy on the server"
                )))
            }
            other => return Err(unexpected("consume", &other)),
        };
        let consumer_id = descriptor.consumer_id.clone();

        let track = recv.consume(&descriptor).await?;
        if producer.paused {
            track.set_enabled(false);
        }

        let registered = {
            let mut state = self.state.lock();
            if state.producers.contains_key(producer_id) {
                Some(state.registry.add_remote(
                    producer.peer_id.clone(),
                    producer.track_type,
                    consumer_id.clone(),
                    producer_id.clone(),
                    Arc::clone(&track),
                ))
            } else {
                None
            }
        };
        let track_id = match registered {
            Some(Ok(track_id)) => track_id,
            Some(Err(DuplicateTrack(existing))) => {
                let shared = self
                    .state
                    .lock()
                    .registry
                    .get(existing)
                    .and_then(TrackInfo::consumer_id)
                    .is_some_and(|id| *id == consumer_id);
                if !shared {
                    track.stop();
                    recv.close_consumer(&consumer_id);
                }
                return Err(ClientError::DuplicateTrack(existing));
            }
            None => {
                debug!(producer_id = %producer_id, "Producer closed during consume");
                track.stop();
                recv.close_consumer(&consumer_id);
                return Err(ClientError::Cancelled(producer_id.clone()));
            }
        };

        let resume = ClientRequest::ResumeConsumer {
            consumer_id: consumer_id.clone(),
        };
        if let Err(e) = self.signaling.request(resume).await {
            self.state.lock().registry.remove(track_id);
            track.stop();
            recv.close_consumer(&consumer_id);
            return Err(e);
        }

        info!(
            track_id = %track_id,
            producer_id = %producer_id,
            consumer_id = %consumer_id,
            peer_id = %producer.peer_id,
            kind = %producer.kind,
            "Remote track added"
        );
        Ok(track_id)
    }

    /// Apply a room notification. Returns the producer to consume for
    /// `new-producer` and `share-started`; the caller feeds it to
    /// [`Self::consume_announced`].
    pub fn handle_notification(&self, notification: Notification) -> Option<RemoteProducer> {
        match notification {
            Notification::PeerJoined { id, name } => {
                info!(peer_id = %id, name = %name, "Peer joined");
                self.state.lock().peers.insert(id, name);
                None
            }
            Notification::PeerLeft { id } => {
                self.remove_peer(&id);
                None
            }
            Notification::NewProducer {
                producer_id,
                peer_id,
                kind,
                track_type,
            } => Some(self.announce(RemoteProducer {
                producer_id,
                peer_id,
                kind,
                track_type,
                paused: false,
            })),
            Notification::ShareStarted {
                peer_id,
                producer_id,
            } => Some(self.announce(RemoteProducer {
                producer_id,
                peer_id,
                kind: MediaKind::Video,
                track_type: TrackType::Screen,
                paused: false,
            })),
            Notification::ProducerClosed { producer_id, .. } => {
                self.drop_remote_producer(&producer_id);
                None
            }
            Notification::ShareStopped {
                peer_id,
                producer_id,
            } => {
                self.drop_remote_producer(&producer_id);
                let (removed, recv) = {
                    let mut state = self.state.lock();
                    (
                        state.registry.remove_by_type(&peer_id, TrackType::Screen),
                        state.recv.clone(),
                    )
                };
                for info in &removed {
                    release_remote(info, recv.as_deref());
                }
                None
            }
            Notification::ProducerPaused { producer_id, .. } => {
                self.mirror_paused(&producer_id, true);
                None
            }
            Notification::ProducerResumed { producer_id, .. } => {
                self.mirror_paused(&producer_id, false);
                None
            }
        }
    }

    fn announce(&self, producer: RemoteProducer) -> RemoteProducer {
        debug!(producer_id = %producer.producer_id, peer_id = %producer.peer_id, kind = %producer.kind, "Producer announced");
        self.state
            .lock()
            .producers
            .insert(producer.producer_id.clone(), producer.clone());
        producer
    }

    fn mirror_paused(&self, producer_id: &ProducerId, paused: bool) {
        let mut state = self.state.lock();
        if let Some(producer) = state.producers.get_mut(producer_id) {
            producer.paused = paused;
        }
        if let Some(info) = state.registry.by_producer(producer_id) {
            info.track.set_enabled(!paused);
        }
    }

    fn drop_remote_producer(&self, producer_id: &ProducerId) {
        self.recovery.cancel(producer_id);
        let (removed, recv) = {
            let mut state = self.state.lock();
            state.producers.remove(producer_id);
            let id = state
                .registry
                .by_producer(producer_id)
                .filter(|info| !info.is_local())
                .map(|info| info.id);
            (id.and_then(|id| state.registry.remove(id)), state.recv.clone())
        };
        if let Some(info) = removed {
            debug!(producer_id = %producer_id, track_id = %info.id, "Remote track removed");
            release_remote(&info, recv.as_deref());
        }
    }

    fn remove_peer(&self, peer_id: &PeerId) {
        let (producers, removed, recv) = {
            let mut state = self.state.lock();
            state.peers.remove(peer_id);
            let producers: Vec<ProducerId> = state
                .producers
                .values()
                .filter(|producer| &producer.peer_id == peer_id)
                .map(|producer| producer.producer_id.clone())
                .collect();
            for producer_id in &producers {
                state.producers.remove(producer_id);
            }
            (producers, state.registry.remove_by_peer(peer_id), state.recv.clone())
        };
        for producer_id in &producers {
            self.recovery.cancel(producer_id);
        }
        for info in &removed {
            release_remote(info, recv.as_deref());
        }
        info!(peer_id = %peer_id, tracks = removed.len(), "Peer left");
    }

    /// Drive the session from a frame channel until it closes. Responses
    /// are routed to waiting requests; notifications are applied in
    /// arrival order and announced producers consumed one at a time.
    pub async fn pump(
        self: Arc<Self>,
        signaling: Arc<ChannelSignaling>,
        mut incoming: mpsc::Receiver<ServerFrame>,
    ) {
        let (consume_tx, mut consume_rx) = mpsc::unbounded_channel::<RemoteProducer>();
        let worker = {
            let session = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(producer) = consume_rx.recv().await {
                    session.consume_announced(producer).await;
                }
            })
        };

        while let Some(frame) = incoming.recv().await {
            let Some(notification) = signaling.dispatch(frame) else {
                continue;
            };
            if let Some(producer) = self.handle_notification(notification) {
                if consume_tx.send(producer).is_err() {
                    break;
                }
            }
        }

        signaling.fail_all("signaling connection closed");
        worker.abort();
        self.teardown_local();
    }

    /// Drop every track and transport without contacting the server
    pub fn teardown_local(&self) {
        self.recovery.cancel_all();
        let (records, send, recv) = {
            let mut state = self.state.lock();
            state.validator.clear();
            state.producers.clear();
            state.peers.clear();
            state.room_id = None;
            (state.registry.clear(), state.send.take(), state.recv.take())
        };
        for info in &records {
            info.track.stop();
        }
        if let Some(send) = send {
            send.close();
        }
        if let Some(recv) = recv {
            recv.close();
        }
        if !records.is_empty() {
            debug!(tracks = records.len(), "Local media state torn down");
        }
    }

    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        self.state.lock().room_id.clone()
    }

    #[must_use]
    pub fn peers(&self) -> HashMap<PeerId, String> {
        self.state.lock().peers.clone()
    }

    #[must_use]
    pub fn track(&self, id: TrackId) -> Option<TrackInfo> {
        self.state.lock().registry.get(id).cloned()
    }

    #[must_use]
    pub fn track_by_producer(&self, producer_id: &ProducerId) -> Option<TrackInfo> {
        self.state.lock().registry.by_producer(producer_id).cloned()
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<TrackInfo> {
        let mut tracks: Vec<TrackInfo> = self.state.lock().registry.tracks().cloned().collect();
        tracks.sort_by_key(|info| info.id);
        tracks
    }

    #[must_use]
    pub fn remote_tracks(&self) -> Vec<TrackInfo> {
        self.tracks()
            .into_iter()
            .filter(|info| !info.is_local())
            .collect()
    }

    #[must_use]
    pub fn is_consuming(&self, producer_id: &ProducerId) -> bool {
        self.state.lock().validator.is_in_flight(producer_id)
    }

    #[must_use]
    pub const fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }
}

/// Recovery hooks for one producer of a session
struct ConsumeRetry<'a> {
    session: &'a MediaSession,
    producer: &'a RemoteProducer,
    last_error: &'a Mutex<Option<ClientError>>,
}

#[async_trait]
impl<'a> RecoveryTarget for ConsumeRetry<'a> {
    fn repair(&self, producer_id: &ProducerId) {
        let mut guard = self.session.state.lock();
        let state = &mut *guard;
        state
            .validator
            .detect_and_repair_inconsistency(&mut state.registry, producer_id);
    }

    fn receive_transport_state(&self) -> TransportState {
        self.session
            .state
            .lock()
            .recv
            .as_ref()
            .map_or(TransportState::Closed, |recv| recv.state())
    }

    async fn consume(&self, _producer_id: &ProducerId) -> Result<TrackId> {
        let result = self.session.consume_once(self.producer).await;
        if let Err(e) = &result {
            *self.last_error.lock() = Some(e.clone());
        }
        result
    }
}

fn release_remote(info: &TrackInfo, recv: Option<&dyn ReceiveTransport>) {
    info.track.stop();
    if let (Some(recv), Some(consumer_id)) = (recv, info.consumer_id()) {
        recv.close_consumer(consumer_id);
    }
}

fn unexpected(request: &'static str, response: &Response) -> ClientError {
    ClientError::UnexpectedResponse {
        request,
        response: format!("{response:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, FakeTrack, ScriptedSignaling};
    use huddle_proto::{ErrorCode, PeerSummary, ProducerSummary};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        session: Arc<MediaSession>,
        signaling: Arc<ScriptedSignaling>,
        device: Arc<FakeDevice>,
    }

    fn harness() -> Harness {
        harness_with(SessionConfig::default())
    }

    fn harness_with(config: SessionConfig) -> Harness {
        let signaling = ScriptedSignaling::new();
        let device = FakeDevice::new();
        let session = MediaSession::new(
            config,
            RecoveryConfig::default().without_jitter(),
            signaling.clone(),
            device.clone(),
        );
        Harness {
            session,
            signaling,
            device,
        }
    }

    async fn joined() -> Harness {
        let h = harness();
        h.session.join(RoomId::from("r"), "me").await.unwrap();
        h
    }

    fn remote(producer: &str, peer: &str, kind: MediaKind) -> RemoteProducer {
        RemoteProducer {
            producer_id: ProducerId::from(producer),
            peer_id: PeerId::from(peer),
            kind,
            track_type: TrackType::Camera,
            paused: false,
        }
    }

    fn new_producer(producer: &str, peer: &str) -> Notification {
        Notification::NewProducer {
            producer_id: ProducerId::from(producer),
            peer_id: PeerId::from(peer),
            kind: MediaKind::Video,
            track_type: TrackType::Camera,
        }
    }

    #[tokio::test]
    async fn test_join_consumes_snapshot() {
        let h = harness();
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.signaling.offer("p2", MediaKind::Audio, TrackType::Camera);
        *h.signaling.snapshot.lock() = vec![PeerSummary {
            id: PeerId::from("a"),
            name: "alice".to_string(),
            producers: vec![
                ProducerSummary {
                    producer_id: ProducerId::from("p1"),
                    kind: MediaKind::Video,
                    track_type: TrackType::Camera,
                    paused: false,
                },
                ProducerSummary {
                    producer_id: ProducerId::from("p2"),
                    kind: MediaKind::Audio,
                    track_type: TrackType::Camera,
                    paused: true,
                },
            ],
        }];

        let outcomes = h.session.join(RoomId::from("r"), "me").await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_created()));
        assert_eq!(h.session.remote_tracks().len(), 2);
        assert_eq!(h.signaling.count("resume-consumer"), 2);
        assert_eq!(h.signaling.count("connect-transport"), 2);
        assert_eq!(h.session.peers().get(&PeerId::from("a")).unwrap(), "alice");

        let muted = h.session.track_by_producer(&ProducerId::from("p2")).unwrap();
        assert!(!muted.is_enabled());
    }

    #[tokio::test]
    async fn test_duplicate_announcement_consumes_once() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);

        let first = h.session.handle_notification(new_producer("p1", "a")).unwrap();
        let second = h.session.handle_notification(new_producer("p1", "a")).unwrap();
        let (a, b) = tokio::join!(
            h.session.consume_announced(first),
            h.session.consume_announced(second)
        );

        let created = [&a, &b].iter().filter(|o| o.is_created()).count();
        assert_eq!(created, 1);
        assert_eq!(a.track_id(), b.track_id());
        assert_eq!(h.signaling.count("consume"), 1);
        assert_eq!(h.session.remote_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_same_slot_from_second_producer_is_duplicate() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.signaling.offer("p2", MediaKind::Video, TrackType::Camera);

        let first = h.session.consume_remote(remote("p1", "a", MediaKind::Video)).await;
        let second = h.session.consume_remote(remote("p2", "a", MediaKind::Video)).await;

        assert!(first.is_created());
        assert!(matches!(second, ConsumeOutcome::Duplicate(Some(id)) if Some(id) == first.track_id()));
        assert_eq!(h.signaling.count("consume"), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let h = joined().await;

        let outcome = h.session.consume_remote(remote("ghost", "a", MediaKind::Video)).await;

        assert!(matches!(
            outcome,
            ConsumeOutcome::Unavailable(ClientError::Remote {
                code: ErrorCode::ProducerNotFound,
                ..
            })
        ));
        assert_eq!(h.signaling.count("consume"), 1);
        assert!(!h.session.is_consuming(&ProducerId::from("ghost")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.signaling
            .consume_errors
            .lock()
            .push(ClientError::Timeout(Duration::from_secs(10)));
        h.device.recv().failures.store(1, Ordering::SeqCst);

        let outcome = h.session.consume_remote(remote("p1", "a", MediaKind::Video)).await;

        assert!(outcome.is_created());
        assert_eq!(h.signaling.count("consume"), 3);
        assert_eq!(h.session.remote_tracks().len(), 1);
        assert!(!h.session.recovery().is_recovering(&ProducerId::from("p1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_recovery_is_terminal() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.signaling
            .consume_always_times_out
            .store(true, Ordering::SeqCst);

        let outcome = h.session.consume_remote(remote("p1", "a", MediaKind::Video)).await;

        match outcome {
            ConsumeOutcome::Unavailable(ClientError::RetryExhausted { attempts, source, .. }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ClientError::Timeout(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.signaling.count("consume"), 4);
        assert!(h.session.remote_tracks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_timeouts_still_exhaust_every_retry() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.signaling
            .consume_always_times_out
            .store(true, Ordering::SeqCst);
        *h.signaling.consume_latency.lock() = Duration::from_secs(10);

        let outcome = h.session.consume_remote(remote("p1", "a", MediaKind::Video)).await;

        match outcome {
            ConsumeOutcome::Unavailable(ClientError::RetryExhausted { attempts, source, .. }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ClientError::Timeout(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.signaling.count("consume"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_clears_state() {
        let h = harness_with(SessionConfig {
            operation_timeout_ms: 20_000,
            ..SessionConfig::default()
        });
        h.session.join(RoomId::from("r"), "me").await.unwrap();
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.signaling
            .consume_always_times_out
            .store(true, Ordering::SeqCst);
        *h.signaling.consume_latency.lock() = Duration::from_secs(10);

        let outcome = h.session.consume_remote(remote("p1", "a", MediaKind::Video)).await;

        match outcome {
            ConsumeOutcome::Unavailable(ClientError::OperationTimeout { last_error, .. }) => {
                assert!(matches!(last_error.as_deref(), Some(ClientError::Timeout(_))));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.signaling.count("consume"), 2);
        let producer = ProducerId::from("p1");
        assert!(!h.session.recovery().is_recovering(&producer));
        assert!(!h.session.is_consuming(&producer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_closed_cancels_recovery() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.signaling
            .consume_always_times_out
            .store(true, Ordering::SeqCst);

        let producer = h.session.handle_notification(new_producer("p1", "a")).unwrap();
        let (outcome, ()) = tokio::join!(h.session.consume_announced(producer), async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(h.session.recovery().is_recovering(&ProducerId::from("p1")));
            h.session.handle_notification(Notification::ProducerClosed {
                producer_id: ProducerId::from("p1"),
                peer_id: PeerId::from("a"),
            });
        });

        assert!(matches!(
            outcome,
            ConsumeOutcome::Unavailable(ClientError::Cancelled(_))
        ));
        assert_eq!(h.signaling.count("consume"), 1);
        assert!(!h.session.recovery().is_recovering(&ProducerId::from("p1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_transport_aborts_recovery() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.device.recv().failures.store(1, Ordering::SeqCst);
        *h.device.recv().state.lock() = TransportState::Failed;

        let outcome = h.session.consume_remote(remote("p1", "a", MediaKind::Video)).await;

        assert!(matches!(
            outcome,
            ConsumeOutcome::Unavailable(ClientError::TransportUnhealthy(TransportState::Failed))
        ));
        assert_eq!(h.signaling.count("consume"), 1);
    }

    #[tokio::test]
    async fn test_removals_release_tracks() {
        let h = joined().await;
        for (producer, peer, kind) in [
            ("p1", "a", MediaKind::Video),
            ("p2", "a", MediaKind::Audio),
            ("p3", "b", MediaKind::Video),
        ] {
            h.signaling.offer(producer, kind, TrackType::Camera);
            assert!(h.session.consume_remote(remote(producer, peer, kind)).await.is_created());
        }
        let p3_track = h.session.track_by_producer(&ProducerId::from("p3")).unwrap();

        h.session.handle_notification(Notification::PeerLeft {
            id: PeerId::from("a"),
        });
        assert_eq!(h.session.remote_tracks().len(), 1);
        assert_eq!(h.device.recv().closed_consumers.lock().len(), 2);

        h.session.handle_notification(Notification::ProducerClosed {
            producer_id: ProducerId::from("p3"),
            peer_id: PeerId::from("b"),
        });
        assert!(h.session.remote_tracks().is_empty());
        assert!(p3_track.track.is_ended());
    }

    #[tokio::test]
    async fn test_producer_pause_is_mirrored() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.session.consume_remote(remote("p1", "a", MediaKind::Video)).await;
        let paused = Notification::ProducerPaused {
            producer_id: ProducerId::from("p1"),
            peer_id: PeerId::from("a"),
        };

        h.session.handle_notification(paused);
        assert!(!h.session.track_by_producer(&ProducerId::from("p1")).unwrap().is_enabled());

        h.session.handle_notification(Notification::ProducerResumed {
            producer_id: ProducerId::from("p1"),
            peer_id: PeerId::from("a"),
        });
        assert!(h.session.track_by_producer(&ProducerId::from("p1")).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_share_stopped_removes_screen_track() {
        let h = joined().await;
        let producer = h
            .session
            .handle_notification(Notification::ShareStarted {
                peer_id: PeerId::from("a"),
                producer_id: ProducerId::from("s1"),
            })
            .unwrap();
        h.signaling.offer("s1", MediaKind::Video, TrackType::Screen);

        assert!(h.session.consume_announced(producer).await.is_created());
        assert_eq!(h.signaling.count("consume-share"), 1);

        h.session.handle_notification(Notification::ShareStopped {
            peer_id: PeerId::from("a"),
            producer_id: ProducerId::from("s1"),
        });
        assert!(h.session.remote_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_local_track_lifecycle() {
        let h = joined().await;

        let mic = FakeTrack::new(MediaKind::Audio);
        let id = h
            .session
            .add_local_track(mic.clone(), TrackType::Camera)
            .await
            .unwrap();
        assert!(!mic.is_enabled());
        assert_eq!(h.signaling.count("produce"), 1);

        // Same slot: swapped, not produced again
        let mic2 = FakeTrack::new(MediaKind::Audio);
        let again = h
            .session
            .add_local_track(mic2.clone(), TrackType::Camera)
            .await
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(h.signaling.count("produce"), 1);
        assert!(mic.is_ended());
        assert!(!mic2.is_enabled());

        h.session.set_local_enabled(id, true).await.unwrap();
        assert!(mic2.is_enabled());
        assert_eq!(h.signaling.count("resume-producer"), 1);
        let producer_id = h.session.track(id).unwrap().producer_id().clone();
        assert!(!h.device.send().paused.lock().contains(&producer_id));

        h.session.remove_local_track(id).await.unwrap();
        assert!(mic2.is_ended());
        assert_eq!(h.signaling.count("close-producer"), 1);
        assert!(h.session.track(id).is_none());
    }

    #[tokio::test]
    async fn test_publish_needs_usable_send_transport() {
        let h = joined().await;
        h.device.send().closed.store(true, Ordering::SeqCst);

        let err = h
            .session
            .add_local_track(FakeTrack::new(MediaKind::Video), TrackType::Camera)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::TransportUnhealthy(TransportState::Closed)
        ));
        assert_eq!(h.signaling.count("produce"), 0);
    }

    #[tokio::test]
    async fn test_screen_share_uses_share_requests() {
        let h = joined().await;

        let screen = FakeTrack::new(MediaKind::Video);
        let id = h
            .session
            .add_local_track(screen, TrackType::Screen)
            .await
            .unwrap();
        assert_eq!(h.signaling.count("start-share"), 1);

        h.session.remove_local_track(id).await.unwrap();
        assert_eq!(h.signaling.count("stop-share"), 1);
    }

    #[tokio::test]
    async fn test_leave_tears_down() {
        let h = joined().await;
        h.signaling.offer("p1", MediaKind::Video, TrackType::Camera);
        h.session.consume_remote(remote("p1", "a", MediaKind::Video)).await;
        let cam = FakeTrack::new(MediaKind::Video);
        h.session
            .add_local_track(cam.clone(), TrackType::Camera)
            .await
            .unwrap();

        h.session.leave().await.unwrap();

        assert!(h.session.tracks().is_empty());
        assert!(h.session.room_id().is_none());
        assert!(cam.is_ended());
        assert_eq!(h.device.recv().state(), TransportState::Closed);
        let err = h
            .session
            .add_local_track(FakeTrack::new(MediaKind::Video), TrackType::Camera)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized(_)));
    }
}
