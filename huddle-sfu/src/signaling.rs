//! Signaling request handling
//!
//! One [`Connection`] per client socket. The connection id doubles as the
//! peer id once the client joins a room. Requests are independent and may be
//! handled concurrently; consume requests for the same producer on the same
//! connection are de-duplicated through [`PendingConsumes`].

use huddle_proto::{
    ClientFrame, ClientRequest, ConsumerId, ErrorBody, Notification, PeerId, Response, RoomId,
    ServerFrame, TrackType, TransportDirection,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::{Result, SfuError};
use crate::manager::SfuManager;
use crate::peer::{Outbox, SfuPeer};
use crate::pending::PendingConsumes;
use crate::room::SfuRoom;
use crate::screen_share::ScreenShareManager;

/// Shared state behind every connection
pub struct SignalingService {
    manager: SfuManager,
    shares: ScreenShareManager,
    pending: PendingConsumes,
}

impl SignalingService {
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        Arc::new(Self {
            manager: SfuManager::new(config, engine),
            shares: ScreenShareManager::new(),
            pending: PendingConsumes::new(),
        })
    }

    #[must_use]
    pub const fn manager(&self) -> &SfuManager {
        &self.manager
    }

    #[must_use]
    pub const fn shares(&self) -> &ScreenShareManager {
        &self.shares
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingConsumes {
        &self.pending
    }

    /// Register a new connection. Notifications for it are written to `outbox`.
    pub fn connect(self: &Arc<Self>, outbox: mpsc::Sender<ServerFrame>) -> Connection {
        let id = PeerId::new(Uuid::new_v4().to_string());
        debug!(connection_id = %id, "Connection registered");
        Connection {
            id,
            service: Arc::clone(self),
            outbox: Outbox::new(outbox),
        }
    }

    /// Tear down a peer's membership, share and pending requests
    fn release(&self, peer_id: &PeerId) -> Option<RoomId> {
        if let Ok((room, peer)) = self.manager.membership(peer_id) {
            self.shares.on_peer_leaving(&room, &peer);
        }
        self.manager.leave_room(peer_id)
    }
}

pub struct Connection {
    id: PeerId,
    service: Arc<SignalingService>,
    outbox: Outbox,
}

impl Connection {
    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    /// Resolves once a notification overflowed the outbound queue. The
    /// socket should then be closed and [`Self::disconnect`] called.
    pub async fn evicted(&self) {
        self.outbox.evicted().await;
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.outbox.is_evicted()
    }

    /// Handle one frame and build the frame to send back
    pub async fn handle_frame(&self, frame: ClientFrame) -> ServerFrame {
        let ClientFrame { id, request } = frame;
        let span = info_span!(
            "signaling",
            connection_id = %self.id,
            request_id = id,
            event = request.name()
        );

        match self.handle(request).instrument(span).await {
            Ok(response) => ServerFrame::Response { id, response },
            Err(e) => {
                match &e {
                    SfuError::Engine(_) | SfuError::RoomClosed(_) => {
                        warn!(connection_id = %self.id, request_id = id, error = %e, "Request failed");
                    }
                    _ => {
                        debug!(connection_id = %self.id, request_id = id, error = %e, "Request rejected");
                    }
                }
                ServerFrame::Error {
                    id,
                    error: ErrorBody::from(&e),
                }
            }
        }
    }

    pub async fn handle(&self, request: ClientRequest) -> Result<Response> {
        match request {
            ClientRequest::Join { room_id, name } => self.join(room_id, name).await,
            ClientRequest::Leave => {
                self.leave();
                Ok(Response::Left)
            }
            ClientRequest::GetRoomInfo { room_id } => {
                let room = self.service.manager.get_room(&room_id)?;
                Ok(Response::RoomInfo(room.info()))
            }
            ClientRequest::CreateSendTransport { room_id } => {
                self.create_transport(&room_id, TransportDirection::Send)
                    .await
            }
            ClientRequest::CreateReceiveTransport { room_id } => {
                self.create_transport(&room_id, TransportDirection::Recv)
                    .await
            }
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let (room, peer) = self.membership()?;
                room.connect_transport(&peer, &transport_id, dtls_parameters)
                    .await?;
                Ok(Response::TransportConnected { transport_id })
            }
            ClientRequest::Produce {
                room_id,
                transport_id,
                kind,
                track_type,
                media_parameters,
            } => {
                // Screen producers only exist as shares, so the room-wide
                // exclusivity check cannot be skipped
                if track_type == TrackType::Screen {
                    return Err(SfuError::InvalidRequest(
                        "screen tracks are published with start-share".to_string(),
                    ));
                }
                let (room, peer) = self.member_of(&room_id)?;
                let producer = room
                    .produce(&peer, &transport_id, kind, track_type, media_parameters)
                    .await?;
                room.broadcast(
                    Some(&peer.id),
                    &Notification::NewProducer {
                        producer_id: producer.id.clone(),
                        peer_id: peer.id.clone(),
                        kind,
                        track_type,
                    },
                );
                Ok(Response::Produced {
                    producer_id: producer.id,
                })
            }
            ClientRequest::CloseProducer { producer_id } => {
                let (room, peer) = self.membership()?;
                if self.service.shares.is_share_producer(&room.id, &producer_id) {
                    self.service.shares.stop_share(&room, &peer, &producer_id)?;
                } else {
                    room.close_producer(&peer, &producer_id)?;
                }
                Ok(Response::Ack)
            }
            ClientRequest::PauseProducer { producer_id } => {
                let (room, peer) = self.membership()?;
                room.set_producer_paused(&peer, &producer_id, true).await?;
                Ok(Response::Ack)
            }
            ClientRequest::ResumeProducer { producer_id } => {
                let (room, peer) = self.membership()?;
                room.set_producer_paused(&peer, &producer_id, false).await?;
                Ok(Response::Ack)
            }
            ClientRequest::Consume {
                room_id,
                transport_id,
                producer_id,
                capabilities,
            } => {
                let (room, peer) = self.member_of(&room_id)?;
                let Some(_guard) = self.service.pending.try_begin(&self.id, &producer_id) else {
                    debug!(connection_id = %self.id, producer_id = %producer_id, "Consume already pending");
                    return Ok(Response::ConsumePending { producer_id });
                };
                let outcome = room
                    .consume(&peer, &transport_id, &producer_id, capabilities)
                    .await?;
                Ok(Response::Consumed(outcome.consumer().descriptor()))
            }
            ClientRequest::ResumeConsumer { consumer_id } => {
                self.set_consumer_paused(&consumer_id, false).await?;
                Ok(Response::ConsumerResumed { consumer_id })
            }
            ClientRequest::PauseConsumer { consumer_id } => {
                self.set_consumer_paused(&consumer_id, true).await?;
                Ok(Response::ConsumerPaused { consumer_id })
            }
            ClientRequest::StartShare {
                room_id,
                transport_id,
                media_parameters,
            } => {
                let (room, peer) = self.member_of(&room_id)?;
                let producer_id = self
                    .service
                    .shares
                    .start_share(&room, &peer, &transport_id, media_parameters)
                    .await?;
                Ok(Response::ShareStarted { producer_id })
            }
            ClientRequest::StopShare {
                room_id,
                producer_id,
            } => {
                let (room, peer) = self.member_of(&room_id)?;
                self.service.shares.stop_share(&room, &peer, &producer_id)?;
                Ok(Response::Ack)
            }
            ClientRequest::ConsumeShare {
                room_id,
                transport_id,
                producer_id,
                capabilities,
            } => {
                let (room, peer) = self.member_of(&room_id)?;
                let Some(_guard) = self.service.pending.try_begin(&self.id, &producer_id) else {
                    return Ok(Response::ConsumePending { producer_id });
                };
                let outcome = self
                    .service
                    .shares
                    .consume_share(&room, &peer, &transport_id, &producer_id, capabilities)
                    .await?;
                Ok(Response::Consumed(outcome.consumer().descriptor()))
            }
            ClientRequest::GetShareStatus { room_id } => {
                Ok(Response::ShareStatus(self.service.shares.status(&room_id)))
            }
        }
    }

    /// Connection closed without an explicit leave
    pub fn disconnect(&self) {
        self.service.pending.clear_connection(&self.id);
        if let Some(room_id) = self.service.release(&self.id) {
            info!(connection_id = %self.id, room_id = %room_id, "Peer disconnected");
        } else {
            debug!(connection_id = %self.id, "Connection closed");
        }
    }

    async fn join(&self, room_id: RoomId, name: String) -> Result<Response> {
        if self.service.manager.room_of(&self.id).is_some() {
            self.leave();
        }

        let joined = self
            .service
            .manager
            .join_room(&room_id, &self.id, name, self.outbox.clone())
            .await?;
        Ok(Response::Joined {
            routing_capabilities: joined.room.router.capabilities(),
            peers: joined.peers,
        })
    }

    fn leave(&self) {
        self.service.pending.clear_connection(&self.id);
        if let Some(room_id) = self.service.release(&self.id) {
            info!(connection_id = %self.id, room_id = %room_id, "Peer left");
        }
    }

    async fn create_transport(
        &self,
        room_id: &RoomId,
        direction: TransportDirection,
    ) -> Result<Response> {
        let (room, peer) = self.member_of(room_id)?;
        let descriptor = room.create_transport(&peer, direction).await?;
        Ok(Response::TransportCreated(descriptor))
    }

    async fn set_consumer_paused(&self, consumer_id: &ConsumerId, paused: bool) -> Result<()> {
        let (room, peer) = self.membership()?;
        if peer.consumer(consumer_id).is_none() {
            return Err(SfuError::ConsumerNotFound(consumer_id.clone()));
        }
        room.router.set_consumer_paused(consumer_id, paused).await?;
        peer.set_consumer_paused(consumer_id, paused);
        Ok(())
    }

    fn membership(&self) -> Result<(Arc<SfuRoom>, Arc<SfuPeer>)> {
        self.service.manager.membership(&self.id)
    }

    /// Membership, checked against the room named in the request
    fn member_of(&self, room_id: &RoomId) -> Result<(Arc<SfuRoom>, Arc<SfuPeer>)> {
        let (room, peer) = self.membership()?;
        if &room.id != room_id {
            return Err(SfuError::NotInRoom(self.id.clone()));
        }
        Ok((room, peer))
    }
}
