//! Signaling frames
//!
//! Media parameters (RTP parameters, DTLS parameters, router capabilities)
//! are opaque to signaling and travel as raw JSON values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorBody;
use crate::ids::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use crate::media::{MediaKind, TrackType, TransportDirection};

/// A client request with its correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: ClientRequest,
}

/// Requests a client may send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientRequest {
    Join {
        room_id: RoomId,
        name: String,
    },
    Leave,
    GetRoomInfo {
        room_id: RoomId,
    },
    CreateSendTransport {
        room_id: RoomId,
    },
    CreateReceiveTransport {
        room_id: RoomId,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: Value,
    },
    Produce {
        room_id: RoomId,
        transport_id: TransportId,
        kind: MediaKind,
        #[serde(default)]
        track_type: TrackType,
        media_parameters: Value,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    PauseProducer {
        producer_id: ProducerId,
    },
    ResumeProducer {
        producer_id: ProducerId,
    },
    Consume {
        room_id: RoomId,
        transport_id: TransportId,
        producer_id: ProducerId,
        capabilities: Value,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    PauseConsumer {
        consumer_id: ConsumerId,
    },
    StartShare {
        room_id: RoomId,
        transport_id: TransportId,
        media_parameters: Value,
    },
    StopShare {
        room_id: RoomId,
        producer_id: ProducerId,
    },
    ConsumeShare {
        room_id: RoomId,
        transport_id: TransportId,
        producer_id: ProducerId,
        capabilities: Value,
    },
    GetShareStatus {
        room_id: RoomId,
    },
}

impl ClientRequest {
    /// Event name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::GetRoomInfo { .. } => "get-room-info",
            Self::CreateSendTransport { .. } => "create-send-transport",
            Self::CreateReceiveTransport { .. } => "create-receive-transport",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::Produce { .. } => "produce",
            Self::CloseProducer { .. } => "close-producer",
            Self::PauseProducer { .. } => "pause-producer",
            Self::ResumeProducer { .. } => "resume-producer",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::PauseConsumer { .. } => "pause-consumer",
            Self::StartShare { .. } => "start-share",
            Self::StopShare { .. } => "stop-share",
            Self::ConsumeShare { .. } => "consume-share",
            Self::GetShareStatus { .. } => "get-share-status",
        }
    }
}

/// Summary of one producer, as listed in join snapshots and room info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub track_type: TrackType,
    pub paused: bool,
}

/// An existing peer as seen by a newly joined peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub name: String,
    pub producers: Vec<ProducerSummary>,
}

/// Per-peer detail for `get-room-info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDetail {
    pub id: PeerId,
    pub name: String,
    pub producers_count: usize,
    pub consumers_count: usize,
    pub transports_count: usize,
    pub producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub peers_count: usize,
    pub peers: Vec<PeerDetail>,
}

/// Entry of the room listing served over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomListing {
    pub id: RoomId,
    pub peers_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Parameters a client needs to build the local side of a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub track_type: TrackType,
    pub media_parameters: Value,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareStatus {
    pub active: bool,
    pub producer_id: Option<ProducerId>,
    pub peer_id: Option<PeerId>,
}

/// Successful responses, one per request kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Response {
    Joined {
        routing_capabilities: Value,
        peers: Vec<PeerSummary>,
    },
    Left,
    RoomInfo(RoomInfo),
    TransportCreated(TransportDescriptor),
    TransportConnected {
        transport_id: TransportId,
    },
    Produced {
        producer_id: ProducerId,
    },
    Consumed(ConsumerDescriptor),
    /// Another consume for the same producer is already in flight on this connection
    ConsumePending {
        producer_id: ProducerId,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    ConsumerPaused {
        consumer_id: ConsumerId,
    },
    ShareStarted {
        producer_id: ProducerId,
    },
    ShareStatus(ShareStatus),
    Ack,
}

/// Room broadcasts, not correlated with any request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    PeerJoined {
        id: PeerId,
        name: String,
    },
    PeerLeft {
        id: PeerId,
    },
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
        track_type: TrackType,
    },
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ProducerPaused {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ProducerResumed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ShareStarted {
        peer_id: PeerId,
        producer_id: ProducerId,
    },
    ShareStopped {
        peer_id: PeerId,
        producer_id: ProducerId,
    },
}

/// Everything the server writes to a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Response { id: u64, response: Response },
    Error { id: u64, error: ErrorBody },
    Notification { notification: Notification },
}

impl ServerFrame {
    #[must_use]
    pub const fn notification(notification: Notification) -> Self {
        Self::Notification { notification }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_client_frame_wire_shape() {
        let raw = json!({
            "id": 7,
            "request": {
                "event": "consume",
                "data": {
                    "roomId": "r1",
                    "transportId": "t1",
                    "producerId": "p1",
                    "capabilities": {"codecs": []}
                }
            }
        });

        let frame: ClientFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(frame.id, 7);
        match frame.request {
            ClientRequest::Consume {
                room_id,
                producer_id,
                ..
            } => {
                assert_eq!(room_id.as_str(), "r1");
                assert_eq!(producer_id.as_str(), "p1");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_unit_request_without_data() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"id": 1, "request": {"event": "leave"}})).unwrap();
        assert!(matches!(frame.request, ClientRequest::Leave));
        assert_eq!(frame.request.name(), "leave");
    }

    #[test]
    fn test_produce_defaults_to_camera() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "id": 2,
            "request": {
                "event": "produce",
                "data": {
                    "roomId": "r1",
                    "transportId": "t1",
                    "kind": "video",
                    "mediaParameters": {}
                }
            }
        }))
        .unwrap();

        match frame.request {
            ClientRequest::Produce { track_type, kind, .. } => {
                assert_eq!(track_type, TrackType::Camera);
                assert_eq!(kind, MediaKind::Video);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_notification_frame_shape() {
        let frame = ServerFrame::notification(Notification::NewProducer {
            producer_id: ProducerId::from("p1"),
            peer_id: PeerId::from("a"),
            kind: MediaKind::Video,
            track_type: TrackType::Camera,
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["notification"]["event"], "new-producer");
        assert_eq!(value["notification"]["data"]["producerId"], "p1");
        assert_eq!(value["notification"]["data"]["trackType"], "camera");
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ServerFrame::Error {
            id: 3,
            error: ErrorBody::new(ErrorCode::ShareAlreadyActive, "busy"),
        };

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["id"], 3);
        assert_eq!(value["error"]["code"], "share-already-active");

        let back: ServerFrame = serde_json::from_value(value).unwrap();
        assert_eq!(back, frame);
    }
}
