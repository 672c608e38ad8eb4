//! Sessions driven against the in-process SFU

use huddle_proto::{ClientFrame, ErrorCode, MediaKind, RoomId, ServerFrame, TrackType};
use huddle_sfu::{Connection, LocalEngine, SfuConfig, SignalingService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod common;

use common::{StubDevice, StubTrack};
use huddle_client::{ChannelSignaling, ClientError, MediaSession, RecoveryConfig, SessionConfig};

struct Linked {
    session: Arc<MediaSession>,
    device: Arc<StubDevice>,
    connection: Arc<Connection>,
}

fn service() -> Arc<SignalingService> {
    let config = SfuConfig::default();
    let engine = Arc::new(LocalEngine::new(&config));
    SignalingService::new(config, engine)
}

/// Wire a session to a server connection through frame channels
fn link(service: &Arc<SignalingService>) -> Linked {
    let (server_tx, server_rx) = mpsc::channel::<ServerFrame>(64);
    let connection = Arc::new(service.connect(server_tx.clone()));
    let (client_tx, mut client_rx) = mpsc::channel::<ClientFrame>(64);

    {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            while let Some(frame) = client_rx.recv().await {
                let connection = Arc::clone(&connection);
                let tx = server_tx.clone();
                tokio::spawn(async move {
                    let reply = connection.handle_frame(frame).await;
                    let _ = tx.send(reply).await;
                });
            }
        });
    }

    let signaling = ChannelSignaling::new(client_tx, Duration::from_secs(5));
    let device = StubDevice::new();
    let session = MediaSession::new(
        SessionConfig::default(),
        RecoveryConfig::default().without_jitter(),
        signaling.clone(),
        device.clone(),
    );
    tokio::spawn(Arc::clone(&session).pump(signaling, server_rx));

    Linked {
        session,
        device,
        connection,
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_announced_producer_is_consumed_and_released() {
    let service = service();
    let room = RoomId::from("r");
    let a = link(&service);
    let b = link(&service);

    assert!(a.session.join(room.clone(), "alice").await.unwrap().is_empty());
    assert!(b.session.join(room.clone(), "bob").await.unwrap().is_empty());
    eventually("alice sees bob", || {
        a.session.peers().contains_key(b.connection.id())
    })
    .await;

    a.session
        .add_local_track(StubTrack::new(MediaKind::Video), TrackType::Camera)
        .await
        .unwrap();
    eventually("bob consumes alice's camera", || {
        b.session.remote_tracks().len() == 1
    })
    .await;

    let track = b.session.remote_tracks().remove(0);
    assert_eq!(&track.peer_id, a.connection.id());
    assert_eq!(track.kind, MediaKind::Video);

    a.session.leave().await.unwrap();
    eventually("bob drops alice's track", || {
        b.session.remote_tracks().is_empty()
    })
    .await;
    assert!(track.track.is_ended());
    assert_eq!(b.device.recv().closed_consumers.lock().len(), 1);
    assert!(!b.session.peers().contains_key(a.connection.id()));
}

#[tokio::test]
async fn test_late_joiner_consumes_snapshot_once() {
    let service = service();
    let room = RoomId::from("r");
    let a = link(&service);
    a.session.join(room.clone(), "alice").await.unwrap();
    a.session
        .add_local_track(StubTrack::new(MediaKind::Video), TrackType::Camera)
        .await
        .unwrap();
    a.session
        .add_local_track(StubTrack::new(MediaKind::Audio), TrackType::Camera)
        .await
        .unwrap();

    let b = link(&service);
    let outcomes = b.session.join(room.clone(), "bob").await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_created()));

    // A replayed announcement must not create a second consumer
    let (producer, _) = &outcomes[0];
    let replay = b.session.consume_remote(producer.clone()).await;
    assert_eq!(replay.track_id(), outcomes[0].1.track_id());
    assert!(!replay.is_created());

    let info = service.manager().get_room(&room).unwrap().info();
    let bob = info.peers.iter().find(|peer| peer.name == "bob").unwrap();
    assert_eq!(bob.consumers_count, 2);
}

#[tokio::test]
async fn test_screen_share_is_exclusive() {
    let service = service();
    let room = RoomId::from("r");
    let a = link(&service);
    let b = link(&service);
    a.session.join(room.clone(), "alice").await.unwrap();
    b.session.join(room.clone(), "bob").await.unwrap();

    let share = a
        .session
        .add_local_track(StubTrack::new(MediaKind::Video), TrackType::Screen)
        .await
        .unwrap();
    eventually("bob consumes the share", || {
        b.session
            .remote_tracks()
            .iter()
            .any(|info| info.track_type == TrackType::Screen)
    })
    .await;

    let err = b
        .session
        .add_local_track(StubTrack::new(MediaKind::Video), TrackType::Screen)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Remote {
            code: ErrorCode::ShareAlreadyActive,
            ..
        }
    ));

    a.session.remove_local_track(share).await.unwrap();
    eventually("bob drops the share", || b.session.remote_tracks().is_empty()).await;
}
