//! HTTP and WebSocket front end
//!
//! Every WebSocket carries JSON text frames for one signaling
//! [`Connection`]. Outgoing frames go through a bounded queue drained by a
//! writer task; incoming frames are handled concurrently and answered
//! through the same queue. A connection whose queue overflows is closed.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use huddle_proto::{ClientFrame, ErrorBody, ErrorCode, RoomListing, ServerFrame};
use huddle_sfu::{Connection, SignalingService};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SignalingService>,
    pub server: Arc<ServerConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&state.server.ws_path, get(ws_handler))
        .route("/rooms", get(list_rooms))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomListing>> {
    Json(state.service.manager().rooms_info())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let manager = state.service.manager();
    Json(json!({
        "status": "ok",
        "rooms": manager.room_count(),
        "peers": manager.peer_count(),
    }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.server.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(state.server.outbound_queue);
    let connection = Arc::new(state.service.connect(tx.clone()));
    let connection_id = connection.id().clone();
    info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();

    let writer = {
        let connection_id = connection_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(connection_id = %connection_id, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(connection_id = %connection_id, error = %e, "WebSocket send failed");
                    break;
                }
            }
        })
    };

    loop {
        let message = tokio::select! {
            () = connection.evicted() => {
                warn!(connection_id = %connection_id, "Outbound queue overflowed, closing connection");
                break;
            }
            message = stream.next() => message,
        };
        let Some(message) = message else { break };
        match message {
            Ok(Message::Text(text)) => dispatch(&connection, &tx, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    connection.disconnect();
    writer.abort();
    info!(connection_id = %connection_id, "WebSocket connection closed");
}

async fn dispatch(connection: &Arc<Connection>, tx: &mpsc::Sender<ServerFrame>, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => {
            let connection = Arc::clone(connection);
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = connection.handle_frame(frame).await;
                let _ = tx.send(reply).await;
            });
        }
        Err(e) => {
            warn!(connection_id = %connection.id(), error = %e, "Malformed signaling frame");
            let reply = ServerFrame::Error {
                id: request_id_hint(text),
                error: ErrorBody::new(ErrorCode::InvalidRequest, e.to_string()),
            };
            let _ = tx.send(reply).await;
        }
    }
}

/// Best-effort correlation id of a frame that failed to parse; 0 if none
fn request_id_hint(text: &str) -> u64 {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("id").and_then(Value::as_u64))
        .unwrap_or(0)
}
