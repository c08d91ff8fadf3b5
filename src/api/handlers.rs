use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coordinator::generate_connection_id;
use crate::protocol::{SessionId, SessionInfo, UserId};
use crate::registry::SocketHandle;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Deserialize)]
pub(super) struct AttachParams {
    user_id: Option<UserId>,
}

pub(super) async fn ws_attach(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    Query(params): Query<AttachParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_attach(socket, state, session_id, params.user_id))
}

async fn handle_ws_attach(
    socket: WebSocket,
    state: AppState,
    session_id: SessionId,
    user_id: Option<UserId>,
) {
    let connection_id = generate_connection_id();
    let (handle, mut outbound_rx) = SocketHandle::channel();
    state
        .relay
        .connect(&connection_id, handle, session_id, user_id)
        .await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Pump queued frames out; drain the inbound side only for close/error.
    // Event delivery is one-way, so inbound data frames are ignored.
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // Unregistered elsewhere (dead-socket cleanup).
                    None => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.relay.disconnect(&connection_id).await;
}

#[derive(Serialize)]
pub(super) struct BroadcastResponse {
    delivered: usize,
}

/// Narrow publish interface for the business layer: deliver event E to
/// session S.
pub(super) async fn broadcast_event(
    Path(session_id): Path<SessionId>,
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    let Value::Object(event) = body else {
        return Err(ApiError::InvalidRequest("body must be a JSON object".into()));
    };
    let delivered = state.relay.send_to_session(session_id, event).await;
    Ok(Json(BroadcastResponse { delivered }))
}

#[derive(Serialize)]
pub(super) struct CountResponse {
    session_id: SessionId,
    count: usize,
}

pub(super) async fn connection_count(
    Path(session_id): Path<SessionId>,
    State(state): State<AppState>,
) -> Json<CountResponse> {
    let count = state.relay.get_session_connection_count(session_id).await;
    Json(CountResponse { session_id, count })
}

pub(super) async fn session_info(
    Path(session_id): Path<SessionId>,
    State(state): State<AppState>,
) -> Json<SessionInfo> {
    Json(state.relay.get_session_info(session_id).await)
}
