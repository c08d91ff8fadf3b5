//! HTTP/WebSocket surface consumed by the business layer.
//!
//! Deliberately narrow: a WebSocket attach endpoint per session, the publish
//! endpoint (`send_to_session` over HTTP), and two diagnostic reads.
//! Authentication of the handshake is the collaborator's concern, not ours.

pub mod error;
mod handlers;

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub relay: Coordinator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/ws/{session_id}", get(ws_attach))
        .route("/sessions/{session_id}/events", post(broadcast_event))
        .route(
            "/sessions/{session_id}/connections/count",
            get(connection_count),
        )
        .route("/sessions/{session_id}/info", get(session_info))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    bind: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "relay API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
