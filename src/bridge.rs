//! Pub/sub bridge between this process and the shared broker.
//!
//! Outbound: events are wrapped in an [`Envelope`] (payload plus this
//! process's `server_id`) and published to the session's channel. Inbound:
//! one long-lived pattern subscription over all session channels feeds every
//! published message -- including this process's own -- into the local
//! delivery path. Self-messages are intentionally not filtered; see
//! [`Envelope`] for why.

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    parse_session_channel, session_channel, Envelope, SessionId, SESSION_CHANNEL_PATTERN,
};
use crate::store::{SharedStore, StoreError, Subscription};

#[derive(Clone)]
pub struct PubSubBridge {
    store: SharedStore,
    server_id: String,
}

impl PubSubBridge {
    pub fn new(store: SharedStore, server_id: &str) -> Self {
        Self {
            store,
            server_id: server_id.to_string(),
        }
    }

    /// Publish an event to the session's channel, stamped with this
    /// process's server id. Returns the broker's subscriber count.
    pub async fn publish(
        &self,
        session_id: SessionId,
        event: Map<String, Value>,
    ) -> Result<i64, StoreError> {
        let envelope = Envelope::new(&self.server_id, event);
        let payload = serde_json::to_string(&envelope)
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        self.store
            .publish(&session_channel(session_id), &payload)
            .await
    }

    /// Open the pattern subscription covering every session channel.
    pub async fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.store.psubscribe(SESSION_CHANNEL_PATTERN).await
    }
}

/// Drive a subscription until cancelled, handing each decoded message to
/// `dispatch`.
///
/// One malformed message must never end cross-process delivery for the whole
/// process, so per-message decode failures are logged and the loop moves on.
/// The loop exits when the token fires or the broker closes the stream.
pub async fn listen<F, Fut>(mut subscription: Subscription, cancel: CancellationToken, dispatch: F)
where
    F: Fn(SessionId, Envelope) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("listener cancelled");
                break;
            }
            message = subscription.next() => match message {
                Some(message) => message,
                None => {
                    tracing::warn!("broker subscription closed, cross-process delivery stopped");
                    break;
                }
            },
        };

        let Some(session_id) = parse_session_channel(&message.channel) else {
            tracing::warn!(channel = %message.channel, "message on unrecognized channel");
            continue;
        };
        let envelope: Envelope = match serde_json::from_str(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(session_id, "dropping malformed broker message: {err}");
                continue;
            }
        };

        tracing::debug!(session_id, origin = %envelope.server_id, "broker message received");
        dispatch(session_id, envelope).await;
    }
}
