//! Delivery coordinator: one object owning the local registry, the shared
//! directory, and the pub/sub bridge.
//!
//! Constructed once per process and handed by clone to every request
//! context. `send_to_session` does the dual-path send: best-effort broker
//! publish for remote processes, immediate local fan-out for sockets on this
//! process, authoritative recipient count from the directory. Store failures
//! never propagate to the collaborator; the affected operation degrades to
//! local-only and is logged through [`Coordinator::degraded`].

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, PubSubBridge};
use crate::directory::Directory;
use crate::lifecycle::Lifecycle;
use crate::protocol::{Envelope, SessionId, SessionInfo, UserId};
use crate::registry::{LocalRegistry, SocketHandle};
use crate::store::{SharedStore, StoreError};

/// Generate a process-unique connection id.
///
/// High-entropy random token; cross-process uniqueness is probabilistic, not
/// enforced -- the directory keyspace relies on collisions being negligible.
pub fn generate_connection_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Short identifier for this server process.
fn generate_server_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Clone)]
pub struct Coordinator {
    registry: LocalRegistry,
    directory: Directory,
    bridge: PubSubBridge,
    store: SharedStore,
    server_id: String,
    lifecycle: Arc<Lifecycle>,
}

impl Coordinator {
    pub fn new(store: SharedStore, ttl_secs: u64) -> Self {
        Self::with_server_id(store, ttl_secs, &generate_server_id())
    }

    /// Construct with an explicit server id (config override, tests modeling
    /// multiple processes).
    pub fn with_server_id(store: SharedStore, ttl_secs: u64, server_id: &str) -> Self {
        Self {
            registry: LocalRegistry::new(),
            directory: Directory::new(store.clone(), ttl_secs),
            bridge: PubSubBridge::new(store.clone(), server_id),
            store,
            server_id: server_id.to_string(),
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Ping the store and start the broker listener. Idempotent.
    ///
    /// This is the one store failure allowed to surface to a caller: the
    /// bootstrap logs it and keeps the rest of the service running in
    /// local-only mode.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        if self.lifecycle.is_initialized() {
            tracing::debug!(server_id = %self.server_id, "coordinator already initialized");
            return Ok(());
        }

        self.store.ping().await?;
        let subscription = self.bridge.subscribe().await?;

        let cancel = CancellationToken::new();
        let this = self.clone();
        let task = tokio::spawn(bridge::listen(
            subscription,
            cancel.clone(),
            move |session_id, envelope| {
                let coordinator = this.clone();
                async move {
                    coordinator.dispatch_broker_message(session_id, envelope).await;
                }
            },
        ));
        self.lifecycle.install(cancel, task).await;

        tracing::info!(server_id = %self.server_id, "session relay initialized");
        Ok(())
    }

    /// Cancel and join the listener. Safe to call repeatedly or without a
    /// prior `initialize`.
    pub async fn cleanup(&self) {
        self.lifecycle.cleanup().await;
        tracing::info!(server_id = %self.server_id, "session relay cleanup complete");
    }

    /// Register an accepted socket locally and record it in the directory.
    ///
    /// The handshake accept itself happens in the transport layer before
    /// this is called; a directory write failure is swallowed (the socket
    /// still works for local delivery).
    pub async fn connect(
        &self,
        connection_id: &str,
        handle: SocketHandle,
        session_id: SessionId,
        user_id: Option<UserId>,
    ) {
        self.registry
            .register(connection_id, handle, session_id, user_id);

        match self
            .directory
            .connect(connection_id, session_id, &self.server_id, user_id)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    %connection_id,
                    session_id,
                    server_id = %self.server_id,
                    "connection registered"
                );
            }
            Err(err) => self.degraded("directory connect", &err),
        }
    }

    /// Tear down a connection. Always succeeds from the caller's view; an
    /// unknown id is a no-op.
    pub async fn disconnect(&self, connection_id: &str) {
        self.registry.unregister(connection_id);
        match self.directory.disconnect(connection_id).await {
            Ok(Some(session_id)) => {
                tracing::info!(%connection_id, session_id, "connection removed");
            }
            Ok(None) => {
                tracing::debug!(%connection_id, "disconnect for unknown connection, ignoring");
            }
            Err(err) => self.degraded("directory disconnect", &err),
        }
    }

    /// Deliver an event to every connection attached to a session, on any
    /// process.
    ///
    /// Publishes to the broker first (best effort -- a publish failure must
    /// not abort local delivery), then fans out to local sockets without
    /// waiting for the broker round-trip, then returns the directory's
    /// authoritative count. When the directory is unreachable the local
    /// count is returned instead.
    pub async fn send_to_session(
        &self,
        session_id: SessionId,
        event: Map<String, Value>,
    ) -> usize {
        match self.bridge.publish(session_id, event.clone()).await {
            Ok(subscribers) => {
                tracing::debug!(session_id, subscribers, "event published to broker");
            }
            Err(err) => self.degraded("broker publish", &err),
        }

        let frame = Value::Object(event).to_string();
        let local_count = self.deliver_local(session_id, &frame).await;

        match self.directory.count(session_id).await {
            Ok(total) => {
                tracing::debug!(session_id, local_count, total, "event delivered");
                total
            }
            Err(err) => {
                self.degraded("directory count", &err);
                local_count
            }
        }
    }

    /// Authoritative cross-process connection count for a session; falls
    /// back to the local index when the directory is unreachable.
    pub async fn get_session_connection_count(&self, session_id: SessionId) -> usize {
        match self.directory.count(session_id).await {
            Ok(count) => count,
            Err(err) => {
                self.degraded("directory count", &err);
                self.registry.connections_for_session(session_id).len()
            }
        }
    }

    /// Diagnostic snapshot combining the directory view with the local one.
    pub async fn get_session_info(&self, session_id: SessionId) -> SessionInfo {
        let (remote_connection_ids, total_connections) =
            match self.directory.entries(session_id).await {
                Ok(entries) => {
                    let mut ids: Vec<String> =
                        entries.entries.iter().map(|(id, _)| id.clone()).collect();
                    ids.extend(entries.corrupt.iter().cloned());
                    let total = ids.len();
                    (ids, total)
                }
                Err(err) => {
                    self.degraded("directory read", &err);
                    (Vec::new(), 0)
                }
            };
        let connection_count = match self.directory.counter_value(session_id).await {
            Ok(value) => value,
            Err(err) => {
                self.degraded("directory counter read", &err);
                0
            }
        };

        SessionInfo {
            session_id,
            total_connections,
            connection_count,
            local_connections: self.registry.connection_ids(),
            server_id: self.server_id.clone(),
            remote_connection_ids,
        }
    }

    /// Listener callback: forward a broker message to local sockets. The
    /// replicated frame carries the origin `server_id`; self-published
    /// messages arrive here too and are delivered like any other.
    async fn dispatch_broker_message(&self, session_id: SessionId, envelope: Envelope) {
        let frame = match serde_json::to_string(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(session_id, "failed to re-serialize broker message: {err}");
                return;
            }
        };
        self.deliver_local(session_id, &frame).await;
    }

    /// Shared local-delivery path for both the direct send and the listener.
    ///
    /// The write set is the directory's entries for this session filtered to
    /// this process's server id. Entries recorded as ours but missing from
    /// the local registry are crash/leak residue and are purged from the
    /// directory opportunistically. When the directory is unreachable the
    /// local session index drives the fan-out instead.
    async fn deliver_local(&self, session_id: SessionId, frame: &str) -> usize {
        let report = match self.directory.entries(session_id).await {
            Ok(entries) => {
                let mut local_ids = Vec::new();
                let mut stale = entries.corrupt;
                for (connection_id, info) in entries.entries {
                    if info.server_id != self.server_id {
                        continue;
                    }
                    if self.registry.contains(&connection_id) {
                        local_ids.push(connection_id);
                    } else {
                        stale.push(connection_id);
                    }
                }

                for connection_id in stale {
                    tracing::warn!(
                        %connection_id,
                        session_id,
                        "directory entry without local socket, purging"
                    );
                    if let Err(err) = self.directory.disconnect(&connection_id).await {
                        self.degraded("stale entry purge", &err);
                    }
                }

                self.registry.deliver_to(&local_ids, frame).await
            }
            Err(err) => {
                self.degraded("directory read", &err);
                self.registry.deliver(session_id, frame).await
            }
        };

        // Dead sockets were already dropped from the local indexes; finish
        // the job in the directory.
        for connection_id in &report.failed {
            if let Err(err) = self.directory.disconnect(connection_id).await {
                self.degraded("dead connection cleanup", &err);
            }
        }
        report.sent
    }

    /// Named absorb-point for store failures: log and continue local-only.
    fn degraded(&self, operation: &str, err: &StoreError) {
        tracing::warn!(
            server_id = %self.server_id,
            operation,
            "shared store unavailable, continuing in local-only mode: {err}"
        );
    }
}
