//! Per-process registry of live socket handles.
//!
//! Each accepted WebSocket gets a bounded outbound channel; the ws handler
//! task pumps frames from the channel into the actual socket. The registry
//! only ever holds channel senders, so delivery never awaits a raw socket
//! write while holding the lock -- senders are cloned out first, the lock is
//! released, and the writes happen afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::protocol::{SessionId, UserId};

/// Capacity of each connection's outbound frame channel.
pub const OUTBOUND_CAPACITY: usize = 64;

/// How long one delivery waits for space in a connection's outbound channel
/// before declaring the connection dead. Bounds the damage a stuck socket can
/// do to a fan-out pass.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Sending half of a connection's outbound frame channel.
#[derive(Clone)]
pub struct SocketHandle {
    tx: mpsc::Sender<String>,
}

impl SocketHandle {
    /// Create a handle plus the receiver its writer task drains.
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queue one frame. `false` means the connection is gone or stuck past
    /// [`SEND_TIMEOUT`] -- the caller treats it as dead.
    async fn send(&self, frame: String) -> bool {
        self.tx.send_timeout(frame, SEND_TIMEOUT).await.is_ok()
    }
}

struct Entry {
    handle: SocketHandle,
    session_id: SessionId,
    user_id: Option<UserId>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Entry>,
    by_session: HashMap<SessionId, Vec<String>>,
    by_user: HashMap<UserId, Vec<String>>,
}

impl Inner {
    fn remove(&mut self, connection_id: &str) -> bool {
        let Some(entry) = self.connections.remove(connection_id) else {
            return false;
        };
        let session_empty = match self.by_session.get_mut(&entry.session_id) {
            Some(ids) => {
                ids.retain(|id| id != connection_id);
                ids.is_empty()
            }
            None => false,
        };
        if session_empty {
            self.by_session.remove(&entry.session_id);
        }
        if let Some(user_id) = entry.user_id {
            let user_empty = match self.by_user.get_mut(&user_id) {
                Some(ids) => {
                    ids.retain(|id| id != connection_id);
                    ids.is_empty()
                }
                None => false,
            };
            if user_empty {
                self.by_user.remove(&user_id);
            }
        }
        true
    }
}

/// Result of one local fan-out pass. Connections in `failed` have already
/// been unregistered locally; the coordinator still owes them a directory
/// cleanup.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: Vec<String>,
}

/// Process-local map of connection id to live socket handle, with session
/// and user secondary indexes. All mutation goes through `register` /
/// `unregister`; empty index lists are deleted rather than left behind.
#[derive(Clone, Default)]
pub struct LocalRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection into the map and both indexes.
    ///
    /// A duplicate id overwrites the previous entry (last write wins); ids
    /// are random tokens so this is not expected in correct usage.
    pub fn register(
        &self,
        connection_id: &str,
        handle: SocketHandle,
        session_id: SessionId,
        user_id: Option<UserId>,
    ) {
        let mut inner = self.inner.write();
        inner.remove(connection_id);
        inner.connections.insert(
            connection_id.to_string(),
            Entry {
                handle,
                session_id,
                user_id,
            },
        );
        inner
            .by_session
            .entry(session_id)
            .or_default()
            .push(connection_id.to_string());
        if let Some(user_id) = user_id {
            inner
                .by_user
                .entry(user_id)
                .or_default()
                .push(connection_id.to_string());
        }
    }

    /// Remove a connection from the map and both indexes. Returns `false` if
    /// the id was not registered. The entry itself records its session and
    /// user, so callers only need the connection id.
    pub fn unregister(&self, connection_id: &str) -> bool {
        self.inner.write().remove(connection_id)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.inner.read().connections.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().connections.is_empty()
    }

    /// All registered connection ids.
    pub fn connection_ids(&self) -> Vec<String> {
        self.inner.read().connections.keys().cloned().collect()
    }

    /// Connection ids attached to one session.
    pub fn connections_for_session(&self, session_id: SessionId) -> Vec<String> {
        self.inner
            .read()
            .by_session
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Connection ids attached to one user.
    pub fn connections_for_user(&self, user_id: UserId) -> Vec<String> {
        self.inner
            .read()
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Write one frame to every connection indexed under `session_id`.
    ///
    /// Failed writes mark the connection dead; dead connections are excluded
    /// from the pass's mutations (the index is snapshotted up front) and
    /// unregistered after the pass completes.
    pub async fn deliver(&self, session_id: SessionId, frame: &str) -> DeliveryReport {
        let ids = self.connections_for_session(session_id);
        self.deliver_to(&ids, frame).await
    }

    /// Write one frame to a specific set of connection ids. Ids not present
    /// locally are skipped (not counted as failures -- the caller decides
    /// what a directory/registry mismatch means).
    pub async fn deliver_to(&self, connection_ids: &[String], frame: &str) -> DeliveryReport {
        let targets: Vec<(String, SocketHandle)> = {
            let inner = self.inner.read();
            connection_ids
                .iter()
                .filter_map(|id| {
                    inner
                        .connections
                        .get(id)
                        .map(|entry| (id.clone(), entry.handle.clone()))
                })
                .collect()
        };

        let mut report = DeliveryReport::default();
        for (connection_id, handle) in targets {
            if handle.send(frame.to_string()).await {
                report.sent += 1;
            } else {
                tracing::debug!(%connection_id, "socket write failed, marking connection dead");
                report.failed.push(connection_id);
            }
        }

        for connection_id in &report.failed {
            self.unregister(connection_id);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_one(registry: &LocalRegistry, id: &str, session: SessionId, user: Option<UserId>)
        -> mpsc::Receiver<String>
    {
        let (handle, rx) = SocketHandle::channel();
        registry.register(id, handle, session, user);
        rx
    }

    #[test]
    fn register_populates_indexes() {
        let registry = LocalRegistry::new();
        let _rx = register_one(&registry, "c1", 42, Some(7));
        assert!(registry.contains("c1"));
        assert_eq!(registry.connections_for_session(42), vec!["c1"]);
        assert_eq!(registry.connections_for_user(7), vec!["c1"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_clears_empty_index_lists() {
        let registry = LocalRegistry::new();
        let _rx = register_one(&registry, "c1", 42, Some(7));
        assert!(registry.unregister("c1"));
        assert!(registry.connections_for_session(42).is_empty());
        assert!(registry.connections_for_user(7).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_unknown_id_is_noop() {
        let registry = LocalRegistry::new();
        assert!(!registry.unregister("ghost"));
    }

    #[test]
    fn duplicate_register_last_write_wins() {
        let registry = LocalRegistry::new();
        let _rx1 = register_one(&registry, "c1", 42, None);
        let _rx2 = register_one(&registry, "c1", 43, None);
        assert_eq!(registry.len(), 1);
        assert!(registry.connections_for_session(42).is_empty());
        assert_eq!(registry.connections_for_session(43), vec!["c1"]);
    }

    #[test]
    fn connection_without_user_skips_user_index() {
        let registry = LocalRegistry::new();
        let _rx = register_one(&registry, "c1", 42, None);
        assert!(registry.connections_for_user(7).is_empty());
    }

    #[tokio::test]
    async fn deliver_writes_to_all_session_connections() {
        let registry = LocalRegistry::new();
        let mut rx1 = register_one(&registry, "c1", 42, None);
        let mut rx2 = register_one(&registry, "c2", 42, None);
        let _other = register_one(&registry, "c3", 99, None);

        let report = registry.deliver(42, "hello").await;
        assert_eq!(report.sent, 2);
        assert!(report.failed.is_empty());
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn deliver_to_empty_session_sends_nothing() {
        let registry = LocalRegistry::new();
        let report = registry.deliver(42, "hello").await;
        assert_eq!(report.sent, 0);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn dead_connection_is_unregistered_after_pass() {
        let registry = LocalRegistry::new();
        let rx1 = register_one(&registry, "dead", 42, None);
        let mut rx2 = register_one(&registry, "live", 42, None);
        drop(rx1);

        let report = registry.deliver(42, "hello").await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, vec!["dead"]);
        assert!(!registry.contains("dead"));
        assert!(registry.contains("live"));
        assert_eq!(rx2.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn repeated_deliver_writes_repeated_frames() {
        // No dedup: the same payload twice means two frames on the socket.
        let registry = LocalRegistry::new();
        let mut rx = register_one(&registry, "c1", 42, None);

        registry.deliver(42, "ping").await;
        registry.deliver(42, "ping").await;

        assert_eq!(rx.recv().await.unwrap(), "ping");
        assert_eq!(rx.recv().await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn deliver_to_skips_ids_not_registered_locally() {
        let registry = LocalRegistry::new();
        let mut rx = register_one(&registry, "c1", 42, None);

        let ids = vec!["c1".to_string(), "remote".to_string()];
        let report = registry.deliver_to(&ids, "hello").await;
        assert_eq!(report.sent, 1);
        assert!(report.failed.is_empty());
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }
}
