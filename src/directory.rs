//! Cross-process connection directory on the shared store.
//!
//! Sole authority for which connections exist and which process owns them.
//! Three keys per the interop contract: the per-session connections hash,
//! the connection-to-session reverse mapping, and a diagnostic counter. All
//! carry the same TTL so crashed processes' entries age out on their own.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::{
    connection_session_key, session_connections_key, session_counter_key, ConnectionInfo,
    SessionId, UserId,
};
use crate::store::{SharedStore, StoreError};

/// Directory read of one session's hash, with unparseable fields split out
/// so the caller can purge them.
#[derive(Debug, Default)]
pub struct SessionEntries {
    pub entries: Vec<(String, ConnectionInfo)>,
    /// Fields whose value failed to deserialize. Treated as dead weight.
    pub corrupt: Vec<String>,
}

#[derive(Clone)]
pub struct Directory {
    store: SharedStore,
    ttl_secs: u64,
}

impl Directory {
    pub fn new(store: SharedStore, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Record a connection in the directory.
    ///
    /// Writes the hash field, then resets the whole-hash TTL -- a field write
    /// alone never extends the hash's expiry, so the order of those two calls
    /// is load-bearing. Also writes the reverse mapping and bumps the
    /// diagnostic counter, each with the same TTL.
    pub async fn connect(
        &self,
        connection_id: &str,
        session_id: SessionId,
        server_id: &str,
        user_id: Option<UserId>,
    ) -> Result<(), StoreError> {
        let info = ConnectionInfo {
            server_id: server_id.to_string(),
            user_id,
            connected_at: unix_now(),
            status: "active".to_string(),
        };
        let value = serde_json::to_string(&info)
            .map_err(|err| StoreError::Decode(err.to_string()))?;

        let hash_key = session_connections_key(session_id);
        self.store.hset(&hash_key, connection_id, &value).await?;
        self.store.expire(&hash_key, self.ttl_secs).await?;

        self.store
            .set_ex(
                &connection_session_key(connection_id),
                &session_id.to_string(),
                self.ttl_secs,
            )
            .await?;

        let counter_key = session_counter_key(session_id);
        self.store.incr(&counter_key).await?;
        self.store.expire(&counter_key, self.ttl_secs).await?;
        Ok(())
    }

    /// Remove a connection from the directory.
    ///
    /// The reverse mapping supplies the session id, so callers only need the
    /// connection id. A missing reverse mapping means the connection was
    /// already cleaned up (or never registered) -- a no-op, not an error.
    /// Returns the session id that was cleaned, if any.
    pub async fn disconnect(&self, connection_id: &str) -> Result<Option<SessionId>, StoreError> {
        let reverse_key = connection_session_key(connection_id);
        let Some(raw) = self.store.get_string(&reverse_key).await? else {
            return Ok(None);
        };
        let session_id: SessionId = raw
            .parse()
            .map_err(|_| StoreError::Decode(format!("bad session id in {reverse_key}: {raw}")))?;

        self.store
            .hdel(&session_connections_key(session_id), connection_id)
            .await?;
        self.store.del(&reverse_key).await?;
        // Gated on the reverse mapping existing, so the counter never drops
        // below the number of live entries from double disconnects.
        self.store.decr(&session_counter_key(session_id)).await?;
        Ok(Some(session_id))
    }

    /// Authoritative number of connections for a session across all
    /// processes. 0 when the session key does not exist.
    pub async fn count(&self, session_id: SessionId) -> Result<usize, StoreError> {
        self.store.hlen(&session_connections_key(session_id)).await
    }

    /// Read every directory entry for a session.
    pub async fn entries(&self, session_id: SessionId) -> Result<SessionEntries, StoreError> {
        let raw = self
            .store
            .hgetall(&session_connections_key(session_id))
            .await?;
        let mut result = SessionEntries::default();
        for (connection_id, value) in raw {
            match serde_json::from_str::<ConnectionInfo>(&value) {
                Ok(info) => result.entries.push((connection_id, info)),
                Err(err) => {
                    tracing::warn!(%connection_id, "corrupt directory entry: {err}");
                    result.corrupt.push(connection_id);
                }
            }
        }
        Ok(result)
    }

    /// Current value of the diagnostic counter. 0 when missing.
    pub async fn counter_value(&self, session_id: SessionId) -> Result<i64, StoreError> {
        let raw = self
            .store
            .get_string(&session_counter_key(session_id))
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_DIRECTORY_TTL_SECS;
    use crate::store::MemoryStore;

    fn directory() -> (Directory, SharedStore) {
        let store = SharedStore::Memory(MemoryStore::new());
        (
            Directory::new(store.clone(), DEFAULT_DIRECTORY_TTL_SECS),
            store,
        )
    }

    #[tokio::test]
    async fn connect_writes_all_three_keys() {
        let (dir, store) = directory();
        dir.connect("c1", 42, "srv-a", Some(7)).await.unwrap();

        assert_eq!(dir.count(42).await.unwrap(), 1);
        assert_eq!(
            store
                .get_string("connection:c1:session")
                .await
                .unwrap()
                .as_deref(),
            Some("42")
        );
        assert_eq!(dir.counter_value(42).await.unwrap(), 1);

        let entries = dir.entries(42).await.unwrap();
        assert_eq!(entries.entries.len(), 1);
        let (id, info) = &entries.entries[0];
        assert_eq!(id, "c1");
        assert_eq!(info.server_id, "srv-a");
        assert_eq!(info.user_id, Some(7));
        assert_eq!(info.status, "active");
    }

    #[tokio::test]
    async fn disconnect_cleans_up_and_returns_session() {
        let (dir, store) = directory();
        dir.connect("c1", 42, "srv-a", None).await.unwrap();

        assert_eq!(dir.disconnect("c1").await.unwrap(), Some(42));
        assert_eq!(dir.count(42).await.unwrap(), 0);
        assert_eq!(store.get_string("connection:c1:session").await.unwrap(), None);
        assert_eq!(dir.counter_value(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disconnect_unknown_connection_is_noop() {
        let (dir, _store) = directory();
        assert_eq!(dir.disconnect("ghost").await.unwrap(), None);
        // The counter is untouched, never negative.
        assert_eq!(dir.counter_value(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn double_disconnect_decrements_once() {
        let (dir, _store) = directory();
        dir.connect("c1", 42, "srv-a", None).await.unwrap();
        dir.disconnect("c1").await.unwrap();
        assert_eq!(dir.disconnect("c1").await.unwrap(), None);
        assert_eq!(dir.counter_value(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn count_tracks_connect_disconnect_sequences() {
        let (dir, _store) = directory();
        dir.connect("c1", 42, "srv-a", None).await.unwrap();
        dir.connect("c2", 42, "srv-a", None).await.unwrap();
        dir.connect("c3", 42, "srv-b", None).await.unwrap();
        dir.disconnect("c2").await.unwrap();
        assert_eq!(dir.count(42).await.unwrap(), 2);
        assert_eq!(dir.counter_value(42).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn corrupt_entries_are_reported_separately() {
        let (dir, store) = directory();
        dir.connect("good", 42, "srv-a", None).await.unwrap();
        store
            .hset("session:42:connections", "bad", "not-json")
            .await
            .unwrap();

        let entries = dir.entries(42).await.unwrap();
        assert_eq!(entries.entries.len(), 1);
        assert_eq!(entries.corrupt, vec!["bad"]);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_without_explicit_disconnect() {
        let store = SharedStore::Memory(MemoryStore::new());
        let dir = Directory::new(store, 60);
        dir.connect("c1", 42, "srv-a", None).await.unwrap();
        assert_eq!(dir.count(42).await.unwrap(), 1);

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        assert_eq!(dir.count(42).await.unwrap(), 0);
        assert_eq!(dir.counter_value(42).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_refreshes_hash_ttl() {
        let store = SharedStore::Memory(MemoryStore::new());
        let dir = Directory::new(store, 60);
        dir.connect("c1", 42, "srv-a", None).await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(50)).await;
        dir.connect("c2", 42, "srv-a", None).await.unwrap();
        tokio::time::advance(std::time::Duration::from_secs(50)).await;
        // The second connect reset the hash deadline, so both survive.
        assert_eq!(dir.count(42).await.unwrap(), 2);
    }
}
