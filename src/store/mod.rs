//! Shared key/value + pub/sub store behind one seam.
//!
//! Everything the directory and bridge need from the external store goes
//! through [`SharedStore`], so the core (and its tests) never depend on a
//! live Redis server. The enum dispatch keeps all futures `Send` without
//! boxing every call.

pub mod memory;
pub mod redis;

use futures::stream::BoxStream;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// One message received through a pattern subscription.
#[derive(Debug, Clone)]
pub struct StoreMessage {
    /// Concrete channel the message was published to (not the pattern).
    pub channel: String,
    /// Raw payload as published.
    pub payload: String,
}

/// Stream of messages from a pattern subscription. The subscription is
/// released when the stream is dropped.
pub type Subscription = BoxStream<'static, StoreMessage>;

/// Errors surfaced by store operations.
///
/// Callers in this crate treat every transport failure as "operation had no
/// effect": they log it and degrade to local-only behavior rather than
/// propagating it to the collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(#[from] ::redis::RedisError),

    #[error("store subscribe failed: {0}")]
    Subscribe(String),

    #[error("store value decode failed: {0}")]
    Decode(String),
}

/// A shared store backend.
///
/// `Redis` is the production backend. `Memory` is a single-process stand-in
/// with the same TTL and pub/sub semantics, used by tests and as a fallback
/// when no store URL is configured.
#[derive(Clone)]
pub enum SharedStore {
    Redis(RedisStore),
    Memory(MemoryStore),
}

impl SharedStore {
    /// Round-trip liveness check.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Self::Redis(s) => s.ping().await,
            Self::Memory(s) => s.ping().await,
        }
    }

    /// Set one hash field. Does NOT touch the hash's own expiry; callers that
    /// need a bounded lifetime must follow up with [`expire`](Self::expire).
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        match self {
            Self::Redis(s) => s.hset(key, field, value).await,
            Self::Memory(s) => s.hset(key, field, value).await,
        }
    }

    /// Delete one hash field. Missing key or field is not an error.
    pub async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        match self {
            Self::Redis(s) => s.hdel(key, field).await,
            Self::Memory(s) => s.hdel(key, field).await,
        }
    }

    /// Number of fields in a hash; 0 if the key does not exist.
    pub async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        match self {
            Self::Redis(s) => s.hlen(key).await,
            Self::Memory(s) => s.hlen(key).await,
        }
    }

    /// All field/value pairs of a hash; empty if the key does not exist.
    pub async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        match self {
            Self::Redis(s) => s.hgetall(key).await,
            Self::Memory(s) => s.hgetall(key).await,
        }
    }

    /// Set a string key with an expiry in seconds.
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        match self {
            Self::Redis(s) => s.set_ex(key, value, ttl_secs).await,
            Self::Memory(s) => s.set_ex(key, value, ttl_secs).await,
        }
    }

    /// Read a string key. `None` if missing or expired.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            Self::Redis(s) => s.get_string(key).await,
            Self::Memory(s) => s.get_string(key).await,
        }
    }

    /// Delete a key. Missing key is not an error.
    pub async fn del(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Redis(s) => s.del(key).await,
            Self::Memory(s) => s.del(key).await,
        }
    }

    /// Increment an integer key, creating it at 0 first if missing.
    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        match self {
            Self::Redis(s) => s.incr(key).await,
            Self::Memory(s) => s.incr(key).await,
        }
    }

    /// Decrement an integer key, creating it at 0 first if missing.
    pub async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        match self {
            Self::Redis(s) => s.decr(key).await,
            Self::Memory(s) => s.decr(key).await,
        }
    }

    /// Reset a key's expiry. Individual hash-field writes never extend the
    /// hash's own TTL, so directory writes call this after every `hset`.
    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        match self {
            Self::Redis(s) => s.expire(key, ttl_secs).await,
            Self::Memory(s) => s.expire(key, ttl_secs).await,
        }
    }

    /// Publish a payload to a channel. Returns the number of subscribers the
    /// broker reports having delivered to.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, StoreError> {
        match self {
            Self::Redis(s) => s.publish(channel, payload).await,
            Self::Memory(s) => s.publish(channel, payload).await,
        }
    }

    /// Open a pattern subscription (`prefix*` style patterns).
    pub async fn psubscribe(&self, pattern: &str) -> Result<Subscription, StoreError> {
        match self {
            Self::Redis(s) => s.psubscribe(pattern).await,
            Self::Memory(s) => s.psubscribe(pattern).await,
        }
    }
}
