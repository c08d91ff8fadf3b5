//! In-process store backend with real TTL and pub/sub semantics.
//!
//! Used by the test suites and as the fallback backend when no store URL is
//! configured (single-process deployments still get working local fan-out).
//! Expiry is lazy: keys past their deadline are dropped on next access.
//! Deadlines use `tokio::time::Instant`, so tests can drive expiry with a
//! paused clock.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::BroadcastStream;

use super::{StoreError, StoreMessage, Subscription};

/// Capacity of the in-process pub/sub channel. A lagged subscriber drops
/// messages, mirroring Redis pub/sub's fire-and-forget delivery.
const PUBSUB_CAPACITY: usize = 256;

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    deadlines: HashMap<String, Instant>,
}

impl State {
    /// Drop the key if its deadline has passed. Called before every access.
    fn evict_if_expired(&mut self, key: &str) {
        let expired = self
            .deadlines
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now());
        if expired {
            self.deadlines.remove(key);
            self.hashes.remove(key);
            self.strings.remove(key);
        }
    }

    fn remove(&mut self, key: &str) {
        self.hashes.remove(key);
        self.strings.remove(key);
        self.deadlines.remove(key);
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    pubsub: broadcast::Sender<StoreMessage>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            pubsub,
            unreachable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate the backing store dropping off the network. While set, every
    /// operation returns a transport error; subscriptions already open keep
    /// their stream (they fail at the next open, like a broken connection
    /// that has not been re-established).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::Relaxed) {
            let err = io::Error::new(io::ErrorKind::ConnectionRefused, "store unreachable");
            return Err(StoreError::Transport(err.into()));
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        let now_empty = match state.hashes.get_mut(key) {
            Some(hash) => {
                hash.remove(field);
                hash.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.hashes.remove(key);
            state.deadlines.remove(key);
        }
        Ok(())
    }

    pub async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        Ok(state.hashes.get(key).map_or(0, HashMap::len))
    }

    pub async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        Ok(state
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.strings.insert(key.to_string(), value.to_string());
        state
            .deadlines
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        Ok(state.strings.get(key).cloned())
    }

    pub async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.state.lock().remove(key);
        Ok(())
    }

    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, 1)
    }

    pub async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, -1)
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        let current: i64 = match state.strings.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Decode(format!("non-integer value at {key}")))?,
            None => 0,
        };
        let next = current + delta;
        state.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        state.evict_if_expired(key);
        if state.hashes.contains_key(key) || state.strings.contains_key(key) {
            state
                .deadlines
                .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, StoreError> {
        self.check_reachable()?;
        let message = StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // Err means no subscribers, which matches Redis returning 0.
        Ok(self.pubsub.send(message).map_or(0, |n| n as i64))
    }

    /// Open a pattern subscription. Supports the `prefix*` glob shape used by
    /// the session channel namespace; other patterns match by equality.
    pub async fn psubscribe(&self, pattern: &str) -> Result<Subscription, StoreError> {
        self.check_reachable()?;
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(self.pubsub.subscribe()).filter_map(move |result| {
            let matched = match &result {
                Ok(message) => channel_matches(&pattern, &message.channel),
                // A lagged subscriber skips what it missed.
                Err(_) => false,
            };
            futures::future::ready(matched.then(|| result.ok()).flatten())
        });
        Ok(stream.boxed())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => channel == pattern,
    }
}
