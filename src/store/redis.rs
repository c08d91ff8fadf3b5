//! Redis backend for the shared store.
//!
//! Commands go over one multiplexed connection shared by every caller; the
//! pattern subscription gets its own dedicated connection, as Redis requires.
//! Dropping the subscription stream releases that connection.

use std::collections::HashMap;

use futures::StreamExt;
use redis::AsyncCommands;

use super::{StoreError, StoreMessage, Subscription};

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// Open a client and establish the shared command connection.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    pub async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.hlen(key).await?;
        Ok(len)
    }

    pub async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1i64).await?;
        Ok(value)
    }

    pub async fn decr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.decr(key, 1i64).await?;
        Ok(value)
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl_secs as i64).await?;
        Ok(())
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    /// Open a pattern subscription on a dedicated pub/sub connection.
    pub async fn psubscribe(&self, pattern: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    tracing::warn!(%channel, "dropping non-UTF8 pub/sub payload: {err}");
                    None
                }
            };
            futures::future::ready(payload.map(|payload| StoreMessage { channel, payload }))
        });
        Ok(stream.boxed())
    }
}
