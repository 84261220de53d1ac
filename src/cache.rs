//! Cache adapter: string values under string keys with per-key expiry.
//!
//! Nothing outside the aggregation engine sees a [`CacheError`]; a failed
//! read is a miss, a failed write is a log line.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[async_trait]
pub trait CacheStore: Send + Sync {
    // ---
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;
}

/// Redis-backed cache. `ConnectionManager` reconnects on its own and is cheap
/// to clone, so each call works on its own handle.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    // ---
    pub async fn connect(url: &str) -> CacheResult<Self> {
        // ---
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        // ---
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        // ---
        // Redis rejects EX 0
        let seconds = ttl.as_secs().max(1);
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        // ---
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
