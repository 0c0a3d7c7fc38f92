//! Typed JSON cache over the Redis pool

use super::error::{CacheError, CacheResult};
use super::RedisPool;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait Cache<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &str) -> CacheResult<Option<T>>;

    /// `ttl = None` uses the cache's default TTL.
    async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;
}

#[derive(Clone)]
pub struct RedisCache {
    pool: RedisPool,
    default_ttl: Duration,
}

impl RedisCache {
    pub fn new(pool: RedisPool, default_ttl: Duration) -> Self {
        Self { pool, default_ttl }
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }
}

#[async_trait]
impl<T> Cache<T> for RedisCache
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> CacheResult<Option<T>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;

        match raw {
            Some(raw) => {
                debug!(key, "cache hit");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()> {
        let ttl = ttl.unwrap_or(self.default_ttl).as_secs();
        if ttl == 0 {
            return Err(CacheError::OperationError(format!(
                "refusing to cache {} without expiry",
                key
            )));
        }

        let payload = serde_json::to_string(value)?;
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
        Ok(removed > 0)
    }
}
