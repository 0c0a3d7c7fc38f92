//! Redis caching layer
//!
//! Only price reference data is cached. Every caller treats a cache failure
//! as a miss and falls through to Postgres.

pub mod cache;
pub mod error;
pub mod keys;

pub use cache::RedisCache;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use error::CacheError;
use std::time::Duration;
use tracing::{error, info, warn};

/// Redis connection pool type alias
pub type RedisPool = Pool<RedisConnectionManager>;

/// Redis pool configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub min_idle: u32,
    pub connection_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 10,
            min_idle: 1,
            connection_timeout: Duration::from_secs(2),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn from_app(redis_url: &str, max_connections: u32) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            max_connections,
            ..Self::default()
        }
    }
}

/// Initialize Redis connection pool. An unreachable server is logged, not fatal.
pub async fn init_cache_pool(config: CacheConfig) -> Result<RedisPool, CacheError> {
    info!(
        max_connections = config.max_connections,
        "Initializing Redis cache pool"
    );

    let manager = RedisConnectionManager::new(config.redis_url.clone()).map_err(|e| {
        error!("Failed to create Redis connection manager: {}", e);
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(Some(config.min_idle))
        .connection_timeout(config.connection_timeout)
        .max_lifetime(Some(config.max_lifetime))
        .idle_timeout(Some(config.idle_timeout))
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!("Failed to build Redis connection pool: {}", e);
            CacheError::ConnectionError(e.to_string())
        })?;

    if let Err(e) = health_check(&pool).await {
        warn!("Initial Redis connection test failed, continuing without warm pool: {}", e);
    }

    info!("Redis cache pool initialized");
    Ok(pool)
}

/// PING through the pool
pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_from_app_keeps_defaults() {
        let config = CacheConfig::from_app("redis://cache:6379", 4);
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.connection_timeout, Duration::from_secs(2));
    }
}
