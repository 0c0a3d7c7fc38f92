//! Health check module
//! Reports the state of Postgres (required) and Redis (optional) for the probes

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::cache::RedisCache;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub providers: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Cache down; prices are served from the database.
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            providers: Vec::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self.status, HealthState::Unhealthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    db_pool: sqlx::PgPool,
    cache: Option<RedisCache>,
    providers: Vec<String>,
}

impl HealthChecker {
    pub fn new(db_pool: sqlx::PgPool, cache: Option<RedisCache>, providers: Vec<String>) -> Self {
        Self {
            db_pool,
            cache,
            providers,
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        health_status.providers = self.providers.clone();

        let database = probe("database", check_database_health(&self.db_pool)).await;
        let database_up = database.status == ComponentState::Up;
        health_status.checks.insert("database".to_string(), database);

        let cache_up = match &self.cache {
            Some(cache) => {
                let component = probe("cache", check_cache_health(cache)).await;
                let up = component.status == ComponentState::Up;
                health_status.checks.insert("cache".to_string(), component);
                up
            }
            None => true,
        };

        health_status.status = aggregate(database_up, cache_up);
        health_status
    }
}

fn aggregate(database_up: bool, cache_up: bool) -> HealthState {
    match (database_up, cache_up) {
        (false, _) => HealthState::Unhealthy,
        (true, false) => HealthState::Degraded,
        (true, true) => HealthState::Healthy,
    }
}

async fn probe<F>(name: &str, check: F) -> ComponentHealth
where
    F: std::future::Future<Output = Result<u128, Box<dyn std::error::Error + Send + Sync>>>,
{
    match timeout(Duration::from_secs(5), check).await {
        Ok(Ok(response_time)) => ComponentHealth::up(Some(response_time)),
        Ok(Err(e)) => {
            error!(component = name, error = %e, "health check failed");
            ComponentHealth::down(Some(e.to_string()))
        }
        Err(_) => {
            warn!(component = name, "health check timed out");
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

pub async fn check_database_health(
    pool: &sqlx::PgPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    crate::database::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}

pub async fn check_cache_health(
    cache: &RedisCache,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    crate::cache::health_check(cache.pool()).await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_cache_outage_only_degrades() {
        assert_eq!(aggregate(true, true), HealthState::Healthy);
        assert_eq!(aggregate(true, false), HealthState::Degraded);
        assert_eq!(aggregate(false, true), HealthState::Unhealthy);
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert_eq!(up_health.status, ComponentState::Up);
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert_eq!(down_health.status, ComponentState::Down);
        assert_eq!(down_health.details, Some("Test error".to_string()));
    }

    #[tokio::test]
    async fn test_probe_times_out_slow_checks() {
        tokio::time::pause();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<u128, Box<dyn std::error::Error + Send + Sync>>(0)
        };
        let component = probe("slow", slow).await;
        assert_eq!(component.status, ComponentState::Down);
        assert_eq!(component.details.as_deref(), Some("Timeout"));
    }
}
