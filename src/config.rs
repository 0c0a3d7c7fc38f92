//! Application configuration module
//! Loads typed sections from environment variables (and `.env`) and validates them

use crate::middleware::auth::MIN_JWT_SECRET_LENGTH;
use crate::payments::PaymentFactoryConfig;
use crate::workers::status_reconciler::ReconcilerConfig;
use std::env;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    pub payments: PaymentsConfig,
    pub reconciler: ReconcilerConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
    pub run_migrations: bool,
}

/// Cache configuration. Without `REDIS_URL` price lookups go straight to Postgres.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub default_ttl: u64, // seconds
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig").finish_non_exhaustive()
    }
}

/// Payment orchestration settings plus the per-provider driver configs
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub currency: String,
    /// Public base URL providers call back into, e.g. `https://api.example.com`
    pub result_base_url: Option<String>,
    pub providers: PaymentFactoryConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            auth: AuthConfig::from_env()?,
            payments: PaymentsConfig::from_env()?,
            reconciler: ReconcilerConfig::from_env(),
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.cache.validate()?;
        self.logging.validate()?;
        self.auth.validate()?;
        self.payments.validate()?;
        self.reconciler
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string()))
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("SERVER_PORT", "8000")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            min_connections: parse_var("DB_MIN_CONNECTIONS", "2")?,
            connection_timeout: parse_var("DB_CONNECTION_TIMEOUT", "30")?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
            run_migrations: parse_var("DB_RUN_MIGRATIONS", "true")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .ok()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
            default_ttl: parse_var("CACHE_DEFAULT_TTL", "600")?,
            max_connections: parse_var("CACHE_MAX_CONNECTIONS", "10")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(ConfigError::InvalidValue(
                    "REDIS_URL must start with redis:// or rediss://".to_string(),
                ));
            }
        }

        if self.default_ttl == 0 {
            return Err(ConfigError::InvalidValue("CACHE_DEFAULT_TTL".to_string()));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(AuthConfig {
            jwt_secret: env::var("JWT_SECRET")
                .map_err(|_| ConfigError::MissingVariable("JWT_SECRET".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.len() < MIN_JWT_SECRET_LENGTH {
            return Err(ConfigError::ValidationFailed(format!(
                "JWT_SECRET must be at least {} bytes",
                MIN_JWT_SECRET_LENGTH
            )));
        }
        Ok(())
    }
}

impl PaymentsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(PaymentsConfig {
            currency: env::var("PAYMENT_CURRENCY")
                .unwrap_or_else(|_| "RUB".to_string())
                .trim()
                .to_uppercase(),
            result_base_url: env::var("PAYMENT_RESULT_BASE_URL")
                .ok()
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            providers: PaymentFactoryConfig::from_env()
                .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::InvalidValue("PAYMENT_CURRENCY".to_string()));
        }

        if let Some(url) = &self.result_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "PAYMENT_RESULT_BASE_URL must be a valid URL".to_string(),
                ));
            }
        }

        self.providers
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
