//! Configuration management

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::stock::NegativeStockPolicy;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/stockline";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default number of records committed per promotion transaction.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default number of batches of one entity kind committed concurrently.
pub const DEFAULT_PARALLEL_BATCHES: usize = 4;

/// Default attempt deadline in seconds (0 = no deadline).
pub const DEFAULT_ATTEMPT_DEADLINE_SECS: u64 = 0;

/// Default lifetime of an idempotency entry (24 hours).
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

/// Default age after which a pending idempotency entry counts as abandoned.
pub const DEFAULT_STALE_PENDING_SECS: u64 = 15 * 60;

/// Default wait for a product stock lock in milliseconds (0 = wait forever).
pub const DEFAULT_STOCK_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Default number of products updated concurrently within one stock batch.
pub const DEFAULT_MAX_CONCURRENT_PRODUCTS: usize = 16;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub ingest: IngestConfig,
    pub idempotency: IdempotencyConfig,
    pub stock: StockConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
        }
    }
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Records per promotion transaction
    pub batch_size: usize,
    /// Concurrent batches per wave within one entity kind
    pub parallel_batches: usize,
    /// Deadline applied when the caller does not pass one
    pub default_deadline: Option<Duration>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            parallel_batches: DEFAULT_PARALLEL_BATCHES,
            default_deadline: None,
        }
    }
}

/// Idempotency ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
    pub stale_pending_after: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS),
            stale_pending_after: Duration::from_secs(DEFAULT_STALE_PENDING_SECS),
        }
    }
}

/// Stock update engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockConfig {
    pub negative_policy: NegativeStockPolicy,
    /// Upper bound on waiting for a product's stock lock
    pub lock_timeout: Option<Duration>,
    pub max_concurrent_products: usize,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            negative_policy: NegativeStockPolicy::default(),
            lock_timeout: Some(Duration::from_millis(DEFAULT_STOCK_LOCK_TIMEOUT_MS)),
            max_concurrent_products: DEFAULT_MAX_CONCURRENT_PRODUCTS,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Zero means "disabled" for the optional durations below.
fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let negative_policy = match std::env::var("STOCKLINE_NEGATIVE_STOCK_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => NegativeStockPolicy::default(),
        };

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            ingest: IngestConfig {
                batch_size: env_or("STOCKLINE_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                parallel_batches: env_or("STOCKLINE_PARALLEL_BATCHES", DEFAULT_PARALLEL_BATCHES),
                default_deadline: non_zero(Duration::from_secs(env_or(
                    "STOCKLINE_ATTEMPT_DEADLINE_SECS",
                    DEFAULT_ATTEMPT_DEADLINE_SECS,
                ))),
            },
            idempotency: IdempotencyConfig {
                ttl: Duration::from_secs(env_or(
                    "STOCKLINE_IDEMPOTENCY_TTL_SECS",
                    DEFAULT_IDEMPOTENCY_TTL_SECS,
                )),
                stale_pending_after: Duration::from_secs(env_or(
                    "STOCKLINE_STALE_PENDING_SECS",
                    DEFAULT_STALE_PENDING_SECS,
                )),
            },
            stock: StockConfig {
                negative_policy,
                lock_timeout: non_zero(Duration::from_millis(env_or(
                    "STOCKLINE_LOCK_TIMEOUT_MS",
                    DEFAULT_STOCK_LOCK_TIMEOUT_MS,
                ))),
                max_concurrent_products: env_or(
                    "STOCKLINE_MAX_CONCURRENT_PRODUCTS",
                    DEFAULT_MAX_CONCURRENT_PRODUCTS,
                ),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!("Database min_connections cannot exceed max_connections");
        }

        if self.ingest.batch_size == 0 {
            anyhow::bail!("Ingest batch_size must be greater than 0");
        }

        if self.ingest.parallel_batches == 0 {
            anyhow::bail!("Ingest parallel_batches must be greater than 0");
        }

        if self.idempotency.ttl.is_zero() {
            anyhow::bail!("Idempotency TTL must be greater than 0");
        }

        if self.stock.max_concurrent_products == 0 {
            anyhow::bail!("Stock max_concurrent_products must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.idempotency.ttl, Duration::from_secs(86_400));
        assert_eq!(config.stock.negative_policy, NegativeStockPolicy::Reject);
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.ingest.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_zero_duration() {
        assert_eq!(non_zero(Duration::ZERO), None);
        assert_eq!(non_zero(Duration::from_secs(3)), Some(Duration::from_secs(3)));
    }
}
