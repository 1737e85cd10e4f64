//! Shared fixtures for stockline-ingest integration tests
//!
//! In-memory tests build NDJSON bodies with the `*_line` helpers and run them
//! through a pipeline backed by [`MemoryStore`]. Postgres tests start a
//! throwaway container via [`TestPostgres`] (requires Docker).

#![allow(dead_code)]

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use stockline_ingest::config::Config;
use stockline_ingest::ingest::{IngestionPipeline, SourceFile};
use stockline_ingest::store::MemoryStore;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use uuid::Uuid;

// ============================================================================
// Record fixtures
// ============================================================================

pub fn customer_line(tenant: Uuid, id: Uuid, email: &str) -> String {
    json!({
        "customer_id": id,
        "tenant_id": tenant,
        "name": "Ada Lovelace",
        "email": email,
    })
    .to_string()
}

pub fn product_line(tenant: Uuid, id: Uuid, sku: &str) -> String {
    json!({
        "product_id": id,
        "tenant_id": tenant,
        "sku": sku,
        "name": format!("Product {}", sku),
        "price": "19.99",
    })
    .to_string()
}

pub fn order_line(tenant: Uuid, id: Uuid, customer_id: Option<Uuid>, external_id: &str) -> String {
    json!({
        "order_id": id,
        "tenant_id": tenant,
        "customer_id": customer_id,
        "external_order_id": external_id,
        "customer_name_snapshot": "Ada Lovelace",
        "customer_email_snapshot": "ada@example.com",
        "total_amount": "39.98",
        "currency": "usd",
        "order_status": "paid",
        "order_date": "2024-03-01T12:00:00Z",
    })
    .to_string()
}

pub fn order_item_line(tenant: Uuid, id: Uuid, order_id: Uuid, product_id: Uuid) -> String {
    json!({
        "order_item_id": id,
        "tenant_id": tenant,
        "order_id": order_id,
        "product_id": product_id,
        "quantity": 2,
        "unit_price": "19.99",
        "line_total": "39.98",
    })
    .to_string()
}

pub fn ndjson(lines: &[String]) -> String {
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

pub fn source(name: &str, body: impl Into<Vec<u8>>) -> SourceFile {
    SourceFile::new(name, Cursor::new(body.into()))
}

/// Test config with small batches so batching paths are exercised
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.ingest.batch_size = 2;
    config.ingest.parallel_batches = 2;
    config
}

pub fn memory_pipeline() -> (MemoryStore, IngestionPipeline) {
    memory_pipeline_with(test_config())
}

pub fn memory_pipeline_with(config: Config) -> (MemoryStore, IngestionPipeline) {
    let store = MemoryStore::new();
    let shared = Arc::new(store.clone());
    let pipeline = IngestionPipeline::new(shared.clone(), shared.clone(), shared, &config);
    (store, pipeline)
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;
        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}

/// Initialize test tracing; safe to call from every test
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stockline_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
