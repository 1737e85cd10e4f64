//! Stockline Ingest Library
//!
//! Multi-tenant bulk ingestion of commerce data and transactional stock
//! updates.
//!
//! # Components
//!
//! - **Ingestion** ([`ingest`]): decode NDJSON/CSV uploads, validate them in an
//!   attempt-scoped staging area and promote customers, products, orders and
//!   order items in dependency order
//! - **Idempotency** ([`idempotency`]): replay-safe request handling keyed by
//!   tenant and idempotency key
//! - **Stock** ([`stock`]): per-product serialized stock deltas with an
//!   append-only event log
//! - **Sessions** ([`sessions`]): chunked upload tracking
//! - **Storage** ([`store`]): in-memory and PostgreSQL backends
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stockline_ingest::config::Config;
//! use stockline_ingest::ingest::{IngestionPipeline, IngestionRequest, SourceFile};
//! use stockline_ingest::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let pipeline =
//!         IngestionPipeline::new(store.clone(), store.clone(), store, &Config::default());
//!
//!     let tenant = uuid::Uuid::new_v4();
//!     let source = SourceFile::from_path("customers_2024.ndjson".as_ref())?;
//!     let response = pipeline.run(IngestionRequest::new(tenant, vec![source])).await?;
//!     println!("{}", serde_json::to_string_pretty(&response)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod idempotency;
pub mod ingest;
pub mod sessions;
pub mod stock;
pub mod store;

pub use config::Config;
pub use error::{IdempotencyError, IngestError, SessionError, StockError, StoreError};
