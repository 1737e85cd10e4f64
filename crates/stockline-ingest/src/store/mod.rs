//! Persistence seams
//!
//! The pipeline, the stock engine, the idempotency ledger and the chunk
//! tracker talk to storage only through the traits in this module:
//!
//! - [`ProductionStore`]: tenant-scoped production tables and stock rows
//! - [`StockUnit`]: one product's exclusive, transactional stock update
//! - [`crate::idempotency::KeyValueStore`]: TTL-aware key-value service
//! - [`crate::sessions::SessionStore`]: upload sessions and chunk receipts
//!
//! [`MemoryStore`] implements all of them in-process; [`PgStore`] backs them
//! with PostgreSQL.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::StoreError;
use crate::ingest::types::{EntityKind, EntityRecord};
use crate::stock::{StockEventInput, StockEventRecord};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Per-record result of a batch insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Natural key already present for the tenant
    Skipped,
}

#[async_trait]
pub trait ProductionStore: Send + Sync {
    /// Create the tenant row if missing
    async fn ensure_tenant(&self, tenant_id: Uuid) -> Result<(), StoreError>;

    /// Subset of `ids` that exist as `kind` for the tenant
    async fn existing_ids(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, StoreError>;

    /// Insert records of one kind in a single transaction.
    ///
    /// An existing natural key is a no-op for that record. Any other
    /// failure rolls back the whole batch.
    async fn insert_batch(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        records: &[EntityRecord],
    ) -> Result<Vec<InsertOutcome>, StoreError>;

    /// Open a unit of work holding the product's stock row exclusively.
    ///
    /// Blocks while another unit holds the same product. Returns `None`
    /// when the product does not exist for the tenant.
    async fn begin_stock_unit(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Box<dyn StockUnit>>, StoreError>;

    async fn stock_level(&self, tenant_id: Uuid, product_id: Uuid) -> Result<Option<i64>, StoreError>;

    /// Applied events in log order
    async fn stock_events(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Vec<StockEventRecord>, StoreError>;

    async fn count(&self, tenant_id: Uuid, kind: EntityKind) -> Result<u64, StoreError>;
}

/// Exclusive, all-or-nothing update of one product's stock.
///
/// Dropping a unit without calling [`StockUnit::commit`] discards every
/// recorded event and releases the lock.
#[async_trait]
pub trait StockUnit: Send {
    /// Level as seen by this unit, including events recorded so far
    fn available(&self) -> i64;

    /// Append one event and move the level to `resulting_level`
    async fn record_event(
        &mut self,
        event: &StockEventInput,
        resulting_level: i64,
    ) -> Result<(), StoreError>;

    /// Persist the events and the final level; returns the final level
    async fn commit(self: Box<Self>) -> Result<i64, StoreError>;
}
