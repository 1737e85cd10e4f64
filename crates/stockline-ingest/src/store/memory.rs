//! In-process store
//!
//! Implements every storage seam with plain maps behind a mutex, plus one
//! async mutex per `(tenant, product)` standing in for the stock row lock.
//! Used by tests and as the reference behavior for [`super::PgStore`].

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{InsertOutcome, ProductionStore, StockUnit};
use crate::error::StoreError;
use crate::idempotency::KeyValueStore;
use crate::ingest::types::{EntityKind, EntityRecord};
use crate::sessions::{SessionStore, UploadSession};
use crate::stock::{StockEventInput, StockEventRecord};

type ProductKey = (Uuid, Uuid);

#[derive(Default)]
struct EntityTable {
    by_id: HashMap<Uuid, EntityRecord>,
    /// (tenant, natural key) -> id
    by_key: HashMap<(Uuid, String), Uuid>,
}

struct KvSlot {
    value: Value,
    expires_at: Instant,
}

impl KvSlot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct Tables {
    tenants: HashSet<Uuid>,
    entities: HashMap<EntityKind, EntityTable>,
    stock_levels: HashMap<ProductKey, i64>,
    stock_events: Vec<StockEventRecord>,
    kv: HashMap<String, KvSlot>,
    sessions: HashMap<Uuid, UploadSession>,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<ProductKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Shared {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }

    fn row_lock(&self, key: ProductKey) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock table poisoned".to_string()))?;
        Ok(locks.entry(key).or_default().clone())
    }

    /// Forget the lock of `key` when nobody holds or waits on it
    fn prune_row_lock(&self, key: &ProductKey) {
        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    fn row_lock_count(&self) -> usize {
        self.row_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

/// Exclusive hold on one product's row lock.
///
/// Releases the lock on drop, then prunes it from the lock table.
struct RowLockGuard {
    shared: Arc<Shared>,
    key: ProductKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.shared.prune_row_lock(&self.key);
    }
}

/// In-memory implementation of every store trait
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a promoted record by id
    pub fn record(&self, kind: EntityKind, id: Uuid) -> Option<EntityRecord> {
        let tables = self.shared.tables().ok()?;
        tables.entities.get(&kind)?.by_id.get(&id).cloned()
    }

    pub fn has_tenant(&self, tenant_id: Uuid) -> bool {
        self.shared
            .tables()
            .map(|t| t.tenants.contains(&tenant_id))
            .unwrap_or(false)
    }

    /// Number of product row locks currently tracked
    pub fn tracked_row_locks(&self) -> usize {
        self.shared.row_lock_count()
    }
}

fn ttl_deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

#[async_trait]
impl ProductionStore for MemoryStore {
    async fn ensure_tenant(&self, tenant_id: Uuid) -> Result<(), StoreError> {
        self.shared.tables()?.tenants.insert(tenant_id);
        Ok(())
    }

    async fn existing_ids(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, StoreError> {
        let tables = self.shared.tables()?;
        let Some(table) = tables.entities.get(&kind) else {
            return Ok(HashSet::new());
        };
        Ok(ids
            .iter()
            .copied()
            .filter(|id| {
                table
                    .by_id
                    .get(id)
                    .is_some_and(|record| record.tenant_id() == tenant_id)
            })
            .collect())
    }

    async fn insert_batch(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        records: &[EntityRecord],
    ) -> Result<Vec<InsertOutcome>, StoreError> {
        let mut tables = self.shared.tables()?;
        if !tables.tenants.contains(&tenant_id) {
            return Err(StoreError::Constraint(format!("tenant {} does not exist", tenant_id)));
        }
        let table = tables.entities.entry(kind).or_default();

        // Plan the whole batch first so a failure leaves nothing behind.
        let mut outcomes = Vec::with_capacity(records.len());
        let mut planned_keys: HashMap<(Uuid, String), Uuid> = HashMap::new();
        let mut planned_ids: HashSet<Uuid> = HashSet::new();

        for record in records {
            if record.kind() != kind || record.tenant_id() != tenant_id {
                return Err(StoreError::Constraint(format!(
                    "record {} does not belong to {} of tenant {}",
                    record.id(),
                    kind,
                    tenant_id
                )));
            }

            let natural = (tenant_id, record.natural_key());
            if table.by_key.contains_key(&natural) || planned_keys.contains_key(&natural) {
                outcomes.push(InsertOutcome::Skipped);
                continue;
            }

            let id = record.id();
            if table.by_id.contains_key(&id) || planned_ids.contains(&id) {
                return Err(StoreError::Constraint(format!(
                    "duplicate key value violates unique constraint \"{}_pkey\" ({}={})",
                    kind,
                    kind.id_field(),
                    id
                )));
            }

            planned_keys.insert(natural, id);
            planned_ids.insert(id);
            outcomes.push(InsertOutcome::Inserted);
        }

        for (record, outcome) in records.iter().zip(&outcomes) {
            if *outcome == InsertOutcome::Inserted {
                table.by_key.insert((tenant_id, record.natural_key()), record.id());
                table.by_id.insert(record.id(), record.clone());
            }
        }

        Ok(outcomes)
    }

    async fn begin_stock_unit(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Box<dyn StockUnit>>, StoreError> {
        let exists = !self
            .existing_ids(tenant_id, EntityKind::Product, &[product_id])
            .await?
            .is_empty();
        if !exists {
            return Ok(None);
        }

        let key = (tenant_id, product_id);
        let guard = RowLockGuard {
            shared: self.shared.clone(),
            key,
            guard: Some(self.shared.row_lock(key)?.lock_owned().await),
        };
        let available = self
            .shared
            .tables()?
            .stock_levels
            .get(&key)
            .copied()
            .unwrap_or(0);

        Ok(Some(Box::new(MemoryStockUnit {
            shared: self.shared.clone(),
            key,
            available,
            pending: Vec::new(),
            _lock: guard,
        })))
    }

    async fn stock_level(&self, tenant_id: Uuid, product_id: Uuid) -> Result<Option<i64>, StoreError> {
        Ok(self
            .shared
            .tables()?
            .stock_levels
            .get(&(tenant_id, product_id))
            .copied())
    }

    async fn stock_events(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Vec<StockEventRecord>, StoreError> {
        Ok(self
            .shared
            .tables()?
            .stock_events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn count(&self, tenant_id: Uuid, kind: EntityKind) -> Result<u64, StoreError> {
        let tables = self.shared.tables()?;
        Ok(tables
            .entities
            .get(&kind)
            .map(|table| {
                table
                    .by_id
                    .values()
                    .filter(|record| record.tenant_id() == tenant_id)
                    .count() as u64
            })
            .unwrap_or(0))
    }
}

/// Holds the product's row lock until committed or dropped
struct MemoryStockUnit {
    shared: Arc<Shared>,
    key: ProductKey,
    available: i64,
    pending: Vec<StockEventRecord>,
    _lock: RowLockGuard,
}

#[async_trait]
impl StockUnit for MemoryStockUnit {
    fn available(&self) -> i64 {
        self.available
    }

    async fn record_event(
        &mut self,
        event: &StockEventInput,
        resulting_level: i64,
    ) -> Result<(), StoreError> {
        self.pending.push(StockEventRecord {
            tenant_id: self.key.0,
            product_id: self.key.1,
            delta: event.delta,
            resulting_level,
            event_time: event.event_time.unwrap_or_else(Utc::now),
            source: event.source,
            meta: event.meta.clone(),
        });
        self.available = resulting_level;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<i64, StoreError> {
        let MemoryStockUnit {
            shared,
            key,
            available,
            pending,
            _lock,
        } = *self;

        let mut tables = shared.tables()?;
        tables.stock_levels.insert(key, available);
        tables.stock_events.extend(pending);
        Ok(available)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        Ok(self
            .shared
            .tables()?
            .kv
            .get(key)
            .filter(|slot| slot.live(now))
            .map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        self.shared.tables()?.kv.insert(
            key.to_string(),
            KvSlot {
                value,
                expires_at: ttl_deadline(now, ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut tables = self.shared.tables()?;
        if tables.kv.get(key).is_some_and(|slot| slot.live(now)) {
            return Ok(false);
        }
        tables.kv.insert(
            key.to_string(),
            KvSlot {
                value,
                expires_at: ttl_deadline(now, ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut tables = self.shared.tables()?;
        match tables.kv.get_mut(key) {
            Some(slot) if slot.live(now) && slot.value == *expected => {
                slot.value = value;
                slot.expires_at = ttl_deadline(now, ttl);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut tables = self.shared.tables()?;
        let slot = tables.kv.entry(key.to_string()).or_insert_with(|| KvSlot {
            value: Value::from(0),
            expires_at: ttl_deadline(now, ttl),
        });
        if !slot.live(now) {
            slot.value = Value::from(0);
            slot.expires_at = ttl_deadline(now, ttl);
        }
        let next = slot.value.as_i64().unwrap_or(0) + 1;
        slot.value = Value::from(next);
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .shared
            .tables()?
            .kv
            .remove(key)
            .is_some_and(|slot| slot.live(now)))
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut tables = self.shared.tables()?;
        let before = tables.kv.len();
        tables.kv.retain(|_, slot| slot.live(now));
        Ok((before - tables.kv.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &UploadSession) -> Result<(), StoreError> {
        let mut tables = self.shared.tables()?;
        if tables.sessions.contains_key(&session.upload_token) {
            return Err(StoreError::Constraint(format!(
                "upload session {} already exists",
                session.upload_token
            )));
        }
        tables.sessions.insert(session.upload_token, session.clone());
        Ok(())
    }

    async fn load_session(&self, upload_token: Uuid) -> Result<Option<UploadSession>, StoreError> {
        Ok(self.shared.tables()?.sessions.get(&upload_token).cloned())
    }

    async fn record_chunk(
        &self,
        upload_token: Uuid,
        chunk_index: u32,
        promoted: bool,
    ) -> Result<bool, StoreError> {
        let mut tables = self.shared.tables()?;
        let session = tables
            .sessions
            .get_mut(&upload_token)
            .ok_or_else(|| StoreError::Constraint(format!("upload session {} does not exist", upload_token)))?;

        let first = session.chunks_received.insert(chunk_index);
        if promoted {
            session.chunks_promoted.insert(chunk_index);
        }
        session.last_activity = Utc::now();
        Ok(first)
    }
}
