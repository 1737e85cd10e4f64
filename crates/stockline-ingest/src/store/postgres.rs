//! PostgreSQL-backed store
//!
//! Production inserts use `ON CONFLICT (tenant_id, <natural key>) DO NOTHING`
//! inside one transaction per batch. Stock units hold a transaction with the
//! product's `stock_levels` row locked `FOR UPDATE` until commit or drop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{InsertOutcome, ProductionStore, StockUnit};
use crate::error::StoreError;
use crate::idempotency::KeyValueStore;
use crate::ingest::types::{EntityKind, EntityRecord};
use crate::sessions::{SessionStore, UploadSession};
use crate::stock::{StockEventInput, StockEventRecord, StockSource};

/// Store over a shared connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

fn table_name(kind: EntityKind) -> &'static str {
    // Table names match the entity kind's wire name.
    kind.as_str()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        info!("Database migrations applied");
        Ok(())
    }

    async fn insert_one(
        tx: &mut Transaction<'static, Postgres>,
        record: &EntityRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let result = match record {
            EntityRecord::Customer(c) => {
                sqlx::query(
                    r#"
                    INSERT INTO customers (customer_id, tenant_id, name, email, metadata)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (tenant_id, email) DO NOTHING
                    "#,
                )
                .bind(c.customer_id)
                .bind(c.tenant_id)
                .bind(&c.name)
                .bind(&c.email)
                .bind(&c.metadata)
                .execute(&mut **tx)
                .await?
            },
            EntityRecord::Product(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO products (product_id, tenant_id, sku, name, price, category_id, active)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (tenant_id, sku) DO NOTHING
                    "#,
                )
                .bind(p.product_id)
                .bind(p.tenant_id)
                .bind(&p.sku)
                .bind(&p.name)
                .bind(&p.price)
                .bind(p.category_id)
                .bind(p.active)
                .execute(&mut **tx)
                .await?
            },
            EntityRecord::Order(o) => {
                sqlx::query(
                    r#"
                    INSERT INTO orders (
                        order_id, tenant_id, customer_id, external_order_id,
                        customer_name_snapshot, customer_email_snapshot,
                        total_amount, currency, order_status, order_date, raw_payload
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (tenant_id, external_order_id) DO NOTHING
                    "#,
                )
                .bind(o.order_id)
                .bind(o.tenant_id)
                .bind(o.customer_id)
                .bind(&o.external_order_id)
                .bind(&o.customer_name_snapshot)
                .bind(&o.customer_email_snapshot)
                .bind(&o.total_amount)
                .bind(&o.currency)
                .bind(&o.order_status)
                .bind(o.order_date)
                .bind(&o.raw_payload)
                .execute(&mut **tx)
                .await?
            },
            EntityRecord::OrderItem(i) => {
                sqlx::query(
                    r#"
                    INSERT INTO order_items (
                        order_item_id, tenant_id, order_id, product_id,
                        quantity, unit_price, line_total
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (tenant_id, order_item_id) DO NOTHING
                    "#,
                )
                .bind(i.order_item_id)
                .bind(i.tenant_id)
                .bind(i.order_id)
                .bind(i.product_id)
                .bind(i.quantity)
                .bind(&i.unit_price)
                .bind(&i.line_total)
                .execute(&mut **tx)
                .await?
            },
        };

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Skipped
        })
    }
}

#[async_trait]
impl ProductionStore for PgStore {
    async fn ensure_tenant(&self, tenant_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO tenants (tenant_id) VALUES ($1) ON CONFLICT (tenant_id) DO NOTHING")
            .bind(tenant_id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn existing_ids(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        ids: &[Uuid],
    ) -> Result<HashSet<Uuid>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let sql = format!(
            "SELECT {id} FROM {table} WHERE tenant_id = $1 AND {id} = ANY($2)",
            id = kind.id_field(),
            table = table_name(kind),
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(ids)
            .fetch_all(&*self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<Uuid, _>(0).map_err(StoreError::from))
            .collect()
    }

    #[tracing::instrument(skip(self, records), fields(kind = %kind, batch = records.len()))]
    async fn insert_batch(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        records: &[EntityRecord],
    ) -> Result<Vec<InsertOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            if record.kind() != kind || record.tenant_id() != tenant_id {
                return Err(StoreError::Constraint(format!(
                    "record {} does not belong to {} of tenant {}",
                    record.id(),
                    kind,
                    tenant_id
                )));
            }
            outcomes.push(Self::insert_one(&mut tx, record).await?);
        }

        tx.commit().await?;
        debug!(
            inserted = outcomes.iter().filter(|o| **o == InsertOutcome::Inserted).count(),
            "Batch committed"
        );
        Ok(outcomes)
    }

    async fn begin_stock_unit(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<Box<dyn StockUnit>>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let product = sqlx::query("SELECT product_id FROM products WHERE tenant_id = $1 AND product_id = $2")
            .bind(tenant_id)
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?;
        if product.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query(
            r#"
            INSERT INTO stock_levels (tenant_id, product_id, available)
            VALUES ($1, $2, 0)
            ON CONFLICT (tenant_id, product_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(product_id)
        .execute(&mut *tx)
        .await?;

        // Blocks while another unit holds this product.
        let available: i64 = sqlx::query(
            "SELECT available FROM stock_levels WHERE tenant_id = $1 AND product_id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(product_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("available")?;

        Ok(Some(Box::new(PgStockUnit {
            tx,
            tenant_id,
            product_id,
            available,
        })))
    }

    async fn stock_level(&self, tenant_id: Uuid, product_id: Uuid) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT available FROM stock_levels WHERE tenant_id = $1 AND product_id = $2")
            .bind(tenant_id)
            .bind(product_id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("available")).transpose()?)
    }

    async fn stock_events(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
    ) -> Result<Vec<StockEventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT delta, resulting_level, event_time, source, meta
            FROM stock_events
            WHERE tenant_id = $1 AND product_id = $2
            ORDER BY seq
            "#,
        )
        .bind(tenant_id)
        .bind(product_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StockEventRecord {
                    tenant_id,
                    product_id,
                    delta: row.try_get("delta")?,
                    resulting_level: row.try_get("resulting_level")?,
                    event_time: row.try_get("event_time")?,
                    source: StockSource::from(row.try_get::<String, _>("source")?),
                    meta: row.try_get("meta")?,
                })
            })
            .collect()
    }

    async fn count(&self, tenant_id: Uuid, kind: EntityKind) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE tenant_id = $1", table_name(kind));
        let count: i64 = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_one(&*self.pool)
            .await?
            .try_get(0)?;
        Ok(count.max(0) as u64)
    }
}

/// Open transaction holding the product's stock row lock
struct PgStockUnit {
    tx: Transaction<'static, Postgres>,
    tenant_id: Uuid,
    product_id: Uuid,
    available: i64,
}

#[async_trait]
impl StockUnit for PgStockUnit {
    fn available(&self) -> i64 {
        self.available
    }

    async fn record_event(
        &mut self,
        event: &StockEventInput,
        resulting_level: i64,
    ) -> Result<(), StoreError> {
        let event_time: DateTime<Utc> = event.event_time.unwrap_or_else(Utc::now);
        sqlx::query(
            r#"
            INSERT INTO stock_events (tenant_id, product_id, delta, resulting_level, event_time, source, meta)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(self.tenant_id)
        .bind(self.product_id)
        .bind(event.delta)
        .bind(resulting_level)
        .bind(event_time)
        .bind(event.source.as_str())
        .bind(&event.meta)
        .execute(&mut *self.tx)
        .await?;

        self.available = resulting_level;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<i64, StoreError> {
        let PgStockUnit {
            mut tx,
            tenant_id,
            product_id,
            available,
        } = *self;

        sqlx::query(
            "UPDATE stock_levels SET available = $3, updated_at = NOW() WHERE tenant_id = $1 AND product_id = $2",
        )
        .bind(tenant_id)
        .bind(product_id)
        .bind(available)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(available)
    }
}

#[async_trait]
impl KeyValueStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = $1 AND expires_at > NOW()")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3::bigint * INTERVAL '1 millisecond'))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(ttl_millis(ttl))
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3::bigint * INTERVAL '1 millisecond'))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE kv_entries.expires_at <= NOW()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(ttl_millis(ttl))
        .fetch_optional(&*self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE kv_entries
            SET value = $3, expires_at = NOW() + ($4::bigint * INTERVAL '1 millisecond')
            WHERE key = $1 AND value = $2 AND expires_at > NOW()
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(&value)
        .bind(ttl_millis(ttl))
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let counter: i64 = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, '1'::jsonb, NOW() + ($2::bigint * INTERVAL '1 millisecond'))
            ON CONFLICT (key) DO UPDATE
            SET value = CASE
                    WHEN kv_entries.expires_at <= NOW() THEN '1'::jsonb
                    ELSE to_jsonb((kv_entries.value #>> '{}')::bigint + 1)
                END,
                expires_at = CASE
                    WHEN kv_entries.expires_at <= NOW() THEN EXCLUDED.expires_at
                    ELSE kv_entries.expires_at
                END
            RETURNING (value #>> '{}')::bigint AS counter
            "#,
        )
        .bind(key)
        .bind(ttl_millis(ttl))
        .fetch_one(&*self.pool)
        .await?
        .try_get("counter")?;
        Ok(counter)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("DELETE FROM kv_entries WHERE key = $1 RETURNING expires_at > NOW() AS live")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("live")?,
            None => false,
        })
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= NOW()")
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create_session(&self, session: &UploadSession) -> Result<(), StoreError> {
        let total = i32::try_from(session.total_chunks)
            .map_err(|_| StoreError::Constraint(format!("total_chunks {} too large", session.total_chunks)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (upload_token, tenant_id, total_chunks, created_at, last_activity)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (upload_token) DO NOTHING
            "#,
        )
        .bind(session.upload_token)
        .bind(session.tenant_id)
        .bind(total)
        .bind(session.created_at)
        .bind(session.last_activity)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Constraint(format!(
                "upload session {} already exists",
                session.upload_token
            )));
        }
        Ok(())
    }

    async fn load_session(&self, upload_token: Uuid) -> Result<Option<UploadSession>, StoreError> {
        let Some(row) = sqlx::query(
            "SELECT tenant_id, total_chunks, created_at, last_activity FROM upload_sessions WHERE upload_token = $1",
        )
        .bind(upload_token)
        .fetch_optional(&*self.pool)
        .await?
        else {
            return Ok(None);
        };

        let chunks = sqlx::query("SELECT chunk_index, promoted FROM upload_chunks WHERE upload_token = $1")
            .bind(upload_token)
            .fetch_all(&*self.pool)
            .await?;

        let mut chunks_received = BTreeSet::new();
        let mut chunks_promoted = BTreeSet::new();
        for chunk in &chunks {
            let index = chunk.try_get::<i32, _>("chunk_index")?.max(0) as u32;
            chunks_received.insert(index);
            if chunk.try_get::<bool, _>("promoted")? {
                chunks_promoted.insert(index);
            }
        }

        Ok(Some(UploadSession {
            upload_token,
            tenant_id: row.try_get("tenant_id")?,
            total_chunks: row.try_get::<i32, _>("total_chunks")?.max(0) as u32,
            chunks_received,
            chunks_promoted,
            created_at: row.try_get("created_at")?,
            last_activity: row.try_get("last_activity")?,
        }))
    }

    async fn record_chunk(
        &self,
        upload_token: Uuid,
        chunk_index: u32,
        promoted: bool,
    ) -> Result<bool, StoreError> {
        let index = i32::try_from(chunk_index)
            .map_err(|_| StoreError::Constraint(format!("chunk index {} too large", chunk_index)))?;
        let mut tx = self.pool.begin().await?;

        let inserted: bool = sqlx::query(
            r#"
            INSERT INTO upload_chunks (upload_token, chunk_index, promoted)
            VALUES ($1, $2, $3)
            ON CONFLICT (upload_token, chunk_index) DO UPDATE
            SET promoted = upload_chunks.promoted OR EXCLUDED.promoted
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(upload_token)
        .bind(index)
        .bind(promoted)
        .fetch_one(&mut *tx)
        .await?
        .try_get("inserted")?;

        sqlx::query("UPDATE upload_sessions SET last_activity = NOW() WHERE upload_token = $1")
            .bind(upload_token)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(inserted)
    }
}
