//! PostgreSQL store integration tests
//!
//! These tests require Docker. Run with:
//!
//! ```bash
//! cargo test -p stockline-ingest --test postgres_store_tests -- --ignored --nocapture
//! ```

mod common;

use common::*;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use stockline_ingest::config::Config;
use stockline_ingest::idempotency::{BeginOutcome, IdempotencyLedger, KeyValueStore};
use stockline_ingest::ingest::{
    EntityKind, EntityRecord, IngestionPipeline, IngestionRequest, IngestionResponse, OutcomeStatus,
};
use stockline_ingest::sessions::{ChunkTracker, SessionStatus};
use stockline_ingest::stock::{NegativeStockPolicy, StockEventInput, StockUpdateEngine};
use stockline_ingest::store::{PgStore, ProductionStore};
use uuid::Uuid;

async fn setup() -> (TestPostgres, Arc<PgStore>) {
    init_test_tracing();
    let pg = TestPostgres::start()
        .await
        .expect("Failed to start PostgreSQL container");
    stockline_ingest::db::health_check(pg.pool())
        .await
        .expect("Database health check failed");
    let store = Arc::new(PgStore::new(Arc::new(pg.pool_clone())));
    (pg, store)
}

#[tokio::test]
#[ignore] // Requires docker
#[serial]
async fn test_pipeline_promotes_and_replays() {
    let (_pg, store) = setup().await;
    let pipeline = IngestionPipeline::new(store.clone(), store.clone(), store.clone(), &test_config());
    let tenant = Uuid::new_v4();
    let customer = Uuid::new_v4();
    let product = Uuid::new_v4();
    let order = Uuid::new_v4();

    let request = || {
        IngestionRequest::new(
            tenant,
            vec![
                source("order_items_1.ndjson", ndjson(&[order_item_line(tenant, Uuid::new_v4(), order, product)])),
                source("orders_1.ndjson", ndjson(&[order_line(tenant, order, Some(customer), "EXT-1")])),
                source("products_1.ndjson", ndjson(&[product_line(tenant, product, "SKU-1")])),
                source("customers_1.ndjson", ndjson(&[customer_line(tenant, customer, "a@example.com")])),
            ],
        )
        .with_idempotency("pg-upload", "pg-hash")
    };

    let first = match pipeline.run(request()).await.unwrap() {
        IngestionResponse::Completed(outcome) => outcome,
        other => panic!("expected completed attempt, got {:?}", other),
    };
    assert_eq!(first.status, OutcomeStatus::Success);
    assert_eq!(first.total_promoted(), 4);

    assert!(matches!(
        pipeline.run(request()).await.unwrap(),
        IngestionResponse::Replayed(_)
    ));
    assert_eq!(store.count(tenant, EntityKind::OrderItem).await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Requires docker
#[serial]
async fn test_natural_key_conflict_is_skipped_and_pk_collision_rolls_back() {
    let (_pg, store) = setup().await;
    let tenant = Uuid::new_v4();
    store.ensure_tenant(tenant).await.unwrap();

    let customer = |id: Uuid, email: &str| {
        EntityRecord::Customer(stockline_ingest::ingest::types::CustomerRecord {
            customer_id: id,
            tenant_id: tenant,
            name: "Ada".to_string(),
            email: email.to_string(),
            metadata: json!({}),
        })
    };

    let taken = Uuid::new_v4();
    store
        .insert_batch(tenant, EntityKind::Customer, &[customer(taken, "a@example.com")])
        .await
        .unwrap();

    let outcomes = store
        .insert_batch(
            tenant,
            EntityKind::Customer,
            &[customer(Uuid::new_v4(), "a@example.com"), customer(Uuid::new_v4(), "b@example.com")],
        )
        .await
        .unwrap();
    assert_eq!(
        outcomes,
        vec![
            stockline_ingest::store::InsertOutcome::Skipped,
            stockline_ingest::store::InsertOutcome::Inserted
        ]
    );

    let err = store
        .insert_batch(
            tenant,
            EntityKind::Customer,
            &[customer(Uuid::new_v4(), "c@example.com"), customer(taken, "d@example.com")],
        )
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(store.count(tenant, EntityKind::Customer).await.unwrap(), 2);
}

#[tokio::test]
#[ignore] // Requires docker
#[serial]
async fn test_stock_updates_serialize_on_row_lock() {
    let (_pg, store) = setup().await;
    let tenant = Uuid::new_v4();
    let pipeline = IngestionPipeline::new(store.clone(), store.clone(), store.clone(), &Config::default());
    let product = Uuid::new_v4();
    pipeline
        .run(IngestionRequest::new(
            tenant,
            vec![source("products_1.ndjson", ndjson(&[product_line(tenant, product, "SKU-1")]))],
        ))
        .await
        .unwrap();

    let mut config = Config::default().stock;
    config.negative_policy = NegativeStockPolicy::Reject;
    let engine = Arc::new(StockUpdateEngine::new(store.clone(), config));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .apply(tenant, vec![StockEventInput::new(product, 5)], 0, None)
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().status, OutcomeStatus::Success);
    }

    assert_eq!(store.stock_level(tenant, product).await.unwrap(), Some(40));
    let levels: Vec<i64> = store
        .stock_events(tenant, product)
        .await
        .unwrap()
        .iter()
        .map(|e| e.resulting_level)
        .collect();
    assert_eq!(levels, (1..=8).map(|n| n * 5).collect::<Vec<i64>>());

    // Overdraw rolls back the whole product unit.
    let outcome = engine
        .apply(
            tenant,
            vec![StockEventInput::new(product, -30), StockEventInput::new(product, -30)],
            0,
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::PartialSuccess);
    assert!(outcome.applied.is_empty());
    assert_eq!(store.stock_level(tenant, product).await.unwrap(), Some(40));
}

#[tokio::test]
#[ignore] // Requires docker
#[serial]
async fn test_key_value_store_semantics() {
    let (_pg, store) = setup().await;
    let ttl = Duration::from_secs(60);

    assert!(store.set_if_absent("k", json!({"v": 1}), ttl).await.unwrap());
    assert!(!store.set_if_absent("k", json!({"v": 2}), ttl).await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), Some(json!({"v": 1})));

    assert!(!store
        .compare_and_swap("k", &json!({"v": 2}), json!({"v": 3}), ttl)
        .await
        .unwrap());
    assert!(store
        .compare_and_swap("k", &json!({"v": 1}), json!({"v": 3}), ttl)
        .await
        .unwrap());

    assert_eq!(store.incr("counter", ttl).await.unwrap(), 1);
    assert_eq!(store.incr("counter", ttl).await.unwrap(), 2);

    store.set("short", json!(true), Duration::from_millis(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get("short").await.unwrap(), None);
    assert!(store.set_if_absent("short", json!(false), ttl).await.unwrap());

    store.set("gone", json!(1), Duration::from_millis(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.purge_expired().await.unwrap(), 1);
    assert!(store.delete("k").await.unwrap());
}

#[tokio::test]
#[ignore] // Requires docker
#[serial]
async fn test_ledger_and_sessions_on_postgres() {
    let (_pg, store) = setup().await;
    let tenant = Uuid::new_v4();

    let ledger = IdempotencyLedger::new(store.clone(), Config::default().idempotency);
    assert!(matches!(
        ledger.begin(tenant, "key", "hash").await.unwrap(),
        BeginOutcome::Proceed { attempt: 1 }
    ));
    assert!(matches!(
        ledger.begin(tenant, "key", "hash").await.unwrap(),
        BeginOutcome::InProgress
    ));
    ledger.complete(tenant, "key", json!({"ok": true})).await.unwrap();
    assert!(matches!(
        ledger.begin(tenant, "key", "hash").await.unwrap(),
        BeginOutcome::ReturnCached(v) if v == json!({"ok": true})
    ));

    let tracker = ChunkTracker::new(store.clone());
    let token = tracker.create_session(tenant, 3, None).await.unwrap().upload_token;
    assert!(tracker.accept(tenant, token, 2).await.unwrap().first_receipt);
    assert!(!tracker.accept(tenant, token, 2).await.unwrap().first_receipt);
    tracker.mark_promoted(tenant, token, 2).await.unwrap();

    let progress = tracker.status(tenant, token).await.unwrap();
    assert_eq!(progress.status, SessionStatus::Incomplete { missing: vec![0, 1] });
    assert_eq!(progress.chunks_promoted, 1);
}
