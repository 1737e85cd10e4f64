//! Stock update engine
//!
//! Events are grouped per product and each group is applied as one unit of
//! work holding that product's stock row exclusively. A failing group rolls
//! back on its own; other products are unaffected.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    AppliedProduct, InvalidStockEvent, NegativeStockPolicy, ProductConflict, StockEventInput,
    StockUpdateOutcome,
};
use crate::config::StockConfig;
use crate::error::{IngestError, StockError, StoreError};
use crate::ingest::decoder::{decode, SourceDescriptor, SourceFormat};
use crate::ingest::types::OutcomeStatus;
use crate::store::ProductionStore;

/// Events read from an upload, plus the lines that could not be used
#[derive(Debug, Default)]
pub struct ParsedStockEvents {
    pub events: Vec<StockEventInput>,
    /// Lines that name a product but are otherwise unusable
    pub invalid: Vec<InvalidStockEvent>,
    /// Lines with no usable `product_id`
    pub skipped: u64,
}

/// Parse an NDJSON (optionally gzip) stock event file.
///
/// Lines that are not objects, or carry no valid `product_id`, are counted
/// in `skipped`. A line with a valid `product_id` but a bad `delta`,
/// `event_time` or `source` is kept in `invalid` so that the whole product
/// is rejected when the batch is applied.
pub fn parse_stock_events<R>(reader: R, file_name: &str) -> Result<ParsedStockEvents, StockError>
where
    R: Read + Send,
{
    let descriptor = SourceDescriptor::from_file_name(file_name).map_err(|err| match err {
        IngestError::Structural(msg) => StockError::Structural(msg),
        other => StockError::Structural(other.to_string()),
    })?;
    if descriptor.format != SourceFormat::Ndjson {
        return Err(StockError::Structural(format!(
            "stock events must be NDJSON, got '{}'",
            file_name
        )));
    }

    let mut parsed = ParsedStockEvents::default();
    for line in decode(reader, descriptor) {
        let fields = match line.result {
            Ok(fields) => fields,
            Err(err) if err.fatal => {
                return Err(StockError::Structural(format!("line {}: {}", line.line_number, err)));
            },
            Err(err) => {
                debug!(line = line.line_number, error = %err, "Skipping malformed stock event");
                parsed.skipped += 1;
                continue;
            },
        };

        let product_id = fields
            .get("product_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let Some(product_id) = product_id else {
            debug!(line = line.line_number, "Skipping stock event without a valid product_id");
            parsed.skipped += 1;
            continue;
        };

        match serde_json::from_value::<StockEventInput>(Value::Object(fields)) {
            Ok(event) => parsed.events.push(event),
            Err(err) => {
                debug!(line = line.line_number, product_id = %product_id, error = %err, "Invalid stock event");
                parsed.invalid.push(InvalidStockEvent {
                    product_id,
                    line_number: line.line_number,
                    reason: err.to_string(),
                });
            },
        }
    }

    if parsed.events.is_empty() && parsed.invalid.is_empty() {
        return Err(StockError::NoValidEvents);
    }
    Ok(parsed)
}

pub struct StockUpdateEngine {
    store: Arc<dyn ProductionStore>,
    config: StockConfig,
}

impl StockUpdateEngine {
    pub fn new(store: Arc<dyn ProductionStore>, config: StockConfig) -> Self {
        Self { store, config }
    }

    /// Apply a batch of stock events for one tenant.
    ///
    /// `skipped_events` is carried into the outcome unchanged. When
    /// `deadline` elapses, products not yet started are reported as
    /// retryable conflicts; products already committed stay committed.
    pub async fn apply(
        &self,
        tenant_id: Uuid,
        events: Vec<StockEventInput>,
        skipped_events: u64,
        deadline: Option<Duration>,
    ) -> Result<StockUpdateOutcome, StockError> {
        self.apply_batch(tenant_id, events, Vec::new(), skipped_events, deadline)
            .await
    }

    /// Apply the output of [`parse_stock_events`].
    ///
    /// Products named by an invalid line are reported as conflicts and none
    /// of their events are written.
    pub async fn apply_parsed(
        &self,
        tenant_id: Uuid,
        parsed: ParsedStockEvents,
        deadline: Option<Duration>,
    ) -> Result<StockUpdateOutcome, StockError> {
        self.apply_batch(tenant_id, parsed.events, parsed.invalid, parsed.skipped, deadline)
            .await
    }

    #[tracing::instrument(
        skip(self, events, invalid),
        fields(events = events.len(), invalid = invalid.len())
    )]
    async fn apply_batch(
        &self,
        tenant_id: Uuid,
        events: Vec<StockEventInput>,
        invalid: Vec<InvalidStockEvent>,
        skipped_events: u64,
        deadline: Option<Duration>,
    ) -> Result<StockUpdateOutcome, StockError> {
        if events.is_empty() && invalid.is_empty() {
            return Err(StockError::NoValidEvents);
        }

        let deadline = deadline.map(|d| Instant::now() + d);
        let received_at = Utc::now();

        let mut groups: BTreeMap<Uuid, Vec<StockEventInput>> = BTreeMap::new();
        for mut event in events.into_iter().filter(|e| e.delta != 0) {
            event.event_time.get_or_insert(received_at);
            if event.meta.is_null() {
                event.meta = Value::Object(Default::default());
            }
            groups.entry(event.product_id).or_default().push(event);
        }
        for group in groups.values_mut() {
            // Stable: equal timestamps keep arrival order.
            group.sort_by_key(|e| e.event_time);
        }

        // First bad line per product; the product never reaches the store.
        let mut rejected: BTreeMap<Uuid, InvalidStockEvent> = BTreeMap::new();
        for bad in invalid {
            rejected.entry(bad.product_id).or_insert(bad);
        }
        groups.retain(|product_id, _| !rejected.contains_key(product_id));

        let mut conflicts: Vec<ProductConflict> = rejected
            .into_values()
            .map(|bad| {
                warn!(product_id = %bad.product_id, line = bad.line_number, "Stock events rejected");
                ProductConflict {
                    product_id: bad.product_id,
                    reason: format!("invalid event on line {}: {}", bad.line_number, bad.reason),
                    retryable: false,
                }
            })
            .collect();

        let results: Vec<Result<AppliedProduct, ProductConflict>> = stream::iter(groups)
            .map(|(product_id, events)| self.apply_product(tenant_id, product_id, events, deadline))
            .buffer_unordered(self.config.max_concurrent_products.max(1))
            .collect()
            .await;

        let mut applied = Vec::new();
        for result in results {
            match result {
                Ok(product) => applied.push(product),
                Err(conflict) => conflicts.push(conflict),
            }
        }
        applied.sort_by_key(|p| p.product_id);
        conflicts.sort_by_key(|c| c.product_id);

        let total_events_processed = applied.iter().map(|p| p.events_processed).sum();
        // Per-product conflicts never fail the batch as a whole.
        let status = if conflicts.is_empty() {
            OutcomeStatus::Success
        } else {
            OutcomeStatus::PartialSuccess
        };

        info!(
            tenant_id = %tenant_id,
            status = status.as_str(),
            applied = applied.len(),
            conflicts = conflicts.len(),
            total_events_processed,
            skipped_events,
            "Stock update finished"
        );

        Ok(StockUpdateOutcome {
            status,
            applied,
            conflicts,
            total_events_processed,
            skipped_events,
        })
    }

    async fn apply_product(
        &self,
        tenant_id: Uuid,
        product_id: Uuid,
        events: Vec<StockEventInput>,
        deadline: Option<Instant>,
    ) -> Result<AppliedProduct, ProductConflict> {
        let conflict = |reason: String, retryable: bool| {
            warn!(product_id = %product_id, reason = %reason, retryable, "Stock update rolled back");
            ProductConflict {
                product_id,
                reason,
                retryable,
            }
        };
        let store_conflict = |err: StoreError| {
            let retryable = err.is_retryable();
            conflict(err.to_string(), retryable)
        };

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(conflict("deadline exceeded".to_string(), true));
        }

        let begin = self.store.begin_stock_unit(tenant_id, product_id);
        let unit = match self.config.lock_timeout {
            Some(limit) => match tokio::time::timeout(limit, begin).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(conflict(
                        format!("lock wait exceeded {}ms", limit.as_millis()),
                        true,
                    ));
                },
            },
            None => begin.await,
        };
        let mut unit = match unit {
            Ok(Some(unit)) => unit,
            Ok(None) => return Err(conflict("product not found".to_string(), false)),
            Err(err) => return Err(store_conflict(err)),
        };

        let mut events_processed = 0u64;
        for event in &events {
            let current = unit.available();
            let Some(next) = current.checked_add(event.delta) else {
                return Err(conflict("stock level overflow".to_string(), false));
            };
            let next = if next >= 0 {
                next
            } else {
                match self.config.negative_policy {
                    NegativeStockPolicy::Reject => {
                        return Err(conflict(
                            format!(
                                "insufficient stock: level {} cannot absorb delta {}",
                                current, event.delta
                            ),
                            false,
                        ));
                    },
                    NegativeStockPolicy::ClampToZero => 0,
                    NegativeStockPolicy::Allow => next,
                }
            };

            unit.record_event(event, next).await.map_err(store_conflict)?;
            events_processed += 1;
        }

        let final_level = unit.commit().await.map_err(store_conflict)?;
        debug!(product_id = %product_id, events_processed, final_level, "Product stock committed");

        Ok(AppliedProduct {
            product_id,
            events_processed,
            final_level,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_separates_skipped_and_invalid_lines() {
        let id = Uuid::new_v4();
        let data = format!(
            concat!(
                "{{\"product_id\":\"{id}\",\"delta\":5}}\n",
                "{{\"product_id\":\"not-a-uuid\",\"delta\":5}}\n",
                "{{\"product_id\":\"{id}\",\"delta\":1.5}}\n",
                "{{\"product_id\":\"{id}\",\"delta\":2,\"source\":\"teleport\"}}\n",
                "{{\"product_id\":\"{id}\",\"delta\":2,\"event_time\":\"yesterday\"}}\n",
                "not json\n",
                "{{\"product_id\":\"{id}\",\"delta\":-1,\"source\":\"order\"}}\n",
            ),
            id = id
        );

        let parsed = parse_stock_events(Cursor::new(data), "stock.ndjson").unwrap();
        assert_eq!(parsed.events.len(), 2);
        assert_eq!(parsed.skipped, 2);

        let lines: Vec<u64> = parsed.invalid.iter().map(|bad| bad.line_number).collect();
        assert_eq!(lines, vec![3, 4, 5]);
        assert!(parsed.invalid.iter().all(|bad| bad.product_id == id));
    }

    #[test]
    fn test_parse_keeps_file_with_only_invalid_events() {
        let id = Uuid::new_v4();
        let data = format!("{{\"product_id\":\"{}\",\"delta\":\"abc\"}}\n", id);

        let parsed = parse_stock_events(Cursor::new(data), "stock.ndjson").unwrap();
        assert!(parsed.events.is_empty());
        assert_eq!(parsed.invalid.len(), 1);
    }

    #[test]
    fn test_parse_rejects_non_ndjson_and_empty() {
        assert!(matches!(
            parse_stock_events(Cursor::new("product_id,delta\n"), "stock.csv"),
            Err(StockError::Structural(_))
        ));
        assert!(matches!(
            parse_stock_events(Cursor::new("garbage\n"), "stock.ndjson"),
            Err(StockError::NoValidEvents)
        ));
    }
}
