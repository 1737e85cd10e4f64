//! Dependency-ordered promotion of validated records into production
//!
//! Kinds are promoted strictly in [`PROMOTION_ORDER`] after the tenant row is
//! ensured. Within a kind, records are split into batches of `batch_size`,
//! each committed in its own transaction; up to `parallel_batches` batches
//! run concurrently per wave. A failing batch is rolled back and reported as
//! conflicts without stopping the remaining batches.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::attempt::{AttemptMachine, AttemptState};
use super::staging::StagingArea;
use super::types::{EntityKind, EntityRecord, PROMOTION_ORDER};
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::store::{InsertOutcome, ProductionStore};

type Candidates = Vec<(usize, EntityRecord)>;

pub struct Promoter {
    store: Arc<dyn ProductionStore>,
    batch_size: usize,
    parallel_batches: usize,
}

impl Promoter {
    pub fn new(store: Arc<dyn ProductionStore>, config: &IngestConfig) -> Self {
        Self {
            store,
            batch_size: config.batch_size.max(1),
            parallel_batches: config.parallel_batches.max(1),
        }
    }

    /// Promote every valid record in `staging`, advancing `machine` through
    /// `promoting(kind)` for each kind.
    ///
    /// Returns [`IngestError::DeadlineExceeded`] when `deadline` passes
    /// between waves; batches committed before that point stay committed.
    pub async fn promote(
        &self,
        staging: &mut StagingArea,
        machine: &mut AttemptMachine,
        deadline: Option<Instant>,
    ) -> Result<(), IngestError> {
        let tenant_id = staging.tenant_id();
        self.store.ensure_tenant(tenant_id).await?;

        for kind in PROMOTION_ORDER {
            machine.advance(AttemptState::Promoting(kind))?;

            let candidates = staging.valid_records(kind);
            if candidates.is_empty() {
                continue;
            }

            let candidates = self.resolve_references(staging, kind, candidates).await?;
            self.promote_kind(staging, machine, kind, candidates, deadline).await?;

            info!(
                attempt_id = %staging.attempt_id(),
                kind = %kind,
                promoted = staging.promoted_counts().get(&kind).copied().unwrap_or(0),
                skipped = staging.skipped_counts().get(&kind).copied().unwrap_or(0),
                "Kind promoted"
            );
        }

        Ok(())
    }

    async fn known_ids(
        &self,
        tenant_id: Uuid,
        kind: EntityKind,
        mut ids: Vec<Uuid>,
    ) -> Result<HashSet<Uuid>, IngestError> {
        ids.sort_unstable();
        ids.dedup();
        Ok(self.store.existing_ids(tenant_id, kind, &ids).await?)
    }

    /// Orders keep their snapshots when the customer is unknown; order items
    /// with an unknown order or product are rejected.
    async fn resolve_references(
        &self,
        staging: &mut StagingArea,
        kind: EntityKind,
        candidates: Candidates,
    ) -> Result<Candidates, IngestError> {
        let tenant_id = staging.tenant_id();

        match kind {
            EntityKind::Order => {
                let customer_ids = candidates
                    .iter()
                    .filter_map(|(_, record)| match record {
                        EntityRecord::Order(order) => order.customer_id,
                        _ => None,
                    })
                    .collect();
                let customers = self.known_ids(tenant_id, EntityKind::Customer, customer_ids).await?;

                Ok(candidates
                    .into_iter()
                    .map(|(idx, mut record)| {
                        if let EntityRecord::Order(order) = &mut record {
                            if order.customer_id.is_some_and(|id| !customers.contains(&id)) {
                                debug!(
                                    external_order_id = %order.external_order_id,
                                    "Customer not found, keeping snapshot only"
                                );
                                order.customer_id = None;
                            }
                        }
                        (idx, record)
                    })
                    .collect())
            },
            EntityKind::OrderItem => {
                let (order_ids, product_ids): (Vec<Uuid>, Vec<Uuid>) = candidates
                    .iter()
                    .filter_map(|(_, record)| match record {
                        EntityRecord::OrderItem(item) => Some((item.order_id, item.product_id)),
                        _ => None,
                    })
                    .unzip();
                let orders = self.known_ids(tenant_id, EntityKind::Order, order_ids).await?;
                let products = self.known_ids(tenant_id, EntityKind::Product, product_ids).await?;

                let mut kept = Vec::with_capacity(candidates.len());
                for (idx, record) in candidates {
                    if let EntityRecord::OrderItem(item) = &record {
                        if !orders.contains(&item.order_id) {
                            staging.mark_rejected(idx, format!("order {} not found", item.order_id));
                            continue;
                        }
                        if !products.contains(&item.product_id) {
                            staging.mark_rejected(idx, format!("product {} not found", item.product_id));
                            continue;
                        }
                    }
                    kept.push((idx, record));
                }
                Ok(kept)
            },
            EntityKind::Customer | EntityKind::Product => Ok(candidates),
        }
    }

    async fn promote_kind(
        &self,
        staging: &mut StagingArea,
        machine: &AttemptMachine,
        kind: EntityKind,
        candidates: Candidates,
        deadline: Option<Instant>,
    ) -> Result<(), IngestError> {
        let tenant_id = staging.tenant_id();
        let batches: Vec<(Vec<usize>, Vec<EntityRecord>)> = candidates
            .chunks(self.batch_size)
            .map(|chunk| chunk.iter().cloned().unzip())
            .collect();

        for wave in batches.chunks(self.parallel_batches) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(state = %machine.state(), "Deadline exceeded during promotion");
                return Err(IngestError::DeadlineExceeded {
                    state: machine.state(),
                });
            }

            let results = join_all(
                wave.iter()
                    .map(|(_, records)| self.store.insert_batch(tenant_id, kind, records)),
            )
            .await;

            for ((indices, _), result) in wave.iter().zip(results) {
                match result {
                    Ok(outcomes) => {
                        for (idx, outcome) in indices.iter().zip(outcomes) {
                            match outcome {
                                InsertOutcome::Inserted => staging.mark_promoted(*idx),
                                InsertOutcome::Skipped => staging.mark_skipped(*idx),
                            }
                        }
                    },
                    Err(err) => {
                        warn!(
                            kind = %kind,
                            records = indices.len(),
                            error = %err,
                            "Batch rolled back"
                        );
                        let reason = format!("batch rolled back: {}", err);
                        for idx in indices {
                            staging.mark_rejected(*idx, reason.clone());
                        }
                    },
                }
            }
        }

        Ok(())
    }
}
