//! Idempotency ledger
//!
//! Maps `(tenant, idempotency key)` to the fingerprint of the first request
//! that used it and, once that request finishes, to its result summary.
//!
//! | stored entry            | same hash          | different hash |
//! |-------------------------|--------------------|----------------|
//! | none / expired          | Proceed            | Proceed        |
//! | pending                 | InProgress         | Conflict       |
//! | pending, stale          | Proceed (takeover) | Conflict       |
//! | failed                  | Proceed (retry)    | Conflict       |
//! | completed               | ReturnCached       | Conflict       |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::kv::KeyValueStore;
use crate::config::IdempotencyConfig;
use crate::error::IdempotencyError;

/// Rounds of set-if-absent / compare-and-swap before reporting contention
const MAX_BEGIN_ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Completed,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Completed => "completed",
            LedgerStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tenant_id: Uuid,
    pub idempotency_key: String,
    pub request_hash: String,
    pub status: LedgerStatus,
    #[serde(default)]
    pub result_summary: Option<Value>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Decision returned by [`IdempotencyLedger::begin`]
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// Caller owns the key and must finish with `complete` or `fail`
    Proceed { attempt: u64 },
    /// Same request already finished; here is its result
    ReturnCached(Value),
    /// Same request is being processed right now
    InProgress,
    /// Key was used for a different request
    Conflict { stored_hash: String },
}

pub struct IdempotencyLedger {
    kv: Arc<dyn KeyValueStore>,
    config: IdempotencyConfig,
}

fn ledger_key(tenant_id: Uuid, key: &str) -> String {
    format!("idem:{}:{}", tenant_id, key)
}

fn attempts_key(storage_key: &str) -> String {
    format!("{}:attempts", storage_key)
}

impl IdempotencyLedger {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: IdempotencyConfig) -> Self {
        Self { kv, config }
    }

    fn remaining_ttl(entry: &LedgerEntry, now: DateTime<Utc>) -> Duration {
        (entry.expires_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_millis(1))
    }

    fn is_stale(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> bool {
        (now - entry.updated_at)
            .to_std()
            .map(|age| age >= self.config.stale_pending_after)
            .unwrap_or(false)
    }

    #[tracing::instrument(skip(self, request_hash))]
    pub async fn begin(
        &self,
        tenant_id: Uuid,
        key: &str,
        request_hash: &str,
    ) -> Result<BeginOutcome, IdempotencyError> {
        let storage_key = ledger_key(tenant_id, key);

        for _ in 0..MAX_BEGIN_ROUNDS {
            let now = Utc::now();
            let expires_at = chrono::Duration::from_std(self.config.ttl)
                .map(|ttl| now + ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let fresh = LedgerEntry {
                tenant_id,
                idempotency_key: key.to_string(),
                request_hash: request_hash.to_string(),
                status: LedgerStatus::Pending,
                result_summary: None,
                failure_reason: None,
                created_at: now,
                updated_at: now,
                expires_at,
            };

            if self
                .kv
                .set_if_absent(&storage_key, serde_json::to_value(&fresh)?, self.config.ttl)
                .await?
            {
                debug!(key, "Idempotency key claimed");
                return self.proceed(&storage_key).await;
            }

            // Expired or deleted between the two calls: claim again.
            let Some(raw) = self.kv.get(&storage_key).await? else {
                continue;
            };
            let existing: LedgerEntry = serde_json::from_value(raw.clone())?;

            if existing.request_hash != request_hash {
                warn!(key, "Idempotency key reused with a different request");
                return Ok(BeginOutcome::Conflict {
                    stored_hash: existing.request_hash,
                });
            }

            match existing.status {
                LedgerStatus::Completed => {
                    debug!(key, "Returning cached result");
                    return Ok(BeginOutcome::ReturnCached(
                        existing.result_summary.unwrap_or(Value::Null),
                    ));
                },
                LedgerStatus::Pending if !self.is_stale(&existing, now) => {
                    return Ok(BeginOutcome::InProgress);
                },
                LedgerStatus::Pending | LedgerStatus::Failed => {
                    let ttl = Self::remaining_ttl(&existing, now);
                    let previous = existing.status;
                    let takeover = LedgerEntry {
                        status: LedgerStatus::Pending,
                        failure_reason: None,
                        updated_at: now,
                        ..existing
                    };
                    if self
                        .kv
                        .compare_and_swap(&storage_key, &raw, serde_json::to_value(&takeover)?, ttl)
                        .await?
                    {
                        info!(key, previous = previous.as_str(), "Retrying idempotent request");
                        return self.proceed(&storage_key).await;
                    }
                },
            }
        }

        // Lost every race: somebody else is working on it.
        Ok(BeginOutcome::InProgress)
    }

    async fn proceed(&self, storage_key: &str) -> Result<BeginOutcome, IdempotencyError> {
        let attempt = self
            .kv
            .incr(&attempts_key(storage_key), self.config.ttl)
            .await?;
        Ok(BeginOutcome::Proceed {
            attempt: attempt.max(1) as u64,
        })
    }

    /// Record the result of a finished request (`pending -> completed`)
    pub async fn complete(
        &self,
        tenant_id: Uuid,
        key: &str,
        result_summary: Value,
    ) -> Result<LedgerEntry, IdempotencyError> {
        self.finish(tenant_id, key, |entry| {
            entry.status = LedgerStatus::Completed;
            entry.result_summary = Some(result_summary);
        })
        .await
    }

    /// Mark an abandoned request (`pending -> failed`) so a retry with the
    /// same payload may proceed
    pub async fn fail(
        &self,
        tenant_id: Uuid,
        key: &str,
        reason: &str,
    ) -> Result<LedgerEntry, IdempotencyError> {
        self.finish(tenant_id, key, |entry| {
            entry.status = LedgerStatus::Failed;
            entry.failure_reason = Some(reason.to_string());
        })
        .await
    }

    async fn finish(
        &self,
        tenant_id: Uuid,
        key: &str,
        apply: impl FnOnce(&mut LedgerEntry),
    ) -> Result<LedgerEntry, IdempotencyError> {
        let storage_key = ledger_key(tenant_id, key);
        let raw = self
            .kv
            .get(&storage_key)
            .await?
            .ok_or_else(|| IdempotencyError::NotFound {
                key: key.to_string(),
            })?;
        let mut entry: LedgerEntry = serde_json::from_value(raw.clone())?;

        if entry.status != LedgerStatus::Pending {
            return Err(IdempotencyError::NotPending {
                key: key.to_string(),
                status: entry.status.as_str().to_string(),
            });
        }

        let now = Utc::now();
        apply(&mut entry);
        entry.updated_at = now;

        let swapped = self
            .kv
            .compare_and_swap(
                &storage_key,
                &raw,
                serde_json::to_value(&entry)?,
                Self::remaining_ttl(&entry, now),
            )
            .await?;
        if !swapped {
            return Err(IdempotencyError::Contended {
                key: key.to_string(),
            });
        }

        debug!(key, status = entry.status.as_str(), "Idempotency entry finished");
        Ok(entry)
    }

    pub async fn get(&self, tenant_id: Uuid, key: &str) -> Result<Option<LedgerEntry>, IdempotencyError> {
        match self.kv.get(&ledger_key(tenant_id, key)).await? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    /// Forget a key regardless of its state
    pub async fn delete(&self, tenant_id: Uuid, key: &str) -> Result<bool, IdempotencyError> {
        let storage_key = ledger_key(tenant_id, key);
        self.kv.delete(&attempts_key(&storage_key)).await?;
        Ok(self.kv.delete(&storage_key).await?)
    }

    /// Drop expired entries; meant to be called by an external sweep
    pub async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let purged = self.kv.purge_expired().await?;
        if purged > 0 {
            info!(purged, "Purged expired idempotency entries");
        }
        Ok(purged)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn ledger_with(ttl: Duration, stale: Duration) -> IdempotencyLedger {
        IdempotencyLedger::new(
            Arc::new(MemoryStore::new()),
            IdempotencyConfig {
                ttl,
                stale_pending_after: stale,
            },
        )
    }

    fn ledger() -> IdempotencyLedger {
        ledger_with(Duration::from_secs(3600), Duration::from_secs(900))
    }

    #[tokio::test]
    async fn test_begin_complete_replay() {
        let ledger = ledger();
        let tenant = Uuid::new_v4();

        assert_eq!(
            ledger.begin(tenant, "k1", "h1").await.unwrap(),
            BeginOutcome::Proceed { attempt: 1 }
        );
        assert_eq!(ledger.begin(tenant, "k1", "h1").await.unwrap(), BeginOutcome::InProgress);

        ledger.complete(tenant, "k1", json!({"status": "success"})).await.unwrap();

        assert_eq!(
            ledger.begin(tenant, "k1", "h1").await.unwrap(),
            BeginOutcome::ReturnCached(json!({"status": "success"}))
        );
    }

    #[tokio::test]
    async fn test_different_hash_conflicts() {
        let ledger = ledger();
        let tenant = Uuid::new_v4();

        ledger.begin(tenant, "k1", "h1").await.unwrap();
        assert_eq!(
            ledger.begin(tenant, "k1", "h2").await.unwrap(),
            BeginOutcome::Conflict {
                stored_hash: "h1".into()
            }
        );

        ledger.complete(tenant, "k1", json!({})).await.unwrap();
        assert!(matches!(
            ledger.begin(tenant, "k1", "h2").await.unwrap(),
            BeginOutcome::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_keys_are_tenant_scoped() {
        let ledger = ledger();
        ledger.begin(Uuid::new_v4(), "shared", "h1").await.unwrap();
        assert!(matches!(
            ledger.begin(Uuid::new_v4(), "shared", "h2").await.unwrap(),
            BeginOutcome::Proceed { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_entry_allows_retry() {
        let ledger = ledger();
        let tenant = Uuid::new_v4();

        ledger.begin(tenant, "k1", "h1").await.unwrap();
        let failed = ledger.fail(tenant, "k1", "deadline exceeded").await.unwrap();
        assert_eq!(failed.status, LedgerStatus::Failed);

        assert!(matches!(
            ledger.begin(tenant, "k1", "h2").await.unwrap(),
            BeginOutcome::Conflict { .. }
        ));
        assert_eq!(
            ledger.begin(tenant, "k1", "h1").await.unwrap(),
            BeginOutcome::Proceed { attempt: 2 }
        );
        let entry = ledger.get(tenant, "k1").await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);
        assert!(entry.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_stale_pending_is_taken_over() {
        let ledger = ledger_with(Duration::from_secs(3600), Duration::ZERO);
        let tenant = Uuid::new_v4();

        ledger.begin(tenant, "k1", "h1").await.unwrap();
        assert_eq!(
            ledger.begin(tenant, "k1", "h1").await.unwrap(),
            BeginOutcome::Proceed { attempt: 2 }
        );
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let ledger = ledger_with(Duration::from_millis(50), Duration::from_secs(900));
        let tenant = Uuid::new_v4();

        ledger.begin(tenant, "k1", "h1").await.unwrap();
        ledger.complete(tenant, "k1", json!({"n": 1})).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(ledger.get(tenant, "k1").await.unwrap().is_none());
        assert!(matches!(
            ledger.begin(tenant, "k1", "other-hash").await.unwrap(),
            BeginOutcome::Proceed { .. }
        ));
    }

    #[tokio::test]
    async fn test_complete_requires_pending() {
        let ledger = ledger();
        let tenant = Uuid::new_v4();

        assert!(matches!(
            ledger.complete(tenant, "missing", json!({})).await,
            Err(IdempotencyError::NotFound { .. })
        ));

        ledger.begin(tenant, "k1", "h1").await.unwrap();
        ledger.complete(tenant, "k1", json!({})).await.unwrap();
        assert!(matches!(
            ledger.fail(tenant, "k1", "late").await,
            Err(IdempotencyError::NotPending { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_forgets_key() {
        let ledger = ledger();
        let tenant = Uuid::new_v4();

        ledger.begin(tenant, "k1", "h1").await.unwrap();
        assert!(ledger.delete(tenant, "k1").await.unwrap());
        assert_eq!(
            ledger.begin(tenant, "k1", "h2").await.unwrap(),
            BeginOutcome::Proceed { attempt: 1 }
        );
    }
}
