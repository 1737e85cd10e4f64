//! Narrow key-value interface used by the idempotency ledger
//!
//! The ledger does not own its storage. Anything offering TTL-aware
//! get/set with an atomic "set if absent" and compare-and-swap can back it.
//! Expired keys behave exactly like missing keys.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::StoreError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Unconditional write with a fresh TTL
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError>;

    /// Write only if the key is missing or expired; `true` when written
    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> Result<bool, StoreError>;

    /// Replace the value only if it still equals `expected`; `true` when swapped
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Increment an integer counter, creating it at 1 with `ttl`
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// `true` when a live key was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Drop expired keys; returns how many were removed
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}
