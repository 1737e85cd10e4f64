//! Stock update inputs and outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ingest::types::OutcomeStatus;

/// Origin of a stock movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StockSource {
    Manual,
    Order,
    Receipt,
    Return,
    Adjustment,
    #[default]
    System,
}

impl StockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockSource::Manual => "manual",
            StockSource::Order => "order",
            StockSource::Receipt => "receipt",
            StockSource::Return => "return",
            StockSource::Adjustment => "adjustment",
            StockSource::System => "system",
        }
    }
}

impl std::str::FromStr for StockSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(StockSource::Manual),
            "order" => Ok(StockSource::Order),
            "receipt" => Ok(StockSource::Receipt),
            "return" => Ok(StockSource::Return),
            "adjustment" => Ok(StockSource::Adjustment),
            "system" => Ok(StockSource::System),
            other => Err(format!("unknown stock source '{}'", other)),
        }
    }
}

impl From<String> for StockSource {
    fn from(s: String) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// What to do when a delta would take the level below zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeStockPolicy {
    /// Roll back the product and report a conflict
    #[default]
    Reject,
    /// Floor the level at zero
    ClampToZero,
    /// Let the level go negative (backorders)
    Allow,
}

impl std::str::FromStr for NegativeStockPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(NegativeStockPolicy::Reject),
            "clamp" | "clamp_to_zero" => Ok(NegativeStockPolicy::ClampToZero),
            "allow" => Ok(NegativeStockPolicy::Allow),
            other => Err(anyhow::anyhow!("Invalid negative stock policy: {}", other)),
        }
    }
}

/// One requested stock movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockEventInput {
    pub product_id: Uuid,
    pub delta: i64,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: StockSource,
    #[serde(default)]
    pub meta: Value,
}

impl StockEventInput {
    pub fn new(product_id: Uuid, delta: i64) -> Self {
        Self {
            product_id,
            delta,
            event_time: None,
            source: StockSource::System,
            meta: Value::Object(Default::default()),
        }
    }

    pub fn at(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }

    pub fn with_source(mut self, source: StockSource) -> Self {
        self.source = source;
        self
    }
}

/// A line naming a product whose other fields could not be interpreted.
///
/// The named product is rejected as a whole rather than partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidStockEvent {
    pub product_id: Uuid,
    pub line_number: u64,
    pub reason: String,
}

/// Stock event as written to the append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockEventRecord {
    pub tenant_id: Uuid,
    pub product_id: Uuid,
    pub delta: i64,
    pub resulting_level: i64,
    pub event_time: DateTime<Utc>,
    pub source: StockSource,
    pub meta: Value,
}

/// A product whose events were all applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedProduct {
    pub product_id: Uuid,
    pub events_processed: u64,
    pub final_level: i64,
}

/// A product whose unit of work was rolled back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConflict {
    pub product_id: Uuid,
    pub reason: String,
    /// Resubmitting this product's events later may succeed
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockUpdateOutcome {
    pub status: OutcomeStatus,
    pub applied: Vec<AppliedProduct>,
    pub conflicts: Vec<ProductConflict>,
    pub total_events_processed: u64,
    /// Input events that could not be interpreted
    pub skipped_events: u64,
}
