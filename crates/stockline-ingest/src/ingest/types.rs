//! Core types shared by the ingestion stages

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::attempt::AttemptState;
use crate::sessions::SessionProgress;

/// Kind of production entity carried by an input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "customers")]
    Customer,
    #[serde(rename = "products")]
    Product,
    #[serde(rename = "orders")]
    Order,
    #[serde(rename = "order_items")]
    OrderItem,
}

/// Promotion order: referenced kinds strictly before referencing kinds.
pub const PROMOTION_ORDER: [EntityKind; 4] = [
    EntityKind::Customer,
    EntityKind::Product,
    EntityKind::Order,
    EntityKind::OrderItem,
];

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customers",
            EntityKind::Product => "products",
            EntityKind::Order => "orders",
            EntityKind::OrderItem => "order_items",
        }
    }

    /// Column holding the globally unique identifier
    pub fn id_field(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customer_id",
            EntityKind::Product => "product_id",
            EntityKind::Order => "order_id",
            EntityKind::OrderItem => "order_item_id",
        }
    }

    /// Field that, together with the tenant, identifies a record
    pub fn natural_key_field(&self) -> &'static str {
        match self {
            EntityKind::Customer => "email",
            EntityKind::Product => "sku",
            EntityKind::Order => "external_order_id",
            EntityKind::OrderItem => "order_item_id",
        }
    }

    /// Position in [`PROMOTION_ORDER`]
    pub fn promotion_rank(&self) -> u8 {
        match self {
            EntityKind::Customer => 0,
            EntityKind::Product => 1,
            EntityKind::Order => 2,
            EntityKind::OrderItem => 3,
        }
    }

    /// Infer the kind from the `{kind}_*.ndjson` naming convention.
    ///
    /// `order_items_` is checked before `orders_` so item files are never
    /// mistaken for order files.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let base = name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(name)
            .to_ascii_lowercase();

        [
            ("customers_", EntityKind::Customer),
            ("products_", EntityKind::Product),
            ("order_items_", EntityKind::OrderItem),
            ("orders_", EntityKind::Order),
        ]
        .into_iter()
        .find(|(prefix, _)| base.starts_with(prefix))
        .map(|(_, kind)| kind)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customers" | "customer" => Ok(EntityKind::Customer),
            "products" | "product" => Ok(EntityKind::Product),
            "orders" | "order" => Ok(EntityKind::Order),
            "order_items" | "order_item" => Ok(EntityKind::OrderItem),
            other => Err(format!("unknown entity kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: Uuid,
    pub tenant_id: Uuid,
    pub sku: String,
    pub name: String,
    pub price: BigDecimal,
    pub category_id: Option<Uuid>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: Uuid,
    pub tenant_id: Uuid,
    /// Nulled at promotion when the customer does not exist
    pub customer_id: Option<Uuid>,
    pub external_order_id: String,
    pub customer_name_snapshot: String,
    pub customer_email_snapshot: String,
    pub total_amount: BigDecimal,
    pub currency: String,
    pub order_status: String,
    pub order_date: DateTime<Utc>,
    pub raw_payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItemRecord {
    pub order_item_id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i64,
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

/// A validated record ready for promotion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityRecord {
    Customer(CustomerRecord),
    Product(ProductRecord),
    Order(OrderRecord),
    OrderItem(OrderItemRecord),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Customer(_) => EntityKind::Customer,
            EntityRecord::Product(_) => EntityKind::Product,
            EntityRecord::Order(_) => EntityKind::Order,
            EntityRecord::OrderItem(_) => EntityKind::OrderItem,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            EntityRecord::Customer(r) => r.customer_id,
            EntityRecord::Product(r) => r.product_id,
            EntityRecord::Order(r) => r.order_id,
            EntityRecord::OrderItem(r) => r.order_item_id,
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        match self {
            EntityRecord::Customer(r) => r.tenant_id,
            EntityRecord::Product(r) => r.tenant_id,
            EntityRecord::Order(r) => r.tenant_id,
            EntityRecord::OrderItem(r) => r.tenant_id,
        }
    }

    /// Natural key value within the tenant
    pub fn natural_key(&self) -> String {
        match self {
            EntityRecord::Customer(r) => r.email.clone(),
            EntityRecord::Product(r) => r.sku.clone(),
            EntityRecord::Order(r) => r.external_order_id.clone(),
            EntityRecord::OrderItem(r) => r.order_item_id.to_string(),
        }
    }
}

/// Overall result classification shared by ingestion and stock updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    PartialSuccess,
    Failure,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::PartialSuccess => "partial_success",
            OutcomeStatus::Failure => "failure",
        }
    }
}

/// A record that did not reach production, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordConflict {
    pub entity_kind: EntityKind,
    pub natural_key: String,
    pub reason: String,
}

/// Result of one ingestion attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionOutcome {
    pub attempt_id: Uuid,
    pub tenant_id: Uuid,
    pub status: OutcomeStatus,
    pub attempt_state: AttemptState,
    /// Non-blank input lines, including ones that failed to decode
    pub rows_received: u64,
    pub promoted_counts: BTreeMap<EntityKind, u64>,
    /// Records whose natural key already existed
    pub skipped_counts: BTreeMap<EntityKind, u64>,
    pub conflicts: Vec<RecordConflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionProgress>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestionOutcome {
    pub fn total_promoted(&self) -> u64 {
        self.promoted_counts.values().sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped_counts.values().sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_file_name() {
        assert_eq!(EntityKind::from_file_name("customers_2024.ndjson"), Some(EntityKind::Customer));
        assert_eq!(EntityKind::from_file_name("uploads/products_1.ndjson.gz"), Some(EntityKind::Product));
        assert_eq!(EntityKind::from_file_name("order_items_01.ndjson"), Some(EntityKind::OrderItem));
        assert_eq!(EntityKind::from_file_name("ORDERS_01.csv"), Some(EntityKind::Order));
        assert_eq!(EntityKind::from_file_name("invoices_01.ndjson"), None);
    }

    #[test]
    fn test_kind_serializes_as_table_name() {
        let mut counts = BTreeMap::new();
        counts.insert(EntityKind::OrderItem, 3u64);
        counts.insert(EntityKind::Customer, 1u64);
        let json = serde_json::to_string(&counts).unwrap();
        assert_eq!(json, r#"{"customers":1,"order_items":3}"#);
    }

    #[test]
    fn test_promotion_order_is_ranked() {
        let ranks: Vec<u8> = PROMOTION_ORDER.iter().map(|k| k.promotion_rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }
}
