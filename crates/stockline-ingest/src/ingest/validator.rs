//! Record validation
//!
//! Checks one staged record in isolation: required fields, UUID shape,
//! numeric domains, enumerations and lengths. Whether referenced rows exist
//! is decided later, at promotion.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Value};
use std::str::FromStr;
use uuid::Uuid;

use super::decoder::Fields;
use super::types::{
    CustomerRecord, EntityKind, EntityRecord, OrderItemRecord, OrderRecord, ProductRecord,
};

/// Domain limits applied by the validator
#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub currencies: Vec<String>,
    pub order_statuses: Vec<String>,
    pub max_name_len: usize,
    pub max_email_len: usize,
    pub max_sku_len: usize,
    pub max_external_id_len: usize,
    pub max_snapshot_len: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            currencies: ["USD", "EUR", "GBP", "CAD"].map(String::from).to_vec(),
            order_statuses: [
                "pending",
                "confirmed",
                "processing",
                "shipped",
                "delivered",
                "cancelled",
                "refunded",
            ]
            .map(String::from)
            .to_vec(),
            max_name_len: 255,
            max_email_len: 255,
            max_sku_len: 100,
            max_external_id_len: 100,
            max_snapshot_len: 255,
        }
    }
}

type FieldResult<T> = Result<T, String>;

/// Validate raw fields as a record of `kind` owned by `tenant_id`.
pub fn validate_record(
    kind: EntityKind,
    tenant_id: Uuid,
    fields: &Fields,
    rules: &ValidationRules,
) -> Result<EntityRecord, String> {
    let reader = FieldReader { fields };

    if let Some(raw) = reader.present("tenant_id") {
        match raw.as_str().map(|s| Uuid::parse_str(s.trim())) {
            Some(Ok(id)) if id == tenant_id => {},
            _ => return Err("tenant mismatch".to_string()),
        }
    }

    let required: &[&str] = match kind {
        EntityKind::Customer => &["customer_id", "name", "email"],
        EntityKind::Product => &["product_id", "sku", "name", "price"],
        EntityKind::Order => &[
            "order_id",
            "external_order_id",
            "total_amount",
            "currency",
            "order_status",
            "order_date",
        ],
        EntityKind::OrderItem => &[
            "order_item_id",
            "order_id",
            "product_id",
            "quantity",
            "unit_price",
            "line_total",
        ],
    };
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| reader.present(field).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required fields: {}", missing.join(", ")));
    }

    let record = match kind {
        EntityKind::Customer => EntityRecord::Customer(CustomerRecord {
            customer_id: reader.uuid("customer_id")?,
            tenant_id,
            name: reader.text("name", rules.max_name_len)?,
            email: reader.email("email", rules.max_email_len)?,
            metadata: reader.json_object("metadata"),
        }),
        EntityKind::Product => EntityRecord::Product(ProductRecord {
            product_id: reader.uuid("product_id")?,
            tenant_id,
            sku: reader.text("sku", rules.max_sku_len)?,
            name: reader.text("name", rules.max_name_len)?,
            price: reader.non_negative_decimal("price")?,
            category_id: reader.optional_uuid("category_id")?,
            active: reader.optional_bool("active")?.unwrap_or(true),
        }),
        EntityKind::Order => EntityRecord::Order(OrderRecord {
            order_id: reader.uuid("order_id")?,
            tenant_id,
            customer_id: reader.optional_uuid("customer_id")?,
            external_order_id: reader.text("external_order_id", rules.max_external_id_len)?,
            customer_name_snapshot: reader
                .optional_text("customer_name_snapshot", rules.max_snapshot_len)?
                .unwrap_or_default(),
            customer_email_snapshot: reader
                .optional_text("customer_email_snapshot", rules.max_snapshot_len)?
                .unwrap_or_default(),
            total_amount: reader.non_negative_decimal("total_amount")?,
            currency: reader.one_of("currency", &rules.currencies, true)?,
            order_status: reader.one_of("order_status", &rules.order_statuses, false)?,
            order_date: reader.timestamp("order_date")?,
            raw_payload: reader.json_object("raw_payload"),
        }),
        EntityKind::OrderItem => EntityRecord::OrderItem(OrderItemRecord {
            order_item_id: reader.uuid("order_item_id")?,
            tenant_id,
            order_id: reader.uuid("order_id")?,
            product_id: reader.uuid("product_id")?,
            quantity: reader.non_negative_integer("quantity")?,
            unit_price: reader.non_negative_decimal("unit_price")?,
            line_total: reader.non_negative_decimal("line_total")?,
        }),
    };

    Ok(record)
}

struct FieldReader<'a> {
    fields: &'a Fields,
}

impl<'a> FieldReader<'a> {
    /// A field counts as present unless it is absent, null or blank.
    fn present(&self, name: &str) -> Option<&'a Value> {
        match self.fields.get(name) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(value) => Some(value),
        }
    }

    fn scalar_string(&self, name: &str) -> FieldResult<Option<String>> {
        match self.present(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(format!("{} must be a string", name)),
        }
    }

    fn text(&self, name: &str, max_len: usize) -> FieldResult<String> {
        self.optional_text(name, max_len)?
            .ok_or_else(|| format!("{} is required", name))
    }

    fn optional_text(&self, name: &str, max_len: usize) -> FieldResult<Option<String>> {
        let value = self.scalar_string(name)?;
        if let Some(ref s) = value {
            if s.chars().count() > max_len {
                return Err(format!("{} exceeds {} characters", name, max_len));
            }
        }
        Ok(value)
    }

    fn email(&self, name: &str, max_len: usize) -> FieldResult<String> {
        let email = self.text(name, max_len)?;
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => {
                Ok(email)
            },
            _ => Err(format!("{} is not a valid email address", name)),
        }
    }

    fn uuid(&self, name: &str) -> FieldResult<Uuid> {
        self.optional_uuid(name)?
            .ok_or_else(|| format!("{} is required", name))
    }

    fn optional_uuid(&self, name: &str) -> FieldResult<Option<Uuid>> {
        match self.present(name) {
            None => Ok(None),
            Some(Value::String(s)) => Uuid::parse_str(s.trim())
                .map(Some)
                .map_err(|_| format!("{} is not a valid UUID", name)),
            Some(_) => Err(format!("{} is not a valid UUID", name)),
        }
    }

    fn non_negative_decimal(&self, name: &str) -> FieldResult<BigDecimal> {
        let raw = self
            .scalar_string(name)?
            .ok_or_else(|| format!("{} is required", name))?;
        let value =
            BigDecimal::from_str(&raw).map_err(|_| format!("{} is not a valid number", name))?;
        if value < BigDecimal::zero() {
            return Err(format!("{} must be >= 0", name));
        }
        Ok(value)
    }

    fn non_negative_integer(&self, name: &str) -> FieldResult<i64> {
        let value = match self.present(name) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| format!("{} must be an integer", name))?;

        if value < 0 {
            return Err(format!("{} must be >= 0", name));
        }
        Ok(value)
    }

    fn optional_bool(&self, name: &str) -> FieldResult<Option<bool>> {
        match self.present(name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(format!("{} must be a boolean", name)),
            },
            Some(Value::Number(n)) if n.as_i64() == Some(0) => Ok(Some(false)),
            Some(Value::Number(n)) if n.as_i64() == Some(1) => Ok(Some(true)),
            Some(_) => Err(format!("{} must be a boolean", name)),
        }
    }

    fn one_of(&self, name: &str, allowed: &[String], uppercase: bool) -> FieldResult<String> {
        let raw = self
            .scalar_string(name)?
            .ok_or_else(|| format!("{} is required", name))?;
        let value = if uppercase {
            raw.to_ascii_uppercase()
        } else {
            raw.to_ascii_lowercase()
        };
        if allowed.iter().any(|a| *a == value) {
            Ok(value)
        } else {
            Err(format!("{} '{}' is not one of {}", name, raw, allowed.join(", ")))
        }
    }

    fn timestamp(&self, name: &str) -> FieldResult<DateTime<Utc>> {
        let raw = self
            .scalar_string(name)?
            .ok_or_else(|| format!("{} is required", name))?;
        parse_timestamp(&raw).ok_or_else(|| format!("{} is not a valid timestamp", name))
    }

    /// JSON objects pass through, strings holding JSON are parsed, anything
    /// else is wrapped as `{"value": ...}`.
    fn json_object(&self, name: &str) -> Value {
        match self.present(name) {
            None => json!({}),
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => parsed,
                _ => json!({ "value": s }),
            },
            Some(obj @ Value::Object(_)) => obj.clone(),
            Some(other) => json!({ "value": other }),
        }
    }
}

/// RFC 3339, naive ISO date-time (taken as UTC) or a bare date.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn order_fields() -> Value {
        json!({
            "order_id": Uuid::new_v4().to_string(),
            "external_order_id": "EXT-1",
            "customer_id": Uuid::new_v4().to_string(),
            "customer_name_snapshot": "Ada",
            "total_amount": "19.90",
            "currency": "usd",
            "order_status": "Shipped",
            "order_date": "2024-03-01T10:00:00Z",
            "raw_payload": "{\"channel\":\"web\"}"
        })
    }

    #[test]
    fn test_valid_order_normalizes_enums() {
        let tenant = Uuid::new_v4();
        let record = validate_record(
            EntityKind::Order,
            tenant,
            &fields(order_fields()),
            &ValidationRules::default(),
        )
        .unwrap();

        let EntityRecord::Order(order) = record else {
            panic!("expected order");
        };
        assert_eq!(order.currency, "USD");
        assert_eq!(order.order_status, "shipped");
        assert_eq!(order.customer_email_snapshot, "");
        assert_eq!(order.raw_payload, json!({"channel": "web"}));
        assert_eq!(order.total_amount, BigDecimal::from_str("19.90").unwrap());
    }

    #[test]
    fn test_unknown_currency_is_invalid() {
        let mut value = order_fields();
        value["currency"] = json!("JPY");
        let err = validate_record(
            EntityKind::Order,
            Uuid::new_v4(),
            &fields(value),
            &ValidationRules::default(),
        )
        .unwrap_err();
        assert!(err.contains("currency"));
    }

    #[test]
    fn test_negative_price_is_invalid() {
        let value = json!({
            "product_id": Uuid::new_v4().to_string(),
            "sku": "SKU-1",
            "name": "Widget",
            "price": -0.01
        });
        let err = validate_record(
            EntityKind::Product,
            Uuid::new_v4(),
            &fields(value),
            &ValidationRules::default(),
        )
        .unwrap_err();
        assert_eq!(err, "price must be >= 0");
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let value = json!({
            "order_item_id": Uuid::new_v4().to_string(),
            "order_id": Uuid::new_v4().to_string(),
            "product_id": Uuid::new_v4().to_string(),
            "quantity": "0",
            "unit_price": "2.50",
            "line_total": 0
        });
        let record = validate_record(
            EntityKind::OrderItem,
            Uuid::new_v4(),
            &fields(value),
            &ValidationRules::default(),
        )
        .unwrap();
        let EntityRecord::OrderItem(item) = record else {
            panic!("expected order item");
        };
        assert_eq!(item.quantity, 0);
    }

    #[test]
    fn test_fractional_quantity_is_invalid() {
        let value = json!({
            "order_item_id": Uuid::new_v4().to_string(),
            "order_id": Uuid::new_v4().to_string(),
            "product_id": Uuid::new_v4().to_string(),
            "quantity": 1.5,
            "unit_price": 1,
            "line_total": 1.5
        });
        assert!(validate_record(
            EntityKind::OrderItem,
            Uuid::new_v4(),
            &fields(value),
            &ValidationRules::default(),
        )
        .is_err());
    }

    #[test]
    fn test_malformed_uuid_and_tenant_mismatch() {
        let rules = ValidationRules::default();
        let tenant = Uuid::new_v4();

        let bad_uuid = json!({"customer_id": "not-a-uuid", "name": "Ada", "email": "ada@example.com"});
        assert_eq!(
            validate_record(EntityKind::Customer, tenant, &fields(bad_uuid), &rules).unwrap_err(),
            "customer_id is not a valid UUID"
        );

        let foreign = json!({
            "tenant_id": Uuid::new_v4().to_string(),
            "customer_id": Uuid::new_v4().to_string(),
            "name": "Ada",
            "email": "ada@example.com"
        });
        assert_eq!(
            validate_record(EntityKind::Customer, tenant, &fields(foreign), &rules).unwrap_err(),
            "tenant mismatch"
        );
    }

    #[test]
    fn test_sku_length_limit() {
        let value = json!({
            "product_id": Uuid::new_v4().to_string(),
            "sku": "X".repeat(101),
            "name": "Widget",
            "price": 1
        });
        let err = validate_record(
            EntityKind::Product,
            Uuid::new_v4(),
            &fields(value),
            &ValidationRules::default(),
        )
        .unwrap_err();
        assert!(err.contains("100"));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert!(parse_timestamp("2024-03-01T10:00:00+02:00").is_some());
        assert!(parse_timestamp("2024-03-01T10:00:00.123").is_some());
        assert!(parse_timestamp("2024-03-01 10:00:00").is_some());
        assert!(parse_timestamp("2024-03-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
