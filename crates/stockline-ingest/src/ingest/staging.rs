//! Attempt-scoped staging area
//!
//! Holds every decoded record of one ingestion attempt together with its
//! validity state. The decoder creates entries, the validator moves them to
//! `Valid`/`Invalid`, and the promoter marks them `Promoted`, `Skipped` or
//! `Rejected`. Nothing here outlives the attempt.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::decoder::{DecodeError, Fields};
use super::types::{EntityKind, EntityRecord, RecordConflict};
use super::validator::{validate_record, ValidationRules};

#[derive(Debug, Clone, PartialEq)]
pub enum Validity {
    /// Decoded, not yet validated
    Staged,
    Valid(EntityRecord),
    Invalid(String),
    /// Written to production by this attempt
    Promoted,
    /// Natural key already present in production
    Skipped,
    /// Valid, but refused at promotion time
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct StagedRecord {
    pub attempt_id: Uuid,
    pub tenant_id: Uuid,
    pub entity_kind: EntityKind,
    pub source: Arc<str>,
    pub line_number: u64,
    pub raw_fields: Fields,
    pub validity: Validity,
}

impl StagedRecord {
    /// Best available identification for conflict reports
    pub fn natural_key(&self) -> String {
        if let Validity::Valid(record) = &self.validity {
            return record.natural_key();
        }

        [self.entity_kind.natural_key_field(), self.entity_kind.id_field()]
            .iter()
            .find_map(|field| match self.raw_fields.get(*field) {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| format!("line:{}", self.line_number))
    }
}

#[derive(Debug, Clone)]
struct DecodeFailure {
    entity_kind: EntityKind,
    line_number: u64,
    message: String,
}

/// Counts produced by a validation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub valid: usize,
    pub invalid: usize,
}

#[derive(Debug)]
pub struct StagingArea {
    attempt_id: Uuid,
    tenant_id: Uuid,
    records: Vec<StagedRecord>,
    decode_failures: Vec<DecodeFailure>,
}

impl StagingArea {
    pub fn new(attempt_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            attempt_id,
            tenant_id,
            records: Vec::new(),
            decode_failures: Vec::new(),
        }
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn stage(&mut self, entity_kind: EntityKind, source: Arc<str>, line_number: u64, raw_fields: Fields) {
        self.records.push(StagedRecord {
            attempt_id: self.attempt_id,
            tenant_id: self.tenant_id,
            entity_kind,
            source,
            line_number,
            raw_fields,
            validity: Validity::Staged,
        });
    }

    pub fn record_decode_failure(&mut self, entity_kind: EntityKind, line_number: u64, error: &DecodeError) {
        self.decode_failures.push(DecodeFailure {
            entity_kind,
            line_number,
            message: error.message.clone(),
        });
    }

    /// Decoded records plus lines that failed to decode
    pub fn rows_received(&self) -> u64 {
        (self.records.len() + self.decode_failures.len()) as u64
    }

    pub fn records(&self) -> &[StagedRecord] {
        &self.records
    }

    /// Run the validator over every record still in `Staged`.
    pub fn validate_all(&mut self, rules: &ValidationRules) -> ValidationSummary {
        let mut summary = ValidationSummary::default();
        let tenant_id = self.tenant_id;

        for record in self.records.iter_mut().filter(|r| r.validity == Validity::Staged) {
            match validate_record(record.entity_kind, tenant_id, &record.raw_fields, rules) {
                Ok(valid) => {
                    record.validity = Validity::Valid(valid);
                    summary.valid += 1;
                },
                Err(reason) => {
                    tracing::debug!(
                        kind = %record.entity_kind,
                        line = record.line_number,
                        source = %record.source,
                        reason = %reason,
                        "Record failed validation"
                    );
                    record.validity = Validity::Invalid(reason);
                    summary.invalid += 1;
                },
            }
        }

        summary
    }

    /// Indices and clones of the valid records of one kind, in input order
    pub fn valid_records(&self, kind: EntityKind) -> Vec<(usize, EntityRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.entity_kind == kind)
            .filter_map(|(idx, r)| match &r.validity {
                Validity::Valid(record) => Some((idx, record.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn mark_promoted(&mut self, idx: usize) {
        self.transition_valid(idx, Validity::Promoted);
    }

    pub fn mark_skipped(&mut self, idx: usize) {
        self.transition_valid(idx, Validity::Skipped);
    }

    pub fn mark_rejected(&mut self, idx: usize, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(record) = self.records.get(idx) {
            tracing::debug!(
                kind = %record.entity_kind,
                line = record.line_number,
                reason = %reason,
                "Record rejected at promotion"
            );
        }
        self.transition_valid(idx, Validity::Rejected(reason));
    }

    /// Only valid records can be consumed by promotion.
    fn transition_valid(&mut self, idx: usize, next: Validity) {
        if let Some(record) = self.records.get_mut(idx) {
            if matches!(record.validity, Validity::Valid(_)) {
                record.validity = next;
            }
        }
    }

    /// Per-kind count of records in the given terminal state
    fn count_where(&self, pred: impl Fn(&Validity) -> bool) -> BTreeMap<EntityKind, u64> {
        let mut counts = BTreeMap::new();
        for record in self.records.iter().filter(|r| pred(&r.validity)) {
            *counts.entry(record.entity_kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn promoted_counts(&self) -> BTreeMap<EntityKind, u64> {
        self.count_where(|v| *v == Validity::Promoted)
    }

    pub fn skipped_counts(&self) -> BTreeMap<EntityKind, u64> {
        self.count_where(|v| *v == Validity::Skipped)
    }

    /// Every line that did not reach production: decode failures first,
    /// then invalid and rejected records in input order.
    pub fn conflicts(&self) -> Vec<RecordConflict> {
        let decode = self.decode_failures.iter().map(|f| RecordConflict {
            entity_kind: f.entity_kind,
            natural_key: format!("line:{}", f.line_number),
            reason: f.message.clone(),
        });

        let records = self.records.iter().filter_map(|r| match &r.validity {
            Validity::Invalid(reason) | Validity::Rejected(reason) => Some(RecordConflict {
                entity_kind: r.entity_kind,
                natural_key: r.natural_key(),
                reason: reason.clone(),
            }),
            _ => None,
        });

        decode.chain(records).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_validate_and_promote_lifecycle() {
        let tenant = Uuid::new_v4();
        let mut staging = StagingArea::new(Uuid::new_v4(), tenant);
        let source: Arc<str> = Arc::from("customers_1.ndjson");

        staging.stage(
            EntityKind::Customer,
            source.clone(),
            1,
            fields(json!({
                "customer_id": Uuid::new_v4().to_string(),
                "name": "Ada",
                "email": "ada@example.com"
            })),
        );
        staging.stage(
            EntityKind::Customer,
            source,
            2,
            fields(json!({ "name": "No Email" })),
        );
        staging.record_decode_failure(
            EntityKind::Customer,
            3,
            &DecodeError {
                message: "invalid JSON".into(),
                fatal: false,
            },
        );

        let summary = staging.validate_all(&ValidationRules::default());
        assert_eq!(summary, ValidationSummary { valid: 1, invalid: 1 });
        assert_eq!(staging.rows_received(), 3);

        let valid = staging.valid_records(EntityKind::Customer);
        assert_eq!(valid.len(), 1);
        staging.mark_promoted(valid[0].0);

        // Promotion can only consume valid records.
        staging.mark_promoted(1);
        assert!(matches!(staging.records()[1].validity, Validity::Invalid(_)));

        assert_eq!(staging.promoted_counts()[&EntityKind::Customer], 1);

        let conflicts = staging.conflicts();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].natural_key, "line:3");
        assert_eq!(conflicts[1].natural_key, "line:2");
        assert!(conflicts[1].reason.contains("email"));
    }

    #[test]
    fn test_natural_key_prefers_raw_key_field() {
        let mut staging = StagingArea::new(Uuid::new_v4(), Uuid::new_v4());
        staging.stage(
            EntityKind::Product,
            Arc::from("products_1.ndjson"),
            7,
            fields(json!({ "sku": " SKU-9 ", "price": -1 })),
        );
        staging.validate_all(&ValidationRules::default());
        assert_eq!(staging.conflicts()[0].natural_key, "SKU-9");
    }
}
