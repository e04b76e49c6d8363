//! Trust scoring.
//!
//! Four components per record (source reliability, completeness,
//! timeliness, validity), each in [0, 1], combined with configured weights
//! summing to 1. Scores attach to the normalized record before matching so
//! survivorship can rank values without recomputation.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::MdmConfig;
use crate::model::record::{NormalizedRecord, TrustScore};
use crate::model::schema::{EntityDescriptor, SchemaRegistry};

pub struct TrustScorer {
    config: Arc<MdmConfig>,
}

impl TrustScorer {
    pub fn new(config: Arc<MdmConfig>) -> Self {
        Self { config }
    }

    /// Score one record. `now` is the run timestamp, passed in so a batch
    /// scores consistently and reruns are reproducible.
    pub fn score(
        &self,
        record: &NormalizedRecord,
        schema: &SchemaRegistry,
        now: DateTime<Utc>,
    ) -> TrustScore {
        let entity = schema.entity(&self.config.entity_type);
        let source_reliability = self
            .config
            .sources
            .get(record.source_id())
            .map(|s| s.reliability)
            .unwrap_or(0.0);
        let completeness = entity
            .map(|e| self.completeness(record, e))
            .unwrap_or(0.0);
        let timeliness = self.timeliness(record, now);
        let validity = entity
            .map(|e| self.validity(record, e, schema))
            .unwrap_or(0.0);

        let w = &self.config.trust.component_weights;
        let overall = (w.source * source_reliability
            + w.completeness * completeness
            + w.timeliness * timeliness
            + w.validity * validity)
            .clamp(0.0, 1.0);

        TrustScore {
            record_id: record.record_id().to_string(),
            source_reliability,
            completeness,
            timeliness,
            validity,
            overall,
        }
    }

    /// Score and attach in one step.
    pub fn attach(
        &self,
        mut record: NormalizedRecord,
        schema: &SchemaRegistry,
        now: DateTime<Utc>,
    ) -> NormalizedRecord {
        record.trust = Some(self.score(&record, schema, now));
        record
    }

    /// Importance-weighted fraction of required fields that are non-null.
    /// Entities with no required fields fall back to all declared fields.
    fn completeness(&self, record: &NormalizedRecord, entity: &EntityDescriptor) -> f64 {
        let required: Vec<_> = entity.required_fields().collect();
        let fields: Vec<_> = if required.is_empty() {
            entity.fields.iter().collect()
        } else {
            required
        };
        let mut present = 0.0;
        let mut total = 0.0;
        for field in fields {
            let importance =
                self.config
                    .importance_for(record.source_id(), &field.name, field.importance);
            total += importance;
            if !record.record.is_null(&field.name) {
                present += importance;
            }
        }
        if total == 0.0 {
            1.0
        } else {
            present / total
        }
    }

    /// `exp(-age_days / half_life_days)`, with age measured from the source
    /// timestamp when present, otherwise ingest time.
    fn timeliness(&self, record: &NormalizedRecord, now: DateTime<Utc>) -> f64 {
        let reference = record
            .record
            .source_timestamp
            .unwrap_or(record.record.ingest_time);
        let age_days = (now - reference).num_seconds().max(0) as f64 / 86_400.0;
        (-age_days / self.config.trust.half_life_days).exp()
    }

    /// Fraction of non-null validated fields that pass their rules. With no
    /// validation rules configured the record is vacuously valid.
    fn validity(
        &self,
        record: &NormalizedRecord,
        entity: &EntityDescriptor,
        schema: &SchemaRegistry,
    ) -> f64 {
        let mut passed = 0usize;
        let mut total = 0usize;
        for field in &entity.fields {
            if field.validation.is_empty() || record.record.is_null(&field.name) {
                continue;
            }
            let value = record.value(&field.name);
            total += 1;
            if field
                .validation
                .iter()
                .all(|rule| schema.check_rule(rule, value).passed())
            {
                passed += 1;
            }
        }
        if total == 0 {
            1.0
        } else {
            passed as f64 / total as f64
        }
    }
}
