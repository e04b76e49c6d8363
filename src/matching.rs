//! Pairwise match engine.
//!
//! For each configured field: resolve the comparator (conditional rules
//! first), apply the field's null policy, score through the shared memo
//! cache, floor against the field threshold, then weight. Field scores
//! aggregate into an overall score and a verdict against the configured
//! match/review thresholds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::block::CandidatePair;
use crate::compare::{self, CacheKey, ComparatorCache};
use crate::config::{
    Aggregation, ComparatorSpec, ConditionOperator, ConditionalRule, MdmConfig, NullPolicy,
};
use crate::model::record::{AttributeValue, NormalizedRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Match,
    Review,
    NoMatch,
}

/// The outcome of evaluating one candidate pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchDecision {
    pub pair: CandidatePair,
    pub overall_score: f64,
    /// Per-field scores for downstream explanation. Fields excluded by the
    /// `skip` null policy are absent.
    pub field_scores: BTreeMap<String, f64>,
    pub verdict: Verdict,
    /// Identifier of the match profile that produced this decision.
    pub rule_id: String,
}

/// Applies the configured field comparisons to candidate pairs.
pub struct MatchEngine {
    config: Arc<MdmConfig>,
    cache: ComparatorCache,
    comparator_warnings: AtomicU64,
}

impl MatchEngine {
    pub fn new(config: Arc<MdmConfig>) -> Self {
        let cache = ComparatorCache::new(config.cache.shards, config.cache.capacity_per_shard);
        Self {
            config,
            cache,
            comparator_warnings: AtomicU64::new(0),
        }
    }

    /// Number of comparator failures absorbed as score 0 so far.
    pub fn warning_count(&self) -> u64 {
        self.comparator_warnings.load(Ordering::Relaxed)
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    /// Evaluate one pair. Never fails: comparator errors degrade to score 0
    /// with a warning, per the pipeline's failure semantics.
    pub fn evaluate_pair(
        &self,
        left: &NormalizedRecord,
        right: &NormalizedRecord,
    ) -> MatchDecision {
        let mut field_scores = BTreeMap::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut min_score: Option<f64> = None;
        let mut product = 1.0;
        let mut contributed = false;

        for (field, field_config) in &self.config.fields {
            let spec = self.select_comparator(field_config, left);
            let left_value = left.value(field);
            let right_value = right.value(field);

            let score = match self.null_policy_score(
                field_config.null_policy,
                left_value,
                right_value,
            ) {
                NullOutcome::Skip => continue,
                NullOutcome::Fixed(score) => score,
                NullOutcome::Compare => self.score_field(field, spec, left, right),
            };

            // Per-field floor: below-threshold similarity is noise.
            let score = if score < field_config.threshold {
                0.0
            } else {
                score
            };

            field_scores.insert(field.clone(), score);
            weighted_sum += score * field_config.weight;
            weight_total += field_config.weight;
            min_score = Some(min_score.map_or(score, |m: f64| m.min(score)));
            product *= score;
            contributed = true;
        }

        let overall_score = if !contributed {
            0.0
        } else {
            match self.config.aggregation {
                Aggregation::WeightedAverage => {
                    if weight_total > 0.0 {
                        weighted_sum / weight_total
                    } else {
                        0.0
                    }
                }
                Aggregation::Min => min_score.unwrap_or(0.0),
                Aggregation::Product => product,
            }
        };

        let thresholds = &self.config.thresholds;
        let verdict = if overall_score >= thresholds.match_threshold {
            Verdict::Match
        } else if overall_score >= thresholds.review_threshold {
            Verdict::Review
        } else {
            Verdict::NoMatch
        };

        MatchDecision {
            pair: CandidatePair::new(left.record_id(), right.record_id()),
            overall_score,
            field_scores,
            verdict,
            rule_id: self.config.profile_id.clone(),
        }
    }

    /// A conditional rule whose predicate holds on the left record
    /// replaces the field's default comparator for the pair.
    fn select_comparator<'a>(
        &self,
        field_config: &'a crate::config::FieldConfig,
        left: &NormalizedRecord,
    ) -> &'a ComparatorSpec {
        for rule in &field_config.conditional_rules {
            if condition_holds(rule, left) {
                return &rule.comparator;
            }
        }
        &field_config.comparator
    }

    fn null_policy_score(
        &self,
        policy: NullPolicy,
        left: &AttributeValue,
        right: &AttributeValue,
    ) -> NullOutcome {
        let left_null = left.is_null();
        let right_null = right.is_null();
        if !left_null && !right_null {
            return NullOutcome::Compare;
        }
        match policy {
            NullPolicy::TreatAsMismatch => NullOutcome::Fixed(0.0),
            NullPolicy::Skip => NullOutcome::Skip,
            NullPolicy::TreatNullsEqual => {
                if left_null && right_null {
                    NullOutcome::Fixed(1.0)
                } else {
                    NullOutcome::Fixed(0.0)
                }
            }
        }
    }

    fn score_field(
        &self,
        field: &str,
        spec: &ComparatorSpec,
        left: &NormalizedRecord,
        right: &NormalizedRecord,
    ) -> f64 {
        // The vector comparator needs the records, not just the values.
        if let ComparatorSpec::Vector { fallback } = spec {
            if let (Some(a), Some(b)) = (left.embeddings.get(field), right.embeddings.get(field)) {
                return compare::cosine_similarity(a, b);
            }
            return self.score_field(field, fallback, left, right);
        }

        let comparator = compare::comparator_id(spec);
        let key = CacheKey::new(
            hash_str(&comparator),
            left.value_hash(field),
            right.value_hash(field),
        );
        if let Some(score) = self.cache.get(&key) {
            return score;
        }

        let score = match compare::evaluate(spec, left.value(field), right.value(field)) {
            Ok(score) => score,
            Err(error) => {
                self.comparator_warnings.fetch_add(1, Ordering::Relaxed);
                warn!(field, comparator, %error, "comparator failed; scoring 0");
                0.0
            }
        };
        self.cache.insert(key, score);
        score
    }
}

enum NullOutcome {
    Compare,
    Skip,
    Fixed(f64),
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Evaluate a conditional rule's predicate against a record.
fn condition_holds(rule: &ConditionalRule, record: &NormalizedRecord) -> bool {
    let value = record.value(&rule.condition_field);
    let target = &rule.value;
    match rule.operator {
        ConditionOperator::Equals => value.canonical_key() == AttributeValue::from_json(target).canonical_key(),
        ConditionOperator::NotEquals => {
            value.canonical_key() != AttributeValue::from_json(target).canonical_key()
        }
        ConditionOperator::GreaterThan => match (value.as_number(), target.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::LessThan => match (value.as_number(), target.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConditionOperator::Contains => match (value.as_text(), target.as_str()) {
            (Some(a), Some(b)) => a.contains(b),
            _ => false,
        },
        ConditionOperator::StartsWith => match (value.as_text(), target.as_str()) {
            (Some(a), Some(b)) => a.starts_with(b),
            _ => false,
        },
        ConditionOperator::EndsWith => match (value.as_text(), target.as_str()) {
            (Some(a), Some(b)) => a.ends_with(b),
            _ => false,
        },
        ConditionOperator::Regex => match (value.as_text(), target.as_str()) {
            (Some(a), Some(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(&a))
                .unwrap_or(false),
            _ => false,
        },
        ConditionOperator::In => match target.as_array() {
            Some(items) => items
                .iter()
                .any(|item| AttributeValue::from_json(item).canonical_key() == value.canonical_key()),
            None => false,
        },
        ConditionOperator::NotIn => match target.as_array() {
            Some(items) => !items
                .iter()
                .any(|item| AttributeValue::from_json(item).canonical_key() == value.canonical_key()),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::Record;
    use chrono::Utc;

    fn config_json(json: serde_json::Value) -> Arc<MdmConfig> {
        Arc::new(serde_json::from_value(json).unwrap())
    }

    fn base_config() -> Arc<MdmConfig> {
        config_json(serde_json::json!({
            "entity_type": "customer",
            "sources": {"crm": {"reliability": 0.9}},
            "fields": {
                "name": {
                    "comparator": {"type": "fuzzy", "method": "jaro_winkler"},
                    "weight": 0.5
                },
                "phone": {"comparator": {"type": "exact"}, "weight": 0.5, "null_policy": "skip"}
            },
            "blocking": {"strategy": "standard", "keys": [{"field": "name"}]},
            "thresholds": {"match": 0.85, "review": 0.65}
        }))
    }

    fn normalized(id: &str, attrs: Vec<(&str, AttributeValue)>) -> NormalizedRecord {
        NormalizedRecord {
            record: Record {
                record_id: id.to_string(),
                source_id: "crm".to_string(),
                attributes: attrs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                ingest_time: Utc::now(),
                source_timestamp: None,
            },
            normalized: BTreeMap::new(),
            embeddings: BTreeMap::new(),
            value_hashes: BTreeMap::new(),
            trust: None,
        }
    }

    fn text(s: &str) -> AttributeValue {
        AttributeValue::Text(s.to_string())
    }

    #[test]
    fn equal_records_match() {
        let engine = MatchEngine::new(base_config());
        let a = normalized(
            "r1",
            vec![("name", text("Acme Corp")), ("phone", text("+15550100123"))],
        );
        let b = normalized(
            "r2",
            vec![("name", text("Acme Corp")), ("phone", text("+15550100123"))],
        );
        let decision = engine.evaluate_pair(&a, &b);
        assert_eq!(decision.verdict, Verdict::Match);
        assert!((decision.overall_score - 1.0).abs() < 1e-9);
        assert_eq!(decision.rule_id, "default");
    }

    #[test]
    fn skip_policy_excludes_field_from_denominator() {
        let engine = MatchEngine::new(base_config());
        let a = normalized(
            "r1",
            vec![("name", text("Acme Corp")), ("phone", AttributeValue::Null)],
        );
        let b = normalized(
            "r2",
            vec![("name", text("Acme Corp")), ("phone", text("+15550100123"))],
        );
        let decision = engine.evaluate_pair(&a, &b);
        // Only the name contributed, so identical names still hit 1.0.
        assert!((decision.overall_score - 1.0).abs() < 1e-9);
        assert!(!decision.field_scores.contains_key("phone"));
    }

    #[test]
    fn treat_nulls_equal_scores_one_for_double_null() {
        let config = config_json(serde_json::json!({
            "entity_type": "customer",
            "sources": {"crm": {"reliability": 0.9}},
            "fields": {
                "fax": {"comparator": {"type": "exact"}, "null_policy": "treat_nulls_equal"}
            },
            "blocking": {"strategy": "standard", "keys": [{"field": "fax"}]}
        }));
        let engine = MatchEngine::new(config);
        let a = normalized("r1", vec![("fax", AttributeValue::Null)]);
        let b = normalized("r2", vec![("fax", AttributeValue::Null)]);
        assert!((engine.evaluate_pair(&a, &b).overall_score - 1.0).abs() < 1e-9);
        let c = normalized("r3", vec![("fax", text("555"))]);
        assert_eq!(engine.evaluate_pair(&a, &c).overall_score, 0.0);
    }

    #[test]
    fn review_band_between_thresholds() {
        let config = config_json(serde_json::json!({
            "entity_type": "customer",
            "sources": {"crm": {"reliability": 0.9}},
            "fields": {
                "a": {"comparator": {"type": "exact"}, "weight": 0.7},
                "b": {"comparator": {"type": "exact"}, "weight": 0.3}
            },
            "blocking": {"strategy": "standard", "keys": [{"field": "a"}]},
            "thresholds": {"match": 0.85, "review": 0.65}
        }));
        let engine = MatchEngine::new(config);
        let left = normalized("r1", vec![("a", text("x")), ("b", text("y"))]);
        let right = normalized("r2", vec![("a", text("x")), ("b", text("z"))]);
        let decision = engine.evaluate_pair(&left, &right);
        assert!((decision.overall_score - 0.7).abs() < 1e-9);
        assert_eq!(decision.verdict, Verdict::Review);
    }

    #[test]
    fn conditional_rule_swaps_comparator() {
        let config = config_json(serde_json::json!({
            "entity_type": "customer",
            "sources": {"crm": {"reliability": 0.9}},
            "fields": {
                "name": {
                    "comparator": {"type": "exact"},
                    "conditional_rules": [{
                        "condition_field": "kind",
                        "operator": "equals",
                        "value": "person",
                        "comparator": {"type": "phonetic", "algorithm": "soundex"}
                    }]
                }
            },
            "blocking": {"strategy": "standard", "keys": [{"field": "name"}]}
        }));
        let engine = MatchEngine::new(config);
        let a = normalized("r1", vec![("name", text("Robert")), ("kind", text("person"))]);
        let b = normalized("r2", vec![("name", text("Rupert")), ("kind", text("person"))]);
        // Soundex equates Robert/Rupert; exact would not.
        assert!((engine.evaluate_pair(&a, &b).overall_score - 1.0).abs() < 1e-9);

        let c = normalized("r3", vec![("name", text("Robert")), ("kind", text("org"))]);
        let d = normalized("r4", vec![("name", text("Rupert")), ("kind", text("org"))]);
        assert_eq!(engine.evaluate_pair(&c, &d).overall_score, 0.0);
    }

    #[test]
    fn product_aggregation_multiplies_contributed_fields() {
        let config = config_json(serde_json::json!({
            "entity_type": "customer",
            "sources": {"crm": {"reliability": 0.9}},
            "fields": {
                "a": {"comparator": {"type": "numeric", "tolerance": 10.0}},
                "b": {"comparator": {"type": "numeric", "tolerance": 10.0}}
            },
            "blocking": {"strategy": "standard", "keys": [{"field": "a"}]},
            "aggregation": "product"
        }));
        let engine = MatchEngine::new(config);
        let left = normalized(
            "r1",
            vec![
                ("a", AttributeValue::Number(0.0)),
                ("b", AttributeValue::Number(0.0)),
            ],
        );
        let right = normalized(
            "r2",
            vec![
                ("a", AttributeValue::Number(5.0)),
                ("b", AttributeValue::Number(5.0)),
            ],
        );
        let decision = engine.evaluate_pair(&left, &right);
        assert!((decision.overall_score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn vector_comparator_uses_embeddings_and_falls_back() {
        let config = config_json(serde_json::json!({
            "entity_type": "customer",
            "sources": {"crm": {"reliability": 0.9}},
            "fields": {
                "name": {
                    "comparator": {"type": "vector", "fallback": {"type": "exact"}}
                }
            },
            "blocking": {"strategy": "lsh", "vector_field": "name"}
        }));
        let engine = MatchEngine::new(config);

        let mut a = normalized("r1", vec![("name", text("Acme Corp"))]);
        let mut b = normalized("r2", vec![("name", text("Acme Inc"))]);
        a.embeddings.insert("name".to_string(), vec![1.0, 0.0]);
        b.embeddings.insert("name".to_string(), vec![1.0, 0.0]);
        // Identical embeddings: cosine 1.0 even though the text differs.
        assert!((engine.evaluate_pair(&a, &b).overall_score - 1.0).abs() < 1e-9);

        // No embeddings: the exact fallback sees different text.
        let c = normalized("r3", vec![("name", text("Acme Corp"))]);
        let d = normalized("r4", vec![("name", text("Acme Inc"))]);
        assert_eq!(engine.evaluate_pair(&c, &d).overall_score, 0.0);
    }

    #[test]
    fn cache_serves_repeat_comparisons() {
        let engine = MatchEngine::new(base_config());
        let a = normalized("r1", vec![("name", text("Acme Corp"))]);
        let b = normalized("r2", vec![("name", text("Acme Corp"))]);
        engine.evaluate_pair(&a, &b);
        engine.evaluate_pair(&a, &b);
        let (hits, _) = engine.cache_stats();
        assert!(hits > 0);
    }
}
