//! Typed configuration surface.
//!
//! Every option the engine understands is enumerated here; unknown keys are
//! rejected at deserialization time and `validate()` collects every problem
//! before the pipeline touches any state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{MdmError, Result};

/// How a field treats null values during comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullPolicy {
    /// Any null scores 0 and the field weight stays in the denominator.
    TreatAsMismatch,
    /// The field is excluded from the aggregate entirely.
    Skip,
    /// Score 1 iff both sides are null; one-sided null scores 0.
    TreatNullsEqual,
}

impl Default for NullPolicy {
    fn default() -> Self {
        NullPolicy::TreatAsMismatch
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzyMethod {
    Levenshtein,
    Jaro,
    JaroWinkler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneticAlgorithm {
    Soundex,
    Metaphone,
    Nysiis,
}

/// Comparator selection plus its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComparatorSpec {
    Exact {
        #[serde(default = "default_true")]
        case_fold: bool,
    },
    Fuzzy {
        method: FuzzyMethod,
        /// Jaro-Winkler prefix weight; clamped to 0.25 at evaluation.
        #[serde(default = "default_prefix_weight")]
        prefix_weight: f64,
    },
    Phonetic {
        algorithm: PhoneticAlgorithm,
    },
    Numeric {
        tolerance: f64,
    },
    Date {
        #[serde(default)]
        format: Option<String>,
        #[serde(default = "default_window_days")]
        window_days: f64,
    },
    Address,
    Vector {
        /// Textual comparator used when either side has no embedding.
        fallback: Box<ComparatorSpec>,
    },
}

fn default_true() -> bool {
    true
}

fn default_prefix_weight() -> f64 {
    0.1
}

fn default_window_days() -> f64 {
    1.0
}

/// Predicate operator for conditional comparator selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    In,
    NotIn,
}

/// Conditional rule: when the predicate over the left record holds, the
/// rule's comparator replaces the field's default comparator for the pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalRule {
    /// Field of the record the predicate inspects.
    pub condition_field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
    pub comparator: ComparatorSpec,
}

/// Per-field matching configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    pub comparator: ComparatorSpec,

    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Field scores below this floor to 0 before weighting.
    #[serde(default)]
    pub threshold: f64,

    #[serde(default)]
    pub null_policy: NullPolicy,

    /// Ordered preprocessor names (`lower`, `strip`, `collapse_whitespace`,
    /// `normalize_phone`, `normalize_date`, or registered custom names).
    #[serde(default)]
    pub preprocessors: Vec<String>,

    #[serde(default)]
    pub conditional_rules: Vec<ConditionalRule>,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingStrategy {
    Standard,
    SortedNeighborhood,
    Lsh,
}

/// One blocking key: a field plus an optional prefix truncation of its
/// normalized textual value.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockKeySpec {
    pub field: String,
    #[serde(default)]
    pub prefix_len: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockingConfig {
    pub strategy: BlockingStrategy,

    #[serde(default)]
    pub keys: Vec<BlockKeySpec>,

    /// Sliding window size for sorted-neighborhood.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Nearest-neighbor count for LSH.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Field whose embeddings the LSH strategy indexes.
    #[serde(default)]
    pub vector_field: Option<String>,

    /// Hard ceiling on records per block; exceeding it is a fatal
    /// BLOCK_EXPLOSION before any match work.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    /// Seed for the LSH hyperplanes. Fixed seed keeps runs deterministic.
    #[serde(default)]
    pub lsh_seed: u64,

    /// Target pair recall under the configured thresholds. A testable
    /// property of the blocking setup, not enforced at runtime.
    #[serde(default = "default_recall_floor")]
    pub recall_floor: f64,
}

fn default_recall_floor() -> f64 {
    0.95
}

fn default_window() -> usize {
    3
}

fn default_top_k() -> usize {
    10
}

fn default_max_block_size() -> usize {
    1000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    #[serde(rename = "match", default = "default_match_threshold")]
    pub match_threshold: f64,

    #[serde(rename = "review", default = "default_review_threshold")]
    pub review_threshold: f64,

    #[serde(default)]
    pub transitivity_guard_enabled: bool,
}

fn default_match_threshold() -> f64 {
    0.85
}

fn default_review_threshold() -> f64 {
    0.65
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            review_threshold: default_review_threshold(),
            transitivity_guard_enabled: false,
        }
    }
}

/// Weights for the four trust components. Must sum to 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustComponentWeights {
    pub source: f64,
    pub completeness: f64,
    pub timeliness: f64,
    pub validity: f64,
}

impl Default for TrustComponentWeights {
    fn default() -> Self {
        Self {
            source: 0.4,
            completeness: 0.3,
            timeliness: 0.15,
            validity: 0.15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustConfig {
    #[serde(default)]
    pub component_weights: TrustComponentWeights,

    #[serde(default = "default_half_life")]
    pub half_life_days: f64,
}

fn default_half_life() -> f64 {
    365.0
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            component_weights: TrustComponentWeights::default(),
            half_life_days: default_half_life(),
        }
    }
}

/// Survivorship strategy for one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SurvivorshipStrategy {
    MostTrusted,
    MostRecent,
    TrustedSourcePriority { sources: Vec<String> },
    MostFrequent,
    Longest,
    Shortest,
    WeightedAverage,
    Custom { name: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SurvivorshipConfig {
    /// Field → strategy. Fields not listed fall back to `default_strategy`.
    #[serde(default)]
    pub fields: BTreeMap<String, SurvivorshipStrategy>,

    #[serde(default = "default_survivorship_strategy")]
    pub default_strategy: SurvivorshipStrategy,
}

fn default_survivorship_strategy() -> SurvivorshipStrategy {
    SurvivorshipStrategy::MostTrusted
}

impl Default for SurvivorshipConfig {
    fn default() -> Self {
        Self {
            fields: BTreeMap::new(),
            default_strategy: default_survivorship_strategy(),
        }
    }
}

/// Per-source configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Configured reliability in [0, 1].
    pub reliability: f64,

    /// Per-field importance overrides applied in this source's completeness
    /// component.
    #[serde(default)]
    pub weight_overrides: HashMap<String, f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    WeightedAverage,
    Min,
    Product,
}

impl Default for Aggregation {
    fn default() -> Self {
        Aggregation::WeightedAverage
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_shards")]
    pub shards: usize,
    #[serde(default = "default_cache_capacity")]
    pub capacity_per_shard: usize,
}

fn default_cache_shards() -> usize {
    16
}

fn default_cache_capacity() -> usize {
    4096
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: default_cache_shards(),
            capacity_per_shard: default_cache_capacity(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_backoff_ms(),
        }
    }
}

/// Root configuration for one entity-resolution profile.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MdmConfig {
    /// Profile identifier recorded as `rule_id` on persisted decisions.
    #[serde(default = "default_profile_id")]
    pub profile_id: String,

    /// Entity type this profile resolves (must exist in the schema
    /// registry).
    pub entity_type: String,

    pub sources: HashMap<String, SourceConfig>,

    pub fields: BTreeMap<String, FieldConfig>,

    pub blocking: BlockingConfig,

    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub survivorship: SurvivorshipConfig,

    #[serde(default)]
    pub aggregation: Aggregation,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker count for the parallel stages; defaults to the rayon global
    /// pool size.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Coarse per-stage wall-clock budget. Exceeding it fails the run with
    /// a retryable stage-timeout error; committed progress survives.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_profile_id() -> String {
    "default".to_string()
}

fn default_batch_size() -> usize {
    1000
}

impl MdmConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: MdmConfig = serde_json::from_str(&raw)
            .map_err(|e| MdmError::Configuration(format!("{}: {e}", path.display())))?;
        config.validated()
    }

    /// Validate and return self, folding the full problem list into one
    /// fatal configuration error.
    pub fn validated(self) -> Result<Self> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(MdmError::Configuration(errors.join("; ")))
        }
    }

    /// Collect every configuration problem. Fatal at startup; no events are
    /// emitted for an invalid configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.fields.is_empty() {
            errors.push("no field configurations provided".to_string());
        }
        let total_weight: f64 = self.fields.values().map(|f| f.weight).sum();
        if !self.fields.is_empty() && total_weight <= 0.0 {
            errors.push("total field weight must be positive".to_string());
        }
        for (name, field) in &self.fields {
            if field.weight < 0.0 {
                errors.push(format!("field '{name}': weight must be non-negative"));
            }
            if !(0.0..=1.0).contains(&field.threshold) {
                errors.push(format!("field '{name}': threshold must be in [0,1]"));
            }
            self.validate_comparator(name, &field.comparator, &mut errors);
            for rule in &field.conditional_rules {
                self.validate_comparator(name, &rule.comparator, &mut errors);
                if rule.operator == ConditionOperator::Regex {
                    if let Some(pattern) = rule.value.as_str() {
                        if regex::Regex::new(pattern).is_err() {
                            errors.push(format!(
                                "field '{name}': invalid regex in conditional rule"
                            ));
                        }
                    } else {
                        errors.push(format!(
                            "field '{name}': regex condition requires a string value"
                        ));
                    }
                }
            }
        }

        if self.sources.is_empty() {
            errors.push("no source configurations provided".to_string());
        }
        for (source_id, source) in &self.sources {
            if !(0.0..=1.0).contains(&source.reliability) {
                errors.push(format!("source '{source_id}': reliability must be in [0,1]"));
            }
        }

        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.match_threshold) || !(0.0..=1.0).contains(&t.review_threshold) {
            errors.push("thresholds must be in [0,1]".to_string());
        }
        if t.review_threshold > t.match_threshold {
            errors.push("review threshold must not exceed match threshold".to_string());
        }

        let w = &self.trust.component_weights;
        let weight_sum = w.source + w.completeness + w.timeliness + w.validity;
        if (weight_sum - 1.0).abs() > 1e-9 {
            errors.push(format!(
                "trust component weights must sum to 1.0 (got {weight_sum})"
            ));
        }
        if self.trust.half_life_days <= 0.0 {
            errors.push("trust half_life_days must be positive".to_string());
        }

        match self.blocking.strategy {
            BlockingStrategy::Standard | BlockingStrategy::SortedNeighborhood => {
                if self.blocking.keys.is_empty() {
                    errors.push("blocking keys must be specified".to_string());
                }
            }
            BlockingStrategy::Lsh => {
                if self.blocking.vector_field.is_none() {
                    errors.push("lsh blocking requires vector_field".to_string());
                }
                if self.blocking.top_k == 0 {
                    errors.push("lsh top_k must be positive".to_string());
                }
            }
        }
        if self.blocking.strategy == BlockingStrategy::SortedNeighborhood
            && self.blocking.window == 0
        {
            errors.push("sorted-neighborhood window must be positive".to_string());
        }
        if self.blocking.max_block_size == 0 {
            errors.push("max_block_size must be positive".to_string());
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be positive".to_string());
        }
        if self.cache.shards == 0 {
            errors.push("cache shards must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry max_attempts must be positive".to_string());
        }

        errors
    }

    fn validate_comparator(&self, field: &str, spec: &ComparatorSpec, errors: &mut Vec<String>) {
        match spec {
            ComparatorSpec::Numeric { tolerance } => {
                if *tolerance <= 0.0 {
                    errors.push(format!("field '{field}': numeric tolerance must be > 0"));
                }
            }
            ComparatorSpec::Date { window_days, .. } => {
                if *window_days <= 0.0 {
                    errors.push(format!("field '{field}': date window_days must be > 0"));
                }
            }
            ComparatorSpec::Fuzzy { prefix_weight, .. } => {
                if *prefix_weight < 0.0 {
                    errors.push(format!("field '{field}': prefix_weight must be non-negative"));
                }
            }
            ComparatorSpec::Vector { fallback } => {
                if matches!(**fallback, ComparatorSpec::Vector { .. }) {
                    errors.push(format!(
                        "field '{field}': vector fallback must be a textual comparator"
                    ));
                }
                self.validate_comparator(field, fallback, errors);
            }
            _ => {}
        }
    }

    /// Effective completeness importance for a field of a given source,
    /// honoring per-source overrides.
    pub fn importance_for(&self, source_id: &str, field: &str, default: f64) -> f64 {
        self.sources
            .get(source_id)
            .and_then(|s| s.weight_overrides.get(field))
            .copied()
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> MdmConfig {
        serde_json::from_value(serde_json::json!({
            "entity_type": "customer",
            "sources": {"crm": {"reliability": 0.9}},
            "fields": {
                "name": {"comparator": {"type": "fuzzy", "method": "jaro_winkler"}, "weight": 0.5},
                "phone": {"comparator": {"type": "exact"}, "weight": 0.5}
            },
            "blocking": {"strategy": "standard", "keys": [{"field": "name", "prefix_len": 3}]}
        }))
        .unwrap()
    }

    #[test]
    fn minimal_config_is_valid() {
        let config = minimal_config();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
        assert_eq!(config.thresholds.match_threshold, 0.85);
        assert_eq!(config.blocking.window, 3);
    }

    #[test]
    fn unknown_keys_rejected() {
        let result: std::result::Result<MdmConfig, _> = serde_json::from_value(serde_json::json!({
            "entity_type": "customer",
            "sources": {},
            "fields": {},
            "blocking": {"strategy": "standard", "keys": [], "bogus_option": 1}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn validation_collects_all_problems() {
        let mut config = minimal_config();
        config.sources.clear();
        config.thresholds.review_threshold = 0.99;
        config.trust.component_weights.source = 0.9;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("source configurations")));
        assert!(errors.iter().any(|e| e.contains("review threshold")));
        assert!(errors.iter().any(|e| e.contains("sum to 1.0")));
    }

    #[test]
    fn zero_tolerance_is_a_config_error() {
        let mut config = minimal_config();
        config.fields.insert(
            "amount".into(),
            FieldConfig {
                comparator: ComparatorSpec::Numeric { tolerance: 0.0 },
                weight: 1.0,
                threshold: 0.0,
                null_policy: NullPolicy::Skip,
                preprocessors: vec![],
                conditional_rules: vec![],
            },
        );
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("tolerance must be > 0")));
    }
}
