//! Source records and their normalized derivations.
//!
//! A `Record` is immutable after ingestion. Normalization never mutates the
//! original attributes; it produces a parallel map cached on the
//! `NormalizedRecord`, together with optional per-field embeddings and
//! pre-hashed normalized values for the comparator cache.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Typed attribute value carried by a record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Sequence(Vec<AttributeValue>),
    Mapping(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Textual view used by string comparators. Non-text scalars are
    /// rendered canonically; sequences and mappings have no textual view.
    pub fn as_text(&self) -> Option<String> {
        match self {
            AttributeValue::Text(s) => Some(s.clone()),
            AttributeValue::Number(n) => Some(canonical_number(*n)),
            AttributeValue::Bool(b) => Some(b.to_string()),
            AttributeValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            AttributeValue::Timestamp(ts) => Some(ts.to_rfc3339()),
            _ => None,
        }
    }

    /// Numeric coercion used by the numeric comparator and weighted-average
    /// survivorship.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            AttributeValue::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Stable key used for frequency counting and cache hashing. Equal
    /// values always render the same key.
    pub fn canonical_key(&self) -> String {
        match self {
            AttributeValue::Null => "\u{0}null".to_string(),
            AttributeValue::Bool(b) => format!("b:{b}"),
            AttributeValue::Number(n) => format!("n:{}", canonical_number(*n)),
            AttributeValue::Text(s) => format!("t:{s}"),
            AttributeValue::Date(d) => format!("d:{d}"),
            AttributeValue::Timestamp(ts) => format!("ts:{}", ts.timestamp_micros()),
            AttributeValue::Sequence(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.canonical_key()).collect();
                format!("seq:[{}]", inner.join(","))
            }
            AttributeValue::Mapping(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.canonical_key()))
                    .collect();
                format!("map:{{{}}}", inner.join(","))
            }
        }
    }

    /// Convert from a loose JSON value, as delivered by ingestion batches.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttributeValue::Null,
            serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
            serde_json::Value::Number(n) => {
                AttributeValue::Number(n.as_f64().unwrap_or(f64::NAN))
            }
            serde_json::Value::String(s) => AttributeValue::Text(s.clone()),
            serde_json::Value::Array(items) => {
                AttributeValue::Sequence(items.iter().map(AttributeValue::from_json).collect())
            }
            serde_json::Value::Object(map) => AttributeValue::Mapping(
                map.iter()
                    .map(|(k, v)| (k.clone(), AttributeValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::Null => serde_json::Value::Null,
            AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
            AttributeValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttributeValue::Text(s) => serde_json::Value::String(s.clone()),
            AttributeValue::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            AttributeValue::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            AttributeValue::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            AttributeValue::Mapping(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn canonical_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// An immutable source record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    /// Globally unique record id.
    pub record_id: String,

    /// Origin system id.
    pub source_id: String,

    /// Field name → typed value.
    pub attributes: BTreeMap<String, AttributeValue>,

    /// When the record entered the pipeline.
    pub ingest_time: DateTime<Utc>,

    /// Timestamp asserted by the source system, if any.
    pub source_timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn attribute(&self, field: &str) -> Option<&AttributeValue> {
        self.attributes.get(field)
    }

    pub fn is_null(&self, field: &str) -> bool {
        self.attributes
            .get(field)
            .map(|v| v.is_null())
            .unwrap_or(true)
    }
}

/// Per-record trust score. Each component is in [0, 1]; `overall` is the
/// configured weighted combination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub record_id: String,
    pub source_reliability: f64,
    pub completeness: f64,
    pub timeliness: f64,
    pub validity: f64,
    pub overall: f64,
}

/// A record plus its normalized attribute map, per-field embeddings, and
/// trust score. Derived once; never mutated after creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub record: Record,

    /// Field name → normalized value, for the fields the configuration
    /// preprocesses. Fields without preprocessors are absent here and read
    /// through to the raw attribute.
    pub normalized: BTreeMap<String, AttributeValue>,

    /// Field name → embedding vector supplied by the embedding provider.
    pub embeddings: BTreeMap<String, Vec<f32>>,

    /// Field name → hash of the normalized value. Computed at
    /// preprocessing time so the comparator cache never hashes values on
    /// the hot path.
    pub value_hashes: BTreeMap<String, u64>,

    pub trust: Option<TrustScore>,
}

/// Shared null for absent-field reads.
pub static NULL_VALUE: AttributeValue = AttributeValue::Null;

impl NormalizedRecord {
    /// The value a comparator sees for `field`: normalized when available,
    /// otherwise the raw attribute, otherwise null.
    pub fn value(&self, field: &str) -> &AttributeValue {
        if let Some(v) = self.normalized.get(field) {
            return v;
        }
        self.record.attribute(field).unwrap_or(&NULL_VALUE)
    }

    pub fn value_hash(&self, field: &str) -> u64 {
        if let Some(h) = self.value_hashes.get(field) {
            return *h;
        }
        hash_value(self.value(field))
    }

    pub fn record_id(&self) -> &str {
        &self.record.record_id
    }

    pub fn source_id(&self) -> &str {
        &self.record.source_id
    }
}

pub fn hash_value(value: &AttributeValue) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.canonical_key().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_keys_distinguish_types() {
        assert_ne!(
            AttributeValue::Text("1".into()).canonical_key(),
            AttributeValue::Number(1.0).canonical_key()
        );
        assert_eq!(
            AttributeValue::Number(2.0).canonical_key(),
            AttributeValue::Number(2.0).canonical_key()
        );
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let value = serde_json::json!({
            "name": "Acme Corp",
            "revenue": 12.5,
            "active": true,
            "tags": ["a", "b"],
            "missing": null
        });
        let attr = AttributeValue::from_json(&value);
        assert_eq!(attr.to_json(), value);
    }

    #[test]
    fn normalized_value_reads_through_to_raw() {
        let record = Record {
            record_id: "r1".into(),
            source_id: "crm".into(),
            attributes: [("name".to_string(), AttributeValue::Text("Acme".into()))]
                .into_iter()
                .collect(),
            ingest_time: Utc::now(),
            source_timestamp: None,
        };
        let normalized = NormalizedRecord {
            record,
            normalized: BTreeMap::new(),
            embeddings: BTreeMap::new(),
            value_hashes: BTreeMap::new(),
            trust: None,
        };
        assert_eq!(
            normalized.value("name"),
            &AttributeValue::Text("Acme".into())
        );
        assert!(normalized.value("missing").is_null());
    }
}
