//! Field value normalization.
//!
//! An ordered pipeline of named transforms runs per field before comparison.
//! Input records are never mutated; the output is cached on the
//! `NormalizedRecord` together with pre-hashed values for the comparator
//! cache and any embeddings the provider returns.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::config::{ComparatorSpec, MdmConfig};
use crate::embed::EmbeddingProvider;
use crate::error::{MdmError, Result};
use crate::model::record::{hash_value, AttributeValue, NormalizedRecord, Record};

type CustomTransform = dyn Fn(&AttributeValue) -> AttributeValue + Send + Sync;

/// Applies configured transform pipelines to records.
pub struct Preprocessor {
    /// Default region for phone normalization (ISO 3166 alpha-2).
    region: String,
    custom: HashMap<String, Box<CustomTransform>>,
    whitespace: Regex,
}

impl Preprocessor {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_uppercase(),
            custom: HashMap::new(),
            whitespace: Regex::new(r"\s+").expect("static regex"),
        }
    }

    pub fn register_transform<F>(&mut self, name: &str, transform: F)
    where
        F: Fn(&AttributeValue) -> AttributeValue + Send + Sync + 'static,
    {
        self.custom.insert(name.to_string(), Box::new(transform));
    }

    /// Check that every preprocessor named in the configuration resolves.
    /// Unknown names are fatal at startup, not at normalization time.
    pub fn check_config(&self, config: &MdmConfig) -> Result<()> {
        let mut unknown = Vec::new();
        for (field, field_config) in &config.fields {
            for name in &field_config.preprocessors {
                if !self.is_known(name) {
                    unknown.push(format!("{field}: '{name}'"));
                }
            }
        }
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(MdmError::Configuration(format!(
                "unknown preprocessors: {}",
                unknown.join(", ")
            )))
        }
    }

    fn is_known(&self, name: &str) -> bool {
        matches!(
            name,
            "lower" | "strip" | "collapse_whitespace" | "normalize_phone" | "normalize_date"
        ) || self.custom.contains_key(name)
    }

    /// Apply one named transform.
    pub fn apply(&self, name: &str, value: &AttributeValue) -> AttributeValue {
        match name {
            "lower" => map_text(value, |s| s.to_lowercase()),
            "strip" => map_text(value, |s| s.trim().to_string()),
            "collapse_whitespace" => map_text(value, |s| {
                self.whitespace.replace_all(s.trim(), " ").to_string()
            }),
            "normalize_phone" => match value.as_text() {
                Some(text) => match normalize_phone(&text, &self.region) {
                    Some(e164) => AttributeValue::Text(e164),
                    None => value.clone(),
                },
                None => value.clone(),
            },
            "normalize_date" => match value {
                AttributeValue::Date(_) | AttributeValue::Timestamp(_) => value.clone(),
                _ => match value.as_text().and_then(|t| parse_date_heuristic(&t)) {
                    Some(date) => AttributeValue::Date(date),
                    None => value.clone(),
                },
            },
            custom => match self.custom.get(custom) {
                Some(transform) => transform(value),
                None => {
                    warn!(transform = custom, "unknown preprocessor, passing through");
                    value.clone()
                }
            },
        }
    }

    /// Run a field's full pipeline over a value.
    pub fn run_pipeline(&self, names: &[String], value: &AttributeValue) -> AttributeValue {
        let mut current = value.clone();
        for name in names {
            current = self.apply(name, &current);
        }
        current
    }

    /// Derive the `NormalizedRecord` for a record under a configuration.
    pub fn normalize_record(
        &self,
        record: Record,
        config: &MdmConfig,
        embedder: &dyn EmbeddingProvider,
    ) -> NormalizedRecord {
        let mut normalized = BTreeMap::new();
        let mut value_hashes = BTreeMap::new();
        let mut embeddings = BTreeMap::new();

        for (field, field_config) in &config.fields {
            let raw = record
                .attribute(field)
                .unwrap_or(&crate::model::record::NULL_VALUE);
            let value = if field_config.preprocessors.is_empty() {
                raw.clone()
            } else {
                self.run_pipeline(&field_config.preprocessors, raw)
            };
            value_hashes.insert(field.clone(), hash_value(&value));

            if wants_embedding(config, field, field_config) {
                if let Some(text) = value.as_text() {
                    if let Some(vector) = embedder.embed(field, &text) {
                        embeddings.insert(field.clone(), vector);
                    }
                }
            }
            normalized.insert(field.clone(), value);
        }

        NormalizedRecord {
            record,
            normalized,
            embeddings,
            value_hashes,
            trust: None,
        }
    }
}

fn wants_embedding(config: &MdmConfig, field: &str, field_config: &crate::config::FieldConfig) -> bool {
    matches!(field_config.comparator, ComparatorSpec::Vector { .. })
        || config.blocking.vector_field.as_deref() == Some(field)
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new("US")
    }
}

fn map_text<F: Fn(&str) -> String>(value: &AttributeValue, f: F) -> AttributeValue {
    match value {
        AttributeValue::Text(s) => AttributeValue::Text(f(s)),
        other => other.clone(),
    }
}

/// Country calling codes for the regions the engine normalizes phones for.
fn calling_code(region: &str) -> Option<&'static str> {
    match region {
        "US" | "CA" => Some("1"),
        "GB" => Some("44"),
        "DE" => Some("49"),
        "FR" => Some("33"),
        "IN" => Some("91"),
        "AU" => Some("61"),
        "JP" => Some("81"),
        "BR" => Some("55"),
        _ => None,
    }
}

/// Normalize a phone number to E.164. Returns None when the input has no
/// plausible digit payload, leaving the original value untouched.
pub fn normalize_phone(raw: &str, region: &str) -> Option<String> {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 || digits.len() > 15 {
        return None;
    }
    if has_plus {
        return Some(format!("+{digits}"));
    }
    let code = calling_code(region)?;
    // A leading national trunk prefix is dropped for the common case.
    let national = digits.strip_prefix('0').unwrap_or(&digits);
    if national.starts_with(code) && national.len() > 10 {
        Some(format!("+{national}"))
    } else {
        Some(format!("+{code}{national}"))
    }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%Y%m%d",
];

/// Parse a date using the fixed heuristic format set. RFC 3339 timestamps
/// are accepted and truncated to their date.
pub fn parse_date_heuristic(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc).date_naive());
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    None
}

/// Parse with an explicit format string.
pub fn parse_date_with_format(text: &str, format: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), format).ok()
}
