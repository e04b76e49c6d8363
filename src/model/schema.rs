//! Declarative entity schemas.
//!
//! Entity, field, and relationship descriptors live in a registry the
//! orchestrator consults. Field descriptors carry the validation rules used
//! both at ingest time (dead-lettering) and by the trust scorer's validity
//! component.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::record::{AttributeValue, Record};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Number,
    Bool,
    Date,
    Timestamp,
    Sequence,
    Mapping,
}

/// A single validation rule applied to a field value. Custom predicates are
/// referenced by name and resolved against the registry at evaluation time,
/// so descriptors stay serializable.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    Pattern { pattern: String },
    Range { min: Option<f64>, max: Option<f64> },
    MinLength { length: usize },
    MaxLength { length: usize },
    AllowedValues { values: Vec<String> },
    Custom { name: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Pass,
    Fail(String),
}

impl ValidationOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, ValidationOutcome::Pass)
    }
}

/// Field descriptor: type, requiredness, completeness weight, validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,

    pub data_type: DataType,

    /// Required fields dead-letter the record when null at ingest.
    #[serde(default)]
    pub required: bool,

    /// Relative weight in the completeness component. Defaults to 1.
    #[serde(default = "default_importance")]
    pub importance: f64,

    #[serde(default)]
    pub validation: Vec<ValidationRule>,
}

fn default_importance() -> f64 {
    1.0
}

/// Inter-entity relationship descriptor, traversed by lineage graph queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub from_entity: String,
    pub to_entity: String,
}

/// Entity descriptor: the fields and relationships of one logical entity
/// type (e.g. "customer").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescriptor>,
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.required)
    }
}

type CustomValidator = dyn Fn(&AttributeValue) -> bool + Send + Sync;

/// Registry of entity descriptors plus named custom validators.
///
/// Replaces the original system's metaclass-driven model definitions with
/// plain data consulted explicitly by the pipeline.
#[derive(Default)]
pub struct SchemaRegistry {
    entities: HashMap<String, EntityDescriptor>,
    custom_validators: HashMap<String, Box<CustomValidator>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&mut self, descriptor: EntityDescriptor) {
        self.entities.insert(descriptor.name.clone(), descriptor);
    }

    pub fn register_validator<F>(&mut self, name: &str, predicate: F)
    where
        F: Fn(&AttributeValue) -> bool + Send + Sync + 'static,
    {
        self.custom_validators
            .insert(name.to_string(), Box::new(predicate));
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.get(name)
    }

    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate a record against an entity descriptor. Returns the list of
    /// failures; an empty list means the record is schema-clean.
    pub fn validate_record(&self, entity: &str, record: &Record) -> Vec<String> {
        let Some(descriptor) = self.entities.get(entity) else {
            return vec![format!("unknown entity type '{entity}'")];
        };
        let mut failures = Vec::new();
        for field in &descriptor.fields {
            let value = record
                .attribute(&field.name)
                .unwrap_or(&super::record::NULL_VALUE);
            if field.required && value.is_null() {
                failures.push(format!("required field '{}' is null", field.name));
                continue;
            }
            if value.is_null() {
                continue;
            }
            for rule in &field.validation {
                if let ValidationOutcome::Fail(reason) = self.check_rule(rule, value) {
                    failures.push(format!("field '{}': {reason}", field.name));
                }
            }
        }
        failures
    }

    /// Evaluate one rule against a non-null value.
    pub fn check_rule(&self, rule: &ValidationRule, value: &AttributeValue) -> ValidationOutcome {
        match rule {
            ValidationRule::Pattern { pattern } => {
                let Some(text) = value.as_text() else {
                    return ValidationOutcome::Fail("value has no textual form".into());
                };
                match regex::Regex::new(pattern) {
                    Ok(re) if re.is_match(&text) => ValidationOutcome::Pass,
                    Ok(_) => ValidationOutcome::Fail(format!("'{text}' does not match /{pattern}/")),
                    Err(e) => ValidationOutcome::Fail(format!("invalid pattern: {e}")),
                }
            }
            ValidationRule::Range { min, max } => {
                let Some(n) = value.as_number() else {
                    return ValidationOutcome::Fail("value is not numeric".into());
                };
                if min.map(|m| n < m).unwrap_or(false) {
                    return ValidationOutcome::Fail(format!("{n} below minimum {:?}", min));
                }
                if max.map(|m| n > m).unwrap_or(false) {
                    return ValidationOutcome::Fail(format!("{n} above maximum {:?}", max));
                }
                ValidationOutcome::Pass
            }
            ValidationRule::MinLength { length } => match value.as_text() {
                Some(text) if text.chars().count() >= *length => ValidationOutcome::Pass,
                Some(text) => {
                    ValidationOutcome::Fail(format!("'{text}' shorter than {length} chars"))
                }
                None => ValidationOutcome::Fail("value has no textual form".into()),
            },
            ValidationRule::MaxLength { length } => match value.as_text() {
                Some(text) if text.chars().count() <= *length => ValidationOutcome::Pass,
                Some(text) => {
                    ValidationOutcome::Fail(format!("'{text}' longer than {length} chars"))
                }
                None => ValidationOutcome::Fail("value has no textual form".into()),
            },
            ValidationRule::AllowedValues { values } => match value.as_text() {
                Some(text) if values.contains(&text) => ValidationOutcome::Pass,
                Some(text) => ValidationOutcome::Fail(format!("'{text}' not in allowed set")),
                None => ValidationOutcome::Fail("value has no textual form".into()),
            },
            ValidationRule::Custom { name } => match self.custom_validators.get(name) {
                Some(predicate) if predicate(value) => ValidationOutcome::Pass,
                Some(_) => ValidationOutcome::Fail(format!("custom validator '{name}' rejected")),
                None => ValidationOutcome::Fail(format!("unknown custom validator '{name}'")),
            },
        }
    }
}
