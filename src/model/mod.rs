//! Data model: records, normalized records, trust scores, and the
//! declarative schema registry consulted by the orchestrator.

pub mod record;
pub mod schema;

pub use record::{AttributeValue, NormalizedRecord, Record, TrustScore};
pub use schema::{
    DataType, EntityDescriptor, FieldDescriptor, RelationshipDescriptor, SchemaRegistry,
    ValidationOutcome, ValidationRule,
};
