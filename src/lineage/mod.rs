//! Cross-references, merge events, and field history.
//!
//! Logical tables: `golden_record`, `xref`, `merge_event`, `field_history`.
//! Physical mapping is the sink implementation's responsibility; the
//! in-memory store here is the reference implementation and backs the CLI.
//!
//! Persisted state stores ids only; in-memory relationship graphs are
//! materialized per query and never cached across batches.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::record::AttributeValue;
use crate::survivor::FieldProvenance;

pub use store::MemoryLineageStore;

/// Current golden record row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GoldenRecordRow {
    pub golden_id: String,
    pub attributes: BTreeMap<String, AttributeValue>,
    pub provenance: BTreeMap<String, FieldProvenance>,
    pub cluster_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Relation carried by a cross-reference edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    SameAs,
    DerivedFrom,
    Supersedes,
    ReplacedBy,
}

/// Source record ↔ golden record mapping with a validity interval.
/// `valid_to = None` means the row is current; at most one current row
/// exists per (source_record_id, source_system).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct XrefRow {
    pub source_record_id: String,
    pub source_system: String,
    pub golden_id: String,
    pub relation: RelationType,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub confidence: f64,
}

impl XrefRow {
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.map(|end| at < end).unwrap_or(true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Create,
    Update,
    Merge,
    Split,
    Link,
    Unlink,
}

/// Append-only merge event. `seq` is assigned in commit order; events for
/// the same golden id are totally ordered by it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeEventRow {
    pub event_id: String,
    pub seq: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub affected_golden_ids: Vec<String>,
    pub affected_record_ids: Vec<String>,
    /// Reversible payload: the committed state of the affected scope
    /// before the event applied.
    pub before_state: serde_json::Value,
    pub after_state: serde_json::Value,
    /// Set when a rollback has undone this event.
    #[serde(default)]
    pub rolled_back: bool,
}

/// One observed golden field value, for value-at-time queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldHistoryRow {
    pub golden_id: String,
    pub field: String,
    pub value: AttributeValue,
    pub source_record_id: String,
    pub source_system: String,
    pub observed_at: DateTime<Utc>,
    /// Commit sequence of the event that wrote this row; used to unwind
    /// history precisely on rollback.
    pub event_seq: u64,
}

/// Reversible snapshot of the affected scope of one merge: the golden rows
/// and every xref row touching the affected golden or record ids.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub goldens: Vec<GoldenRecordRow>,
    pub xrefs: Vec<XrefRow>,
}

/// Abstract write API for lineage persistence.
///
/// A transaction covers one merge; implementations MUST apply `commit`
/// atomically per golden id so a reader never observes a partially applied
/// merge.
pub trait LineageSink: Send + Sync {
    fn begin(&self) -> Result<()>;
    fn upsert_golden(&self, row: GoldenRecordRow) -> Result<()>;
    /// Remove a golden row (merge loser). The row stays recoverable via
    /// the event's before-state.
    fn retire_golden(&self, golden_id: &str) -> Result<()>;
    fn upsert_xref(&self, row: XrefRow) -> Result<()>;
    /// Close the open interval of a record's xref without reassigning it
    /// (full-rebuild SPLIT and merge-loser cleanup).
    fn close_xref(&self, source_record_id: &str, source_system: &str, at: DateTime<Utc>)
        -> Result<()>;
    fn append_field_history(&self, row: FieldHistoryRow) -> Result<()>;
    /// Append an event inside the open transaction; returns the sequence
    /// number it will commit with.
    fn append_event(&self, event: MergeEventRow) -> Result<u64>;
    fn commit(&self) -> Result<()>;
    /// Abort the open transaction, discarding pending writes.
    fn abort(&self) -> Result<()>;
}

/// Read surface the orchestrator needs on top of the write API: current
/// assignments for incremental seeding and scope snapshots for reversible
/// event payloads.
pub trait LineageStore: LineageSink {
    fn golden(&self, golden_id: &str) -> Option<GoldenRecordRow>;
    fn golden_ids(&self) -> Vec<String>;
    fn current_members(&self, golden_id: &str) -> Vec<XrefRow>;
    /// Record id → golden id for every current membership.
    fn current_assignments(&self) -> std::collections::BTreeMap<String, String>;
    /// Committed state of a scope (before-image).
    fn snapshot_for(&self, golden_ids: &[String], record_ids: &[String]) -> StateSnapshot;
    /// Committed state with the open transaction overlaid (after-image).
    fn preview_snapshot_for(&self, golden_ids: &[String], record_ids: &[String]) -> StateSnapshot;
}
