//! In-memory lineage store.
//!
//! Reference implementation of the lineage sink: transactional writes with
//! per-merge atomicity, an append-only event log with rollback, xref
//! interval maintenance, and the graph queries the CLI exposes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::info;

use super::{
    EventType, FieldHistoryRow, GoldenRecordRow, LineageSink, LineageStore, MergeEventRow,
    RelationType, StateSnapshot, XrefRow,
};
use crate::error::{MdmError, Result};
use crate::model::record::AttributeValue;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    goldens: BTreeMap<String, GoldenRecordRow>,
    xrefs: Vec<XrefRow>,
    events: Vec<MergeEventRow>,
    field_history: Vec<FieldHistoryRow>,
    next_seq: u64,
}

#[derive(Default)]
struct Pending {
    golden_upserts: BTreeMap<String, GoldenRecordRow>,
    golden_retirements: BTreeSet<String>,
    xrefs: Vec<XrefRow>,
    xref_closures: Vec<(String, String, DateTime<Utc>)>,
    field_history: Vec<FieldHistoryRow>,
    events: Vec<MergeEventRow>,
}

/// Thread-safe in-memory store. Writes go through the `LineageSink`
/// transaction protocol; reads always see committed state only.
pub struct MemoryLineageStore {
    inner: Mutex<Inner>,
    /// Test hook: make the next N commits fail to exercise atomicity and
    /// retry behavior.
    induced_failures: AtomicU32,
}

struct Inner {
    tables: Tables,
    pending: Option<Pending>,
}

impl MemoryLineageStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tables: Tables::default(),
                pending: None,
            }),
            induced_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` commits fail with a lineage conflict.
    pub fn inject_commit_failures(&self, n: u32) {
        self.induced_failures.store(n, Ordering::SeqCst);
    }

    // ----- queries (committed state only) -----

    pub fn golden(&self, golden_id: &str) -> Option<GoldenRecordRow> {
        self.inner.lock().unwrap().tables.goldens.get(golden_id).cloned()
    }

    pub fn golden_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().tables.goldens.keys().cloned().collect()
    }

    /// The open xref for a source record, if any.
    pub fn current_xref(&self, source_record_id: &str) -> Option<XrefRow> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .xrefs
            .iter()
            .find(|x| {
                x.source_record_id == source_record_id
                    && x.is_current()
                    && x.relation == RelationType::SameAs
            })
            .cloned()
    }

    /// All current member xrefs of a golden record.
    pub fn current_members(&self, golden_id: &str) -> Vec<XrefRow> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .xrefs
            .iter()
            .filter(|x| {
                x.golden_id == golden_id && x.is_current() && x.relation == RelationType::SameAs
            })
            .cloned()
            .collect()
    }

    /// Record id → golden id for every current membership.
    pub fn current_assignments(&self) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .xrefs
            .iter()
            .filter(|x| x.is_current() && x.relation == RelationType::SameAs)
            .map(|x| (x.source_record_id.clone(), x.golden_id.clone()))
            .collect()
    }

    pub fn all_xrefs(&self) -> Vec<XrefRow> {
        self.inner.lock().unwrap().tables.xrefs.clone()
    }

    pub fn events(&self) -> Vec<MergeEventRow> {
        self.inner.lock().unwrap().tables.events.clone()
    }

    pub fn event_by_id(&self, event_id: &str) -> Option<MergeEventRow> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .events
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned()
    }

    pub fn field_history(&self, golden_id: &str, field: &str) -> Vec<FieldHistoryRow> {
        let mut rows: Vec<FieldHistoryRow> = self
            .inner
            .lock()
            .unwrap()
            .tables
            .field_history
            .iter()
            .filter(|h| h.golden_id == golden_id && h.field == field)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.event_seq);
        rows
    }

    /// The value a golden field held at a point in time.
    pub fn field_value_at(
        &self,
        golden_id: &str,
        field: &str,
        at: DateTime<Utc>,
    ) -> Option<AttributeValue> {
        self.field_history(golden_id, field)
            .into_iter()
            .filter(|h| h.observed_at <= at)
            .last()
            .map(|h| h.value)
    }

    /// Entities related to `id` over xref edges valid at `at_time`
    /// (default: now). The edge set is bidirectional: record → golden and
    /// golden → record, plus golden → golden supersession edges.
    pub fn related_entities(
        &self,
        id: &str,
        relation_type: Option<RelationType>,
        at_time: Option<DateTime<Utc>>,
    ) -> Vec<String> {
        let at = at_time.unwrap_or_else(Utc::now);
        let inner = self.inner.lock().unwrap();
        let mut related = BTreeSet::new();
        for xref in &inner.tables.xrefs {
            if !xref.valid_at(at) {
                continue;
            }
            if let Some(filter) = relation_type {
                if xref.relation != filter {
                    continue;
                }
            }
            if xref.source_record_id == id {
                related.insert(xref.golden_id.clone());
            } else if xref.golden_id == id {
                related.insert(xref.source_record_id.clone());
            }
        }
        related.into_iter().collect()
    }

    /// Shortest xref path between two ids over edges valid at `at_time`,
    /// materialized on demand and never cached.
    pub fn find_path(
        &self,
        from: &str,
        to: &str,
        at_time: Option<DateTime<Utc>>,
    ) -> Option<Vec<String>> {
        let at = at_time.unwrap_or_else(Utc::now);
        let edges: Vec<(String, String)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .tables
                .xrefs
                .iter()
                .filter(|x| x.valid_at(at))
                .map(|x| (x.source_record_id.clone(), x.golden_id.clone()))
                .collect()
        };

        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (a, b) in &edges {
            adjacency.entry(a).or_default().push(b);
            adjacency.entry(b).or_default().push(a);
        }

        let mut queue = std::collections::VecDeque::from([vec![from.to_string()]]);
        let mut seen = BTreeSet::from([from.to_string()]);
        while let Some(path) = queue.pop_front() {
            let tail = path.last().cloned().unwrap_or_default();
            if tail == to {
                return Some(path);
            }
            if let Some(neighbors) = adjacency.get(tail.as_str()) {
                for next in neighbors {
                    if seen.insert(next.to_string()) {
                        let mut extended = path.clone();
                        extended.push(next.to_string());
                        queue.push_back(extended);
                    }
                }
            }
        }
        None
    }

    /// Committed state of the given scope, for before-images.
    pub fn snapshot_for(&self, golden_ids: &[String], record_ids: &[String]) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        snapshot(&inner.tables, golden_ids, record_ids)
    }

    /// Committed state with the open transaction overlaid, for
    /// after-images written into the event itself.
    pub fn preview_snapshot_for(
        &self,
        golden_ids: &[String],
        record_ids: &[String],
    ) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut tables = inner.tables.clone();
        if let Some(pending) = &inner.pending {
            apply_pending(&mut tables, pending);
        }
        snapshot(&tables, golden_ids, record_ids)
    }

    // ----- rollback -----

    /// Undo events `event_id` and everything after it, in reverse commit
    /// order, by restoring their before-states. Idempotent: events already
    /// rolled back are skipped.
    pub fn rollback_to_event(&self, event_id: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let target_seq = inner
            .tables
            .events
            .iter()
            .find(|e| e.event_id == event_id)
            .map(|e| e.seq)
            .ok_or_else(|| MdmError::UnknownEvent(event_id.to_string()))?;

        let mut undone = 0u64;
        let sequences: Vec<u64> = inner
            .tables
            .events
            .iter()
            .filter(|e| e.seq >= target_seq && !e.rolled_back)
            .map(|e| e.seq)
            .rev()
            .collect();

        for seq in sequences {
            let event = inner
                .tables
                .events
                .iter()
                .find(|e| e.seq == seq)
                .cloned()
                .ok_or_else(|| MdmError::Data(format!("event seq {seq} vanished")))?;
            let before: StateSnapshot = serde_json::from_value(event.before_state.clone())?;

            // Replace the affected scope with its before-image.
            let golden_scope: BTreeSet<&String> = event.affected_golden_ids.iter().collect();
            let record_scope: BTreeSet<&String> = event.affected_record_ids.iter().collect();

            for golden_id in &event.affected_golden_ids {
                inner.tables.goldens.remove(golden_id);
            }
            for row in before.goldens {
                inner.tables.goldens.insert(row.golden_id.clone(), row);
            }

            inner.tables.xrefs.retain(|x| {
                !(golden_scope.contains(&x.golden_id)
                    || record_scope.contains(&x.source_record_id))
            });
            inner.tables.xrefs.extend(before.xrefs);

            inner.tables.field_history.retain(|h| h.event_seq != seq);

            if let Some(entry) = inner.tables.events.iter_mut().find(|e| e.seq == seq) {
                entry.rolled_back = true;
            }
            undone += 1;
        }

        info!(event_id, undone, "rollback complete");
        Ok(undone)
    }

    // ----- persistence for the CLI state directory -----

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let inner = self.inner.lock().unwrap();
        Ok(serde_json::to_value(&inner.tables)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let tables: Tables = serde_json::from_value(value)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                tables,
                pending: None,
            }),
            induced_failures: AtomicU32::new(0),
        })
    }
}

impl Default for MemoryLineageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(tables: &Tables, golden_ids: &[String], record_ids: &[String]) -> StateSnapshot {
    let golden_scope: BTreeSet<&String> = golden_ids.iter().collect();
    let record_scope: BTreeSet<&String> = record_ids.iter().collect();
    StateSnapshot {
        goldens: golden_ids
            .iter()
            .filter_map(|id| tables.goldens.get(id).cloned())
            .collect(),
        xrefs: tables
            .xrefs
            .iter()
            .filter(|x| {
                golden_scope.contains(&x.golden_id) || record_scope.contains(&x.source_record_id)
            })
            .cloned()
            .collect(),
    }
}

fn apply_pending(tables: &mut Tables, pending: &Pending) {
    for golden_id in &pending.golden_retirements {
        tables.goldens.remove(golden_id);
    }
    for (golden_id, row) in &pending.golden_upserts {
        tables.goldens.insert(golden_id.clone(), row.clone());
    }
    for (record, system, at) in &pending.xref_closures {
        for existing in tables.xrefs.iter_mut() {
            if existing.source_record_id == *record
                && existing.source_system == *system
                && existing.is_current()
            {
                existing.valid_to = Some(*at);
            }
        }
    }
    for row in &pending.xrefs {
        upsert_xref_row(&mut tables.xrefs, row.clone());
    }
    tables.field_history.extend(pending.field_history.iter().cloned());
    for event in &pending.events {
        let mut event = event.clone();
        event.seq = tables.next_seq;
        tables.next_seq += 1;
        tables.events.push(event);
    }
}

/// Apply one xref row: an existing open interval for the same
/// (record, system) pointing at a different golden is closed at the new
/// row's `valid_from`; re-asserting the same assignment refreshes
/// confidence in place.
fn upsert_xref_row(xrefs: &mut Vec<XrefRow>, row: XrefRow) {
    for existing in xrefs.iter_mut() {
        if existing.source_record_id == row.source_record_id
            && existing.source_system == row.source_system
            && existing.relation == row.relation
            && existing.is_current()
        {
            if existing.golden_id == row.golden_id {
                existing.confidence = row.confidence;
                return;
            }
            existing.valid_to = Some(row.valid_from);
        }
    }
    xrefs.push(row);
}

impl LineageSink for MemoryLineageStore {
    fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.is_some() {
            return Err(MdmError::LineageConflict {
                golden_id: "<tx>".to_string(),
                reason: "transaction already open".to_string(),
            });
        }
        inner.pending = Some(Pending::default());
        Ok(())
    }

    fn upsert_golden(&self, row: GoldenRecordRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pending = open_tx(&mut inner)?;
        pending.golden_retirements.remove(&row.golden_id);
        pending.golden_upserts.insert(row.golden_id.clone(), row);
        Ok(())
    }

    fn retire_golden(&self, golden_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pending = open_tx(&mut inner)?;
        pending.golden_upserts.remove(golden_id);
        pending.golden_retirements.insert(golden_id.to_string());
        Ok(())
    }

    fn upsert_xref(&self, row: XrefRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pending = open_tx(&mut inner)?;
        pending.xrefs.push(row);
        Ok(())
    }

    fn close_xref(
        &self,
        source_record_id: &str,
        source_system: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pending = open_tx(&mut inner)?;
        pending
            .xref_closures
            .push((source_record_id.to_string(), source_system.to_string(), at));
        Ok(())
    }

    fn append_field_history(&self, row: FieldHistoryRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pending = open_tx(&mut inner)?;
        pending.field_history.push(row);
        Ok(())
    }

    fn append_event(&self, event: MergeEventRow) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let provisional = inner.tables.next_seq;
        let pending = open_tx(&mut inner)?;
        let seq = provisional + pending.events.len() as u64;
        pending.events.push(event);
        Ok(seq)
    }

    fn commit(&self) -> Result<()> {
        if self.induced_failures.load(Ordering::SeqCst) > 0 {
            self.induced_failures.fetch_sub(1, Ordering::SeqCst);
            let mut inner = self.inner.lock().unwrap();
            inner.pending = None;
            return Err(MdmError::LineageConflict {
                golden_id: "<injected>".to_string(),
                reason: "injected commit failure".to_string(),
            });
        }
        let mut inner = self.inner.lock().unwrap();
        let pending = inner.pending.take().ok_or_else(|| MdmError::LineageConflict {
            golden_id: "<tx>".to_string(),
            reason: "commit without open transaction".to_string(),
        })?;
        // Single critical section: readers see the old state or the whole
        // new state, never a slice of the merge.
        let tables = &mut inner.tables;
        apply_pending(tables, &pending);
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending = None;
        Ok(())
    }
}

impl LineageStore for MemoryLineageStore {
    fn golden(&self, golden_id: &str) -> Option<GoldenRecordRow> {
        MemoryLineageStore::golden(self, golden_id)
    }

    fn golden_ids(&self) -> Vec<String> {
        MemoryLineageStore::golden_ids(self)
    }

    fn current_members(&self, golden_id: &str) -> Vec<XrefRow> {
        MemoryLineageStore::current_members(self, golden_id)
    }

    fn current_assignments(&self) -> BTreeMap<String, String> {
        MemoryLineageStore::current_assignments(self)
    }

    fn snapshot_for(&self, golden_ids: &[String], record_ids: &[String]) -> StateSnapshot {
        MemoryLineageStore::snapshot_for(self, golden_ids, record_ids)
    }

    fn preview_snapshot_for(&self, golden_ids: &[String], record_ids: &[String]) -> StateSnapshot {
        MemoryLineageStore::preview_snapshot_for(self, golden_ids, record_ids)
    }
}

fn open_tx<'a>(inner: &'a mut Inner) -> Result<&'a mut Pending> {
    inner.pending.as_mut().ok_or_else(|| MdmError::LineageConflict {
        golden_id: "<tx>".to_string(),
        reason: "write outside transaction".to_string(),
    })
}
