//! Ingestion boundary.
//!
//! The pipeline consumes records through an abstract batch source and
//! routes schema failures to a dead-letter sink with a `VALIDATION_ERROR`
//! reason. Connectors (databases, files, REST) live outside the core and
//! implement `BatchSource`.

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::model::record::{AttributeValue, Record};
use crate::model::schema::SchemaRegistry;

/// Pull-based record source. `None` marks the end of the stream; batches
/// are bounded in count by the producing side.
pub trait BatchSource {
    fn next_batch(&mut self) -> AnyResult<Option<Vec<Record>>>;
}

/// A rejected record with its reason, as written to the dead-letter sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub record_id: String,
    pub source_id: String,
    pub reason_code: String,
    pub detail: String,
    pub rejected_at: DateTime<Utc>,
}

pub trait DeadLetterSink: Send + Sync {
    fn reject(&self, row: DeadLetterRow);
}

/// In-memory dead letter collection.
#[derive(Default)]
pub struct MemoryDeadLetter {
    rows: Mutex<Vec<DeadLetterRow>>,
}

impl MemoryDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<DeadLetterRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.record_id == record_id)
    }
}

impl DeadLetterSink for MemoryDeadLetter {
    fn reject(&self, row: DeadLetterRow) {
        self.rows.lock().unwrap().push(row);
    }
}

/// Dead letters appended as JSON lines, one rejected record per line.
pub struct JsonlDeadLetter {
    file: Mutex<std::fs::File>,
}

impl JsonlDeadLetter {
    pub fn open(path: &Path) -> AnyResult<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening dead letter file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl DeadLetterSink for JsonlDeadLetter {
    fn reject(&self, row: DeadLetterRow) {
        if let Ok(line) = serde_json::to_string(&row) {
            let mut file = self.file.lock().unwrap();
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Validate a batch against the schema registry, splitting it into clean
/// records and dead-lettered rejects.
pub fn validate_batch(
    records: Vec<Record>,
    entity_type: &str,
    schema: &SchemaRegistry,
    dead_letter: &dyn DeadLetterSink,
) -> (Vec<Record>, u64) {
    let mut clean = Vec::with_capacity(records.len());
    let mut rejected = 0u64;
    for record in records {
        let failures = schema.validate_record(entity_type, &record);
        if failures.is_empty() {
            clean.push(record);
        } else {
            rejected += 1;
            dead_letter.reject(DeadLetterRow {
                record_id: record.record_id.clone(),
                source_id: record.source_id.clone(),
                reason_code: "VALIDATION_ERROR".to_string(),
                detail: failures.join("; "),
                rejected_at: Utc::now(),
            });
        }
    }
    (clean, rejected)
}

/// Parse one record from its JSON wire form:
/// `{record_id, source_id, attributes, source_timestamp?}`.
pub fn parse_record(value: &serde_json::Value, ingest_time: DateTime<Utc>) -> AnyResult<Record> {
    let record_id = value
        .get("record_id")
        .and_then(|v| v.as_str())
        .context("record_id missing")?
        .to_string();
    let source_id = value
        .get("source_id")
        .and_then(|v| v.as_str())
        .context("source_id missing")?
        .to_string();
    let attributes: BTreeMap<String, AttributeValue> = value
        .get("attributes")
        .and_then(|v| v.as_object())
        .context("attributes missing")?
        .iter()
        .map(|(k, v)| (k.clone(), AttributeValue::from_json(v)))
        .collect();
    let source_timestamp = value
        .get("source_timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc));

    Ok(Record {
        record_id,
        source_id,
        attributes,
        ingest_time,
        source_timestamp,
    })
}

/// Batch source over an in-memory record list, chunked to the configured
/// batch size. Backs the CLI's file-based ingestion and the test suites.
pub struct VecBatchSource {
    batches: VecDeque<Vec<Record>>,
}

impl VecBatchSource {
    pub fn new(records: Vec<Record>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        let mut batches = VecDeque::new();
        let mut current = Vec::with_capacity(batch_size);
        for record in records {
            current.push(record);
            if current.len() == batch_size {
                batches.push_back(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push_back(current);
        }
        Self { batches }
    }

    /// Load records from a JSON file holding an array of wire-form records.
    pub fn from_file(path: &Path, batch_size: usize) -> AnyResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let values: Vec<serde_json::Value> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let ingest_time = Utc::now();
        let records = values
            .iter()
            .map(|v| parse_record(v, ingest_time))
            .collect::<AnyResult<Vec<Record>>>()?;
        Ok(Self::new(records, batch_size))
    }
}

impl BatchSource for VecBatchSource {
    fn next_batch(&mut self) -> AnyResult<Option<Vec<Record>>> {
        Ok(self.batches.pop_front())
    }
}

/// Store of ingested source records. Records are immutable once inserted;
/// incremental runs read the existing population back out of it so
/// cross-batch matches are found.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecordStore {
    records: BTreeMap<String, Record>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: Record) {
        self.records.entry(record.record_id.clone()).or_insert(record);
    }

    pub fn get(&self, record_id: &str) -> Option<&Record> {
        self.records.get(record_id)
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.records.contains_key(record_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::{DataType, EntityDescriptor, FieldDescriptor};

    fn schema() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry.register_entity(EntityDescriptor {
            name: "customer".into(),
            fields: vec![FieldDescriptor {
                name: "name".into(),
                data_type: DataType::Text,
                required: true,
                importance: 1.0,
                validation: vec![],
            }],
            relationships: vec![],
        });
        registry
    }

    fn record(id: &str, name: Option<&str>) -> Record {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "name".to_string(),
            name.map(|n| AttributeValue::Text(n.to_string()))
                .unwrap_or(AttributeValue::Null),
        );
        Record {
            record_id: id.to_string(),
            source_id: "crm".to_string(),
            attributes,
            ingest_time: Utc::now(),
            source_timestamp: None,
        }
    }

    #[test]
    fn invalid_records_route_to_dead_letter() {
        let schema = schema();
        let dead_letter = MemoryDeadLetter::new();
        let (clean, rejected) = validate_batch(
            vec![record("r1", Some("Acme")), record("r2", None)],
            "customer",
            &schema,
            &dead_letter,
        );
        assert_eq!(clean.len(), 1);
        assert_eq!(rejected, 1);
        let rows = dead_letter.rows();
        assert_eq!(rows[0].record_id, "r2");
        assert_eq!(rows[0].reason_code, "VALIDATION_ERROR");
    }

    #[test]
    fn batches_are_bounded() {
        let records: Vec<Record> = (0..5).map(|i| record(&format!("r{i}"), Some("x"))).collect();
        let mut source = VecBatchSource::new(records, 2);
        let mut sizes = Vec::new();
        while let Some(batch) = source.next_batch().unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn wire_form_parses() {
        let value = serde_json::json!({
            "record_id": "CRM_1",
            "source_id": "CRM",
            "attributes": {"name": "Acme Corp", "phone": "555-0101"},
            "source_timestamp": "2024-02-25T00:00:00Z"
        });
        let record = parse_record(&value, Utc::now()).unwrap();
        assert_eq!(record.record_id, "CRM_1");
        assert!(record.source_timestamp.is_some());
        assert_eq!(
            record.attributes["name"],
            AttributeValue::Text("Acme Corp".into())
        );
    }

    #[test]
    fn missing_record_id_is_an_error() {
        let value = serde_json::json!({"source_id": "CRM", "attributes": {}});
        assert!(parse_record(&value, Utc::now()).is_err());
    }

    #[test]
    fn file_source_and_jsonl_dead_letter_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let batch_path = dir.path().join("batch.json");
        std::fs::write(
            &batch_path,
            serde_json::json!([
                {"record_id": "r1", "source_id": "CRM", "attributes": {"name": "Acme"}},
                {"record_id": "r2", "source_id": "ERP", "attributes": {"name": null}}
            ])
            .to_string(),
        )
        .unwrap();
        let mut source = VecBatchSource::from_file(&batch_path, 10).unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);

        let dl_path = dir.path().join("dead_letter.jsonl");
        let sink = JsonlDeadLetter::open(&dl_path).unwrap();
        sink.reject(DeadLetterRow {
            record_id: "r2".into(),
            source_id: "ERP".into(),
            reason_code: "VALIDATION_ERROR".into(),
            detail: "required field 'name' is null".into(),
            rejected_at: Utc::now(),
        });
        let written = std::fs::read_to_string(&dl_path).unwrap();
        assert!(written.contains("VALIDATION_ERROR"));
        assert_eq!(written.lines().count(), 1);
    }
}
