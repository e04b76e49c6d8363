//! Shared fixtures for the integration suites.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use mdm_engine::config::MdmConfig;
use mdm_engine::embed::NoEmbeddings;
use mdm_engine::ingest::{MemoryDeadLetter, RecordStore, VecBatchSource};
use mdm_engine::lineage::MemoryLineageStore;
use mdm_engine::metrics::InMemoryMetrics;
use mdm_engine::model::record::{AttributeValue, Record};
use mdm_engine::model::schema::{DataType, EntityDescriptor, FieldDescriptor, SchemaRegistry};
use mdm_engine::pipeline::{CancellationToken, Pipeline, PipelineContext, PipelineOutcome};
use mdm_engine::preprocess::Preprocessor;
use mdm_engine::survivor::Survivor;

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, d, 0, 0, 0).unwrap()
}

pub fn record(
    record_id: &str,
    source_id: &str,
    attrs: Vec<(&str, AttributeValue)>,
    timestamp: DateTime<Utc>,
) -> Record {
    Record {
        record_id: record_id.to_string(),
        source_id: source_id.to_string(),
        attributes: attrs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
        ingest_time: timestamp,
        source_timestamp: Some(timestamp),
    }
}

pub fn text(s: &str) -> AttributeValue {
    AttributeValue::Text(s.to_string())
}

pub fn customer_schema(fields: Vec<(&str, bool)>) -> Arc<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();
    registry.register_entity(EntityDescriptor {
        name: "customer".into(),
        fields: fields
            .into_iter()
            .map(|(name, required)| FieldDescriptor {
                name: name.to_string(),
                data_type: DataType::Text,
                required,
                importance: 1.0,
                validation: vec![],
            })
            .collect(),
        relationships: vec![],
    });
    Arc::new(registry)
}

pub fn config(json: serde_json::Value) -> Arc<MdmConfig> {
    Arc::new(serde_json::from_value(json).expect("test config parses"))
}

/// Everything one pipeline run needs, owned together so tests can chain
/// incremental batches against the same state.
pub struct Harness {
    pub pipeline: Pipeline,
    pub store: MemoryLineageStore,
    pub records: RecordStore,
    pub dead_letter: MemoryDeadLetter,
    pub metrics: InMemoryMetrics,
}

impl Harness {
    pub fn new(config: Arc<MdmConfig>, schema: Arc<SchemaRegistry>) -> Self {
        let pipeline = Pipeline::new(
            config.clone(),
            schema,
            Preprocessor::default(),
            Survivor::new(config),
        )
        .expect("pipeline builds");
        Self {
            pipeline,
            store: MemoryLineageStore::new(),
            records: RecordStore::new(),
            dead_letter: MemoryDeadLetter::new(),
            metrics: InMemoryMetrics::new(),
        }
    }

    pub fn process(&mut self, batch: Vec<Record>) -> PipelineOutcome {
        let mut source = VecBatchSource::new(batch, 100);
        let mut ctx = PipelineContext {
            store: &self.store,
            records: &mut self.records,
            dead_letter: &self.dead_letter,
            metrics: &self.metrics,
            embedder: &NoEmbeddings,
            cancellation: CancellationToken::new(),
            actor: "test".to_string(),
        };
        self.pipeline
            .process_batch(&mut source, &mut ctx)
            .expect("batch processes")
    }

    pub fn rebuild(&mut self, batch: Vec<Record>) -> PipelineOutcome {
        let mut source = VecBatchSource::new(batch, 100);
        let mut ctx = PipelineContext {
            store: &self.store,
            records: &mut self.records,
            dead_letter: &self.dead_letter,
            metrics: &self.metrics,
            embedder: &NoEmbeddings,
            cancellation: CancellationToken::new(),
            actor: "test".to_string(),
        };
        self.pipeline
            .rebuild(&mut source, &mut ctx)
            .expect("rebuild processes")
    }
}
