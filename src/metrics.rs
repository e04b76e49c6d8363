//! Pipeline metrics.
//!
//! Emission is fire-and-forget to an external sink; the in-memory recorder
//! backs tests and the CLI's run summary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Fire-and-forget metrics emission.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, value: u64);
    fn gauge(&self, name: &str, value: f64);
    fn histogram(&self, name: &str, value: f64);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _value: u64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
    fn histogram(&self, _name: &str, _value: f64) {}
}

/// In-memory recorder: counters accumulate, gauges overwrite, histogram
/// samples append.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.lock().unwrap().get(name).copied()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn counter(&self, name: &str, value: u64) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += value;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.gauges.lock().unwrap().insert(name.to_string(), value);
    }

    fn histogram(&self, name: &str, value: f64) {
        self.histograms
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(Vec::new)
            .push(value);
    }
}

/// Per-run derived statistics, emitted to the sink and returned to the
/// caller with the pipeline result.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub records_ingested: u64,
    pub records_dead_lettered: u64,
    pub pairs_generated: u64,
    pub pairs_evaluated: u64,
    pub matches: u64,
    pub reviews: u64,
    pub non_matches: u64,
    pub comparator_warnings: u64,
    pub clusters: u64,
    pub golden_created: u64,
    pub golden_updated: u64,
    pub golden_merged: u64,
    pub mean_match_score: f64,
    /// Cluster size → count of clusters of that size.
    pub cluster_size_distribution: HashMap<usize, u64>,
}

impl PipelineStats {
    pub fn match_rate(&self) -> f64 {
        if self.pairs_evaluated == 0 {
            0.0
        } else {
            self.matches as f64 / self.pairs_evaluated as f64
        }
    }

    pub fn emit(&self, sink: &dyn MetricsSink) {
        sink.counter("records.ingested", self.records_ingested);
        sink.counter("records.dead_lettered", self.records_dead_lettered);
        sink.counter("pairs.generated", self.pairs_generated);
        sink.counter("pairs.evaluated", self.pairs_evaluated);
        sink.counter("decisions.match", self.matches);
        sink.counter("decisions.review", self.reviews);
        sink.counter("decisions.no_match", self.non_matches);
        sink.counter("comparator.warnings", self.comparator_warnings);
        sink.gauge("clusters.count", self.clusters as f64);
        sink.gauge("match.rate", self.match_rate());
        sink.gauge("match.mean_score", self.mean_match_score);
        for (size, count) in &self.cluster_size_distribution {
            sink.histogram("clusters.size", *size as f64 * *count as f64);
        }
    }
}
