//! Candidate pair generation.
//!
//! Three strategies: standard key blocking, sorted-neighborhood, and LSH
//! over embeddings. All strategies emit a duplicate-free set of unordered
//! pairs with `a < b`, and refuse configurations whose blocks exceed the
//! configured safety bound before any match work happens.

pub mod lsh;

use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::config::{BlockKeySpec, BlockingConfig, BlockingStrategy};
use crate::error::{MdmError, Result};
use crate::model::record::NormalizedRecord;

/// Unordered candidate pair; `a` is always lexicographically smaller.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidatePair {
    pub a: String,
    pub b: String,
}

impl CandidatePair {
    pub fn new(x: &str, y: &str) -> Self {
        if x <= y {
            Self {
                a: x.to_string(),
                b: y.to_string(),
            }
        } else {
            Self {
                a: y.to_string(),
                b: x.to_string(),
            }
        }
    }

    pub fn contains(&self, record_id: &str) -> bool {
        self.a == record_id || self.b == record_id
    }
}

/// Generates candidate pairs from a record set.
pub struct Blocker {
    config: BlockingConfig,
}

impl Blocker {
    pub fn new(config: BlockingConfig) -> Self {
        Self { config }
    }

    /// The block keys one record occupies. Recomputed whenever the blocking
    /// configuration changes; used by incremental runs to co-locate new
    /// records with the existing population.
    pub fn block_keys(&self, record: &NormalizedRecord) -> Vec<String> {
        self.config
            .keys
            .iter()
            .filter_map(|spec| key_for(record, spec))
            .collect()
    }

    /// Generate all candidate pairs for a record population.
    pub fn candidate_pairs(&self, records: &[NormalizedRecord]) -> Result<Vec<CandidatePair>> {
        let mut pairs = match self.config.strategy {
            BlockingStrategy::Standard => self.standard(records)?,
            BlockingStrategy::SortedNeighborhood => self.sorted_neighborhood(records)?,
            BlockingStrategy::Lsh => self.lsh(records)?,
        };
        pairs.sort();
        pairs.dedup();
        debug!(pairs = pairs.len(), records = records.len(), "blocking complete");
        Ok(pairs)
    }

    fn standard(&self, records: &[NormalizedRecord]) -> Result<Vec<CandidatePair>> {
        let blocks: DashMap<String, Vec<usize>> = DashMap::new();
        records.par_iter().enumerate().for_each(|(index, record)| {
            for key in self.block_keys(record) {
                blocks.entry(key).or_default().push(index);
            }
        });

        // Safety bound first: a single oversized block is fatal before any
        // pair is produced.
        for entry in blocks.iter() {
            if entry.value().len() > self.config.max_block_size {
                return Err(self.explosion(entry.key(), entry.value().len()));
            }
        }

        let mut block_list: Vec<(String, Vec<usize>)> = blocks
            .into_iter()
            .map(|(key, mut members)| {
                members.sort();
                (key, members)
            })
            .collect();
        block_list.sort();

        let pairs: Vec<CandidatePair> = block_list
            .par_iter()
            .flat_map_iter(|(_, members)| {
                let records = &records;
                members.iter().enumerate().flat_map(move |(i, &x)| {
                    members[i + 1..].iter().map(move |&y| {
                        CandidatePair::new(records[x].record_id(), records[y].record_id())
                    })
                })
            })
            .collect();
        Ok(pairs)
    }

    fn sorted_neighborhood(&self, records: &[NormalizedRecord]) -> Result<Vec<CandidatePair>> {
        let window = self.config.window;
        let mut keyed: Vec<(String, &str)> = records
            .iter()
            .map(|record| {
                let composite: Vec<String> = self
                    .config
                    .keys
                    .iter()
                    .map(|spec| key_for(record, spec).unwrap_or_default())
                    .collect();
                (composite.join("|"), record.record_id())
            })
            .collect();
        keyed.sort();

        let mut pairs = Vec::new();
        for i in 0..keyed.len() {
            let end = (i + window + 1).min(keyed.len());
            for j in (i + 1)..end {
                pairs.push(CandidatePair::new(keyed[i].1, keyed[j].1));
            }
        }
        Ok(pairs)
    }

    fn lsh(&self, records: &[NormalizedRecord]) -> Result<Vec<CandidatePair>> {
        let field = self
            .config
            .vector_field
            .as_deref()
            .ok_or_else(|| MdmError::Configuration("lsh blocking requires vector_field".into()))?;

        let indexed: Vec<(&NormalizedRecord, &[f32])> = records
            .iter()
            .filter_map(|r| r.embeddings.get(field).map(|v| (r, v.as_slice())))
            .collect();
        let skipped = records.len() - indexed.len();
        if skipped > 0 {
            warn!(
                skipped,
                field, "records without embeddings are excluded from lsh blocking"
            );
        }
        if indexed.is_empty() {
            return Ok(Vec::new());
        }

        let dimensions = indexed[0].1.len();
        let index = lsh::HyperplaneIndex::new(dimensions, self.config.lsh_seed);

        let mut pairs = Vec::new();
        for (record, neighbors) in index.top_k_neighbors(&indexed, self.config.top_k) {
            for neighbor in neighbors {
                pairs.push(CandidatePair::new(record, neighbor));
            }
        }
        Ok(pairs)
    }

    fn explosion(&self, block_key: &str, size: usize) -> MdmError {
        let mut suggestions = Vec::new();
        for spec in &self.config.keys {
            match spec.prefix_len {
                Some(len) => suggestions.push(format!(
                    "lengthen prefix on '{}' beyond {len} characters",
                    spec.field
                )),
                None => suggestions.push(format!("add a prefix_len to blocking key '{}'", spec.field)),
            }
        }
        suggestions.push("add a second blocking key to split large blocks".to_string());
        MdmError::BlockExplosion {
            block_key: block_key.to_string(),
            size,
            limit: self.config.max_block_size,
            suggestions,
        }
    }
}

/// Build the block key for one record/key-spec combination. Records with a
/// null or non-textual value for the field emit no key.
fn key_for(record: &NormalizedRecord, spec: &BlockKeySpec) -> Option<String> {
    let value = record.value(&spec.field);
    let text = value.as_text()?;
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    let derived = match spec.prefix_len {
        Some(len) => text.chars().take(len).collect::<String>(),
        None => text,
    };
    Some(format!("{}={derived}", spec.field))
}

/// Check that a pair set covers the labeled duplicate pairs at the
/// configured recall floor. A test harness helper for property 5
/// (blocker recall), not a runtime enforcement point.
pub fn pair_recall(generated: &[CandidatePair], labeled_duplicates: &[CandidatePair]) -> f64 {
    if labeled_duplicates.is_empty() {
        return 1.0;
    }
    let set: HashSet<&CandidatePair> = generated.iter().collect();
    let found = labeled_duplicates
        .iter()
        .filter(|pair| set.contains(pair))
        .count();
    found as f64 / labeled_duplicates.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockingConfig;
    use crate::model::record::{AttributeValue, Record};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(id: &str, name: &str) -> NormalizedRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert("name".to_string(), AttributeValue::Text(name.to_string()));
        NormalizedRecord {
            record: Record {
                record_id: id.to_string(),
                source_id: "crm".to_string(),
                attributes,
                ingest_time: Utc::now(),
                source_timestamp: None,
            },
            normalized: BTreeMap::new(),
            embeddings: BTreeMap::new(),
            value_hashes: BTreeMap::new(),
            trust: None,
        }
    }

    fn standard_config(prefix_len: Option<usize>, max_block_size: usize) -> BlockingConfig {
        serde_json::from_value(serde_json::json!({
            "strategy": "standard",
            "keys": [{"field": "name", "prefix_len": prefix_len}],
            "max_block_size": max_block_size
        }))
        .unwrap()
    }

    #[test]
    fn shared_key_produces_one_pair() {
        let blocker = Blocker::new(standard_config(Some(3), 100));
        let records = vec![
            record("r1", "Acme Corp"),
            record("r2", "ACME Corporation"),
            record("r3", "Zenith Ltd"),
        ];
        let pairs = blocker.candidate_pairs(&records).unwrap();
        assert_eq!(pairs, vec![CandidatePair::new("r1", "r2")]);
    }

    #[test]
    fn duplicate_pairs_from_multiple_blocks_collapse() {
        let config: BlockingConfig = serde_json::from_value(serde_json::json!({
            "strategy": "standard",
            "keys": [
                {"field": "name", "prefix_len": 3},
                {"field": "name", "prefix_len": 4}
            ]
        }))
        .unwrap();
        let blocker = Blocker::new(config);
        let records = vec![record("r1", "Acme Corp"), record("r2", "Acme Inc")];
        let pairs = blocker.candidate_pairs(&records).unwrap();
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn oversized_block_is_fatal() {
        let blocker = Blocker::new(standard_config(Some(1), 2));
        let records = vec![
            record("r1", "Acme"),
            record("r2", "Apex"),
            record("r3", "Able"),
        ];
        let err = blocker.candidate_pairs(&records).unwrap_err();
        match err {
            MdmError::BlockExplosion {
                size, suggestions, ..
            } => {
                assert_eq!(size, 3);
                assert!(!suggestions.is_empty());
            }
            other => panic!("expected BlockExplosion, got {other:?}"),
        }
    }

    #[test]
    fn sorted_neighborhood_stays_in_window() {
        let config: BlockingConfig = serde_json::from_value(serde_json::json!({
            "strategy": "sorted_neighborhood",
            "keys": [{"field": "name"}],
            "window": 1
        }))
        .unwrap();
        let blocker = Blocker::new(config);
        let records = vec![
            record("r1", "alpha"),
            record("r2", "beta"),
            record("r3", "gamma"),
        ];
        let pairs = blocker.candidate_pairs(&records).unwrap();
        // window 1: only adjacent-in-sort-order pairs
        assert_eq!(
            pairs,
            vec![CandidatePair::new("r1", "r2"), CandidatePair::new("r2", "r3")]
        );
    }

    #[test]
    fn null_blocking_field_emits_no_key() {
        let blocker = Blocker::new(standard_config(None, 100));
        let mut rec = record("r1", "x");
        rec.record.attributes.remove("name");
        assert!(blocker.block_keys(&rec).is_empty());
    }

    #[test]
    fn recall_helper_measures_coverage() {
        let generated = vec![CandidatePair::new("a", "b"), CandidatePair::new("b", "c")];
        let labeled = vec![CandidatePair::new("a", "b"), CandidatePair::new("c", "d")];
        assert!((pair_recall(&generated, &labeled) - 0.5).abs() < 1e-9);
    }
}
