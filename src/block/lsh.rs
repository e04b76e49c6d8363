//! Random-hyperplane LSH over embedding vectors.
//!
//! Signatures are sign patterns against a fixed set of hyperplanes drawn
//! from a seeded generator, so the index is deterministic for a given
//! configuration. Candidate lookup probes the home bucket plus all buckets
//! at Hamming distance 1, then re-ranks by exact cosine similarity.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

use crate::compare::cosine_similarity;
use crate::model::record::NormalizedRecord;

const SIGNATURE_BITS: usize = 12;

pub struct HyperplaneIndex {
    hyperplanes: Vec<Vec<f32>>,
}

impl HyperplaneIndex {
    pub fn new(dimensions: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let hyperplanes = (0..SIGNATURE_BITS)
            .map(|_| {
                (0..dimensions)
                    .map(|_| rng.gen_range(-1.0f32..1.0f32))
                    .collect()
            })
            .collect();
        Self { hyperplanes }
    }

    pub fn signature(&self, vector: &[f32]) -> u32 {
        let mut bits = 0u32;
        for (i, plane) in self.hyperplanes.iter().enumerate() {
            let dot: f32 = plane
                .iter()
                .zip(vector.iter())
                .map(|(p, v)| p * v)
                .sum();
            if dot >= 0.0 {
                bits |= 1 << i;
            }
        }
        bits
    }

    /// Approximate top-k neighbors per record.
    ///
    /// Returns `(record_id, neighbor_ids)` with the candidate list ordered
    /// by (similarity desc, id asc) before truncation, so results are a
    /// total order independent of bucket iteration.
    pub fn top_k_neighbors<'a>(
        &self,
        records: &[(&'a NormalizedRecord, &'a [f32])],
        top_k: usize,
    ) -> Vec<(&'a str, Vec<&'a str>)> {
        let mut buckets: HashMap<u32, Vec<usize>> = HashMap::new();
        let signatures: Vec<u32> = records
            .iter()
            .map(|(_, vector)| self.signature(vector))
            .collect();
        for (index, signature) in signatures.iter().enumerate() {
            buckets.entry(*signature).or_default().push(index);
        }

        records
            .iter()
            .enumerate()
            .map(|(index, (record, vector))| {
                let signature = signatures[index];
                let mut candidates: Vec<usize> = Vec::new();
                if let Some(members) = buckets.get(&signature) {
                    candidates.extend(members.iter().copied());
                }
                // Multi-probe: flip each bit once.
                for bit in 0..SIGNATURE_BITS {
                    if let Some(members) = buckets.get(&(signature ^ (1 << bit))) {
                        candidates.extend(members.iter().copied());
                    }
                }
                candidates.retain(|&c| c != index);
                candidates.sort_unstable();
                candidates.dedup();

                let mut ranked: Vec<(f64, &str)> = candidates
                    .into_iter()
                    .map(|c| {
                        (
                            cosine_similarity(vector, records[c].1),
                            records[c].0.record_id(),
                        )
                    })
                    .collect();
                ranked.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.1.cmp(b.1))
                });
                ranked.truncate(top_k);
                (
                    record.record_id(),
                    ranked.into_iter().map(|(_, id)| id).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::{AttributeValue, Record};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record_with_vector(id: &str, vector: Vec<f32>) -> NormalizedRecord {
        let mut embeddings = BTreeMap::new();
        embeddings.insert("name".to_string(), vector);
        NormalizedRecord {
            record: Record {
                record_id: id.to_string(),
                source_id: "crm".to_string(),
                attributes: BTreeMap::from([(
                    "name".to_string(),
                    AttributeValue::Text(id.to_string()),
                )]),
                ingest_time: Utc::now(),
                source_timestamp: None,
            },
            normalized: BTreeMap::new(),
            embeddings,
            value_hashes: BTreeMap::new(),
            trust: None,
        }
    }

    #[test]
    fn signatures_are_deterministic_for_a_seed() {
        let a = HyperplaneIndex::new(8, 42);
        let b = HyperplaneIndex::new(8, 42);
        let vector = vec![0.3, -0.1, 0.9, 0.0, 0.2, -0.5, 0.4, 0.7];
        assert_eq!(a.signature(&vector), b.signature(&vector));
    }

    #[test]
    fn near_identical_vectors_are_neighbors() {
        let records = vec![
            record_with_vector("r1", vec![1.0, 0.0, 0.0, 0.1]),
            record_with_vector("r2", vec![0.9999, 0.0001, 0.0, 0.1]),
            record_with_vector("r3", vec![-1.0, 0.2, 0.9, -0.4]),
        ];
        let indexed: Vec<(&NormalizedRecord, &[f32])> = records
            .iter()
            .map(|r| (r, r.embeddings["name"].as_slice()))
            .collect();
        let index = HyperplaneIndex::new(4, 0);
        let neighbors = index.top_k_neighbors(&indexed, 2);
        let r1 = neighbors.iter().find(|(id, _)| *id == "r1").unwrap();
        assert!(r1.1.contains(&"r2"));
    }
}
