//! Attribute survivorship.
//!
//! Given a cluster of scored records, pick one winning value per attribute
//! under the configured strategy, with a deterministic tie order: higher
//! trust, then later source timestamp, then lexicographically smaller
//! source id, then smaller record id. Provenance is retained per attribute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{MdmConfig, SurvivorshipStrategy};
use crate::model::record::{AttributeValue, NormalizedRecord};

/// Where a golden attribute value came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldProvenance {
    pub record_id: String,
    pub source_id: String,
    /// The survivorship rule that selected the value.
    pub rule: String,
    /// True when the value was computed rather than copied from a member
    /// (weighted_average and custom survivors).
    #[serde(default)]
    pub synthesized: bool,
}

/// The attribute set and provenance produced for one cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SurvivedRecord {
    pub attributes: BTreeMap<String, AttributeValue>,
    pub provenance: BTreeMap<String, FieldProvenance>,
}

/// One candidate value with the metadata tie-breaking needs.
#[derive(Clone, Debug)]
pub struct ValueCandidate {
    pub value: AttributeValue,
    pub trust: f64,
    pub timestamp: Option<DateTime<Utc>>,
    pub source_id: String,
    pub record_id: String,
}

/// The canonical tie order. `Less` means "wins".
fn tie_break(a: &ValueCandidate, b: &ValueCandidate) -> Ordering {
    b.trust
        .partial_cmp(&a.trust)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| a.source_id.cmp(&b.source_id))
        .then_with(|| a.record_id.cmp(&b.record_id))
}

type CustomSurvivor = dyn Fn(&[ValueCandidate]) -> Option<AttributeValue> + Send + Sync;

/// Applies survivorship strategies to clusters.
pub struct Survivor {
    config: Arc<MdmConfig>,
    custom: HashMap<String, Box<CustomSurvivor>>,
}

impl Survivor {
    pub fn new(config: Arc<MdmConfig>) -> Self {
        Self {
            config,
            custom: HashMap::new(),
        }
    }

    /// Register a custom survivorship function under a name referenced by
    /// the configuration.
    pub fn register_custom<F>(&mut self, name: &str, survivor: F)
    where
        F: Fn(&[ValueCandidate]) -> Option<AttributeValue> + Send + Sync + 'static,
    {
        self.custom.insert(name.to_string(), Box::new(survivor));
    }

    /// Fail fast when the configuration names custom survivors that were
    /// never registered.
    pub fn check_config(&self) -> crate::error::Result<()> {
        let mut missing = Vec::new();
        for (field, strategy) in &self.config.survivorship.fields {
            if let SurvivorshipStrategy::Custom { name } = strategy {
                if !self.custom.contains_key(name) {
                    missing.push(format!("{field}: '{name}'"));
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(crate::error::MdmError::Configuration(format!(
                "unregistered custom survivors: {}",
                missing.join(", ")
            )))
        }
    }

    /// Produce the golden attribute set for a cluster.
    pub fn survive(&self, members: &[&NormalizedRecord]) -> SurvivedRecord {
        let mut fields: BTreeSet<String> = BTreeSet::new();
        for member in members {
            fields.extend(member.record.attributes.keys().cloned());
        }

        let mut attributes = BTreeMap::new();
        let mut provenance = BTreeMap::new();

        for field in fields {
            let mut candidates: Vec<ValueCandidate> = members
                .iter()
                .filter_map(|member| {
                    let value = member.record.attribute(&field)?;
                    if value.is_null() {
                        return None;
                    }
                    Some(ValueCandidate {
                        value: value.clone(),
                        trust: member.trust.as_ref().map(|t| t.overall).unwrap_or(0.0),
                        timestamp: member.record.source_timestamp,
                        source_id: member.source_id().to_string(),
                        record_id: member.record_id().to_string(),
                    })
                })
                .collect();
            if candidates.is_empty() {
                continue;
            }
            candidates.sort_by(tie_break);

            let strategy = self
                .config
                .survivorship
                .fields
                .get(&field)
                .unwrap_or(&self.config.survivorship.default_strategy);

            if let Some((value, winner)) = self.apply(strategy, &candidates) {
                attributes.insert(field.clone(), value);
                provenance.insert(field, winner);
            }
        }

        SurvivedRecord {
            attributes,
            provenance,
        }
    }

    fn apply(
        &self,
        strategy: &SurvivorshipStrategy,
        candidates: &[ValueCandidate],
    ) -> Option<(AttributeValue, FieldProvenance)> {
        match strategy {
            SurvivorshipStrategy::MostTrusted => {
                Some(copied(&candidates[0], "most_trusted"))
            }
            SurvivorshipStrategy::MostRecent => {
                let winner = candidates
                    .iter()
                    .max_by(|a, b| {
                        a.timestamp
                            .cmp(&b.timestamp)
                            .then_with(|| tie_break(b, a))
                    })?;
                Some(copied(winner, "most_recent"))
            }
            SurvivorshipStrategy::TrustedSourcePriority { sources } => {
                for source in sources {
                    if let Some(winner) = candidates.iter().find(|c| &c.source_id == source) {
                        return Some(copied(winner, "trusted_source_priority"));
                    }
                }
                // No prioritized source holds a value; strongest candidate
                // wins so the golden field is still populated.
                Some(copied(&candidates[0], "trusted_source_priority"))
            }
            SurvivorshipStrategy::MostFrequent => {
                let mut counts: BTreeMap<String, (usize, &ValueCandidate)> = BTreeMap::new();
                for candidate in candidates {
                    let entry = counts
                        .entry(candidate.value.canonical_key())
                        .or_insert((0, candidate));
                    entry.0 += 1;
                    // candidates are already in tie order; keep the first.
                }
                let winner = counts
                    .values()
                    .max_by(|(count_a, cand_a), (count_b, cand_b)| {
                        count_a
                            .cmp(count_b)
                            .then_with(|| tie_break(cand_b, cand_a))
                    })
                    .map(|(_, candidate)| *candidate)?;
                Some(copied(winner, "most_frequent"))
            }
            SurvivorshipStrategy::Longest => {
                pick_by_length(candidates, true).map(|w| copied(w, "longest"))
            }
            SurvivorshipStrategy::Shortest => {
                pick_by_length(candidates, false).map(|w| copied(w, "shortest"))
            }
            SurvivorshipStrategy::WeightedAverage => {
                let numeric: Vec<(f64, &ValueCandidate)> = candidates
                    .iter()
                    .filter_map(|c| c.value.as_number().map(|n| (n, c)))
                    .collect();
                if numeric.is_empty() {
                    return None;
                }
                let weight_total: f64 = numeric.iter().map(|(_, c)| c.trust).sum();
                let mean = if weight_total > 0.0 {
                    numeric.iter().map(|(n, c)| n * c.trust).sum::<f64>() / weight_total
                } else {
                    numeric.iter().map(|(n, _)| n).sum::<f64>() / numeric.len() as f64
                };
                let anchor = numeric[0].1;
                Some((
                    AttributeValue::Number(mean),
                    FieldProvenance {
                        record_id: anchor.record_id.clone(),
                        source_id: anchor.source_id.clone(),
                        rule: "weighted_average".to_string(),
                        synthesized: true,
                    },
                ))
            }
            SurvivorshipStrategy::Custom { name } => {
                let survivor = self.custom.get(name)?;
                let value = survivor(candidates)?;
                let anchor = &candidates[0];
                Some((
                    value,
                    FieldProvenance {
                        record_id: anchor.record_id.clone(),
                        source_id: anchor.source_id.clone(),
                        rule: format!("custom:{name}"),
                        synthesized: true,
                    },
                ))
            }
        }
    }
}

fn copied(candidate: &ValueCandidate, rule: &str) -> (AttributeValue, FieldProvenance) {
    (
        candidate.value.clone(),
        FieldProvenance {
            record_id: candidate.record_id.clone(),
            source_id: candidate.source_id.clone(),
            rule: rule.to_string(),
            synthesized: false,
        },
    )
}

fn pick_by_length(candidates: &[ValueCandidate], longest: bool) -> Option<&ValueCandidate> {
    candidates
        .iter()
        .filter(|c| c.value.as_text().is_some())
        .max_by(|a, b| {
            let len_a = a.value.as_text().map(|t| t.chars().count()).unwrap_or(0);
            let len_b = b.value.as_text().map(|t| t.chars().count()).unwrap_or(0);
            let primary = if longest {
                len_a.cmp(&len_b)
            } else {
                len_b.cmp(&len_a)
            };
            primary.then_with(|| tie_break(b, a))
        })
}

/// New golden ids are UUIDs minted at event time. Derivation from the
/// sorted member set keeps independent runs over the same input producing
/// identical golden records and xref sets.
pub fn new_golden_id(members: &[String]) -> String {
    let name = members.join("\u{1f}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// On a merge of existing golden records the id with the earliest
/// `created_at` survives; ties break to the lexicographically smaller id.
pub fn select_surviving_golden(candidates: &[(String, DateTime<Utc>)]) -> Option<String> {
    candidates
        .iter()
        .min_by(|(id_a, at_a), (id_b, at_b)| at_a.cmp(at_b).then_with(|| id_a.cmp(id_b)))
        .map(|(id, _)| id.clone())
}
