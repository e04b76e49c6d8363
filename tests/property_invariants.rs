//! Property-based invariants: determinism, rollback round-trips,
//! survivorship purity, and null-policy neutrality.

mod common;

use common::{config, customer_schema, day, record, text, Harness};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use mdm_engine::block::{pair_recall, Blocker, CandidatePair};
use mdm_engine::matching::MatchEngine;
use mdm_engine::model::record::AttributeValue;

fn dedup_config() -> Arc<mdm_engine::config::MdmConfig> {
    config(serde_json::json!({
        "entity_type": "customer",
        "sources": {"CRM": {"reliability": 0.9}, "ERP": {"reliability": 0.7}},
        "fields": {
            "name": {
                "comparator": {"type": "fuzzy", "method": "jaro_winkler"},
                "preprocessors": ["strip", "collapse_whitespace", "lower"]
            }
        },
        "blocking": {"strategy": "standard", "keys": [{"field": "name", "prefix_len": 3}]}
    }))
}

fn name_pool() -> Vec<&'static str> {
    vec![
        "Acme Corp",
        "ACME Corporation",
        "Zenith Ltd",
        "Zenith Limited",
        "Apex Inc",
        "Apex Incorporated",
        "Borealis AG",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Two independent runs over the same batch produce identical golden
    /// records and identical xref assignments.
    #[test]
    fn determinism_across_runs(picks in prop::collection::vec(0usize..7, 1..12)) {
        let batch: Vec<_> = picks
            .iter()
            .enumerate()
            .map(|(i, pick)| {
                let source = if i % 2 == 0 { "CRM" } else { "ERP" };
                record(
                    &format!("r{i:02}"),
                    source,
                    vec![("name", text(name_pool()[*pick]))],
                    day(1 + (i % 20) as u32),
                )
            })
            .collect();

        let mut first = Harness::new(dedup_config(), customer_schema(vec![("name", true)]));
        let mut second = Harness::new(dedup_config(), customer_schema(vec![("name", true)]));
        first.process(batch.clone());
        second.process(batch);

        let goldens_first: BTreeMap<String, _> = first
            .store
            .golden_ids()
            .into_iter()
            .map(|id| (id.clone(), first.store.golden(&id).unwrap().attributes))
            .collect();
        let goldens_second: BTreeMap<String, _> = second
            .store
            .golden_ids()
            .into_iter()
            .map(|id| (id.clone(), second.store.golden(&id).unwrap().attributes))
            .collect();

        prop_assert_eq!(goldens_first, goldens_second);
        prop_assert_eq!(
            first.store.current_assignments(),
            second.store.current_assignments()
        );
    }

    /// Applying a batch and rolling back to its first event restores the
    /// initial (empty) table state.
    #[test]
    fn rollback_round_trip(picks in prop::collection::vec(0usize..7, 1..8)) {
        let batch: Vec<_> = picks
            .iter()
            .enumerate()
            .map(|(i, pick)| {
                record(
                    &format!("r{i:02}"),
                    "CRM",
                    vec![("name", text(name_pool()[*pick]))],
                    day(1),
                )
            })
            .collect();

        let mut harness = Harness::new(dedup_config(), customer_schema(vec![("name", true)]));
        harness.process(batch);

        let mut events = harness.store.events();
        prop_assert!(!events.is_empty());
        events.sort_by_key(|e| e.seq);
        harness.store.rollback_to_event(&events[0].event_id).unwrap();

        prop_assert!(harness.store.golden_ids().is_empty());
        prop_assert!(harness.store.current_assignments().is_empty());
        // No orphan history rows survive the unwind.
        for event in harness.store.events() {
            prop_assert!(event.rolled_back);
        }
    }

    /// Every golden attribute value appears in some member's attributes
    /// when no synthesizing survivor is configured.
    #[test]
    fn survivorship_purity(picks in prop::collection::vec(0usize..7, 2..10)) {
        let batch: Vec<_> = picks
            .iter()
            .enumerate()
            .map(|(i, pick)| {
                let source = if i % 2 == 0 { "CRM" } else { "ERP" };
                record(
                    &format!("r{i:02}"),
                    source,
                    vec![("name", text(name_pool()[*pick]))],
                    day(1 + i as u32),
                )
            })
            .collect();

        let mut harness = Harness::new(dedup_config(), customer_schema(vec![("name", true)]));
        harness.process(batch.clone());

        for golden_id in harness.store.golden_ids() {
            let golden = harness.store.golden(&golden_id).unwrap();
            let members = harness.store.current_members(&golden_id);
            for (field, value) in &golden.attributes {
                let found = members.iter().any(|xref| {
                    batch
                        .iter()
                        .find(|r| r.record_id == xref.source_record_id)
                        .and_then(|r| r.attributes.get(field))
                        .map(|v| v == value)
                        .unwrap_or(false)
                });
                prop_assert!(found, "golden {golden_id} field {field} not from a member");
                prop_assert!(!golden.provenance[field].synthesized);
            }
        }
    }
}

/// For the `skip` null policy a null-valued field leaves the weighted
/// average of the remaining fields untouched.
#[test]
fn skip_null_policy_is_neutral() {
    let with_skip_field = config(serde_json::json!({
        "entity_type": "customer",
        "sources": {"CRM": {"reliability": 0.9}},
        "fields": {
            "a": {"comparator": {"type": "exact"}, "weight": 0.6},
            "b": {"comparator": {"type": "exact"}, "weight": 0.4},
            "c": {"comparator": {"type": "exact"}, "weight": 5.0, "null_policy": "skip"}
        },
        "blocking": {"strategy": "standard", "keys": [{"field": "a"}]}
    }));
    let without_skip_field = config(serde_json::json!({
        "entity_type": "customer",
        "sources": {"CRM": {"reliability": 0.9}},
        "fields": {
            "a": {"comparator": {"type": "exact"}, "weight": 0.6},
            "b": {"comparator": {"type": "exact"}, "weight": 0.4}
        },
        "blocking": {"strategy": "standard", "keys": [{"field": "a"}]}
    }));

    let left = common::record(
        "r1",
        "CRM",
        vec![("a", text("x")), ("b", text("y")), ("c", AttributeValue::Null)],
        day(1),
    );
    let right = common::record(
        "r2",
        "CRM",
        vec![("a", text("x")), ("b", text("z")), ("c", text("present"))],
        day(1),
    );

    let normalize = |r: &mdm_engine::model::record::Record| mdm_engine::model::record::NormalizedRecord {
        record: r.clone(),
        normalized: BTreeMap::new(),
        embeddings: BTreeMap::new(),
        value_hashes: BTreeMap::new(),
        trust: None,
    };

    let with_engine = MatchEngine::new(with_skip_field);
    let without_engine = MatchEngine::new(without_skip_field);
    let with_score = with_engine.evaluate_pair(&normalize(&left), &normalize(&right));
    let without_score = without_engine.evaluate_pair(&normalize(&left), &normalize(&right));

    assert!((with_score.overall_score - without_score.overall_score).abs() < 1e-9);
    assert!(!with_score.field_scores.contains_key("c"));
}

/// Blocker recall on a labeled duplicate set: standard prefix blocking
/// finds at least the configured floor of true pairs.
#[test]
fn blocker_recall_meets_floor() {
    let blocking: mdm_engine::config::BlockingConfig = serde_json::from_value(serde_json::json!({
        "strategy": "standard",
        "keys": [{"field": "name", "prefix_len": 3}],
        "recall_floor": 0.95
    }))
    .unwrap();
    let recall_floor = blocking.recall_floor;
    let blocker = Blocker::new(blocking);

    // Labeled distribution: duplicates vary in suffix and case but share
    // the head of the name, which is what prefix blocking keys on.
    let variants = [
        ("Acme Corp", "ACME Corporation"),
        ("Zenith Ltd", "zenith limited"),
        ("Apex Inc", "Apex Incorporated"),
        ("Borealis AG", "borealis group"),
        ("Cascade LLC", "Cascade Logistics"),
    ];

    let mut records = Vec::new();
    let mut labeled = Vec::new();
    for (i, (left, right)) in variants.iter().enumerate() {
        let id_a = format!("a{i}");
        let id_b = format!("b{i}");
        records.push(record(&id_a, "CRM", vec![("name", text(left))], day(1)));
        records.push(record(&id_b, "ERP", vec![("name", text(right))], day(1)));
        labeled.push(CandidatePair::new(&id_a, &id_b));
    }

    let normalized: Vec<_> = records
        .iter()
        .map(|r| mdm_engine::model::record::NormalizedRecord {
            record: r.clone(),
            normalized: BTreeMap::new(),
            embeddings: BTreeMap::new(),
            value_hashes: BTreeMap::new(),
            trust: None,
        })
        .collect();

    let pairs = blocker.candidate_pairs(&normalized).unwrap();
    let recall = pair_recall(&pairs, &labeled);
    assert!(recall >= recall_floor, "recall {recall} below floor");
}
