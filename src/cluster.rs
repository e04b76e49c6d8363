//! Clustering of pairwise decisions into entities.
//!
//! MATCH decisions union records in a union-find; REVIEW decisions are
//! queued and never union; NO_MATCH decisions are kept as negative edges
//! for the transitivity guard. The builder is the pipeline's sole mutable
//! shared structure and is only driven by the reducer task.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::block::CandidatePair;
use crate::matching::{MatchDecision, Verdict};

/// A resolved cluster: the maximal set of records connected by MATCH
/// decisions. Members are sorted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub members: Vec<String>,
}

/// What happened to a cluster relative to the prior golden state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterDelta {
    /// No prior golden covers any member.
    Create { members: Vec<String> },
    /// Exactly one prior golden covers some members and the membership is
    /// unchanged.
    Unchanged {
        golden_id: String,
        members: Vec<String>,
    },
    /// Exactly one prior golden covers some members and membership grew or
    /// shrank.
    Update {
        golden_id: String,
        members: Vec<String>,
    },
    /// Two or more prior goldens now share one cluster.
    Merge {
        golden_ids: Vec<String>,
        members: Vec<String>,
    },
}

/// Union-find with path compression and deterministic union-by-rank (rank
/// ties pick the lexicographically smaller root, so the final forest does
/// not depend on edge arrival order beyond the builder's own sort).
#[derive(Clone, Debug, Default)]
pub struct UnionFind {
    parent: HashMap<String, String>,
    rank: HashMap<String, u32>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str) {
        if !self.parent.contains_key(id) {
            self.parent.insert(id.to_string(), id.to_string());
            self.rank.insert(id.to_string(), 0);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parent.contains_key(id)
    }

    pub fn find(&mut self, id: &str) -> String {
        self.insert(id);
        let mut root = id.to_string();
        while self.parent[&root] != root {
            root = self.parent[&root].clone();
        }
        // Path compression.
        let mut current = id.to_string();
        while self.parent[&current] != root {
            let next = self.parent[&current].clone();
            self.parent.insert(current, root.clone());
            current = next;
        }
        root
    }

    pub fn union(&mut self, a: &str, b: &str) -> String {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return root_a;
        }
        let rank_a = self.rank[&root_a];
        let rank_b = self.rank[&root_b];
        let (winner, loser) = if rank_a > rank_b {
            (root_a, root_b)
        } else if rank_b > rank_a {
            (root_b, root_a)
        } else if root_a < root_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        let rank = self.rank[&winner].max(self.rank[&loser] + 1);
        self.parent.insert(loser, winner.clone());
        self.rank.insert(winner.clone(), rank);
        winner
    }

    pub fn same_set(&mut self, a: &str, b: &str) -> bool {
        self.find(a) == self.find(b)
    }
}

/// Builds clusters from a stream of decisions.
pub struct ClusterBuilder {
    uf: UnionFind,
    members: HashMap<String, Vec<String>>,
    positive: Vec<MatchDecision>,
    review: Vec<MatchDecision>,
    negative: HashMap<CandidatePair, f64>,
    demoted: Vec<MatchDecision>,
    guard_enabled: bool,
}

impl ClusterBuilder {
    pub fn new(guard_enabled: bool) -> Self {
        Self {
            uf: UnionFind::new(),
            members: HashMap::new(),
            positive: Vec::new(),
            review: Vec::new(),
            negative: HashMap::new(),
            demoted: Vec::new(),
            guard_enabled,
        }
    }

    /// Register a record so it forms at least a singleton cluster.
    pub fn add_record(&mut self, record_id: &str) {
        if self.uf.contains(record_id) {
            return;
        }
        self.uf.insert(record_id);
        self.members
            .insert(record_id.to_string(), vec![record_id.to_string()]);
    }

    /// Seed prior cluster memberships (incremental mode).
    pub fn seed_cluster(&mut self, members: &[String]) {
        let Some(first) = members.first() else {
            return;
        };
        self.add_record(first);
        for member in &members[1..] {
            self.add_record(member);
            self.apply_union(first, member);
        }
    }

    /// Feed one decision. MATCH edges are buffered so they can be applied
    /// in a total order at build time.
    pub fn observe(&mut self, decision: MatchDecision) {
        self.add_record(&decision.pair.a);
        self.add_record(&decision.pair.b);
        match decision.verdict {
            Verdict::Match => self.positive.push(decision),
            Verdict::Review => self.review.push(decision),
            Verdict::NoMatch => {
                self.negative
                    .insert(decision.pair.clone(), decision.overall_score);
            }
        }
    }

    fn apply_union(&mut self, a: &str, b: &str) {
        let root_a = self.uf.find(a);
        let root_b = self.uf.find(b);
        if root_a == root_b {
            return;
        }
        let winner = self.uf.union(a, b);
        let loser = if winner == root_a { root_b } else { root_a };
        let moved = self.members.remove(&loser).unwrap_or_default();
        self.members.entry(winner).or_default().extend(moved);
    }

    /// Any recorded NO_MATCH between the two components?
    fn conflicting(&mut self, a: &str, b: &str) -> bool {
        let root_a = self.uf.find(a);
        let root_b = self.uf.find(b);
        let negatives: Vec<CandidatePair> = self.negative.keys().cloned().collect();
        for pair in negatives {
            let left_root = self.uf.find(&pair.a);
            let right_root = self.uf.find(&pair.b);
            if (left_root == root_a && right_root == root_b)
                || (left_root == root_b && right_root == root_a)
            {
                return true;
            }
        }
        false
    }

    /// Apply all buffered MATCH edges and return the final clusters.
    ///
    /// Edges are processed strongest-first, so when the transitivity guard
    /// trips, the edge being applied is the weaker of the edges bridging
    /// the two components; it is demoted to REVIEW and the components stay
    /// apart.
    pub fn build(mut self) -> ClusterSet {
        let mut edges = std::mem::take(&mut self.positive);
        edges.sort_by(|x, y| {
            y.overall_score
                .partial_cmp(&x.overall_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| x.pair.cmp(&y.pair))
        });

        let mut applied = Vec::new();
        for decision in edges {
            let a = decision.pair.a.clone();
            let b = decision.pair.b.clone();
            if self.guard_enabled && !self.uf.same_set(&a, &b) && self.conflicting(&a, &b) {
                let mut demoted = decision;
                demoted.verdict = Verdict::Review;
                self.demoted.push(demoted);
                continue;
            }
            self.apply_union(&a, &b);
            applied.push(decision);
        }

        let mut clusters: Vec<Cluster> = self
            .members
            .into_values()
            .map(|mut members| {
                members.sort();
                members.dedup();
                Cluster { members }
            })
            .collect();
        clusters.sort_by(|a, b| a.members.cmp(&b.members));

        let mut review = self.review;
        review.extend(self.demoted.iter().cloned());

        ClusterSet {
            clusters,
            applied,
            review,
            demoted: self.demoted,
        }
    }
}

/// Result of a clustering pass.
pub struct ClusterSet {
    pub clusters: Vec<Cluster>,
    /// MATCH decisions that actually unioned (or confirmed) components.
    pub applied: Vec<MatchDecision>,
    /// REVIEW decisions, including guard demotions, for the external queue.
    pub review: Vec<MatchDecision>,
    /// The subset of reviews the guard demoted.
    pub demoted: Vec<MatchDecision>,
}

impl ClusterSet {
    /// Classify each cluster against the prior record → golden mapping.
    pub fn deltas(&self, prior: &HashMap<String, String>) -> Vec<ClusterDelta> {
        // Prior golden → its full prior member set, to detect growth.
        let mut prior_members: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        for (record, golden) in prior {
            prior_members
                .entry(golden.clone())
                .or_default()
                .insert(record.clone());
        }

        self.clusters
            .iter()
            .map(|cluster| {
                let mut goldens: Vec<String> = cluster
                    .members
                    .iter()
                    .filter_map(|m| prior.get(m).cloned())
                    .collect();
                goldens.sort();
                goldens.dedup();
                match goldens.len() {
                    0 => ClusterDelta::Create {
                        members: cluster.members.clone(),
                    },
                    1 => {
                        let golden_id = goldens.remove(0);
                        let previous = &prior_members[&golden_id];
                        let current: HashSet<String> =
                            cluster.members.iter().cloned().collect();
                        if *previous == current {
                            ClusterDelta::Unchanged {
                                golden_id,
                                members: cluster.members.clone(),
                            }
                        } else {
                            ClusterDelta::Update {
                                golden_id,
                                members: cluster.members.clone(),
                            }
                        }
                    }
                    _ => ClusterDelta::Merge {
                        golden_ids: goldens,
                        members: cluster.members.clone(),
                    },
                }
            })
            .collect()
    }
}
