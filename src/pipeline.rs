//! Pipeline orchestrator.
//!
//! Glues ingestion → normalize/trust → block → match → cluster → survive →
//! lineage commit. Two modes: full rebuild (prior clusters split, the whole
//! population reprocessed) and incremental (new batch co-blocked with the
//! existing population, union-find seeded from current clusters).
//!
//! Parallelism: record normalization, pair evaluation, and survivorship run
//! on the rayon pool; match decisions stream over a channel into a single
//! reducer thread that owns the union-find; lineage commits are serialized
//! per golden id. Cancellation is cooperative and checked between batches,
//! pair chunks, and cluster commits.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::block::Blocker;
use crate::cluster::{ClusterBuilder, ClusterDelta, ClusterSet};
use crate::config::MdmConfig;
use crate::embed::EmbeddingProvider;
use crate::error::{MdmError, Result};
use crate::ingest::{validate_batch, BatchSource, DeadLetterSink, RecordStore};
use crate::lineage::{
    EventType, FieldHistoryRow, GoldenRecordRow, LineageStore, MergeEventRow, RelationType,
    XrefRow,
};
use crate::matching::{MatchDecision, MatchEngine, Verdict};
use crate::metrics::{MetricsSink, PipelineStats};
use crate::model::record::NormalizedRecord;
use crate::model::schema::SchemaRegistry;
use crate::preprocess::Preprocessor;
use crate::survivor::{new_golden_id, select_surviving_golden, SurvivedRecord, Survivor};
use crate::trust::TrustScorer;
use uuid::Uuid;

/// Cooperative cancellation signal, checked at suspension points.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MdmError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// External collaborators, passed explicitly instead of living in global
/// singletons.
pub struct PipelineContext<'a> {
    pub store: &'a dyn LineageStore,
    pub records: &'a mut RecordStore,
    pub dead_letter: &'a dyn DeadLetterSink,
    pub metrics: &'a dyn MetricsSink,
    pub embedder: &'a dyn EmbeddingProvider,
    pub cancellation: CancellationToken,
    /// Actor recorded on merge events.
    pub actor: String,
}

/// Result of one pipeline run.
pub struct PipelineOutcome {
    pub stats: PipelineStats,
    /// All decisions, sorted by score descending for explanation surfaces.
    pub decisions: Vec<MatchDecision>,
    /// Review queue: REVIEW verdicts plus transitivity-guard demotions.
    pub review: Vec<MatchDecision>,
    /// Clusters whose lineage commit failed after retries; the committed
    /// state of other clusters is untouched.
    pub requeued_clusters: Vec<Vec<String>>,
}

pub struct Pipeline {
    config: Arc<MdmConfig>,
    schema: Arc<SchemaRegistry>,
    preprocessor: Preprocessor,
    blocker: Blocker,
    engine: MatchEngine,
    trust: TrustScorer,
    survivor: Survivor,
}

impl Pipeline {
    /// Build a pipeline, failing fast on any configuration problem.
    pub fn new(
        config: Arc<MdmConfig>,
        schema: Arc<SchemaRegistry>,
        preprocessor: Preprocessor,
        survivor: Survivor,
    ) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(MdmError::Configuration(errors.join("; ")));
        }
        if schema.entity(&config.entity_type).is_none() {
            return Err(MdmError::Configuration(format!(
                "entity type '{}' is not registered in the schema",
                config.entity_type
            )));
        }
        preprocessor.check_config(&config)?;
        survivor.check_config()?;

        Ok(Self {
            blocker: Blocker::new(config.blocking.clone()),
            engine: MatchEngine::new(config.clone()),
            trust: TrustScorer::new(config.clone()),
            preprocessor,
            survivor,
            schema,
            config,
        })
    }

    pub fn config(&self) -> &MdmConfig {
        &self.config
    }

    /// Incremental run: ingest a new batch, co-block it with the existing
    /// population, seed clusters from current assignments.
    pub fn process_batch(
        &self,
        source: &mut dyn BatchSource,
        ctx: &mut PipelineContext<'_>,
    ) -> Result<PipelineOutcome> {
        self.run(source, ctx, true)
    }

    /// Full rebuild: split all prior golden records, then reprocess the
    /// whole population (existing store plus whatever the source yields).
    pub fn rebuild(
        &self,
        source: &mut dyn BatchSource,
        ctx: &mut PipelineContext<'_>,
    ) -> Result<PipelineOutcome> {
        self.split_all(ctx)?;
        self.run(source, ctx, false)
    }

    fn run(
        &self,
        source: &mut dyn BatchSource,
        ctx: &mut PipelineContext<'_>,
        incremental: bool,
    ) -> Result<PipelineOutcome> {
        let now = Utc::now();
        let mut stats = PipelineStats::default();
        let deadline = StageClock::new(self.config.stage_timeout_secs);

        // ---- ingest ----
        let mut new_records = Vec::new();
        loop {
            ctx.cancellation.check()?;
            let batch = source
                .next_batch()
                .map_err(|e| MdmError::Data(format!("ingestion source failed: {e}")))?;
            let Some(batch) = batch else { break };
            stats.records_ingested += batch.len() as u64;
            let (clean, rejected) = validate_batch(
                batch,
                &self.config.entity_type,
                &self.schema,
                ctx.dead_letter,
            );
            stats.records_dead_lettered += rejected;
            new_records.extend(clean);
        }
        deadline.check("ingest")?;
        info!(
            ingested = stats.records_ingested,
            dead_lettered = stats.records_dead_lettered,
            "ingestion complete"
        );

        for record in &new_records {
            ctx.records.insert(record.clone());
        }

        // The population this run matches over: for incremental runs the
        // whole store (so cross-batch matches are found), which the new
        // batch has just been inserted into; a rebuild also reprocesses
        // everything, with prior assignments already split.
        let population: Vec<_> = ctx.records.all().cloned().collect();

        // ---- normalize + trust (record-parallel) ----
        let normalized: Vec<NormalizedRecord> = population
            .into_par_iter()
            .map(|record| {
                let normalized =
                    self.preprocessor
                        .normalize_record(record, &self.config, ctx.embedder);
                self.trust.attach(normalized, &self.schema, now)
            })
            .collect();
        ctx.cancellation.check()?;
        deadline.check("normalize")?;

        let by_id: HashMap<&str, &NormalizedRecord> = normalized
            .iter()
            .map(|r| (r.record_id(), r))
            .collect();

        // ---- block ----
        let pairs = self.blocker.candidate_pairs(&normalized)?;
        stats.pairs_generated = pairs.len() as u64;
        deadline.check("block")?;

        // ---- match (pair-parallel, decisions reduced on one thread) ----
        let prior = if incremental {
            ctx.store.current_assignments()
        } else {
            BTreeMap::new()
        };

        let mut builder = ClusterBuilder::new(self.config.thresholds.transitivity_guard_enabled);
        let mut prior_clusters: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (record, golden) in &prior {
            prior_clusters
                .entry(golden.clone())
                .or_default()
                .push(record.clone());
        }
        for members in prior_clusters.values() {
            builder.seed_cluster(members);
        }
        for record in &normalized {
            builder.add_record(record.record_id());
        }

        let (sender, receiver) = mpsc::channel::<MatchDecision>();
        let reducer = std::thread::spawn(move || {
            let mut decisions = Vec::new();
            for decision in receiver {
                builder.observe(decision.clone());
                decisions.push(decision);
            }
            (builder, decisions)
        });

        let cancelled = &ctx.cancellation;
        pairs
            .par_iter()
            .for_each_with(sender, |sender, pair| {
                if cancelled.is_cancelled() {
                    return; // in-flight pairs are discarded
                }
                let (Some(left), Some(right)) =
                    (by_id.get(pair.a.as_str()), by_id.get(pair.b.as_str()))
                else {
                    return;
                };
                let decision = self.engine.evaluate_pair(left, right);
                let _ = sender.send(decision);
            });

        let (builder, mut decisions) = reducer
            .join()
            .map_err(|_| MdmError::Data("match reducer thread panicked".to_string()))?;
        ctx.cancellation.check()?;
        deadline.check("match")?;

        stats.pairs_evaluated = decisions.len() as u64;
        stats.comparator_warnings = self.engine.warning_count();
        let mut score_sum = 0.0;
        for decision in &decisions {
            score_sum += decision.overall_score;
            match decision.verdict {
                Verdict::Match => stats.matches += 1,
                Verdict::Review => stats.reviews += 1,
                Verdict::NoMatch => stats.non_matches += 1,
            }
        }
        if !decisions.is_empty() {
            stats.mean_match_score = score_sum / decisions.len() as f64;
        }

        // ---- cluster ----
        let cluster_set = builder.build();
        stats.clusters = cluster_set.clusters.len() as u64;
        for cluster in &cluster_set.clusters {
            *stats
                .cluster_size_distribution
                .entry(cluster.members.len())
                .or_insert(0) += 1;
        }

        // ---- survive + persist ----
        let requeued = self.persist_deltas(&cluster_set, &by_id, &prior, ctx, now, &mut stats)?;
        deadline.check("persist")?;

        decisions.sort_by(|a, b| {
            b.overall_score
                .partial_cmp(&a.overall_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pair.cmp(&b.pair))
        });

        stats.emit(ctx.metrics);
        Ok(PipelineOutcome {
            stats,
            decisions,
            review: cluster_set.review,
            requeued_clusters: requeued,
        })
    }

    /// Apply survivorship per changed cluster and commit each cluster's
    /// merge atomically, retrying transient lineage conflicts with
    /// exponential backoff.
    fn persist_deltas(
        &self,
        cluster_set: &ClusterSet,
        by_id: &HashMap<&str, &NormalizedRecord>,
        prior: &BTreeMap<String, String>,
        ctx: &mut PipelineContext<'_>,
        now: DateTime<Utc>,
        stats: &mut PipelineStats,
    ) -> Result<Vec<Vec<String>>> {
        let prior_hash: HashMap<String, String> =
            prior.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let deltas = cluster_set.deltas(&prior_hash);

        // Survivorship is pure and cluster-parallel.
        let survived: Vec<(ClusterDelta, Option<SurvivedRecord>)> = deltas
            .into_par_iter()
            .map(|delta| {
                let members = delta_members(&delta);
                let records: Vec<&NormalizedRecord> = members
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).copied())
                    .collect();
                let survived = if matches!(delta, ClusterDelta::Unchanged { .. }) {
                    None
                } else {
                    Some(self.survivor.survive(&records))
                };
                (delta, survived)
            })
            .collect();

        let mut requeued = Vec::new();
        for (delta, survived) in survived {
            ctx.cancellation.check()?;
            let members = delta_members(&delta).to_vec();
            let Some(survived) = survived else {
                continue; // unchanged cluster, no event
            };
            match self.commit_delta(&delta, &survived, by_id, ctx, now) {
                Ok(event_type) => match event_type {
                    EventType::Create => stats.golden_created += 1,
                    EventType::Update => stats.golden_updated += 1,
                    EventType::Merge => stats.golden_merged += 1,
                    _ => {}
                },
                Err(error) => {
                    warn!(%error, ?members, "cluster commit failed after retries; re-queued");
                    requeued.push(members);
                }
            }
        }
        Ok(requeued)
    }

    fn commit_delta(
        &self,
        delta: &ClusterDelta,
        survived: &SurvivedRecord,
        by_id: &HashMap<&str, &NormalizedRecord>,
        ctx: &mut PipelineContext<'_>,
        now: DateTime<Utc>,
    ) -> Result<EventType> {
        let mut backoff = Duration::from_millis(self.config.retry.initial_backoff_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_commit_delta(delta, survived, by_id, ctx, now) {
                Ok(event_type) => return Ok(event_type),
                Err(error) if error.is_retryable() && attempt < self.config.retry.max_attempts => {
                    warn!(%error, attempt, "lineage write conflict; backing off");
                    let _ = ctx.store.abort();
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(error) => {
                    let _ = ctx.store.abort();
                    return Err(error);
                }
            }
        }
    }

    fn try_commit_delta(
        &self,
        delta: &ClusterDelta,
        survived: &SurvivedRecord,
        by_id: &HashMap<&str, &NormalizedRecord>,
        ctx: &mut PipelineContext<'_>,
        now: DateTime<Utc>,
    ) -> Result<EventType> {
        let store = ctx.store;
        let members = delta_members(delta);

        let (event_type, golden_id, retired, version, created_at) = match delta {
            ClusterDelta::Create { members } => (
                EventType::Create,
                new_golden_id(members),
                Vec::new(),
                1,
                now,
            ),
            ClusterDelta::Update { golden_id, .. } => {
                let existing = store
                    .golden(golden_id)
                    .ok_or_else(|| MdmError::UnknownGolden(golden_id.clone()))?;
                (
                    EventType::Update,
                    golden_id.clone(),
                    Vec::new(),
                    existing.version + 1,
                    existing.created_at,
                )
            }
            ClusterDelta::Merge { golden_ids, .. } => {
                let rows: Vec<GoldenRecordRow> = golden_ids
                    .iter()
                    .map(|id| {
                        store
                            .golden(id)
                            .ok_or_else(|| MdmError::UnknownGolden(id.clone()))
                    })
                    .collect::<Result<_>>()?;
                let candidates: Vec<(String, DateTime<Utc>)> = rows
                    .iter()
                    .map(|r| (r.golden_id.clone(), r.created_at))
                    .collect();
                let survivor_id = select_surviving_golden(&candidates)
                    .ok_or_else(|| MdmError::Data("merge with no candidates".to_string()))?;
                let survivor_row = rows
                    .iter()
                    .find(|r| r.golden_id == survivor_id)
                    .ok_or_else(|| MdmError::UnknownGolden(survivor_id.clone()))?;
                let retired: Vec<String> = golden_ids
                    .iter()
                    .filter(|id| **id != survivor_id)
                    .cloned()
                    .collect();
                (
                    EventType::Merge,
                    survivor_id,
                    retired,
                    survivor_row.version + 1,
                    survivor_row.created_at,
                )
            }
            ClusterDelta::Unchanged { .. } => {
                return Err(MdmError::Data("unchanged delta has no commit".to_string()))
            }
        };

        let mut affected_goldens = vec![golden_id.clone()];
        affected_goldens.extend(retired.iter().cloned());
        affected_goldens.sort();
        affected_goldens.dedup();
        let affected_records: Vec<String> = members.to_vec();

        let before = store.snapshot_for(&affected_goldens, &affected_records);

        store.begin()?;
        store.upsert_golden(GoldenRecordRow {
            golden_id: golden_id.clone(),
            attributes: survived.attributes.clone(),
            provenance: survived.provenance.clone(),
            cluster_id: golden_id.clone(),
            version,
            created_at,
            updated_at: now,
        })?;

        // Merge losers close and map onto the survivor.
        for loser in &retired {
            store.retire_golden(loser)?;
            store.upsert_xref(XrefRow {
                source_record_id: loser.clone(),
                source_system: "golden".to_string(),
                golden_id: golden_id.clone(),
                relation: RelationType::ReplacedBy,
                valid_from: now,
                valid_to: None,
                confidence: 1.0,
            })?;
        }

        for member in members {
            let confidence = by_id
                .get(member.as_str())
                .and_then(|r| r.trust.as_ref())
                .map(|t| t.overall)
                .unwrap_or(1.0);
            let source_system = by_id
                .get(member.as_str())
                .map(|r| r.source_id().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            store.upsert_xref(XrefRow {
                source_record_id: member.clone(),
                source_system,
                golden_id: golden_id.clone(),
                relation: RelationType::SameAs,
                valid_from: now,
                valid_to: None,
                confidence,
            })?;
        }

        let event_id = Uuid::new_v4().to_string();
        let after = store.preview_snapshot_for(&affected_goldens, &affected_records);
        let seq = store.append_event(MergeEventRow {
            event_id,
            seq: 0, // assigned in commit order
            event_type,
            timestamp: now,
            actor: ctx.actor.clone(),
            affected_golden_ids: affected_goldens,
            affected_record_ids: affected_records,
            before_state: serde_json::to_value(&before)?,
            after_state: serde_json::to_value(&after)?,
            rolled_back: false,
        })?;

        for (field, value) in &survived.attributes {
            let provenance = survived.provenance.get(field);
            store.append_field_history(FieldHistoryRow {
                golden_id: golden_id.clone(),
                field: field.clone(),
                value: value.clone(),
                source_record_id: provenance
                    .map(|p| p.record_id.clone())
                    .unwrap_or_default(),
                source_system: provenance
                    .map(|p| p.source_id.clone())
                    .unwrap_or_default(),
                observed_at: now,
                event_seq: seq,
            })?;
        }

        store.commit()?;
        Ok(event_type)
    }

    /// Split every existing golden record (full rebuild): close member
    /// xrefs and retire the golden rows, one SPLIT event per golden.
    fn split_all(&self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        let now = Utc::now();
        let mut golden_ids = ctx.store.golden_ids();
        golden_ids.sort();
        for golden_id in golden_ids {
            ctx.cancellation.check()?;
            let members: Vec<String> = ctx
                .store
                .current_members(&golden_id)
                .into_iter()
                .map(|x| x.source_record_id)
                .collect();
            let scope_goldens = vec![golden_id.clone()];
            let before = ctx.store.snapshot_for(&scope_goldens, &members);

            ctx.store.begin()?;
            ctx.store.retire_golden(&golden_id)?;
            for xref in ctx.store.current_members(&golden_id) {
                ctx.store
                    .close_xref(&xref.source_record_id, &xref.source_system, now)?;
            }
            let after = ctx.store.preview_snapshot_for(&scope_goldens, &members);
            ctx.store.append_event(MergeEventRow {
                event_id: Uuid::new_v4().to_string(),
                seq: 0,
                event_type: EventType::Split,
                timestamp: now,
                actor: ctx.actor.clone(),
                affected_golden_ids: scope_goldens,
                affected_record_ids: members,
                before_state: serde_json::to_value(&before)?,
                after_state: serde_json::to_value(&after)?,
                rolled_back: false,
            })?;
            ctx.store.commit()?;
        }
        Ok(())
    }
}

fn delta_members(delta: &ClusterDelta) -> &[String] {
    match delta {
        ClusterDelta::Create { members }
        | ClusterDelta::Unchanged { members, .. }
        | ClusterDelta::Update { members, .. }
        | ClusterDelta::Merge { members, .. } => members,
    }
}

/// Coarse stage budget: checked at stage boundaries, failing with a
/// retryable timeout so committed progress survives.
struct StageClock {
    started: Instant,
    budget: Option<Duration>,
}

impl StageClock {
    fn new(timeout_secs: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            budget: timeout_secs.map(Duration::from_secs),
        }
    }

    fn check(&self, stage: &str) -> Result<()> {
        if let Some(budget) = self.budget {
            if self.started.elapsed() > budget {
                return Err(MdmError::StageTimeout {
                    stage: stage.to_string(),
                    timeout_secs: budget.as_secs(),
                });
            }
        }
        Ok(())
    }
}
