use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use mdm_engine::config::MdmConfig;
use mdm_engine::embed::NoEmbeddings;
use mdm_engine::error::MdmError;
use mdm_engine::ingest::{JsonlDeadLetter, RecordStore, VecBatchSource};
use mdm_engine::lineage::MemoryLineageStore;
use mdm_engine::metrics::NoopMetrics;
use mdm_engine::model::schema::{EntityDescriptor, SchemaRegistry};
use mdm_engine::pipeline::{CancellationToken, Pipeline, PipelineContext, PipelineOutcome};
use mdm_engine::preprocess::Preprocessor;
use mdm_engine::survivor::Survivor;

#[derive(Parser)]
#[command(name = "mdm-engine")]
#[command(about = "Master Data Management engine: entity resolution, survivorship, lineage")]
#[command(version)]
struct Args {
    /// State directory (config.json, schema.json, store.json, dead_letter.jsonl)
    #[arg(short, long, default_value = "mdm-state")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a state directory with a sample configuration and schema
    Init,
    /// Process one batch incrementally against the current state
    ProcessBatch {
        /// JSON file with an array of records
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Split all golden records and rebuild from the full record store
    Rebuild {
        /// Optional JSON file with additional records to ingest first
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Roll back the event log to (and including) the given event
    Rollback {
        #[arg(long = "to-event")]
        to_event: String,
    },
    /// Show a golden record with its xrefs and events
    Inspect {
        #[arg(long = "golden-id")]
        golden_id: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(args: &Args) -> Result<(), MdmError> {
    match &args.command {
        Commands::Init => init(&args.state_dir),
        Commands::ProcessBatch { input } => process(&args.state_dir, Some(input.as_path()), false),
        Commands::Rebuild { input } => process(&args.state_dir, input.as_deref(), true),
        Commands::Rollback { to_event } => rollback(&args.state_dir, to_event),
        Commands::Inspect { golden_id } => inspect(&args.state_dir, golden_id),
    }
}

fn init(state_dir: &Path) -> Result<(), MdmError> {
    std::fs::create_dir_all(state_dir)?;
    let config_path = state_dir.join("config.json");
    if !config_path.exists() {
        std::fs::write(config_path, SAMPLE_CONFIG.trim_start())?;
    }
    let schema_path = state_dir.join("schema.json");
    if !schema_path.exists() {
        std::fs::write(schema_path, SAMPLE_SCHEMA.trim_start())?;
    }
    info!(state_dir = %state_dir.display(), "state directory initialized");
    Ok(())
}

struct State {
    config: Arc<MdmConfig>,
    schema: Arc<SchemaRegistry>,
    store: MemoryLineageStore,
    records: RecordStore,
}

fn load_state(state_dir: &Path) -> Result<State, MdmError> {
    let config = Arc::new(MdmConfig::from_file(&state_dir.join("config.json"))?);

    let schema_raw = std::fs::read_to_string(state_dir.join("schema.json"))?;
    let entities: Vec<EntityDescriptor> = serde_json::from_str(&schema_raw)
        .map_err(|e| MdmError::Configuration(format!("schema.json: {e}")))?;
    let mut schema = SchemaRegistry::new();
    for entity in entities {
        schema.register_entity(entity);
    }

    let store_path = state_dir.join("store.json");
    let (store, records) = if store_path.exists() {
        let raw = std::fs::read_to_string(&store_path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let store = MemoryLineageStore::from_json(value["lineage"].clone())?;
        let records: RecordStore = serde_json::from_value(value["records"].clone())?;
        (store, records)
    } else {
        (MemoryLineageStore::new(), RecordStore::new())
    };

    Ok(State {
        config,
        schema: Arc::new(schema),
        store,
        records,
    })
}

fn save_state(state_dir: &Path, state: &State) -> Result<(), MdmError> {
    let value = serde_json::json!({
        "lineage": state.store.to_json()?,
        "records": serde_json::to_value(&state.records)?,
    });
    let tmp = state_dir.join("store.json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&value)?)?;
    std::fs::rename(tmp, state_dir.join("store.json"))?;
    Ok(())
}

fn process(state_dir: &Path, input: Option<&Path>, rebuild: bool) -> Result<(), MdmError> {
    let mut state = load_state(state_dir)?;
    let pipeline = Pipeline::new(
        state.config.clone(),
        state.schema.clone(),
        Preprocessor::default(),
        Survivor::new(state.config.clone()),
    )?;

    let dead_letter = JsonlDeadLetter::open(&state_dir.join("dead_letter.jsonl"))
        .map_err(|e| MdmError::Data(e.to_string()))?;
    let metrics = NoopMetrics;
    let embedder = NoEmbeddings;

    let mut source = match input {
        Some(path) => VecBatchSource::from_file(path, state.config.batch_size)
            .map_err(|e| MdmError::Data(e.to_string()))?,
        None => VecBatchSource::new(Vec::new(), state.config.batch_size),
    };

    let outcome = {
        let mut ctx = PipelineContext {
            store: &state.store,
            records: &mut state.records,
            dead_letter: &dead_letter,
            metrics: &metrics,
            embedder: &embedder,
            cancellation: CancellationToken::new(),
            actor: "cli".to_string(),
        };
        if rebuild {
            pipeline.rebuild(&mut source, &mut ctx)?
        } else {
            pipeline.process_batch(&mut source, &mut ctx)?
        }
    };

    save_state(state_dir, &state)?;
    print_summary(&outcome);

    if !outcome.requeued_clusters.is_empty() {
        return Err(MdmError::Data(format!(
            "{} cluster(s) re-queued after persistent lineage conflicts",
            outcome.requeued_clusters.len()
        )));
    }
    Ok(())
}

fn print_summary(outcome: &PipelineOutcome) {
    let stats = &outcome.stats;
    println!("records ingested:     {}", stats.records_ingested);
    println!("records dead-lettered: {}", stats.records_dead_lettered);
    println!("pairs generated:      {}", stats.pairs_generated);
    println!("pairs evaluated:      {}", stats.pairs_evaluated);
    println!(
        "verdicts:             {} match / {} review / {} no-match",
        stats.matches, stats.reviews, stats.non_matches
    );
    println!("match rate:           {:.3}", stats.match_rate());
    println!("mean score:           {:.3}", stats.mean_match_score);
    println!("clusters:             {}", stats.clusters);
    println!(
        "golden records:       {} created / {} updated / {} merged",
        stats.golden_created, stats.golden_updated, stats.golden_merged
    );
    if !outcome.review.is_empty() {
        println!("review queue:         {} pair(s)", outcome.review.len());
    }
}

fn rollback(state_dir: &Path, event_id: &str) -> Result<(), MdmError> {
    let state = load_state(state_dir)?;
    let undone = state.store.rollback_to_event(event_id)?;
    save_state(state_dir, &state)?;
    println!("rolled back {undone} event(s)");
    Ok(())
}

fn inspect(state_dir: &Path, golden_id: &str) -> Result<(), MdmError> {
    let state = load_state(state_dir)?;
    let golden = state
        .store
        .golden(golden_id)
        .ok_or_else(|| MdmError::UnknownGolden(golden_id.to_string()))?;
    let xrefs = state.store.current_members(golden_id);
    let events: Vec<_> = state
        .store
        .events()
        .into_iter()
        .filter(|e| e.affected_golden_ids.iter().any(|id| id == golden_id))
        .collect();

    let report = serde_json::json!({
        "golden": golden,
        "xrefs": xrefs,
        "events": events,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"
{
  "profile_id": "customer-dedup",
  "entity_type": "customer",
  "sources": {
    "CRM": {"reliability": 0.9},
    "ERP": {"reliability": 0.8},
    "LEGACY": {"reliability": 0.5}
  },
  "fields": {
    "name": {
      "comparator": {"type": "fuzzy", "method": "jaro_winkler"},
      "weight": 0.5,
      "preprocessors": ["strip", "collapse_whitespace", "lower"]
    },
    "phone": {
      "comparator": {"type": "exact"},
      "weight": 0.5,
      "null_policy": "skip",
      "preprocessors": ["normalize_phone"]
    }
  },
  "blocking": {
    "strategy": "standard",
    "keys": [{"field": "name", "prefix_len": 3}],
    "max_block_size": 1000
  },
  "thresholds": {"match": 0.85, "review": 0.65, "transitivity_guard_enabled": false},
  "trust": {
    "component_weights": {"source": 0.4, "completeness": 0.3, "timeliness": 0.15, "validity": 0.15},
    "half_life_days": 365.0
  },
  "survivorship": {
    "fields": {
      "name": {"strategy": "trusted_source_priority", "sources": ["CRM", "ERP"]}
    },
    "default_strategy": {"strategy": "most_trusted"}
  }
}
"#;

const SAMPLE_SCHEMA: &str = r#"
[
  {
    "name": "customer",
    "fields": [
      {"name": "name", "data_type": "text", "required": true, "importance": 2.0},
      {"name": "phone", "data_type": "text", "required": false},
      {
        "name": "email",
        "data_type": "text",
        "required": false,
        "validation": [{"pattern": {"pattern": "^[^@\\s]+@[^@\\s]+\\.[^@\\s]+$"}}]
      }
    ],
    "relationships": []
  }
]
"#;
