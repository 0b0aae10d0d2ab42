#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ensemble_harness::cache::{MemoryStageCache, SqliteStageCache, StageCache};
use ensemble_harness::config::EnsembleConfig;
use ensemble_harness::gateway::{JsonlUsageSink, TracingUsageSink, UsageSink, UsageWorker};
use ensemble_harness::pipeline::{PipelineResult, Request};
use ensemble_harness::StageKind;

#[derive(Parser)]
#[command(name = "ensemble", version, about = "Multi-model generation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a prompt through a pattern
    Run {
        /// Config file (defaults to $ENSEMBLE_CONFIG or ./ensemble.json)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, conflicts_with = "prompt_file")]
        prompt: Option<String>,
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        /// Comma-separated model ids (defaults to every enabled model)
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
        #[arg(long, default_value = "standard")]
        pattern: String,
        /// Override the synthesis model for this run
        #[arg(long)]
        synthesizer: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Per-call timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Write the full result JSON here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// SQLite stage cache (defaults to the config's cache.sqlite_path, else in-memory)
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Append one JSON line per provider attempt
        #[arg(long)]
        usage_log: Option<PathBuf>,
    },
    /// List enabled models in priority order
    Models {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List patterns and their stages
    Patterns {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Prune SQLite cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// Export SQLite cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<EnsembleConfig, Box<dyn std::error::Error>> {
    let path = path.unwrap_or_else(EnsembleConfig::default_path);
    Ok(EnsembleConfig::from_path(&path)?)
}

fn read_prompt(
    prompt: Option<String>,
    prompt_file: Option<PathBuf>,
) -> Result<String, Box<dyn std::error::Error>> {
    match (prompt, prompt_file) {
        (Some(p), _) => Ok(p),
        (None, Some(path)) => Ok(std::fs::read_to_string(path)?),
        (None, None) => Err("run requires --prompt or --prompt-file".into()),
    }
}

fn write_json(path: &Path, value: &PipelineResult) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            prompt,
            prompt_file,
            models,
            pattern,
            synthesizer,
            temperature,
            max_tokens,
            timeout_secs,
            out,
            cache,
            usage_log,
        } => {
            let config = load_config(config)?;
            let prompt = read_prompt(prompt, prompt_file)?;

            let stage_cache: Arc<dyn StageCache> =
                match cache.or_else(|| config.cache.sqlite_path.clone()) {
                    Some(path) => Arc::new(SqliteStageCache::new(path)?),
                    None => Arc::new(MemoryStageCache::new(config.cache.max_entries)),
                };
            let (usage_sink, usage_worker): (Arc<dyn UsageSink>, Option<UsageWorker>) =
                match usage_log {
                    Some(path) => {
                        let (sink, worker) = JsonlUsageSink::new(path)?;
                        (Arc::new(sink), Some(worker))
                    }
                    None => (Arc::new(TracingUsageSink), None),
                };

            let orchestrator = config
                .orchestrator(config.adapters()?)?
                .cache(stage_cache, config.cache.ttl())
                .usage_sink(usage_sink)
                .build()?;

            let models = if models.is_empty() {
                orchestrator
                    .registry()
                    .list_enabled()
                    .iter()
                    .map(|m| m.id.clone())
                    .collect()
            } else {
                models
            };
            let mut request = Request::new(prompt, models, pattern);
            if let Some(t) = temperature {
                request = request.temperature(t);
            }
            if let Some(n) = max_tokens {
                request = request.max_tokens(n);
            }
            if let Some(secs) = timeout_secs {
                request = request.timeout(Duration::from_secs(secs));
            }
            if let Some(id) = synthesizer {
                request = request.synthesizer(id);
            }

            let result = orchestrator.run(request).await?;
            drop(orchestrator);
            if let Some(worker) = usage_worker {
                worker.join()?;
            }

            eprintln!(
                "status: {:?}; stages: {}; cached: {}; {} ms",
                result.status,
                result
                    .stages
                    .iter()
                    .map(|s| format!("{}={}/{}", s.stage, s.success_count(), s.responses.len()))
                    .collect::<Vec<_>>()
                    .join(" "),
                result
                    .cache_hits
                    .iter()
                    .map(StageKind::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
                result.total_latency_ms
            );

            match &out {
                Some(path) => {
                    write_json(path, &result)?;
                    if let Some(text) = result.selected_text() {
                        println!("{text}");
                    }
                }
                None => println!("{}", serde_json::to_string_pretty(&result)?),
            }

            if result.selected_response.is_none() {
                return Err("pipeline produced no usable response".into());
            }
        }
        Commands::Models { config } => {
            let config = load_config(config)?;
            let registry = config.registry()?;
            for model in registry.list_enabled() {
                println!(
                    "{}\t{}\tpriority={}\trpm={}\tmeta={}\t{}",
                    model.id,
                    model.family,
                    model.priority,
                    model.rate_limit_per_minute,
                    model.meta_capable,
                    model.display_name()
                );
            }
        }
        Commands::Patterns { config } => {
            let config = load_config(config)?;
            let templates = config.templates()?;
            for pattern in templates.patterns() {
                let stages: Vec<&str> = pattern.stages.iter().map(StageKind::as_str).collect();
                println!("{}\t{}", pattern.key, stages.join(" -> "));
            }
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteStageCache::default_path);
            let cache = SqliteStageCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteStageCache::default_path);
            let cache = SqliteStageCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let rows = cache.export_jsonl(out).await?;
            println!("exported {rows} rows");
        }
    }

    Ok(())
}
