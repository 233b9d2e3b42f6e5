//! polyeval CLI - cross-lingual LLM evaluation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polyeval::{
    ApiBackend, BackendKind, BackendRegistry, Config, CorrectnessLabel, EntryStore, EvaluationRun,
    ResultType, RunReport, load_keywords, unmatched_keyword_ids,
};
use std::path::{Path, PathBuf};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "polyeval")]
#[command(version)]
#[command(about = "Cross-lingual LLM evaluation: preferences, chain-of-thought verdicts, perplexity")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation; results already on disk are skipped
    Run {
        /// Override run.result_type
        #[arg(short, long)]
        result_type: Option<ResultType>,

        /// Override run.lang1
        #[arg(long)]
        lang1: Option<String>,

        /// Override run.lang2
        #[arg(long)]
        lang2: Option<String>,

        /// Keep only the first N entries of every dataset file
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Validate configuration, datasets and API access
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn print_example_config() {
    let example = r#"# polyeval configuration file

[model]
id = "Qwen/Qwen3-8B"
backend = "vllm"          # api | huggingface | vllm
device = "cuda:0,1"
parallelism = 2
# family = "qwen3"        # qwen3 | llama3 | granite4 | api_chat (detected from id)

[api]
# api_key = "${OPENAI_API_KEY}"
api_key_env = "OPENAI_API_KEY"
base_url = "https://api.openai.com/v1"
timeout_secs = 180
max_retries = 3
concurrency = 16
input_price_per_1m = 1.25
output_price_per_1m = 10.0

[local]
host = "127.0.0.1"
base_port = 8100
startup_timeout_secs = 900
request_timeout_secs = 600
tgi_launcher = "text-generation-launcher"
vllm_launcher = "vllm"
extra_args = []
# base_url = "http://127.0.0.1:8000"   # use a running server instead of launching one

[batching]
# batch_size = 8          # discovered from the backend when omitted
discovery_start = 1
discovery_max = 64
capacity_retries = 2
flush_every_batches = 1

[run]
result_type = "preference_cot"   # preference_direct | preference_cot | perplexity | response
lang1 = "en"
lang2 = "sw"
data_dir = "judge/datasets"
result_dir = "judge/result"
# sample_limit = 100
# task_timeout_secs = 600
cot_max_new_tokens = 2048
response_max_new_tokens = 512
# keywords_file = "judge/datasets/keywords_sw.jsonl"
"#;
    println!("{example}");
}

fn print_report(report: &RunReport, config: &Config) {
    println!("\n=== Evaluation Complete ===");
    println!("Model:       {}", report.model);
    if let Some(result_type) = report.result_type {
        println!("Result type: {result_type}");
    }
    for group in &report.groups {
        println!(
            "  {:<32} {:>5} total, {:>5} done before, {:>5} succeeded, {:>5} failed",
            group.suffix, group.total, group.already_done, group.succeeded, group.failed
        );
        if !group.failure_sample.is_empty() {
            println!("    failed: {}", group.failure_sample.join(", "));
        }
    }
    if !report.skipped_groups.is_empty() {
        println!("Skipped:     {}", report.skipped_groups.join(", "));
    }
    println!("Succeeded:   {}", report.total_succeeded());
    println!("Failed:      {}", report.total_failed());
    println!("Throughput:  {:.0}/hr", report.throughput_per_hour);
    println!("Cost:        ${:.4}", report.total_cost_usd());
    println!("Runtime:     {:.1}s", report.runtime_secs);
    println!("Output:      {:?}", config.run.result_dir);
}

async fn validate(config: &Config) -> Result<()> {
    info!("Configuration is valid");
    info!("  Model: {} ({})", config.model.id, config.backend_key());
    info!("  Family: {}", config.model_family()?);
    info!(
        "  Run: {} over {} / {}",
        config.run.result_type, config.run.lang1, config.run.lang2
    );

    if config.model.backend == BackendKind::Api {
        let api_key = config
            .resolve_api_key()
            .context("Failed to resolve API key")?;
        let backend = ApiBackend::new(config.backend_key(), &config.api, api_key)?;
        let health = backend.client().health_check().await;
        match health.error {
            None => info!("  API: {} ({}ms)", health.status, health.latency_ms.unwrap_or(0)),
            Some(error) => warn!("  API: {} - {error}", health.status),
        }
    }

    let store = EntryStore::new(&config.run.data_dir);
    let mut entries = Vec::new();
    for lang in [&config.run.lang1, &config.run.lang2] {
        for label in [CorrectnessLabel::Correct, CorrectnessLabel::Incorrect] {
            let path = store.path_for(lang, label);
            match store.load(lang, label, config.run.sample_limit) {
                Ok(loaded) => {
                    info!("  {}: {} entries", path.display(), loaded.len());
                    entries.extend(loaded);
                }
                Err(e) => warn!("  {}: {e}", path.display()),
            }
        }
    }

    if let Some(keywords_file) = &config.run.keywords_file {
        let index = load_keywords(keywords_file)
            .with_context(|| format!("Failed to load keywords from {keywords_file:?}"))?;
        let unmatched = unmatched_keyword_ids(&index, &entries);
        if unmatched.is_empty() {
            info!("  Keywords: all {} ids match entries", index.len());
        } else {
            warn!(
                "  Keywords: {} of {} ids match no entry (e.g. {})",
                unmatched.len(),
                index.len(),
                unmatched.iter().take(5).cloned().collect::<Vec<_>>().join(", ")
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            validate(&config).await?;
        }

        Commands::Run {
            result_type,
            lang1,
            lang2,
            limit,
        } => {
            let mut config = load_config(&cli.config)?;

            // Override run settings from CLI
            if let Some(result_type) = result_type {
                config.run.result_type = result_type;
            }
            if let Some(lang1) = lang1 {
                config.run.lang1 = lang1;
            }
            if let Some(lang2) = lang2 {
                config.run.lang2 = lang2;
            }
            if limit.is_some() {
                config.run.sample_limit = limit;
            }
            config.validate().context("Invalid configuration after overrides")?;

            let registry = BackendRegistry::from_config(&config);
            let run = EvaluationRun::new(&config, &registry);
            let outcome = tokio::select! {
                report = run.execute() => Some(report),
                _ = tokio::signal::ctrl_c() => None,
            };

            let released = registry.shutdown_all().await;
            info!(backends = released, "Backends shut down");

            match outcome {
                Some(report) => print_report(&report?, &config),
                None => {
                    warn!("Interrupted; completed batches are saved, rerun to resume");
                    std::process::exit(130);
                }
            }
        }
    }

    Ok(())
}
