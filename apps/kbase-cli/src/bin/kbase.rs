//! `kbase`: operator CLI for the retrieval and coverage engine.
//!
//! ```bash
//! kbase ingest chunks.jsonl
//! kbase search "rain barrel overflow" --hybrid --top-k 5 --filter lang=en
//! kbase assess "water storage" "seed saving"
//! kbase sync
//! kbase status
//! ```
//!
//! Reports go to stdout as JSON; logs and progress go to stderr
//! (`RUST_LOG` controls verbosity, default `info`).
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use serde_json::json;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use kbase_cli::ingest::{ingest, read_records};
use kbase_cli::Engine;
use kbase_core::config::Config;
use kbase_core::{Meta, VectorStore};

#[derive(Parser)]
#[command(name = "kbase", version, about = "Hybrid retrieval, coverage assessment and offline sync for a local knowledge base")]
struct Cli {
    /// Directory holding `config.toml` and `config.<env>.toml`.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search the knowledge base.
    Search {
        text: String,
        /// Fuse keyword and vector scores.
        #[arg(long)]
        hybrid: bool,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long, default_value_t = 0.0)]
        threshold: f32,
        /// Exact-match metadata filter, repeatable.
        #[arg(long = "filter", value_name = "KEY=VALUE", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Report which knowledge areas are missing or weakly covered.
    Assess {
        #[arg(required = true)]
        areas: Vec<String>,
    },
    /// Replicate Primary into Fallback.
    Sync,
    /// Show online/degraded mode, sync history and store sizes.
    Status,
    /// Load pre-chunked JSON lines (`{"id", "content", "metadata"}`) into Primary.
    Ingest {
        file: PathBuf,
        #[arg(long, default_value_t = 256)]
        batch_size: usize,
    },
}

fn parse_filter(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn spinner(msg: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_message(msg);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Config::load_from(&cli.config_dir)?.settings().context("loading configuration")?;
    let engine = Engine::open(settings).await.context("opening engine")?;

    match cli.command {
        Command::Search { text, hybrid, top_k, threshold, filters } => {
            let filters: Meta = filters.into_iter().collect();
            let query = engine.query(&text, hybrid, top_k, threshold, filters)?;
            let results = engine.searcher.search(&query).await?;
            print_json(&results)?;
        }
        Command::Assess { areas } => {
            let pb = spinner("assessing coverage");
            let report = engine.assessor().assess(&areas, &engine.settings.coverage).await;
            pb.finish_and_clear();
            print_json(&report?)?;
        }
        Command::Sync => {
            let pb = spinner("syncing primary into fallback");
            let result = engine.sync.sync().await;
            pb.finish_and_clear();
            print_json(&result)?;
            if !result.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Status => {
            let mode = engine.sync.current_mode().await;
            let primary_rows = engine.primary.count().await.ok();
            let fallback_rows = engine.fallback.count().await.ok();
            print_json(&json!({
                "mode": mode,
                "sync": engine.sync.state(),
                "primary_rows": primary_rows,
                "fallback_rows": fallback_rows,
                "embedding_model": engine.cache.model_id(),
                "cache": engine.cache.stats(),
            }))?;
        }
        Command::Ingest { file, batch_size } => {
            let reader = BufReader::new(File::open(&file).with_context(|| format!("opening {}", file.display()))?);
            let records = read_records(reader)?;
            tracing::info!(records = records.len(), file = %file.display(), "ingesting");
            let inserted = ingest(&engine.cache, engine.primary.as_ref(), records, batch_size).await?;
            print_json(&json!({ "inserted": inserted, "cache": engine.cache.stats() }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
