//! # RAG Harness CLI (`rag`)
//!
//! The `rag` binary is the primary interface for RAG Harness. It provides
//! commands for database initialization, document management, question
//! answering, preset and provider management, trace inspection, and
//! starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and run schema migrations |
//! | `rag add <path>` | Add a file or directory of `.md`/`.txt` documents |
//! | `rag docs` | List stored documents |
//! | `rag remove <id>` | Delete a document and its chunks |
//! | `rag ask "<question>"` | Answer a question through the pipeline |
//! | `rag preset [name]` | List presets, or apply one |
//! | `rag providers` | Probe local model runtimes |
//! | `rag traces` | Show recent query traces |
//! | `rag eval <name> <file>` | Run a question file and aggregate metrics |
//! | `rag serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! rag init --config ./config/rag.toml
//!
//! # Ingest a docs directory
//! rag add ./docs --config ./config/rag.toml
//!
//! # Ask a question
//! rag ask "How does the billing retry work?" --config ./config/rag.toml
//!
//! # Switch to the thorough preset
//! rag preset thorough --config ./config/rag.toml
//!
//! # Start the HTTP server
//! rag serve --config ./config/rag.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rag_harness::config::{self, Config};
use rag_harness::db;
use rag_harness::migrate;
use rag_harness::models::StepDetails;
use rag_harness::pipeline::Pipeline;
use rag_harness::provider::discover_local_providers;
use rag_harness::server;
use rag_harness::settings::{all_presets, SettingsStore};
use rag_harness::store::SqliteStore;
use rag_harness::trace::TraceRecorder;

/// RAG Harness CLI — a local-first retrieval-augmented question answering
/// pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "RAG Harness — a local-first retrieval-augmented question answering pipeline",
    version,
    long_about = "RAG Harness answers questions over a local document store. Every query runs a \
    three-stage pipeline (plan, retrieve, generate) against SQLite-backed hybrid retrieval \
    (FTS5 keyword + vector similarity), works with or without a local model runtime, and \
    records a full per-step trace for inspection."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rag.toml`. Database, chunking, embedding,
    /// provider, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, chunk_vectors, chunks_fts, traces).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Add documents from a file or directory.
    ///
    /// A single file is stored as one document titled by its file name.
    /// A directory is walked recursively and every `.md` and `.txt` file
    /// is stored as a document.
    Add {
        /// File or directory to ingest.
        path: PathBuf,
    },

    /// List stored documents with their chunk counts.
    Docs,

    /// Delete a document and all of its chunks.
    Remove {
        /// Document id (as shown by `rag docs`).
        id: String,
    },

    /// Answer a question through the full pipeline.
    ///
    /// Prints the answer, the evidence sources, the per-step timings, and
    /// the trace id. Works without any model runtime configured: the
    /// pipeline degrades to deterministic fallback answers.
    Ask {
        /// The question to answer.
        question: String,

        /// Print the full result as JSON instead of formatted text.
        #[arg(long)]
        json: bool,
    },

    /// List retrieval presets, or apply one by name.
    ///
    /// Presets (`fast`, `balanced`, `thorough`) are complete retrieval
    /// parameter sets; applying one replaces the active configuration.
    Preset {
        /// Preset name to apply. Omit to list all presets.
        name: Option<String>,
    },

    /// Probe local model runtimes (Ollama, LM Studio).
    ///
    /// Shows which runtimes are reachable, their available and loaded
    /// models, and their versions. Unreachable runtimes are listed with
    /// the probe error.
    Providers,

    /// Show recent query traces, newest first.
    Traces {
        /// Maximum number of traces to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Delete all but the newest N traces before listing.
        #[arg(long)]
        prune: Option<usize>,
    },

    /// Run a question file through the pipeline and aggregate metrics.
    ///
    /// The file holds one question per line; blank lines are skipped.
    /// Each question records its own trace.
    Eval {
        /// Name for the evaluation run.
        name: String,

        /// Path to the question file.
        questions: PathBuf,
    },

    /// Start the HTTP server.
    ///
    /// Exposes the pipeline, document management, settings, and traces
    /// via a JSON API. See the server module docs for the endpoint table.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rag_harness=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Initialized database at {}", cfg.db.path.display());
        }
        Commands::Add { path } => {
            let (store, _) = open_store(&cfg).await?;
            let added = add_path(&store, &cfg, &path).await?;
            println!("Added {} document(s)", added);
        }
        Commands::Docs => {
            let (store, _) = open_store(&cfg).await?;
            let docs = store.list_documents().await?;
            if docs.is_empty() {
                println!("No documents stored.");
            }
            for (id, title, chunk_count) in docs {
                println!("{}  {} ({} chunks)", id, title, chunk_count);
            }
        }
        Commands::Remove { id } => {
            let (store, _) = open_store(&cfg).await?;
            store.delete_document(&id).await?;
            println!("Deleted document {}", id);
        }
        Commands::Ask { question, json } => {
            let pipeline = open_pipeline(&cfg).await?;
            let result = pipeline.ask(&question).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
        }
        Commands::Preset { name } => {
            let settings = SettingsStore::open(&cfg.settings_path())?;
            match name {
                Some(name) => {
                    let applied = settings.apply_preset(&name)?;
                    println!(
                        "Applied preset '{}': top_n={}, target_tokens={}, coverage_target={}",
                        name,
                        applied.retrieval.top_n,
                        applied.retrieval.target_tokens,
                        applied.retrieval.coverage_target
                    );
                }
                None => {
                    let active = settings.snapshot().retrieval;
                    for (name, preset) in all_presets() {
                        let marker = if preset == active { "*" } else { " " };
                        println!(
                            "{} {:<9} dense_k={:<3} sparse_k={:<3} top_n={:<3} target_tokens={:<5} coverage={}",
                            marker,
                            name,
                            preset.dense_k,
                            preset.sparse_k,
                            preset.top_n,
                            preset.target_tokens,
                            preset.coverage_target
                        );
                    }
                }
            }
        }
        Commands::Providers => {
            let infos = discover_local_providers(&cfg.providers).await;
            for info in infos {
                match info.status.as_str() {
                    "ok" => {
                        println!(
                            "{} at {} — {} model(s), {} loaded{}",
                            info.name,
                            info.base_url,
                            info.models.len(),
                            info.running.len(),
                            info.version
                                .map(|v| format!(", version {}", v))
                                .unwrap_or_default()
                        );
                        for model in info.models {
                            println!("  {}", model);
                        }
                    }
                    _ => println!(
                        "{} at {} — unreachable ({})",
                        info.name,
                        info.base_url,
                        info.error_message.unwrap_or_default()
                    ),
                }
            }
        }
        Commands::Traces { limit, prune } => {
            let pipeline = open_pipeline(&cfg).await?;
            if let Some(keep) = prune {
                let removed = pipeline.traces().prune(keep).await?;
                println!("Pruned {} trace(s)", removed);
            }
            let traces = pipeline.traces().list(limit).await?;
            if traces.is_empty() {
                println!("No traces recorded.");
            }
            for trace in traces {
                println!(
                    "{}  {}  coverage={:.2} tokens={} chunks={}  {}",
                    trace.id,
                    trace.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    trace.metrics.coverage,
                    trace.metrics.tokens,
                    trace.metrics.chunk_count,
                    truncate(&trace.prompt, 60)
                );
            }
        }
        Commands::Eval { name, questions } => {
            let text = std::fs::read_to_string(&questions)
                .with_context(|| format!("Failed to read question file: {}", questions.display()))?;
            let questions: Vec<String> = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            let pipeline = open_pipeline(&cfg).await?;
            let report = pipeline.evaluate(&name, &questions).await?;
            println!(
                "Evaluation '{}': {} question(s), avg coverage {:.2}, avg tokens {:.0}",
                report.name,
                report.results.len(),
                report.average_coverage,
                report.average_tokens
            );
            for result in &report.results {
                let question = result
                    .steps
                    .first()
                    .map(|s| match &s.details {
                        StepDetails::Planning { sub_queries, .. } => {
                            sub_queries.first().cloned().unwrap_or_default()
                        }
                        _ => String::new(),
                    })
                    .unwrap_or_default();
                println!(
                    "  coverage={:.2} tokens={:<5} fallback={}  {}",
                    result.metrics.coverage,
                    result.metrics.tokens,
                    result.fallback,
                    truncate(&question, 60)
                );
            }
        }
        Commands::Serve => {
            let (store, pool) = open_store(&cfg).await?;
            let store = Arc::new(store);
            let settings = Arc::new(SettingsStore::open(&cfg.settings_path())?);
            let pipeline = Arc::new(Pipeline::new(
                store.clone(),
                settings.clone(),
                TraceRecorder::new(pool),
                cfg.providers.clone(),
            ));
            server::run_server(&cfg, store, settings, pipeline).await?;
        }
    }

    Ok(())
}

/// Connect, migrate, and build the SQLite store.
async fn open_store(cfg: &Config) -> Result<(SqliteStore, sqlx::SqlitePool)> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;
    Ok((
        SqliteStore::new(pool.clone(), cfg.embedding.clone()),
        pool,
    ))
}

/// Assemble the full pipeline for one-shot CLI commands.
async fn open_pipeline(cfg: &Config) -> Result<Pipeline> {
    let (store, pool) = open_store(cfg).await?;
    let settings = Arc::new(SettingsStore::open(&cfg.settings_path())?);
    Ok(Pipeline::new(
        Arc::new(store),
        settings,
        TraceRecorder::new(pool),
        cfg.providers.clone(),
    ))
}

/// Ingest one file or a directory tree of `.md`/`.txt` files.
async fn add_path(store: &SqliteStore, cfg: &Config, path: &Path) -> Result<usize> {
    if path.is_file() {
        add_file(store, cfg, path).await?;
        return Ok(1);
    }
    if !path.is_dir() {
        bail!("path not found: {}", path.display());
    }

    let mut added = 0;
    for entry in walkdir::WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        if ext == "md" || ext == "txt" {
            add_file(store, cfg, entry.path()).await?;
            added += 1;
        }
    }
    if added == 0 {
        bail!("no .md or .txt files found under {}", path.display());
    }
    Ok(added)
}

async fn add_file(store: &SqliteStore, cfg: &Config, path: &Path) -> Result<()> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string();
    let (id, chunk_count) = store
        .add_document(&title, &body, cfg.chunking.max_tokens)
        .await?;
    println!("  {} — {} ({} chunks)", id, title, chunk_count);
    Ok(())
}

fn print_result(result: &rag_harness::models::QueryResult) {
    println!("{}", result.answer);
    println!();
    if !result.evidence.is_empty() {
        println!("Sources:");
        for chunk in &result.evidence {
            println!("  [{:.3}] {} — {}", chunk.score, chunk.title, truncate(&chunk.text, 70));
        }
        println!();
    }
    for step in &result.steps {
        println!(
            "  {:<10} {:>8.1}ms  {:?}",
            step.details.name(),
            step.duration_ms,
            step.status
        );
    }
    println!(
        "\ntrace {}  coverage={:.2} tokens={} total={:.1}ms{}",
        result.trace_id,
        result.metrics.coverage,
        result.metrics.tokens,
        result.metrics.duration_ms,
        if result.fallback { "  (fallback)" } else { "" }
    );
}

fn truncate(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.len() <= max {
        flat
    } else {
        let mut cut = max;
        while cut > 0 && !flat.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &flat[..cut])
    }
}
