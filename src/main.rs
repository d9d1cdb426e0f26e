//! # Medical knowledge store CLI (`medctx`)
//!
//! The `medctx` binary installs and queries the offline medical knowledge
//! store: it downloads and validates the database artifact, runs vector
//! searches against it, and prints the citation-ready context a language
//! model would receive.
//!
//! ## Usage
//!
//! ```bash
//! medctx --config ./config/medctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `medctx init` | Create an empty local store with the expected schema |
//! | `medctx status` | Validate the local artifact and report the lifecycle state |
//! | `medctx download` | Download (or resume downloading) the artifact |
//! | `medctx remove` | Delete the local artifact and any partial download |
//! | `medctx search "<query>"` | Vector search over documents and Q&A pairs |
//! | `medctx context "<query>"` | Print the assembled RAG context and sources |
//!
//! ## Examples
//!
//! ```bash
//! # Fetch the knowledge base, with JSON progress on stderr
//! medctx download --progress json
//!
//! # Throw away the local copy and fetch it again from zero
//! medctx download --reset
//!
//! # Search cardiology documents from 2021
//! medctx search "beta blockers after infarction" --specialty cardiology --year 2021
//!
//! # Inspect the context block for a question
//! medctx context "first-line treatment for type 2 diabetes" --json
//! ```

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use medcontext::config::{self, Config};
use medcontext::embed_gate::EmbeddingGate;
use medcontext::embedding;
use medcontext::lifecycle::{LifecycleController, LifecycleState};
use medcontext::logging;
use medcontext::migrate;
use medcontext::models::{RecordKind, SearchFilters, VectorRecord};
use medcontext::progress::{DownloadEvent, ProgressMode};
use medcontext::rag::{RagPipeline, RagSettings};
use medcontext::search::VectorSearchEngine;
use medcontext::store::{IndexMode, KnowledgeStore};

/// Medical knowledge store CLI: download, validate, and search the
/// offline medical knowledge base.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/medctx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "medctx",
    about = "Offline medical knowledge store: download, validate, search, and build RAG context",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/medctx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty knowledge store at `artifact.path`.
    ///
    /// Useful for development: the store has the production schema but no
    /// rows and no native vector index. Idempotent.
    Init,

    /// Validate the local artifact and print the lifecycle state.
    Status {
        /// Print the state as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Download the artifact from `artifact.url`.
    ///
    /// Resumes a previous partial download when one is present. Ctrl-C
    /// pauses the transfer and keeps the bytes received so far.
    Download {
        /// Delete the local artifact and any partial download, then start from zero.
        #[arg(long)]
        reset: bool,

        /// Progress output on stderr: `human`, `json`, or `off`.
        /// Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Delete the local artifact and any partial download.
    Remove,

    /// Vector search over documents and Q&A pairs.
    Search {
        query: String,

        /// Maximum number of results (defaults to `retrieval.max_results`).
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity in [-1, 1] (defaults to `retrieval.similarity_threshold`).
        #[arg(long)]
        threshold: Option<f32>,

        /// Only documents with this specialty (Q&A: the owning document's).
        #[arg(long)]
        specialty: Option<String>,

        /// Only documents from this year (Q&A: the owning document's).
        #[arg(long)]
        year: Option<i64>,

        /// Which records to search: `all`, `documents`, or `qa`.
        #[arg(long, default_value = "all")]
        kind: String,
    },

    /// Print the assembled context and sources for a query.
    Context {
        query: String,

        /// Override `context.max_context_length`.
        #[arg(long)]
        max_length: Option<usize>,

        /// Print the full context object as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg.artifact.path).await?;
            println!(
                "Knowledge store initialized at {}.",
                cfg.artifact.path.display()
            );
        }
        Commands::Status { json } => run_status(&cfg, json).await?,
        Commands::Download { reset, progress } => run_download(&cfg, reset, progress).await?,
        Commands::Remove => {
            let (controller, _) = open_lifecycle(&cfg)?;
            controller.remove_artifact().await?;
            println!("Removed {}.", cfg.artifact.path.display());
        }
        Commands::Search {
            query,
            limit,
            threshold,
            specialty,
            year,
            kind,
        } => {
            let filters = SearchFilters { specialty, year };
            run_search(&cfg, &query, limit, threshold, &filters, &kind).await?;
        }
        Commands::Context {
            query,
            max_length,
            json,
        } => run_context(&cfg, &query, max_length, json).await?,
    }

    Ok(())
}

fn open_lifecycle(cfg: &Config) -> anyhow::Result<(LifecycleController, Arc<KnowledgeStore>)> {
    let mode: IndexMode = cfg.retrieval.index.parse()?;
    let store = Arc::new(KnowledgeStore::new(mode));
    let controller = LifecycleController::new(cfg, Arc::clone(&store))?;
    Ok((controller, store))
}

/// Open the artifact and wire the embedding backend into a search engine.
async fn open_engine(cfg: &Config) -> anyhow::Result<Arc<VectorSearchEngine>> {
    let (controller, store) = open_lifecycle(cfg)?;
    match controller.check().await {
        LifecycleState::Ready => {}
        _ => {
            let snapshot = controller.snapshot();
            bail!(
                "Knowledge base is not ready ({}). Run `medctx download` first.",
                snapshot
                    .error
                    .unwrap_or_else(|| "no local artifact".to_string())
            );
        }
    }

    let backend = embedding::create_backend(&cfg.embedding)?.ok_or_else(|| {
        anyhow::anyhow!("Search requires an embedding provider. Set [embedding] provider in config.")
    })?;
    let gate = Arc::new(EmbeddingGate::from_config(&cfg.embedding));
    gate.register_backend(backend)?;

    Ok(Arc::new(VectorSearchEngine::new(gate, store)))
}

async fn run_status(cfg: &Config, json: bool) -> anyhow::Result<()> {
    let (controller, _) = open_lifecycle(cfg)?;
    controller.check().await;
    let snapshot = controller.snapshot();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("state:    {}", state_label(snapshot.state));
    println!("path:     {}", cfg.artifact.path.display());
    if let Some(artifact) = &snapshot.artifact {
        if let Some(size) = artifact.size_bytes {
            println!("size:     {} bytes", medcontext::progress::format_number(size));
        }
        if let Some(modified) = artifact.modified_at {
            println!("modified: {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    if let Some(error) = &snapshot.error {
        println!("error:    {}", error);
    }
    if snapshot.state == LifecycleState::Ready {
        let reader = controller.store().reader().await?;
        let (documents, qa) = reader.counts().await?;
        println!("records:  {} documents, {} Q&A pairs", documents, qa);
        println!("index:    {}", reader.index_name());
    }
    Ok(())
}

async fn run_download(cfg: &Config, reset: bool, progress: Option<String>) -> anyhow::Result<()> {
    let mode = match progress.as_deref() {
        None => ProgressMode::default_for_tty(),
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some("off") => ProgressMode::Off,
        Some(other) => bail!("Unknown progress mode: {}. Use human, json, or off.", other),
    };
    let reporter = mode.reporter();

    let (controller, _) = open_lifecycle(cfg)?;
    if reset {
        controller.reset_and_download().await?;
    } else {
        if controller.check().await == LifecycleState::Ready {
            println!("Knowledge base is installed and valid. Use --reset to download it again.");
            return Ok(());
        }
        controller.start_download().await?;
    }

    let mut updates = controller.subscribe();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        match snapshot.state {
            LifecycleState::Ready => {
                let bytes = snapshot.artifact.as_ref().and_then(|a| a.size_bytes);
                reporter.report(DownloadEvent::Finished { bytes });
                println!("Downloaded {}.", cfg.artifact.path.display());
                return Ok(());
            }
            LifecycleState::Error | LifecycleState::Missing => {
                let error = snapshot
                    .error
                    .unwrap_or_else(|| "download stopped".to_string());
                reporter.report(DownloadEvent::Failed {
                    error: error.clone(),
                });
                bail!("Download failed: {}", error);
            }
            _ => {
                if let Some(progress) = snapshot.progress {
                    reporter.report(DownloadEvent::Transferring(progress));
                }
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                changed.context("lifecycle controller stopped")?;
            }
            _ = tokio::signal::ctrl_c() => {
                controller.pause().await;
                eprintln!("Interrupted. Received bytes are kept; run `medctx download` to resume.");
                return Ok(());
            }
        }
    }
}

async fn run_search(
    cfg: &Config,
    query: &str,
    limit: Option<usize>,
    threshold: Option<f32>,
    filters: &SearchFilters,
    kind: &str,
) -> anyhow::Result<()> {
    let engine = open_engine(cfg).await?;
    let limit = limit.unwrap_or(cfg.retrieval.max_results);
    let threshold = threshold.unwrap_or(cfg.retrieval.similarity_threshold);

    let results = match kind {
        "all" => engine.search(query, limit, threshold, filters).await?,
        "documents" => engine.search_documents(query, limit, threshold, filters).await?,
        "qa" => engine.search_qa(query, limit, threshold, filters).await?,
        other => bail!("Unknown kind: {}. Use all, documents, or qa.", other),
    };

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        let kind = match result.record.kind() {
            RecordKind::Document => "document",
            RecordKind::Qa => "qa",
        };
        println!(
            "{}. [{:.3}] {} {}",
            i + 1,
            result.similarity,
            kind,
            result.record.id()
        );
        match &result.record {
            VectorRecord::Document(doc) => {
                println!("    title: {}", doc.title);
                if let Some(ref specialty) = doc.specialty {
                    println!("    specialty: {}", specialty);
                }
                if let Some(year) = doc.year {
                    println!("    year: {}", year);
                }
            }
            VectorRecord::Qa(qa) => {
                println!("    question: {}", qa.question);
                println!(
                    "    answer: {}",
                    medcontext::context::excerpt(&qa.answer, 120)
                );
            }
        }
        println!();
    }
    Ok(())
}

async fn run_context(
    cfg: &Config,
    query: &str,
    max_length: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let engine = open_engine(cfg).await?;
    let mut settings = RagSettings::from_config(cfg);
    if let Some(max) = max_length {
        settings.max_context_length = max;
    }
    let pipeline = RagPipeline::new(engine, settings);
    let context = pipeline.retrieve(query, &SearchFilters::default()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&context)?);
        return Ok(());
    }

    if !context.success {
        println!(
            "No context: {}",
            context.error.as_deref().unwrap_or("unknown error")
        );
        return Ok(());
    }

    println!("{}", context.text);
    if !context.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &context.sources {
            match &source.url {
                Some(url) => println!("  - {} ({})", source.title, url),
                None => println!("  - {}", source.title),
            }
        }
    }
    Ok(())
}

fn state_label(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Checking => "checking",
        LifecycleState::Ready => "ready",
        LifecycleState::Missing => "missing",
        LifecycleState::Downloading => "downloading",
        LifecycleState::Paused => "paused",
        LifecycleState::Error => "error",
    }
}
