//! # Ragline CLI (`ragline`)
//!
//! The `ragline` binary drives the ingestion service: database setup,
//! one-shot indexing of local files, search, question answering, and the
//! long-running HTTP server with its worker pool.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragline init` | Create the SQLite database and run schema migrations |
//! | `ragline serve` | Start the HTTP API and background workers |
//! | `ragline index <file>` | Ingest a local file and run its index job |
//! | `ragline search "<query>"` | Similarity search over the indexed corpus |
//! | `ragline ask "<question>"` | One-shot RAG answer with sources |
//! | `ragline job <id>` | Show a job's state, progress, and attempts |
//!
//! ## Examples
//!
//! ```bash
//! ragline init --config ./config/ragline.toml
//! ragline index ./handbook.pdf --title "Employee Handbook"
//! ragline search "vacation policy"
//! ragline ask "How many vacation days do employees get?"
//! ragline serve
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ragline::completion::{CannedCompleter, CompletionProvider, OpenAiCompleter};
use ragline::config::{self, Config};
use ragline::embedding::{OfflineProviderFactory, OpenAiProviderFactory, ProviderFactory};
use ragline::extract;
use ragline::models::DocumentStatus;
use ragline::queue::{JobPayload, JobQueue};
use ragline::rag::{QueryRequest, RagService, SearchRequest};
use ragline::server::{self, StaticTokenProvider};
use ragline::store::{self, NewDocument};
use ragline::vector::{CollectionResolver, QdrantStore};
use ragline::worker::{self, PipelineContext};
use ragline::{db, migrate, profiles};

/// Ragline — a document ingestion and retrieval-augmented-generation
/// service.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragline.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ragline",
    about = "Ragline — document ingestion and retrieval-augmented generation",
    version,
    long_about = "Ragline ingests documents through a durable background job queue \
    (chunking, batched embedding, vector upsert), stores vectors in Qdrant, and answers \
    questions over the indexed corpus via a CLI and JSON HTTP API with token streaming."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragline.toml")]
    config: PathBuf,

    /// Use the deterministic offline embedder instead of the OpenAI API.
    /// Embeddings are not semantic; intended for smoke testing.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent.
    Init,

    /// Start the HTTP API server and background workers.
    ///
    /// Binds to `[server].bind` and runs `[queue].index_concurrency`
    /// workers in the same process.
    Serve,

    /// Ingest a local file and run its index job to completion.
    ///
    /// Extracts text according to the file's type, stores the document,
    /// enqueues an index job, and drains the queue before returning.
    Index {
        /// Path to the file (pdf, docx, xlsx, html, md, txt).
        file: PathBuf,

        /// Document title. Defaults to the file name.
        #[arg(long)]
        title: Option<String>,

        /// Profile to index under. Defaults to the owner's default profile.
        #[arg(long)]
        profile: Option<String>,
    },

    /// Similarity search over the indexed corpus.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity score, overriding the profile's threshold.
        #[arg(long)]
        threshold: Option<f32>,

        /// Only return chunks from documents with this source value.
        #[arg(long)]
        source: Option<String>,

        /// Profile whose retrieval settings to use.
        #[arg(long)]
        profile: Option<String>,
    },

    /// Ask a question over the indexed corpus (one-shot RAG answer).
    Ask {
        /// The question.
        question: String,

        /// Profile whose retrieval, generation, and persona settings to use.
        #[arg(long)]
        profile: Option<String>,
    },

    /// Show a job's state, progress, and attempts.
    Job {
        /// Job id, e.g. `index-<document-uuid>`.
        id: String,
    },
}

/// User all CLI operations act as.
const CLI_USER: &str = "local";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ragline=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let (ctx, rag) = build_services(&cfg, cli.offline).await?;
            worker::spawn_workers(ctx.clone());
            let sessions = Arc::new(StaticTokenProvider::new(&cfg.auth));
            server::run_server(ctx, rag, sessions).await?;
        }
        Commands::Index {
            file,
            title,
            profile,
        } => {
            let (ctx, _rag) = build_services(&cfg, cli.offline).await?;
            index_file(&ctx, &file, title, profile).await?;
        }
        Commands::Search {
            query,
            limit,
            threshold,
            source,
            profile,
        } => {
            let (_ctx, rag) = build_services(&cfg, cli.offline).await?;
            let hits = rag
                .search(
                    CLI_USER,
                    &SearchRequest {
                        query,
                        profile_id: profile,
                        top_k: limit,
                        score_threshold: threshold,
                        source,
                        document_id: None,
                    },
                )
                .await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. [{:.3}] {}", i + 1, hit.score, snippet(&hit.content));
                println!("   document: {}  chunk: {}", hit.document_id, hit.chunk_id);
            }
        }
        Commands::Ask { question, profile } => {
            let (_ctx, rag) = build_services(&cfg, cli.offline).await?;
            let answer = rag
                .query(
                    CLI_USER,
                    &QueryRequest {
                        question,
                        profile_id: profile,
                        ..QueryRequest::default()
                    },
                )
                .await?;
            println!("{}", answer.answer);
            if !answer.sources.is_empty() {
                println!();
                println!("Sources:");
                for (i, source) in answer.sources.iter().enumerate() {
                    println!(
                        "  [{}] {:.3} {} ({})",
                        i + 1,
                        source.score,
                        snippet(&source.content),
                        source.document_id
                    );
                }
            }
        }
        Commands::Job { id } => {
            let (ctx, _rag) = build_services(&cfg, cli.offline).await?;
            match ctx.queue.get(&id).await? {
                Some(job) => {
                    println!("id:        {}", job.id);
                    println!("kind:      {}", job.kind);
                    println!("state:     {}", job.state.as_str());
                    println!("progress:  {:.0}%", job.progress);
                    println!("attempts:  {}/{}", job.attempts_made, job.max_attempts);
                    if let Some(err) = job.error {
                        println!("error:     {}", err);
                    }
                }
                None => bail!("job not found: {}", id),
            }
        }
    }

    Ok(())
}

/// Wire the shared pipeline context and RAG service from config.
async fn build_services(
    cfg: &Config,
    offline: bool,
) -> anyhow::Result<(Arc<PipelineContext>, Arc<RagService>)> {
    let pool = db::connect(&cfg.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let vectors: Arc<dyn ragline::vector::VectorStore> = Arc::new(QdrantStore::new(&cfg.vector)?);
    let embedders: Arc<dyn ProviderFactory> = if offline {
        Arc::new(OfflineProviderFactory)
    } else {
        Arc::new(OpenAiProviderFactory::new(cfg.embedding.clone()))
    };
    let completer: Arc<dyn CompletionProvider> = if offline {
        Arc::new(CannedCompleter::new(
            "Generation is disabled in offline mode.",
        ))
    } else {
        Arc::new(OpenAiCompleter::new(&cfg.generation)?)
    };
    let resolver = Arc::new(CollectionResolver::new(&cfg.vector.collection_prefix));
    let queue = JobQueue::new(pool.clone(), cfg.queue.clone());

    let ctx = Arc::new(PipelineContext {
        pool: pool.clone(),
        config: cfg.clone(),
        queue,
        vectors: vectors.clone(),
        embedders: embedders.clone(),
        resolver: resolver.clone(),
    });
    let rag = Arc::new(RagService {
        pool,
        config: cfg.clone(),
        vectors,
        embedders,
        resolver,
        completer,
    });
    Ok((ctx, rag))
}

async fn index_file(
    ctx: &PipelineContext,
    file: &Path,
    title: Option<String>,
    profile: Option<String>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;
    let mime = mime_for_path(file)?;
    let text = extract::extract_text(&bytes, mime)?;
    if text.trim().is_empty() {
        bail!("no text could be extracted from {}", file.display());
    }

    if let Some(pid) = profile.as_deref() {
        profiles::resolve_profile(&ctx.pool, &ctx.config, CLI_USER, Some(pid)).await?;
    }

    let title = title.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Untitled".to_string())
    });
    let doc = store::insert_document(
        &ctx.pool,
        NewDocument {
            owner_id: CLI_USER.to_string(),
            profile_id: profile.clone(),
            title,
            content: text,
            source: Some(file.display().to_string()),
            metadata_json: "{}".to_string(),
        },
    )
    .await?;

    let job_id = ctx
        .queue
        .enqueue(&JobPayload::Index {
            document_id: doc.id.clone(),
            profile_id: profile,
            chunk_options: None,
        })
        .await?;
    store::set_status(&ctx.pool, &doc.id, DocumentStatus::Processing).await?;
    println!("Indexing {} (job {})...", doc.id, job_id);

    worker::drain(ctx).await?;

    let doc = store::get_document(&ctx.pool, &doc.id)
        .await?
        .context("document vanished during indexing")?;
    match doc.status {
        DocumentStatus::Indexed => {
            println!("Indexed {} chunks.", doc.chunk_count);
        }
        DocumentStatus::Failed => {
            bail!(
                "indexing failed: {}",
                doc.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        other => bail!("unexpected document status: {}", other.as_str()),
    }
    Ok(())
}

fn mime_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    Ok(match ext.as_str() {
        "pdf" => extract::MIME_PDF,
        "docx" => extract::MIME_DOCX,
        "xlsx" => extract::MIME_XLSX,
        "html" | "htm" => extract::MIME_HTML,
        "md" | "markdown" => extract::MIME_MARKDOWN,
        "txt" | "text" | "" => extract::MIME_TEXT,
        other => bail!("unsupported file extension: .{}", other),
    })
}

fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out: String = flat.chars().take(100).collect();
    if flat.chars().count() > 100 {
        out.push('…');
    }
    out
}
