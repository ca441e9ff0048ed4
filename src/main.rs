//! # Knowledge Engine CLI (`rke`)
//!
//! The `rke` binary drives the knowledge engine: database initialization,
//! document ingestion, retrieval and question answering, usage analytics,
//! and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! rke --config ./rke.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rke init` | Create the SQLite database and run schema migrations |
//! | `rke ingest <file>` | Chunk, embed, and store a document |
//! | `rke list` | List documents with filters and pagination |
//! | `rke delete <id>` | Delete a document and its chunks |
//! | `rke stats` | Knowledge-base aggregates |
//! | `rke retrieve "<query>"` | Ranked matches without generation |
//! | `rke ask "<query>"` | Full cached RAG answer |
//! | `rke research <name>` | Company research cache lookup |
//! | `rke analytics` | Usage aggregates over recent queries |
//! | `rke cleanup` | Purge expired cache rows and old usage logs |
//! | `rke serve` | Start the JSON HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use knowledge_engine::cache::{AnalyticsRecorder, QueryCache};
use knowledge_engine::chunk::Chunker;
use knowledge_engine::embedding::{Embedder, HttpEmbedder};
use knowledge_engine::generation::{self, Generator, HttpGenerator};
use knowledge_engine::ingest::IngestionPipeline;
use knowledge_engine::models::{DocumentMeta, DocumentQuery};
use knowledge_engine::rag::RagEngine;
use knowledge_engine::retrieve::SimilarityRetriever;
use knowledge_engine::store::sqlite::SqliteStore;
use knowledge_engine::store::Store;
use knowledge_engine::{config, db, migrate, research, server};

/// Knowledge Engine CLI — document ingestion, similarity retrieval, and
/// cached RAG answers over a local SQLite database.
#[derive(Parser)]
#[command(
    name = "rke",
    about = "Knowledge engine — ingest documents, retrieve by similarity, answer with context",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./rke.toml")]
    config: PathBuf,

    /// Owner namespace for all operations.
    #[arg(long, global = true, default_value = "local")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running
    /// it multiple times is safe.
    Init,

    /// Ingest a text file: chunk, embed, and store it.
    Ingest {
        /// Path to the file to ingest.
        file: PathBuf,

        /// Document title. Defaults to the file name.
        #[arg(long)]
        title: Option<String>,

        /// Tag to attach (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Source URL to record with the document.
        #[arg(long)]
        source_url: Option<String>,
    },

    /// List documents.
    List {
        /// Maximum number of documents to show.
        #[arg(long, default_value_t = 20)]
        limit: i64,

        /// Offset into the result set.
        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Only documents carrying this tag (repeatable, match-any).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Case-insensitive substring match on title.
        #[arg(long)]
        search: Option<String>,
    },

    /// Delete a document and its chunks.
    Delete {
        /// Document id.
        id: String,
    },

    /// Show knowledge-base aggregates.
    Stats,

    /// Retrieve ranked matches without generation.
    Retrieve {
        /// The query string.
        query: String,

        /// Maximum number of chunk matches.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity for chunk matches.
        #[arg(long)]
        threshold: Option<f32>,

        /// Restrict to documents carrying this tag (repeatable, match-any).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Skip the company research pool.
        #[arg(long)]
        no_company: bool,
    },

    /// Answer a question with retrieved context.
    Ask {
        /// The question.
        query: String,

        /// Restrict to documents carrying this tag (repeatable, match-any).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Look up a cached company research entry.
    Research {
        /// Company name.
        name: String,

        /// Industry disambiguator.
        #[arg(long)]
        industry: Option<String>,

        /// Location disambiguator.
        #[arg(long)]
        location: Option<String>,
    },

    /// Show usage aggregates over recent queries.
    Analytics {
        /// Window in days.
        #[arg(long, default_value_t = 7)]
        days: i64,

        /// Maximum number of recent entries to aggregate.
        #[arg(long, default_value_t = 1000)]
        limit: i64,
    },

    /// Purge expired cache rows and old usage logs.
    Cleanup {
        /// Usage rows older than this many days are deleted.
        #[arg(long, default_value_t = 90)]
        days: i64,
    },

    /// Start the JSON HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&cfg.db.path).await?;
        migrate::run_migrations(&pool).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let pool = db::connect(&cfg.db.path).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

    match cli.command {
        Commands::Init => unreachable!(),

        Commands::Ingest {
            file,
            title,
            tags,
            source_url,
        } => {
            let content = std::fs::read_to_string(&file)?;
            let title = title.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "untitled".to_string())
            });
            let meta = DocumentMeta {
                owner_id: cli.owner.clone(),
                title,
                source_url,
                file_type: Some("text/plain".to_string()),
                tags,
            };
            let chunker = Chunker::new(cfg.chunking.target_size, cfg.chunking.overlap)?;
            let pipeline = IngestionPipeline::new(store, embedder(&cfg)?, chunker);
            let doc = pipeline.ingest_document(&meta, &content).await?;
            println!("Ingested {} ({:?})", doc.id, doc.status);
        }

        Commands::List {
            limit,
            offset,
            tags,
            search,
        } => {
            let query = DocumentQuery {
                limit,
                offset,
                tags,
                search,
            };
            let (docs, total) = store.list_documents(&cli.owner, &query).await?;
            println!("{} documents ({} total):", docs.len(), total);
            for d in docs {
                println!(
                    "  {}  {:10}  {}  [{}]",
                    d.id,
                    d.status.as_str(),
                    d.title,
                    d.tags.join(", ")
                );
            }
        }

        Commands::Delete { id } => {
            match store.get_document(&id).await? {
                Some(doc) if doc.owner_id == cli.owner => {
                    store.delete_document(&id).await?;
                    println!("Deleted {}.", id);
                }
                _ => anyhow::bail!("document {} not found", id),
            }
        }

        Commands::Stats => {
            let stats = store.knowledge_base_stats(&cli.owner).await?;
            println!(
                "{} documents, {} chunks",
                stats.document_count, stats.chunk_count
            );
            for (tag, count) in stats.tag_counts {
                println!("  {}: {}", tag, count);
            }
        }

        Commands::Retrieve {
            query,
            limit,
            threshold,
            tags,
            no_company,
        } => {
            let mut options = cfg.retrieval.default_options();
            if let Some(limit) = limit {
                options.match_count = limit;
            }
            if let Some(threshold) = threshold {
                options.similarity_threshold = threshold;
            }
            options.filter_tags = tags;
            if no_company {
                options.include_company_research = false;
            }

            let retriever = SimilarityRetriever::new(store, embedder(&cfg)?);
            let result = retriever.retrieve(&query, &cli.owner, &options).await?;

            if result.is_empty() {
                println!("No matches.");
            }
            for m in &result.company_matches {
                println!("[{:.3}] (company) {}", m.similarity, m.company_name);
            }
            for m in &result.chunks {
                println!(
                    "[{:.3}] {} #{}\n    {}",
                    m.similarity,
                    m.document_title,
                    m.chunk_index,
                    snippet(&m.content)
                );
            }
        }

        Commands::Ask { query, tags } => {
            let mut options = cfg.retrieval.default_options();
            options.filter_tags = tags;
            let engine = build_engine(&cfg, store)?;
            let response = engine.answer(&query, &cli.owner, &options).await?;

            match &response.answer {
                Some(answer) => println!("{}", answer),
                None if response.context.is_empty() => println!("No relevant context found."),
                None => {
                    println!("(generation unavailable, showing retrieved context)\n");
                    println!("{}", generation::render_context(&response.context));
                }
            }
            if response.cached {
                println!("\n(cached)");
            }
        }

        Commands::Research {
            name,
            industry,
            location,
        } => {
            let key = research::normalize_company_key(
                &name,
                industry.as_deref(),
                location.as_deref(),
            );
            let cache = research::ResearchCache::new(store);
            match cache.lookup(&key, chrono::Utc::now().timestamp()).await? {
                Some(entry) => {
                    println!(
                        "{} (confidence {:.2}, expires {})",
                        entry.company_name, entry.confidence, entry.expires_at
                    );
                    println!("{}", serde_json::to_string_pretty(&entry.payload)?);
                }
                None => println!("No live research entry for '{}'.", name),
            }
        }

        Commands::Analytics { days, limit } => {
            let analytics = AnalyticsRecorder::new(store);
            let summary = analytics.usage_summary(&cli.owner, days, limit).await?;
            println!("{} queries in the last {} days", summary.total_queries, days);
            println!("  avg latency: {:.0} ms", summary.avg_latency_ms);
            println!("  avg top similarity: {:.3}", summary.avg_top_similarity);
            if let Some(s) = summary.avg_satisfaction {
                println!("  avg satisfaction: {:.2}", s);
            }
        }

        Commands::Cleanup { days } => {
            let cache = QueryCache::new(store.clone(), cfg.cache.search_ttl_secs);
            let purged = cache.purge_expired(chrono::Utc::now().timestamp()).await?;
            let analytics = AnalyticsRecorder::new(store);
            let removed = analytics.purge_older_than(days).await?;
            println!(
                "Purged {} cache entries and {} usage rows.",
                purged, removed
            );
        }

        Commands::Serve => {
            let generator = generator(&cfg)?;
            server::run_server(&cfg, store, embedder(&cfg)?, generator).await?;
        }
    }

    Ok(())
}

/// Build the configured embedding provider. Retrieval and ingestion need
/// one; there is no degraded mode without embeddings.
fn embedder(cfg: &config::Config) -> anyhow::Result<Arc<dyn Embedder>> {
    if !cfg.embedding.is_enabled() {
        anyhow::bail!(
            "embedding provider is disabled; set [embedding] provider = \"openai\" in the config"
        );
    }
    Ok(Arc::new(HttpEmbedder::new(&cfg.embedding)?))
}

/// Build the configured generator, if any. `None` means answers degrade
/// to raw retrieved context.
fn generator(cfg: &config::Config) -> anyhow::Result<Option<Arc<dyn Generator>>> {
    if !cfg.generation.is_enabled() {
        return Ok(None);
    }
    Ok(Some(Arc::new(HttpGenerator::new(&cfg.generation)?)))
}

fn build_engine(cfg: &config::Config, store: Arc<dyn Store>) -> anyhow::Result<RagEngine> {
    let retriever = Arc::new(SimilarityRetriever::new(store.clone(), embedder(cfg)?));
    Ok(RagEngine::new(
        retriever,
        generator(cfg)?,
        QueryCache::new(store.clone(), cfg.cache.search_ttl_secs),
        AnalyticsRecorder::new(store),
        cfg.retrieval.timeout_secs,
    ))
}

fn snippet(text: &str) -> String {
    let flat = text.replace('\n', " ");
    let mut end = flat.len().min(160);
    while !flat.is_char_boundary(end) {
        end -= 1;
    }
    if end < flat.len() {
        format!("{}…", &flat[..end])
    } else {
        flat
    }
}
