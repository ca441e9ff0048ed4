//! End-to-end tests over a real SQLite database in a temp directory,
//! with deterministic embedding and generation fakes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tempfile::TempDir;

use knowledge_engine::cache::{AnalyticsRecorder, QueryCache};
use knowledge_engine::chunk::Chunker;
use knowledge_engine::embedding::Embedder;
use knowledge_engine::error::EngineError;
use knowledge_engine::generation::Generator;
use knowledge_engine::ingest::IngestionPipeline;
use knowledge_engine::models::{
    CompanyResearchEntry, ContextItem, ContextSource, DocumentMeta, DocumentQuery,
    DocumentStatus, RetrievalOptions,
};
use knowledge_engine::rag::RagEngine;
use knowledge_engine::retrieve::SimilarityRetriever;
use knowledge_engine::store::sqlite::SqliteStore;
use knowledge_engine::store::Store;
use knowledge_engine::{db, migrate};

/// Embeds text into a fixed 3-dimensional space keyed on topic words, so
/// similarities are exact and reproducible.
struct TopicEmbedder {
    calls: AtomicUsize,
}

impl TopicEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

fn topic_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v = vec![0.0f32, 0.0, 0.0];
    if lower.contains("deploy") {
        v[0] = 1.0;
    }
    if lower.contains("onboard") {
        v[1] = 1.0;
    }
    if lower.contains("acme") {
        v[2] = 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v = vec![0.1, 0.1, 0.1];
    }
    v
}

#[async_trait]
impl Embedder for TopicEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> knowledge_engine::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| topic_vector(t)).collect())
    }
    fn dims(&self) -> usize {
        3
    }
}

struct FlakyEmbedder;

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed_batch(&self, _: &[String]) -> knowledge_engine::Result<Vec<Vec<f32>>> {
        Err(EngineError::Embedding("rate limited".to_string()))
    }
    fn dims(&self) -> usize {
        3
    }
}

struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, context: &[ContextItem], query: &str) -> anyhow::Result<String> {
        Ok(format!("answer from {} items: {}", context.len(), query))
    }
}

struct OfflineGenerator;

#[async_trait]
impl Generator for OfflineGenerator {
    async fn generate(&self, _: &[ContextItem], _: &str) -> anyhow::Result<String> {
        Err(anyhow!("connection refused"))
    }
}

async fn open_store(tmp: &TempDir) -> Arc<SqliteStore> {
    let pool = db::connect(&tmp.path().join("rke.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

fn pipeline(store: Arc<SqliteStore>, embedder: Arc<dyn Embedder>) -> IngestionPipeline {
    IngestionPipeline::new(store, embedder, Chunker::new(200, 40).unwrap())
}

fn engine(
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
    ttl_secs: i64,
) -> RagEngine {
    RagEngine::new(
        Arc::new(SimilarityRetriever::new(store.clone(), embedder)),
        generator,
        QueryCache::new(store.clone(), ttl_secs),
        AnalyticsRecorder::new(store),
        30,
    )
}

fn meta(owner: &str, title: &str, tags: &[&str]) -> DocumentMeta {
    DocumentMeta {
        owner_id: owner.to_string(),
        title: title.to_string(),
        source_url: None,
        file_type: None,
        tags: tags.iter().map(|t| t.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_ingest_then_retrieve_ranks_relevant_chunks() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let embedder = Arc::new(TopicEmbedder::new());
    let p = pipeline(store.clone(), embedder.clone());

    p.ingest_document(
        &meta("u1", "Deploy Guide", &["ops"]),
        "How to deploy the service.\n\nRun the deploy script and watch the dashboards.",
    )
    .await
    .unwrap();
    p.ingest_document(
        &meta("u1", "Onboarding", &["hr"]),
        "Onboarding checklist.\n\nNew hires complete the onboarding tasks in week one.",
    )
    .await
    .unwrap();

    let retriever = SimilarityRetriever::new(store, embedder);
    let result = retriever
        .retrieve("deploy process", "u1", &RetrievalOptions::default())
        .await
        .unwrap();

    assert!(!result.chunks.is_empty());
    assert_eq!(result.chunks[0].document_title, "Deploy Guide");
    for m in &result.chunks {
        assert_ne!(m.document_title, "Onboarding");
    }
}

#[tokio::test]
async fn test_answer_puts_company_research_before_chunks() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let embedder = Arc::new(TopicEmbedder::new());
    let p = pipeline(store.clone(), embedder.clone());

    p.ingest_document(
        &meta("u1", "Acme Notes", &[]),
        "Meeting notes about acme.\n\nThey asked about pricing tiers.",
    )
    .await
    .unwrap();
    store
        .put_research_entry(
            &CompanyResearchEntry {
                key: "acme corp||".to_string(),
                company_name: "Acme Corp".to_string(),
                payload: serde_json::json!({"summary": "Acme Corp manufactures anvils."}),
                confidence: 0.85,
                expires_at: i64::MAX,
                created_at: 1,
            },
            &topic_vector("acme"),
        )
        .await
        .unwrap();

    let e = engine(store, embedder, Some(Arc::new(EchoGenerator)), 0);
    let response = e
        .answer("what do we know about acme?", "u1", &RetrievalOptions::default())
        .await
        .unwrap();

    assert!(response.answer.is_some());
    assert!(!response.generation_skipped);
    assert_eq!(response.context[0].source, ContextSource::CompanyResearch);
    assert_eq!(response.context[0].content, "Acme Corp manufactures anvils.");
    assert!(response
        .context
        .iter()
        .any(|c| c.source == ContextSource::Chunk));
}

#[tokio::test]
async fn test_repeated_question_served_from_cache() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let embedder = Arc::new(TopicEmbedder::new());
    let p = pipeline(store.clone(), embedder.clone());

    p.ingest_document(
        &meta("u1", "Deploy Guide", &[]),
        "Deploy steps.\n\nShip it carefully.",
    )
    .await
    .unwrap();

    let e = engine(store, embedder.clone(), Some(Arc::new(EchoGenerator)), 600);
    let options = RetrievalOptions::default();

    let first = e.answer("how to deploy", "u1", &options).await.unwrap();
    assert!(!first.cached);
    let calls = embedder.calls.load(Ordering::SeqCst);

    let second = e.answer("How To Deploy", "u1", &options).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.answer, first.answer);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);

    // A different owner never sees the cached entry.
    let other = e.answer("how to deploy", "u2", &options).await.unwrap();
    assert!(!other.cached);
}

#[tokio::test]
async fn test_generation_outage_returns_context_not_error() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let embedder = Arc::new(TopicEmbedder::new());
    let p = pipeline(store.clone(), embedder.clone());

    p.ingest_document(
        &meta("u1", "Deploy Guide", &[]),
        "Deploy steps.\n\nShip it carefully.",
    )
    .await
    .unwrap();

    let e = engine(store, embedder, Some(Arc::new(OfflineGenerator)), 0);
    let response = e
        .answer("how to deploy", "u1", &RetrievalOptions::default())
        .await
        .unwrap();

    assert!(response.generation_skipped);
    assert!(response.answer.is_none());
    assert!(!response.context.is_empty());
    assert!(response.top_similarity > 0.0);
}

#[tokio::test]
async fn test_failed_ingestion_rolls_back_and_is_retryable() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let broken = pipeline(store.clone(), Arc::new(FlakyEmbedder));
    let err = broken
        .ingest_document(&meta("u1", "Doomed", &[]), "deploy content")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Embedding(_)));

    let (docs, total) = store
        .list_documents("u1", &DocumentQuery::default())
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(docs[0].status, DocumentStatus::Failed);
    assert!(store.chunk_candidates("u1", &[]).await.unwrap().is_empty());

    let healthy = pipeline(store.clone(), Arc::new(TopicEmbedder::new()));
    let doc = healthy
        .reingest_document(&docs[0].id, "deploy content")
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(store.chunk_candidates("u1", &[]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stats_and_listing_filters() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let embedder = Arc::new(TopicEmbedder::new());
    let p = pipeline(store.clone(), embedder);

    p.ingest_document(&meta("u1", "Deploy Guide", &["ops"]), "deploy text")
        .await
        .unwrap();
    p.ingest_document(&meta("u1", "Onboarding", &["hr", "ops"]), "onboard text")
        .await
        .unwrap();
    p.ingest_document(&meta("u2", "Elsewhere", &["ops"]), "deploy text")
        .await
        .unwrap();

    let stats = store.knowledge_base_stats("u1").await.unwrap();
    assert_eq!(stats.document_count, 2);
    assert!(stats.chunk_count >= 2);
    assert!(stats
        .tag_counts
        .iter()
        .any(|(tag, count)| tag == "ops" && *count == 2));

    let query = DocumentQuery {
        tags: vec!["hr".to_string()],
        ..Default::default()
    };
    let (docs, total) = store.list_documents("u1", &query).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(docs[0].title, "Onboarding");

    let query = DocumentQuery {
        search: Some("deploy".to_string()),
        ..Default::default()
    };
    let (docs, _) = store.list_documents("u1", &query).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].title, "Deploy Guide");
}

#[tokio::test]
async fn test_usage_log_and_cleanup() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let embedder = Arc::new(TopicEmbedder::new());
    let p = pipeline(store.clone(), embedder.clone());

    p.ingest_document(&meta("u1", "Deploy Guide", &[]), "deploy text")
        .await
        .unwrap();

    let e = engine(store.clone(), embedder, None, 600);
    let options = RetrievalOptions::default();
    e.answer("how to deploy", "u1", &options).await.unwrap();
    e.answer("how to deploy", "u1", &options).await.unwrap();
    e.answer("onboarding schedule", "u1", &options).await.unwrap();

    let analytics = AnalyticsRecorder::new(store.clone());
    let summary = analytics.usage_summary("u1", 7, 100).await.unwrap();
    assert_eq!(summary.total_queries, 3);
    assert!(summary.avg_latency_ms >= 0.0);

    // Future cutoff removes everything; an immediate purge of unexpired
    // cache rows removes nothing.
    let removed = store
        .delete_usage_before(chrono::Utc::now().timestamp() + 60)
        .await
        .unwrap();
    assert_eq!(removed, 3);
    let cache = QueryCache::new(store, 600);
    assert_eq!(
        cache.purge_expired(chrono::Utc::now().timestamp()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_documents_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let doc_id;
    {
        let store = open_store(&tmp).await;
        let p = pipeline(store.clone(), Arc::new(TopicEmbedder::new()));
        let doc = p
            .ingest_document(&meta("u1", "Durable", &[]), "deploy text")
            .await
            .unwrap();
        doc_id = doc.id;
    }

    let store = open_store(&tmp).await;
    let doc = store.get_document(&doc_id).await.unwrap().unwrap();
    assert_eq!(doc.title, "Durable");
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(store.chunk_candidates("u1", &[]).await.unwrap().len(), 1);
}
