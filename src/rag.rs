//! Retrieval orchestrator: cache, retrieve, generate, record.
//!
//! Answer flow: check the query cache, run the similarity scan, merge the
//! two match pools into one context block (company research first), hand
//! the context to the generator, cache the response, append a usage row.
//! Generation is best-effort — when it is unconfigured, fails, or runs
//! past what remains of the call deadline, the response carries the raw
//! context with `generation_skipped` set instead of surfacing an error. Cache and analytics writes are likewise never
//! allowed to fail the call.
//!
//! The similarity scan runs on a spawned task: if the caller goes away
//! mid-request the scan still completes and its result still lands in the
//! cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::cache::{cache_key, AnalyticsRecorder, QueryCache};
use crate::error::{EngineError, Result};
use crate::generation::Generator;
use crate::models::{
    ContextItem, ContextSource, RagResponse, RetrievalOptions, RetrievalResult,
};
use crate::retrieve::SimilarityRetriever;

pub struct RagEngine {
    retriever: Arc<SimilarityRetriever>,
    generator: Option<Arc<dyn Generator>>,
    cache: Arc<QueryCache>,
    analytics: AnalyticsRecorder,
    timeout_secs: u64,
}

impl RagEngine {
    pub fn new(
        retriever: Arc<SimilarityRetriever>,
        generator: Option<Arc<dyn Generator>>,
        cache: QueryCache,
        analytics: AnalyticsRecorder,
        timeout_secs: u64,
    ) -> Self {
        Self {
            retriever,
            generator,
            cache: Arc::new(cache),
            analytics,
            timeout_secs,
        }
    }

    /// Answer a query end to end. Fails only on invalid input, a query
    /// that cannot be embedded, a storage fault during the scan, or the
    /// overall deadline.
    pub async fn answer(
        &self,
        query: &str,
        owner_id: &str,
        options: &RetrievalOptions,
    ) -> Result<RagResponse> {
        if query.trim().is_empty() {
            return Err(EngineError::InvalidInput("query is empty".to_string()));
        }
        if owner_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("owner_id is required".to_string()));
        }

        let started = Instant::now();
        let key = cache_key(query, owner_id, options);

        if let Some(mut hit) = self.cache.get(&key, Utc::now().timestamp()).await? {
            hit.cached = true;
            let latency_ms = started.elapsed().as_millis() as i64;
            if let Err(err) = self
                .analytics
                .record_event(
                    owner_id,
                    query,
                    options,
                    "cached",
                    hit.result_count as i64,
                    hit.top_similarity,
                    latency_ms,
                )
                .await
            {
                warn!(error = %err, "usage log append failed");
            }
            info!(owner_id, latency_ms, "answer served from cache");
            return Ok(hit);
        }

        let deadline = Duration::from_secs(self.timeout_secs);
        let result = self
            .run_retrieval(query, owner_id, options, deadline.saturating_sub(started.elapsed()))
            .await?;

        let context = merge_context(&result);

        // If the caller drops us mid-generation, the finished scan is still
        // worth keeping: the guard writes a context-only entry on drop.
        let mut guard = ScanCacheGuard::arm(
            self.cache.clone(),
            key.clone(),
            owner_id.to_string(),
            RagResponse {
                query: query.to_string(),
                answer: None,
                context: context.clone(),
                result_count: result.result_count(),
                top_similarity: result.top_similarity(),
                generation_skipped: true,
                cached: false,
            },
        );

        let (answer, generation_skipped) = self
            .generate(&context, query, deadline.saturating_sub(started.elapsed()))
            .await;

        let response = RagResponse {
            query: query.to_string(),
            answer,
            context,
            result_count: result.result_count(),
            top_similarity: result.top_similarity(),
            generation_skipped,
            cached: false,
        };

        guard.disarm();
        if let Err(err) = self
            .cache
            .put(&key, owner_id, &response, Utc::now().timestamp())
            .await
        {
            warn!(error = %err, "query cache write failed");
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        if let Err(err) = self
            .analytics
            .record(owner_id, query, options, &result, latency_ms)
            .await
        {
            warn!(error = %err, "usage log append failed");
        }

        info!(
            owner_id,
            result_count = response.result_count,
            generation_skipped,
            latency_ms,
            "answer produced"
        );
        Ok(response)
    }

    /// Retrieval without generation or caching, for callers that want the
    /// ranked matches themselves.
    pub async fn retrieve(
        &self,
        query: &str,
        owner_id: &str,
        options: &RetrievalOptions,
    ) -> Result<RetrievalResult> {
        if query.trim().is_empty() {
            return Err(EngineError::InvalidInput("query is empty".to_string()));
        }
        self.run_retrieval(query, owner_id, options, Duration::from_secs(self.timeout_secs))
            .await
    }

    async fn run_retrieval(
        &self,
        query: &str,
        owner_id: &str,
        options: &RetrievalOptions,
        budget: Duration,
    ) -> Result<RetrievalResult> {
        let retriever = self.retriever.clone();
        let query = query.to_string();
        let owner = owner_id.to_string();
        let options = options.clone();
        let handle = tokio::spawn(async move {
            retriever
                .retrieve_at(&query, &owner, &options, Utc::now().timestamp())
                .await
        });

        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::Storage(format!(
                "retrieval task failed: {}",
                join_err
            ))),
            Err(_) => Err(EngineError::Timeout(self.timeout_secs)),
        }
    }

    /// Generation gets whatever is left of the call deadline after
    /// retrieval. A timed-out or failed generation degrades to the raw
    /// context rather than discarding the scan.
    async fn generate(
        &self,
        context: &[ContextItem],
        query: &str,
        budget: Duration,
    ) -> (Option<String>, bool) {
        if context.is_empty() {
            return (None, false);
        }
        let Some(generator) = &self.generator else {
            return (None, true);
        };
        match tokio::time::timeout(budget, generator.generate(context, query)).await {
            Ok(Ok(answer)) => (Some(answer), false),
            Ok(Err(err)) => {
                warn!(error = %err, "generation failed, returning raw context");
                (None, true)
            }
            Err(_) => {
                warn!(
                    budget_ms = budget.as_millis() as u64,
                    "generation exceeded the call deadline, returning raw context"
                );
                (None, true)
            }
        }
    }
}

/// Caches a completed retrieval scan if the response future is dropped
/// before the final cache write. Disarmed once the full response lands.
struct ScanCacheGuard {
    cache: Arc<QueryCache>,
    key: String,
    owner: String,
    response: Option<RagResponse>,
}

impl ScanCacheGuard {
    fn arm(cache: Arc<QueryCache>, key: String, owner: String, response: RagResponse) -> Self {
        Self {
            cache,
            key,
            owner,
            response: Some(response),
        }
    }

    fn disarm(&mut self) {
        self.response = None;
    }
}

impl Drop for ScanCacheGuard {
    fn drop(&mut self) {
        let Some(response) = self.response.take() else {
            return;
        };
        // Dropped during runtime shutdown there is nowhere to spawn the
        // write; losing the entry is fine, it is only a cache.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(err) = cache.put(&key, &owner, &response, Utc::now().timestamp()).await {
                warn!(error = %err, "scan cache write after cancellation failed");
            }
        });
    }
}

/// Merge the two pools into a single context block, company research
/// first. Each item keeps its similarity and source for citation.
pub fn merge_context(result: &RetrievalResult) -> Vec<ContextItem> {
    let mut context = Vec::with_capacity(result.result_count());
    for m in &result.company_matches {
        context.push(ContextItem {
            source: ContextSource::CompanyResearch,
            similarity: m.similarity,
            title: m.company_name.clone(),
            content: research_content(&m.payload),
        });
    }
    for m in &result.chunks {
        context.push(ContextItem {
            source: ContextSource::Chunk,
            similarity: m.similarity,
            title: m.document_title.clone(),
            content: m.content.clone(),
        });
    }
    context
}

/// Research payloads carry a human-readable `summary` field; fall back to
/// the raw JSON when it is absent.
fn research_content(payload: &serde_json::Value) -> String {
    match payload.get("summary").and_then(|s| s.as_str()) {
        Some(summary) => summary.to_string(),
        None => payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedder;
    use crate::models::{Chunk, CompanyResearchEntry, Document, DocumentStatus};
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dims(&self) -> usize {
            2
        }
    }

    struct EchoGenerator;

    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(&self, context: &[ContextItem], query: &str) -> anyhow::Result<String> {
            Ok(format!("{} items for: {}", context.len(), query))
        }
    }

    struct SlowGenerator(Duration);

    #[async_trait]
    impl Generator for SlowGenerator {
        async fn generate(&self, _: &[ContextItem], _: &str) -> anyhow::Result<String> {
            tokio::time::sleep(self.0).await;
            Ok("late answer".to_string())
        }
    }

    struct BrokenGenerator;

    #[async_trait]
    impl Generator for BrokenGenerator {
        async fn generate(&self, _: &[ContextItem], _: &str) -> anyhow::Result<String> {
            Err(anyhow!("model offline"))
        }
    }

    async fn seed(store: &Arc<MemoryStore>) {
        let doc = Document {
            id: "d1".to_string(),
            owner_id: "u1".to_string(),
            title: "Handbook".to_string(),
            source_url: None,
            file_type: "text/plain".to_string(),
            size_bytes: 10,
            tags: Vec::new(),
            status: DocumentStatus::Completed,
            error: None,
            created_at: 100,
            updated_at: 100,
        };
        store.create_document(&doc).await.unwrap();
        store
            .insert_chunks(
                "d1",
                &[Chunk {
                    id: "c1".to_string(),
                    document_id: "d1".to_string(),
                    chunk_index: 0,
                    content: "the handbook text".to_string(),
                }],
                &[vec![1.0, 0.0]],
            )
            .await
            .unwrap();
        store
            .put_research_entry(
                &CompanyResearchEntry {
                    key: "acme||".to_string(),
                    company_name: "Acme".to_string(),
                    payload: serde_json::json!({"summary": "Acme builds anvils"}),
                    confidence: 0.8,
                    expires_at: i64::MAX,
                    created_at: 50,
                },
                &[1.0, 0.0],
            )
            .await
            .unwrap();
    }

    fn engine(
        store: Arc<MemoryStore>,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
        ttl_secs: i64,
        timeout_secs: u64,
    ) -> RagEngine {
        RagEngine::new(
            Arc::new(SimilarityRetriever::new(store.clone(), embedder)),
            generator,
            QueryCache::new(store.clone(), ttl_secs),
            AnalyticsRecorder::new(store),
            timeout_secs,
        )
    }

    #[tokio::test]
    async fn test_answer_merges_company_research_first() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let e = engine(
            store,
            Arc::new(CountingEmbedder::new()),
            Some(Arc::new(EchoGenerator)),
            600,
            30,
        );

        let response = e
            .answer("anvils", "u1", &RetrievalOptions::default())
            .await
            .unwrap();

        assert!(!response.cached);
        assert!(!response.generation_skipped);
        assert_eq!(response.result_count, 2);
        assert_eq!(response.context[0].source, ContextSource::CompanyResearch);
        assert_eq!(response.context[0].content, "Acme builds anvils");
        assert_eq!(response.context[1].source, ContextSource::Chunk);
        assert_eq!(response.answer.as_deref(), Some("2 items for: anvils"));
    }

    #[tokio::test]
    async fn test_second_call_hits_cache_without_embedding() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let embedder = Arc::new(CountingEmbedder::new());
        let e = engine(
            store.clone(),
            embedder.clone(),
            Some(Arc::new(EchoGenerator)),
            600,
            30,
        );

        let options = RetrievalOptions::default();
        let first = e.answer("anvils", "u1", &options).await.unwrap();
        assert!(!first.cached);
        let calls_after_first = embedder.calls.load(Ordering::SeqCst);

        let second = e.answer("  ANVILS ", "u1", &options).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.answer, first.answer);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_after_first);

        // Both calls appear in the usage log.
        assert_eq!(store.usage_len(), 2);
    }

    #[tokio::test]
    async fn test_generation_failure_degrades_to_context() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let e = engine(
            store,
            Arc::new(CountingEmbedder::new()),
            Some(Arc::new(BrokenGenerator)),
            0,
            30,
        );

        let response = e
            .answer("anvils", "u1", &RetrievalOptions::default())
            .await
            .unwrap();

        assert!(response.generation_skipped);
        assert!(response.answer.is_none());
        assert!(!response.context.is_empty());
    }

    #[tokio::test]
    async fn test_no_generator_skips_generation() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let e = engine(store, Arc::new(CountingEmbedder::new()), None, 0, 30);

        let response = e
            .answer("anvils", "u1", &RetrievalOptions::default())
            .await
            .unwrap();

        assert!(response.generation_skipped);
        assert!(response.answer.is_none());
    }

    #[tokio::test]
    async fn test_empty_retrieval_is_a_complete_response() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(
            store,
            Arc::new(CountingEmbedder::new()),
            Some(Arc::new(EchoGenerator)),
            0,
            30,
        );

        let response = e
            .answer("anything", "u1", &RetrievalOptions::default())
            .await
            .unwrap();

        assert_eq!(response.result_count, 0);
        assert!(response.answer.is_none());
        assert!(!response.generation_skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_retrieval_times_out() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let e = engine(
            store,
            Arc::new(CountingEmbedder::slow(Duration::from_secs(10))),
            None,
            0,
            1,
        );

        let err = e
            .answer("anvils", "u1", &RetrievalOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_generation_degrades_within_deadline() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let e = engine(
            store,
            Arc::new(CountingEmbedder::new()),
            Some(Arc::new(SlowGenerator(Duration::from_secs(60)))),
            0,
            2,
        );

        let began = tokio::time::Instant::now();
        let response = e
            .answer("anvils", "u1", &RetrievalOptions::default())
            .await
            .unwrap();

        assert!(began.elapsed() <= Duration::from_secs(3));
        assert!(response.generation_skipped);
        assert!(response.answer.is_none());
        assert!(!response.context.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_answer_still_caches_scan() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let e = engine(
            store.clone(),
            Arc::new(CountingEmbedder::new()),
            Some(Arc::new(SlowGenerator(Duration::from_secs(60)))),
            600,
            30,
        );

        let options = RetrievalOptions::default();
        let cancelled =
            tokio::time::timeout(Duration::from_secs(5), e.answer("anvils", "u1", &options)).await;
        assert!(cancelled.is_err());

        // Let the guard's spawned cache write run.
        tokio::time::sleep(Duration::from_millis(1)).await;

        let probe = QueryCache::new(store, 600);
        let key = cache_key("anvils", "u1", &options);
        let hit = probe
            .get(&key, Utc::now().timestamp())
            .await
            .unwrap()
            .expect("scan result should be cached after cancellation");
        assert!(hit.answer.is_none());
        assert!(hit.generation_skipped);
        assert_eq!(hit.result_count, 2);
    }

    #[tokio::test]
    async fn test_blank_query_rejected() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(store, Arc::new(CountingEmbedder::new()), None, 0, 30);
        let err = e
            .answer("   ", "u1", &RetrievalOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_research_content_prefers_summary() {
        assert_eq!(
            research_content(&serde_json::json!({"summary": "s", "x": 1})),
            "s"
        );
        assert_eq!(research_content(&serde_json::json!({"x": 1})), r#"{"x":1}"#);
    }

}
