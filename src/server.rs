//! JSON HTTP API over the engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Ingest a document |
//! | `GET`  | `/documents` | List documents (filter + pagination) |
//! | `DELETE` | `/documents/{id}` | Delete a document and its chunks |
//! | `GET`  | `/stats` | Knowledge-base aggregates |
//! | `POST` | `/retrieve` | Ranked matches without generation |
//! | `POST` | `/answer` | Full cached RAG answer |
//! | `GET`  | `/research` | Company research cache lookup |
//! | `GET`  | `/analytics` | Usage aggregates |
//! | `POST` | `/cleanup` | Purge expired cache rows and old usage logs |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_input", "message": "query is empty" } }
//! ```
//!
//! Codes mirror [`EngineError::code`]: `invalid_input` (400), `timeout`
//! (408), `embedding_error` (502), `storage_error` (500). Lookups that
//! find nothing return `not_found` (404).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::cache::{AnalyticsRecorder, QueryCache};
use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::generation::Generator;
use crate::ingest::IngestionPipeline;
use crate::models::{DocumentMeta, DocumentQuery, RetrievalOptions};
use crate::rag::RagEngine;
use crate::research::ResearchCache;
use crate::retrieve::SimilarityRetriever;
use crate::store::Store;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pipeline: Arc<IngestionPipeline>,
    engine: Arc<RagEngine>,
    analytics: Arc<AnalyticsRecorder>,
    cache: Arc<QueryCache>,
    research: Arc<ResearchCache>,
}

/// Starts the HTTP server on `[server].bind` with the given collaborators.
/// Runs until the process is terminated.
pub async fn run_server(
    config: &Config,
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let chunker = Chunker::new(config.chunking.target_size, config.chunking.overlap)?;
    let retriever = Arc::new(SimilarityRetriever::new(store.clone(), embedder.clone()));
    let state = AppState {
        pipeline: Arc::new(IngestionPipeline::new(store.clone(), embedder, chunker)),
        engine: Arc::new(RagEngine::new(
            retriever,
            generator,
            QueryCache::new(store.clone(), config.cache.search_ttl_secs),
            AnalyticsRecorder::new(store.clone()),
            config.retrieval.timeout_secs,
        )),
        analytics: Arc::new(AnalyticsRecorder::new(store.clone())),
        cache: Arc::new(QueryCache::new(store.clone(), config.cache.search_ttl_secs)),
        research: Arc::new(ResearchCache::new(store)),
        config,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_ingest).get(handle_list))
        .route("/documents/{id}", delete(handle_delete))
        .route("/stats", get(handle_stats))
        .route("/retrieve", post(handle_retrieve))
        .route("/answer", post(handle_answer))
        .route("/research", get(handle_research))
        .route("/analytics", get(handle_analytics))
        .route("/cleanup", post(handle_cleanup))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "http server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            EngineError::Embedding(_) => StatusCode::BAD_GATEWAY,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ Request / response bodies ============

#[derive(Deserialize)]
struct IngestRequest {
    #[serde(flatten)]
    meta: DocumentMeta,
    content: String,
}

#[derive(Deserialize)]
struct ListParams {
    owner_id: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
    /// Comma-separated tag list, match-any.
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    search: Option<String>,
}

#[derive(Deserialize)]
struct OwnerParams {
    owner_id: String,
}

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    owner_id: String,
    #[serde(default)]
    options: OptionOverrides,
}

/// Per-request overrides over the configured retrieval defaults.
#[derive(Deserialize, Default)]
struct OptionOverrides {
    match_count: Option<usize>,
    similarity_threshold: Option<f32>,
    filter_tags: Option<Vec<String>>,
    include_company_research: Option<bool>,
    company_match_count: Option<usize>,
    company_similarity_threshold: Option<f32>,
}

impl OptionOverrides {
    fn apply(self, mut base: RetrievalOptions) -> RetrievalOptions {
        if let Some(v) = self.match_count {
            base.match_count = v;
        }
        if let Some(v) = self.similarity_threshold {
            base.similarity_threshold = v;
        }
        if let Some(v) = self.filter_tags {
            base.filter_tags = v;
        }
        if let Some(v) = self.include_company_research {
            base.include_company_research = v;
        }
        if let Some(v) = self.company_match_count {
            base.company_match_count = v;
        }
        if let Some(v) = self.company_similarity_threshold {
            base.company_similarity_threshold = v;
        }
        base
    }
}

#[derive(Deserialize)]
struct ResearchParams {
    name: String,
    #[serde(default)]
    industry: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize)]
struct AnalyticsParams {
    owner_id: String,
    #[serde(default)]
    days: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct CleanupRequest {
    /// Usage rows older than this many days are deleted.
    #[serde(default = "default_cleanup_days")]
    days: i64,
}

fn default_cleanup_days() -> i64 {
    90
}

// ============ Handlers ============

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<impl IntoResponse, AppError> {
    let doc = state.pipeline.ingest_document(&req.meta, &req.content).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn handle_list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let query = DocumentQuery {
        limit: params.limit.unwrap_or(50),
        offset: params.offset.unwrap_or(0),
        tags: params
            .tags
            .map(|t| {
                t.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        search: params.search,
    };
    let (documents, total) = state.pipeline.list_documents(&params.owner_id, &query).await?;
    Ok(Json(serde_json::json!({ "documents": documents, "total": total })))
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<OwnerParams>,
) -> Result<impl IntoResponse, AppError> {
    state.pipeline.delete_document(&params.owner_id, &id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn handle_stats(
    State(state): State<AppState>,
    Query(params): Query<OwnerParams>,
) -> Result<impl IntoResponse, AppError> {
    let stats = state.pipeline.knowledge_base_stats(&params.owner_id).await?;
    Ok(Json(stats))
}

async fn handle_retrieve(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, AppError> {
    let options = req.options.apply(state.config.retrieval.default_options());
    let result = state
        .engine
        .retrieve(&req.query, &req.owner_id, &options)
        .await?;
    Ok(Json(result))
}

async fn handle_answer(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, AppError> {
    let options = req.options.apply(state.config.retrieval.default_options());
    let response = state
        .engine
        .answer(&req.query, &req.owner_id, &options)
        .await?;
    Ok(Json(response))
}

async fn handle_research(
    State(state): State<AppState>,
    Query(params): Query<ResearchParams>,
) -> Result<impl IntoResponse, AppError> {
    let key = crate::research::normalize_company_key(
        &params.name,
        params.industry.as_deref(),
        params.location.as_deref(),
    );
    let entry = state.research.lookup(&key, Utc::now().timestamp()).await?;
    match entry {
        Some(entry) => Ok(Json(entry)),
        None => Err(AppError {
            status: StatusCode::NOT_FOUND,
            code: "not_found".to_string(),
            message: format!("no live research entry for '{}'", params.name),
        }),
    }
}

async fn handle_analytics(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Result<impl IntoResponse, AppError> {
    let summary = state
        .analytics
        .usage_summary(
            &params.owner_id,
            params.days.unwrap_or(7),
            params.limit.unwrap_or(1000),
        )
        .await?;
    Ok(Json(summary))
}

async fn handle_cleanup(
    State(state): State<AppState>,
    Json(req): Json<CleanupRequest>,
) -> Result<impl IntoResponse, AppError> {
    let cache_purged = state.cache.purge_expired(Utc::now().timestamp()).await?;
    let usage_purged = state.analytics.purge_older_than(req.days).await?;
    Ok(Json(serde_json::json!({
        "cache_entries_purged": cache_purged,
        "usage_rows_purged": usage_purged,
    })))
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
