//! Core data models for the knowledge engine.
//!
//! These types represent the documents, chunks, research entries, and
//! retrieval results that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a document as ingestion advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// A document owned by a user, stored in SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub source_url: Option<String>,
    pub file_type: String,
    pub size_bytes: i64,
    /// Ordered tag set; order is preserved as supplied at ingestion.
    pub tags: Vec<String>,
    pub status: DocumentStatus,
    /// Failure reason when `status == Failed`.
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Caller-supplied metadata for a new document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A chunk of a document's text. Immutable after creation; deleted with
/// its owning document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
}

/// A cached company research profile, written by the external research
/// capability and read-only to this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyResearchEntry {
    /// Normalized company key (`name|industry|location`, lowercased).
    pub key: String,
    pub company_name: String,
    pub payload: serde_json::Value,
    /// Research confidence in [0, 1].
    pub confidence: f64,
    pub expires_at: i64,
    pub created_at: i64,
}

/// Filters and pagination for document listing.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    pub limit: i64,
    pub offset: i64,
    /// Match-any tag filter: a document matches if it carries any of these.
    pub tags: Vec<String>,
    /// Case-insensitive substring match on title.
    pub search: Option<String>,
}

impl Default for DocumentQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            tags: Vec::new(),
            search: None,
        }
    }
}

/// Retrieval options. Every field participates in the query-cache key, so
/// any change yields a distinct cache entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalOptions {
    pub match_count: usize,
    pub similarity_threshold: f32,
    #[serde(default)]
    pub filter_tags: Vec<String>,
    pub include_company_research: bool,
    pub company_match_count: usize,
    pub company_similarity_threshold: f32,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            match_count: 5,
            similarity_threshold: 0.35,
            filter_tags: Vec::new(),
            include_company_research: true,
            company_match_count: 2,
            company_similarity_threshold: 0.5,
        }
    }
}

/// A chunk that cleared the similarity threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub chunk_index: i64,
    pub content: String,
    pub similarity: f32,
    pub created_at: i64,
}

/// A company research entry that cleared its threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyMatch {
    pub key: String,
    pub company_name: String,
    pub payload: serde_json::Value,
    pub confidence: f64,
    pub similarity: f32,
    pub created_at: i64,
}

/// Output of the similarity retriever. The two pools are ranked and
/// truncated independently — they answer different questions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunks: Vec<ChunkMatch>,
    pub company_matches: Vec<CompanyMatch>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.company_matches.is_empty()
    }

    /// Highest similarity across both pools, for analytics.
    pub fn top_similarity(&self) -> f32 {
        let chunk_top = self.chunks.first().map(|c| c.similarity).unwrap_or(0.0);
        let company_top = self
            .company_matches
            .first()
            .map(|c| c.similarity)
            .unwrap_or(0.0);
        chunk_top.max(company_top)
    }

    pub fn result_count(&self) -> usize {
        self.chunks.len() + self.company_matches.len()
    }
}

/// Where a context item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    CompanyResearch,
    Chunk,
}

/// One item of merged context, annotated for downstream citation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub source: ContextSource,
    pub similarity: f32,
    pub title: String,
    pub content: String,
}

/// Final response from the retrieval orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResponse {
    pub query: String,
    pub answer: Option<String>,
    pub context: Vec<ContextItem>,
    pub result_count: usize,
    pub top_similarity: f32,
    /// True when generation was unavailable and the raw retrieval context
    /// was returned instead of failing the call.
    pub generation_skipped: bool,
    /// True when this response was served from the query cache.
    pub cached: bool,
}

/// One retrieval event, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub id: String,
    pub owner_id: String,
    pub query: String,
    pub classification: String,
    pub options_json: String,
    pub result_count: i64,
    pub top_similarity: f32,
    pub latency_ms: i64,
    pub satisfaction: Option<i64>,
    pub created_at: i64,
}

/// Aggregate over recent usage log entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_queries: i64,
    pub avg_latency_ms: f64,
    pub avg_top_similarity: f64,
    pub avg_satisfaction: Option<f64>,
}

/// Derived knowledge-base aggregate; always recomputed, never stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeBaseStats {
    pub document_count: i64,
    pub chunk_count: i64,
    /// Tag name → number of documents carrying it.
    pub tag_counts: Vec<(String, i64)>,
}
