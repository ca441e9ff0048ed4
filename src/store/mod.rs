//! Storage abstraction for the knowledge engine.
//!
//! The [`Store`] trait defines all persistence operations the pipeline,
//! retriever, and orchestrator need, enabling pluggable backends: the
//! production SQLite store ([`sqlite::SqliteStore`]) and an in-memory store
//! ([`memory::MemoryStore`]) for tests.
//!
//! TTL-aware reads take `now` explicitly so expiry behaviour is
//! deterministic under test.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Chunk, CompanyResearchEntry, Document, DocumentQuery, DocumentStatus, KnowledgeBaseStats,
    UsageLogEntry, UsageSummary,
};

/// A chunk candidate for similarity scoring: chunk fields plus its stored
/// embedding and enough document metadata to build a match without another
/// round-trip.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub document_title: String,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: i64,
}

/// A company research candidate: the cached entry plus its summary embedding.
#[derive(Debug, Clone)]
pub struct ResearchCandidate {
    pub entry: CompanyResearchEntry,
    pub embedding: Vec<f32>,
}

/// Abstract storage backend.
///
/// Documents and chunks are written only by ingestion; the company research
/// table is written by the external research capability and read-only to
/// engine components. Usage log rows are append-only.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- documents ----

    /// Insert a new document record.
    async fn create_document(&self, doc: &Document) -> Result<()>;

    /// Fetch a document by id.
    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Atomically move a document from one of `from` statuses to `to`,
    /// recording `error` when present. Returns `false` when the document is
    /// missing or not in an allowed source status — the concurrency guard
    /// for per-document ingestion.
    async fn transition_status(
        &self,
        id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
        error: Option<&str>,
        now: i64,
    ) -> Result<bool>;

    /// Filtered, paginated listing: most-recent-first, then id, for stable
    /// pagination. Returns the page and the total match count.
    async fn list_documents(
        &self,
        owner_id: &str,
        query: &DocumentQuery,
    ) -> Result<(Vec<Document>, i64)>;

    /// Delete a document and (cascade) its chunks and embeddings.
    async fn delete_document(&self, id: &str) -> Result<()>;

    // ---- chunks ----

    /// Persist a document's chunks and their embeddings in one transaction.
    /// All-or-nothing: a failure leaves no partial rows behind.
    async fn insert_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<()>;

    /// Remove every chunk (and embedding) belonging to a document. Used to
    /// roll back a failed ingestion.
    async fn delete_chunks(&self, document_id: &str) -> Result<()>;

    /// All scoring candidates for an owner's completed documents,
    /// optionally restricted to documents carrying any of `filter_tags`.
    async fn chunk_candidates(
        &self,
        owner_id: &str,
        filter_tags: &[String],
    ) -> Result<Vec<ChunkCandidate>>;

    // ---- derived stats ----

    /// Recompute document/chunk/tag aggregates for an owner.
    async fn knowledge_base_stats(&self, owner_id: &str) -> Result<KnowledgeBaseStats>;

    // ---- company research cache ----

    /// Insert or refresh a research entry. Owned by the external
    /// company-research capability; engine components never call this.
    async fn put_research_entry(&self, entry: &CompanyResearchEntry, embedding: &[f32])
        -> Result<()>;

    /// Fetch the live entry for a normalized key, if any. Rows with
    /// `expires_at <= now` are treated as absent whether or not they have
    /// been purged; duplicate keys resolve to the latest expiry.
    async fn research_lookup(&self, key: &str, now: i64) -> Result<Option<CompanyResearchEntry>>;

    /// All non-expired research candidates with embeddings.
    async fn research_candidates(&self, now: i64) -> Result<Vec<ResearchCandidate>>;

    // ---- query cache ----

    /// Fetch an unexpired cached result for a key.
    async fn cache_get(&self, cache_key: &str, now: i64) -> Result<Option<String>>;

    /// Store (or replace) a cached result.
    async fn cache_put(
        &self,
        cache_key: &str,
        owner_id: &str,
        result_json: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<()>;

    /// Bulk-delete expired cache rows. Lazy expiry already hides them; this
    /// reclaims the space.
    async fn cache_purge_expired(&self, now: i64) -> Result<u64>;

    // ---- usage log ----

    /// Append one retrieval event.
    async fn append_usage(&self, entry: &UsageLogEntry) -> Result<()>;

    /// Aggregate usage over entries newer than `since`, considering at most
    /// `limit` most recent rows.
    async fn usage_summary(&self, owner_id: &str, since: i64, limit: i64) -> Result<UsageSummary>;

    /// Delete usage rows older than `cutoff`. Returns the purged count.
    async fn delete_usage_before(&self, cutoff: i64) -> Result<u64>;
}
