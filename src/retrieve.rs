//! Similarity retrieval across the chunk corpus and the company research
//! cache.
//!
//! The two candidate pools are scored, thresholded, ranked, and truncated
//! independently — chunks answer general knowledge questions, research
//! entries answer company-specific ones, and their score distributions
//! differ, so they carry distinct thresholds and counts and are never
//! collapsed into a single top-K.
//!
//! Ranking is fully deterministic: similarity descending, exact ties
//! broken by newest creation timestamp, then by id.

use std::sync::Arc;

use tracing::debug;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::Result;
use crate::models::{ChunkMatch, CompanyMatch, RetrievalOptions, RetrievalResult};
use crate::store::Store;

pub struct SimilarityRetriever {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
}

impl SimilarityRetriever {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Retrieve ranked matches for `query`. An empty result is a normal
    /// outcome, not an error; the call fails only when the query cannot be
    /// embedded or the store is unavailable.
    pub async fn retrieve(
        &self,
        query: &str,
        owner_id: &str,
        options: &RetrievalOptions,
    ) -> Result<RetrievalResult> {
        self.retrieve_at(query, owner_id, options, chrono::Utc::now().timestamp())
            .await
    }

    /// Like [`retrieve`](Self::retrieve) with an explicit clock, so expiry
    /// behaviour is deterministic under test.
    pub async fn retrieve_at(
        &self,
        query: &str,
        owner_id: &str,
        options: &RetrievalOptions,
        now: i64,
    ) -> Result<RetrievalResult> {
        if query.trim().is_empty() {
            return Ok(RetrievalResult::default());
        }

        let query_vec = self.embedder.embed(query).await?;

        let chunks = self
            .score_chunks(&query_vec, owner_id, options)
            .await?;

        let company_matches = if options.include_company_research {
            self.score_research(&query_vec, options, now).await?
        } else {
            Vec::new()
        };

        debug!(
            owner_id,
            chunk_matches = chunks.len(),
            company_matches = company_matches.len(),
            "retrieval scan complete"
        );

        Ok(RetrievalResult {
            chunks,
            company_matches,
        })
    }

    async fn score_chunks(
        &self,
        query_vec: &[f32],
        owner_id: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<ChunkMatch>> {
        let candidates = self
            .store
            .chunk_candidates(owner_id, &options.filter_tags)
            .await?;

        let mut matches: Vec<ChunkMatch> = candidates
            .into_iter()
            .filter_map(|c| {
                let similarity = cosine_similarity(query_vec, &c.embedding);
                if similarity < options.similarity_threshold {
                    return None;
                }
                Some(ChunkMatch {
                    chunk_id: c.chunk_id,
                    document_id: c.document_id,
                    document_title: c.document_title,
                    chunk_index: c.chunk_index,
                    content: c.content,
                    similarity,
                    created_at: c.created_at,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        matches.truncate(options.match_count);
        Ok(matches)
    }

    async fn score_research(
        &self,
        query_vec: &[f32],
        options: &RetrievalOptions,
        now: i64,
    ) -> Result<Vec<CompanyMatch>> {
        let candidates = self.store.research_candidates(now).await?;

        let mut matches: Vec<CompanyMatch> = candidates
            .into_iter()
            .filter_map(|c| {
                let similarity = cosine_similarity(query_vec, &c.embedding);
                if similarity < options.company_similarity_threshold {
                    return None;
                }
                Some(CompanyMatch {
                    key: c.entry.key,
                    company_name: c.entry.company_name,
                    payload: c.entry.payload,
                    confidence: c.entry.confidence,
                    similarity,
                    created_at: c.entry.created_at,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.key.cmp(&b.key))
        });
        matches.truncate(options.company_match_count);
        Ok(matches)
    }
}
