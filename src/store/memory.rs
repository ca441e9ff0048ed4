//! In-memory [`Store`] implementation for tests.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Semantics mirror
//! the SQLite backend, including lazy expiry and the all-or-nothing chunk
//! write, so engine components can be exercised without a database file.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Chunk, CompanyResearchEntry, Document, DocumentQuery, DocumentStatus, KnowledgeBaseStats,
    UsageLogEntry, UsageSummary,
};

use super::{ChunkCandidate, ResearchCandidate, Store};

struct StoredChunk {
    chunk: Chunk,
    embedding: Vec<f32>,
}

struct StoredResearch {
    entry: CompanyResearchEntry,
    embedding: Vec<f32>,
}

struct CachedResult {
    owner_id: String,
    result_json: String,
    expires_at: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<StoredChunk>>,
    research: RwLock<Vec<StoredResearch>>,
    cache: RwLock<HashMap<String, CachedResult>>,
    usage: RwLock<Vec<UsageLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tags_match_any(doc_tags: &[String], filter: &[String]) -> bool {
    filter.is_empty() || doc_tags.iter().any(|t| filter.contains(t))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_document(&self, doc: &Document) -> Result<()> {
        self.docs
            .write()
            .unwrap()
            .insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.docs.read().unwrap().get(id).cloned())
    }

    async fn transition_status(
        &self,
        id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
        error: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let mut docs = self.docs.write().unwrap();
        match docs.get_mut(id) {
            Some(doc) if from.contains(&doc.status) => {
                doc.status = to;
                doc.error = error.map(|e| e.to_string());
                doc.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_documents(
        &self,
        owner_id: &str,
        query: &DocumentQuery,
    ) -> Result<(Vec<Document>, i64)> {
        let docs = self.docs.read().unwrap();
        let search_lower = query.search.as_ref().map(|s| s.to_lowercase());

        let mut matching: Vec<Document> = docs
            .values()
            .filter(|d| d.owner_id == owner_id)
            .filter(|d| match &search_lower {
                Some(needle) => d.title.to_lowercase().contains(needle),
                None => true,
            })
            .filter(|d| tags_match_any(&d.tags, &query.tags))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as i64;
        let start = (query.offset.max(0) as usize).min(matching.len());
        let page: Vec<Document> = matching
            .into_iter()
            .skip(start)
            .take(query.limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        self.docs.write().unwrap().remove(id);
        self.chunks
            .write()
            .unwrap()
            .retain(|sc| sc.chunk.document_id != id);
        Ok(())
    }

    async fn insert_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        let mut stored = self.chunks.write().unwrap();
        stored.retain(|sc| sc.chunk.document_id != document_id);
        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            stored.push(StoredChunk {
                chunk: chunk.clone(),
                embedding: embedding.clone(),
            });
        }
        Ok(())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        self.chunks
            .write()
            .unwrap()
            .retain(|sc| sc.chunk.document_id != document_id);
        Ok(())
    }

    async fn chunk_candidates(
        &self,
        owner_id: &str,
        filter_tags: &[String],
    ) -> Result<Vec<ChunkCandidate>> {
        let docs = self.docs.read().unwrap();
        let chunks = self.chunks.read().unwrap();

        let candidates = chunks
            .iter()
            .filter_map(|sc| {
                let doc = docs.get(&sc.chunk.document_id)?;
                if doc.owner_id != owner_id
                    || doc.status != DocumentStatus::Completed
                    || !tags_match_any(&doc.tags, filter_tags)
                {
                    return None;
                }
                Some(ChunkCandidate {
                    chunk_id: sc.chunk.id.clone(),
                    document_id: sc.chunk.document_id.clone(),
                    document_title: doc.title.clone(),
                    chunk_index: sc.chunk.chunk_index,
                    content: sc.chunk.content.clone(),
                    embedding: sc.embedding.clone(),
                    created_at: doc.created_at,
                })
            })
            .collect();
        Ok(candidates)
    }

    async fn knowledge_base_stats(&self, owner_id: &str) -> Result<KnowledgeBaseStats> {
        let docs = self.docs.read().unwrap();
        let chunks = self.chunks.read().unwrap();

        let owner_docs: Vec<&Document> =
            docs.values().filter(|d| d.owner_id == owner_id).collect();
        let owner_ids: Vec<&str> = owner_docs.iter().map(|d| d.id.as_str()).collect();

        let chunk_count = chunks
            .iter()
            .filter(|sc| owner_ids.contains(&sc.chunk.document_id.as_str()))
            .count() as i64;

        let mut tag_counts: HashMap<String, i64> = HashMap::new();
        for doc in &owner_docs {
            for tag in &doc.tags {
                *tag_counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        let mut tag_counts: Vec<(String, i64)> = tag_counts.into_iter().collect();
        tag_counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        Ok(KnowledgeBaseStats {
            document_count: owner_docs.len() as i64,
            chunk_count,
            tag_counts,
        })
    }

    async fn put_research_entry(
        &self,
        entry: &CompanyResearchEntry,
        embedding: &[f32],
    ) -> Result<()> {
        self.research.write().unwrap().push(StoredResearch {
            entry: entry.clone(),
            embedding: embedding.to_vec(),
        });
        Ok(())
    }

    async fn research_lookup(&self, key: &str, now: i64) -> Result<Option<CompanyResearchEntry>> {
        let research = self.research.read().unwrap();
        Ok(research
            .iter()
            .filter(|sr| sr.entry.key == key && sr.entry.expires_at > now)
            .max_by_key(|sr| sr.entry.expires_at)
            .map(|sr| sr.entry.clone()))
    }

    async fn research_candidates(&self, now: i64) -> Result<Vec<ResearchCandidate>> {
        let research = self.research.read().unwrap();
        // Latest expiry wins per key.
        let mut best: HashMap<&str, &StoredResearch> = HashMap::new();
        for sr in research.iter().filter(|sr| sr.entry.expires_at > now) {
            match best.get(sr.entry.key.as_str()) {
                Some(existing) if existing.entry.expires_at >= sr.entry.expires_at => {}
                _ => {
                    best.insert(&sr.entry.key, sr);
                }
            }
        }
        Ok(best
            .into_values()
            .map(|sr| ResearchCandidate {
                entry: sr.entry.clone(),
                embedding: sr.embedding.clone(),
            })
            .collect())
    }

    async fn cache_get(&self, cache_key: &str, now: i64) -> Result<Option<String>> {
        let cache = self.cache.read().unwrap();
        Ok(cache
            .get(cache_key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.result_json.clone()))
    }

    async fn cache_put(
        &self,
        cache_key: &str,
        owner_id: &str,
        result_json: &str,
        _now: i64,
        expires_at: i64,
    ) -> Result<()> {
        self.cache.write().unwrap().insert(
            cache_key.to_string(),
            CachedResult {
                owner_id: owner_id.to_string(),
                result_json: result_json.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn cache_purge_expired(&self, now: i64) -> Result<u64> {
        let mut cache = self.cache.write().unwrap();
        let before = cache.len();
        cache.retain(|_, c| c.expires_at > now);
        Ok((before - cache.len()) as u64)
    }

    async fn append_usage(&self, entry: &UsageLogEntry) -> Result<()> {
        self.usage.write().unwrap().push(entry.clone());
        Ok(())
    }

    async fn usage_summary(&self, owner_id: &str, since: i64, limit: i64) -> Result<UsageSummary> {
        let usage = self.usage.read().unwrap();
        let mut recent: Vec<&UsageLogEntry> = usage
            .iter()
            .filter(|u| u.owner_id == owner_id && u.created_at >= since)
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit.max(0) as usize);

        if recent.is_empty() {
            return Ok(UsageSummary::default());
        }

        let n = recent.len() as f64;
        let ratings: Vec<i64> = recent.iter().filter_map(|u| u.satisfaction).collect();
        Ok(UsageSummary {
            total_queries: recent.len() as i64,
            avg_latency_ms: recent.iter().map(|u| u.latency_ms as f64).sum::<f64>() / n,
            avg_top_similarity: recent.iter().map(|u| u.top_similarity as f64).sum::<f64>() / n,
            avg_satisfaction: if ratings.is_empty() {
                None
            } else {
                Some(ratings.iter().sum::<i64>() as f64 / ratings.len() as f64)
            },
        })
    }

    async fn delete_usage_before(&self, cutoff: i64) -> Result<u64> {
        let mut usage = self.usage.write().unwrap();
        let before = usage.len();
        usage.retain(|u| u.created_at >= cutoff);
        Ok((before - usage.len()) as u64)
    }
}

impl MemoryStore {
    /// Number of usage log rows, for test assertions.
    pub fn usage_len(&self) -> usize {
        self.usage.read().unwrap().len()
    }

    /// Owner of a cached entry, for test assertions.
    pub fn cached_owner(&self, cache_key: &str) -> Option<String> {
        self.cache
            .read()
            .unwrap()
            .get(cache_key)
            .map(|c| c.owner_id.clone())
    }
}
