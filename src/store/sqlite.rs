//! SQLite [`Store`] backend (sqlx, WAL journal).
//!
//! Embeddings are stored as little-endian f32 BLOBs next to their chunks;
//! similarity scoring happens in Rust over the candidate rows, which keeps
//! the scan linear and auditable at the corpus sizes this engine targets.
//! Tag filters operate on the `tags_json` column after fetch.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{EngineError, Result};
use crate::models::{
    Chunk, CompanyResearchEntry, Document, DocumentQuery, DocumentStatus, KnowledgeBaseStats,
    UsageLogEntry, UsageSummary,
};

use super::{ChunkCandidate, ResearchCandidate, Store};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_tags(tags_json: &str) -> Vec<String> {
    serde_json::from_str(tags_json).unwrap_or_default()
}

fn tags_match_any(doc_tags: &[String], filter: &[String]) -> bool {
    filter.is_empty() || doc_tags.iter().any(|t| filter.contains(t))
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let status_raw: String = row.get("status");
    let status = DocumentStatus::parse(&status_raw)
        .ok_or_else(|| EngineError::Storage(format!("unknown document status: {}", status_raw)))?;
    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        source_url: row.get("source_url"),
        file_type: row.get("file_type"),
        size_bytes: row.get("size_bytes"),
        tags: parse_tags(&row.get::<String, _>("tags_json")),
        status,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, owner_id, title, source_url, file_type, size_bytes, tags_json,
                 status, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.title)
        .bind(&doc.source_url)
        .bind(&doc.file_type)
        .bind(doc.size_bytes)
        .bind(serde_json::to_string(&doc.tags).unwrap_or_else(|_| "[]".to_string()))
        .bind(doc.status.as_str())
        .bind(&doc.error)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn transition_status(
        &self,
        id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
        error: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE documents SET status = ?, error = ?, updated_at = ? \
             WHERE id = ? AND status IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(error)
            .bind(now)
            .bind(id);
        for status in from {
            q = q.bind(status.as_str());
        }
        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_documents(
        &self,
        owner_id: &str,
        query: &DocumentQuery,
    ) -> Result<(Vec<Document>, i64)> {
        // Deterministic ordering: most-recent-first, then id.
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE owner_id = ? ORDER BY updated_at DESC, id ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let search_lower = query.search.as_ref().map(|s| s.to_lowercase());
        let mut matching = Vec::new();
        for row in &rows {
            let doc = row_to_document(row)?;
            if let Some(ref needle) = search_lower {
                if !doc.title.to_lowercase().contains(needle) {
                    continue;
                }
            }
            if !tags_match_any(&doc.tags, &query.tags) {
                continue;
            }
            matching.push(doc);
        }

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
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_embeddings WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Retry-safe: drop anything a previous partial attempt left behind.
        sqlx::query("DELETE FROM chunk_embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, content) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO chunk_embeddings (chunk_id, document_id, embedding, dims) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(vec_to_blob(embedding))
            .bind(embedding.len() as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn chunk_candidates(
        &self,
        owner_id: &str,
        filter_tags: &[String],
    ) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id, c.document_id, c.chunk_index, c.content,
                   d.title, d.tags_json, d.created_at, e.embedding
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            JOIN chunk_embeddings e ON e.chunk_id = c.id
            WHERE d.owner_id = ? AND d.status = 'completed'
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let tags = parse_tags(&row.get::<String, _>("tags_json"));
            if !tags_match_any(&tags, filter_tags) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            candidates.push(ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                document_title: row.get("title"),
                chunk_index: row.get("chunk_index"),
                content: row.get("content"),
                embedding: blob_to_vec(&blob),
                created_at: row.get("created_at"),
            });
        }
        Ok(candidates)
    }

    async fn knowledge_base_stats(&self, owner_id: &str) -> Result<KnowledgeBaseStats> {
        let document_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE owner_id = ?")
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await?;

        let chunk_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE d.owner_id = ?",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        let tag_rows = sqlx::query("SELECT tags_json FROM documents WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        let mut tag_counts: HashMap<String, i64> = HashMap::new();
        for row in &tag_rows {
            for tag in parse_tags(&row.get::<String, _>("tags_json")) {
                *tag_counts.entry(tag).or_insert(0) += 1;
            }
        }
        let mut tag_counts: Vec<(String, i64)> = tag_counts.into_iter().collect();
        tag_counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        Ok(KnowledgeBaseStats {
            document_count,
            chunk_count,
            tag_counts,
        })
    }

    async fn put_research_entry(
        &self,
        entry: &CompanyResearchEntry,
        embedding: &[f32],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO company_research_cache
                (id, cache_key, company_name, payload_json, confidence,
                 summary_embedding, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&entry.key)
        .bind(&entry.company_name)
        .bind(entry.payload.to_string())
        .bind(entry.confidence)
        .bind(vec_to_blob(embedding))
        .bind(entry.expires_at)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn research_lookup(&self, key: &str, now: i64) -> Result<Option<CompanyResearchEntry>> {
        // Soft delete: expired rows are never matched. Duplicate keys
        // resolve to the most recently refreshed entry (latest expiry).
        let row = sqlx::query(
            "SELECT * FROM company_research_cache \
             WHERE cache_key = ? AND expires_at > ? \
             ORDER BY expires_at DESC, id ASC LIMIT 1",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row_to_research_entry(&row)))
    }

    async fn research_candidates(&self, now: i64) -> Result<Vec<ResearchCandidate>> {
        let rows = sqlx::query(
            "SELECT * FROM company_research_cache WHERE expires_at > ? \
             ORDER BY expires_at DESC, id ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        // One candidate per key: the ordering above puts the latest expiry
        // first, so the first row per key wins.
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();
        for row in &rows {
            let key: String = row.get("cache_key");
            if !seen.insert(key) {
                continue;
            }
            let blob: Vec<u8> = row.get("summary_embedding");
            candidates.push(ResearchCandidate {
                entry: row_to_research_entry(row),
                embedding: blob_to_vec(&blob),
            });
        }
        Ok(candidates)
    }

    async fn cache_get(&self, cache_key: &str, now: i64) -> Result<Option<String>> {
        let result: Option<String> = sqlx::query_scalar(
            "SELECT result_json FROM search_cache WHERE cache_key = ? AND expires_at > ?",
        )
        .bind(cache_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    async fn cache_put(
        &self,
        cache_key: &str,
        owner_id: &str,
        result_json: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<()> {
        // Last-writer-wins: concurrent misses recompute the same result.
        sqlx::query(
            "INSERT OR REPLACE INTO search_cache \
             (cache_key, owner_id, result_json, created_at, expires_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(cache_key)
        .bind(owner_id)
        .bind(result_json)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cache_purge_expired(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_usage(&self, entry: &UsageLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_log
                (id, owner_id, query, classification, options_json, result_count,
                 top_similarity, latency_ms, satisfaction, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.owner_id)
        .bind(&entry.query)
        .bind(&entry.classification)
        .bind(&entry.options_json)
        .bind(entry.result_count)
        .bind(entry.top_similarity)
        .bind(entry.latency_ms)
        .bind(entry.satisfaction)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_summary(&self, owner_id: &str, since: i64, limit: i64) -> Result<UsageSummary> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(AVG(latency_ms), 0.0) AS avg_latency,
                   COALESCE(AVG(top_similarity), 0.0) AS avg_similarity,
                   AVG(satisfaction) AS avg_satisfaction
            FROM (
                SELECT latency_ms, top_similarity, satisfaction
                FROM usage_log
                WHERE owner_id = ? AND created_at >= ?
                ORDER BY created_at DESC
                LIMIT ?
            )
            "#,
        )
        .bind(owner_id)
        .bind(since)
        .bind(limit)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageSummary {
            total_queries: row.get("total"),
            avg_latency_ms: row.get("avg_latency"),
            avg_top_similarity: row.get("avg_similarity"),
            avg_satisfaction: row.get("avg_satisfaction"),
        })
    }

    async fn delete_usage_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM usage_log WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_research_entry(row: &sqlx::sqlite::SqliteRow) -> CompanyResearchEntry {
    let payload_raw: String = row.get("payload_json");
    CompanyResearchEntry {
        key: row.get("cache_key"),
        company_name: row.get("company_name"),
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        confidence: row.get("confidence"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}
