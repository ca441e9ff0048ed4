//! Document ingestion pipeline: validate, chunk, embed, persist.
//!
//! A document moves `pending -> processing -> completed`, or to `failed`
//! with the error recorded on the row. The `pending -> processing`
//! transition is a conditional update, so two workers racing on the same
//! document cannot both process it. A failed ingestion leaves no chunk
//! rows behind and the document remains retryable.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::Chunker;
use crate::embedding::Embedder;
use crate::error::{EngineError, Result};
use crate::models::{
    Chunk, Document, DocumentMeta, DocumentQuery, DocumentStatus, KnowledgeBaseStats,
};
use crate::store::Store;

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, chunker: Chunker) -> Self {
        Self {
            store,
            embedder,
            chunker,
        }
    }

    /// Register a document and run it through the pipeline. Returns the
    /// final document record (status `completed`, or the error if any step
    /// failed — in which case the record is marked `failed` and retryable).
    pub async fn ingest_document(&self, meta: &DocumentMeta, content: &str) -> Result<Document> {
        if meta.owner_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("owner_id is required".to_string()));
        }
        if meta.title.trim().is_empty() {
            return Err(EngineError::InvalidInput("title is required".to_string()));
        }
        if content.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "document content is empty".to_string(),
            ));
        }

        let now = Utc::now().timestamp();
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            owner_id: meta.owner_id.clone(),
            title: meta.title.trim().to_string(),
            source_url: meta.source_url.clone(),
            file_type: meta
                .file_type
                .clone()
                .unwrap_or_else(|| "text/plain".to_string()),
            size_bytes: content.len() as i64,
            tags: meta.tags.clone(),
            status: DocumentStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.create_document(&doc).await?;

        self.process(&doc.id, content).await?;

        self.store
            .get_document(&doc.id)
            .await?
            .ok_or_else(|| EngineError::Storage("document vanished during ingestion".to_string()))
    }

    /// Re-run the pipeline for an existing `pending` or `failed` document.
    /// Returns `InvalidInput` if the document is missing or currently being
    /// processed by another worker.
    pub async fn reingest_document(&self, document_id: &str, content: &str) -> Result<Document> {
        if content.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "document content is empty".to_string(),
            ));
        }
        if self.store.get_document(document_id).await?.is_none() {
            return Err(EngineError::InvalidInput(format!(
                "document {} not found",
                document_id
            )));
        }

        self.process(document_id, content).await?;

        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| EngineError::Storage("document vanished during ingestion".to_string()))
    }

    async fn process(&self, document_id: &str, content: &str) -> Result<()> {
        let claimed = self
            .store
            .transition_status(
                document_id,
                &[DocumentStatus::Pending, DocumentStatus::Failed],
                DocumentStatus::Processing,
                None,
                Utc::now().timestamp(),
            )
            .await?;
        if !claimed {
            return Err(EngineError::InvalidInput(format!(
                "document {} is already being processed or completed",
                document_id
            )));
        }

        match self.chunk_embed_store(document_id, content).await {
            Ok(chunk_count) => {
                self.store
                    .transition_status(
                        document_id,
                        &[DocumentStatus::Processing],
                        DocumentStatus::Completed,
                        None,
                        Utc::now().timestamp(),
                    )
                    .await?;
                info!(document_id, chunk_count, "document ingested");
                Ok(())
            }
            Err(err) => {
                // Roll back any partial chunk rows, then record the failure
                // on the document so it stays retryable.
                if let Err(cleanup_err) = self.store.delete_chunks(document_id).await {
                    warn!(document_id, error = %cleanup_err, "chunk rollback failed");
                }
                self.store
                    .transition_status(
                        document_id,
                        &[DocumentStatus::Processing],
                        DocumentStatus::Failed,
                        Some(&err.to_string()),
                        Utc::now().timestamp(),
                    )
                    .await?;
                warn!(document_id, error = %err, "ingestion failed");
                Err(err)
            }
        }
    }

    async fn chunk_embed_store(&self, document_id: &str, content: &str) -> Result<usize> {
        let pieces: Vec<String> = self.chunker.chunk(content)?.collect();

        let embeddings = self.embedder.embed_batch(&pieces).await?;
        if embeddings.len() != pieces.len() {
            return Err(EngineError::Embedding(format!(
                "expected {} embeddings, provider returned {}",
                pieces.len(),
                embeddings.len()
            )));
        }

        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(i, content)| Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                chunk_index: i as i64,
                content,
            })
            .collect();

        let count = chunks.len();
        self.store
            .insert_chunks(document_id, &chunks, &embeddings)
            .await?;
        Ok(count)
    }

    pub async fn list_documents(
        &self,
        owner_id: &str,
        query: &DocumentQuery,
    ) -> Result<(Vec<Document>, i64)> {
        self.store.list_documents(owner_id, query).await
    }

    pub async fn delete_document(&self, owner_id: &str, document_id: &str) -> Result<()> {
        match self.store.get_document(document_id).await? {
            Some(doc) if doc.owner_id == owner_id => self.store.delete_document(document_id).await,
            _ => Err(EngineError::InvalidInput(format!(
                "document {} not found",
                document_id
            ))),
        }
    }

    pub async fn knowledge_base_stats(&self, owner_id: &str) -> Result<KnowledgeBaseStats> {
        self.store.knowledge_base_stats(owner_id).await
    }
}
