//! Embedding collaborator abstraction and vector utilities.
//!
//! The engine treats text embedding as an external capability behind the
//! [`Embedder`] trait, so tests can substitute deterministic fakes. The
//! shipped implementation, [`HttpEmbedder`], calls an OpenAI-compatible
//! embeddings endpoint with batching, retry, and exponential backoff.
//!
//! Vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 BLOB codec for
//!   SQLite storage
//!
//! # Retry strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{EngineError, Result};

/// Text-embedding capability consumed by ingestion and retrieval.
///
/// All embeddings produced by one engine instance share a fixed dimension;
/// anything else is a data-integrity error.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text (e.g. a retrieval query).
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vecs = self.embed_batch(&[text.to_string()]).await?;
        vecs.pop()
            .ok_or_else(|| EngineError::Embedding("empty embedding response".to_string()))
    }

    /// Fixed system-wide embedding dimension.
    fn dims(&self) -> usize;
}

/// Embedder backed by an OpenAI-compatible `POST {api_base}/embeddings`
/// endpoint. Requires the `OPENAI_API_KEY` environment variable.
pub struct HttpEmbedder {
    model: String,
    dims: usize,
    api_base: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            EngineError::InvalidInput("embedding.model required for openai provider".to_string())
        })?;
        let dims = config.dims.ok_or_else(|| {
            EngineError::InvalidInput("embedding.dims required for openai provider".to_string())
        })?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(EngineError::InvalidInput(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Embedding(e.to_string()))?;
        Ok(Self {
            model,
            dims,
            api_base: config.api_base.clone(),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EngineError::Embedding("OPENAI_API_KEY not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let url = format!("{}/embeddings", self.api_base.trim_end_matches('/'));
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                warn!(attempt, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EngineError::Embedding(e.to_string()))?;
                        let vecs = parse_embedding_response(&json)?;
                        for v in &vecs {
                            if v.len() != self.dims {
                                return Err(EngineError::Embedding(format!(
                                    "provider returned {}-dim vector, expected {}",
                                    v.len(),
                                    self.dims
                                )));
                            }
                        }
                        return Ok(vecs);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(EngineError::Embedding(format!(
                            "embedding API error {}: {}",
                            status, text
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let text = response.text().await.unwrap_or_default();
                    return Err(EngineError::Embedding(format!(
                        "embedding API error {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(EngineError::Embedding(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::Embedding("embedding failed after retries".to_string())))
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EngineError::Embedding("invalid response: missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                EngineError::Embedding("invalid response: missing embedding".to_string())
            })?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`. Defined as `0.0` when either vector
/// has zero norm, is empty, or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
