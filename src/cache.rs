//! Query-result cache and usage analytics.
//!
//! Cache keys are a SHA-256 digest over the normalized query, owner, and
//! the full serialized option set, so any option change addresses a
//! different entry. Expiry is lazy on read, with an explicit purge for
//! reclaiming space. Writes are last-writer-wins.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{RagResponse, RetrievalOptions, RetrievalResult, UsageSummary};
use crate::store::Store;

/// Compute the cache key for a query. The query is trimmed and
/// case-folded; owner and options are serialized into the digest so
/// entries never leak across owners or option sets.
pub fn cache_key(query: &str, owner_id: &str, options: &RetrievalOptions) -> String {
    let normalized = query.trim().to_lowercase();
    let options_json =
        serde_json::to_string(options).unwrap_or_else(|_| "{}".to_string());

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(owner_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(options_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// TTL cache over complete answers. A `ttl_secs` of zero disables
/// caching entirely.
pub struct QueryCache {
    store: Arc<dyn Store>,
    ttl_secs: i64,
}

impl QueryCache {
    pub fn new(store: Arc<dyn Store>, ttl_secs: i64) -> Self {
        Self { store, ttl_secs }
    }

    pub fn enabled(&self) -> bool {
        self.ttl_secs > 0
    }

    pub async fn get(&self, key: &str, now: i64) -> Result<Option<RagResponse>> {
        if !self.enabled() {
            return Ok(None);
        }
        let Some(json) = self.store.cache_get(key, now).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<RagResponse>(&json) {
            Ok(response) => Ok(Some(response)),
            Err(err) => {
                // An unreadable row is treated as a miss; the fresh write
                // will replace it.
                debug!(key, error = %err, "discarding unreadable cache entry");
                Ok(None)
            }
        }
    }

    pub async fn put(
        &self,
        key: &str,
        owner_id: &str,
        response: &RagResponse,
        now: i64,
    ) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let json = serde_json::to_string(response)
            .map_err(|e| crate::error::EngineError::Storage(e.to_string()))?;
        self.store
            .cache_put(key, owner_id, &json, now, now + self.ttl_secs)
            .await
    }

    /// Delete expired rows. Returns the number removed.
    pub async fn purge_expired(&self, now: i64) -> Result<u64> {
        self.store.cache_purge_expired(now).await
    }
}

/// Coarse query classification recorded with each usage row, derived from
/// which candidate pools contributed matches.
pub fn classify_query(result: &RetrievalResult) -> &'static str {
    match (!result.chunks.is_empty(), !result.company_matches.is_empty()) {
        (true, true) => "mixed",
        (true, false) => "knowledge",
        (false, true) => "company",
        (false, false) => "unanswered",
    }
}

/// Append-only recorder for retrieval events plus the aggregate read side.
pub struct AnalyticsRecorder {
    store: Arc<dyn Store>,
}

impl AnalyticsRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        owner_id: &str,
        query: &str,
        options: &RetrievalOptions,
        result: &RetrievalResult,
        latency_ms: i64,
    ) -> Result<()> {
        self.record_event(
            owner_id,
            query,
            options,
            classify_query(result),
            result.result_count() as i64,
            result.top_similarity(),
            latency_ms,
        )
        .await
    }

    /// Lower-level append for events without a live retrieval result, such
    /// as cache hits.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_event(
        &self,
        owner_id: &str,
        query: &str,
        options: &RetrievalOptions,
        classification: &str,
        result_count: i64,
        top_similarity: f32,
        latency_ms: i64,
    ) -> Result<()> {
        let entry = crate::models::UsageLogEntry {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            query: query.to_string(),
            classification: classification.to_string(),
            options_json: serde_json::to_string(options)
                .unwrap_or_else(|_| "{}".to_string()),
            result_count,
            top_similarity,
            latency_ms,
            satisfaction: None,
            created_at: Utc::now().timestamp(),
        };
        self.store.append_usage(&entry).await
    }

    /// Aggregate usage over the last `days`, considering at most `limit`
    /// most recent entries.
    pub async fn usage_summary(
        &self,
        owner_id: &str,
        days: i64,
        limit: i64,
    ) -> Result<UsageSummary> {
        let since = Utc::now().timestamp() - days.max(0) * 86_400;
        self.store.usage_summary(owner_id, since, limit).await
    }

    /// Drop usage rows older than `days`. Returns the purged count.
    pub async fn purge_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - days.max(0) * 86_400;
        self.store.delete_usage_before(cutoff).await
    }
}
