//! Read side of the company research cache.
//!
//! Entries are written and refreshed by the external company-research
//! capability; this engine only normalizes lookup keys and reads live
//! entries. Expiry is lazy: a row past its `expires_at` is treated as
//! absent whether or not it has been physically purged. When duplicate
//! keys exist, the entry with the later expiry (most recently refreshed)
//! wins.

use std::sync::Arc;

use crate::error::Result;
use crate::models::CompanyResearchEntry;
use crate::store::Store;

/// Build the normalized cache key for a company identity.
///
/// Name plus optional industry/location disambiguators, lowercased and
/// whitespace-collapsed, joined with `|`. The same normalization must be
/// used by the research capability on the write side.
pub fn normalize_company_key(name: &str, industry: Option<&str>, location: Option<&str>) -> String {
    let norm = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    format!(
        "{}|{}|{}",
        norm(name),
        industry.map(norm).unwrap_or_default(),
        location.map(norm).unwrap_or_default()
    )
}

/// Read-only view over cached company research.
pub struct ResearchCache {
    store: Arc<dyn Store>,
}

impl ResearchCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Look up the live entry for a normalized key, if any.
    pub async fn lookup(&self, key: &str, now: i64) -> Result<Option<CompanyResearchEntry>> {
        self.store.research_lookup(key, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn entry(key: &str, expires_at: i64, confidence: f64) -> CompanyResearchEntry {
        CompanyResearchEntry {
            key: key.to_string(),
            company_name: "Acme".to_string(),
            payload: serde_json::json!({ "summary": "Acme builds anvils" }),
            confidence,
            expires_at,
            created_at: 0,
        }
    }

    #[test]
    fn test_normalize_company_key() {
        assert_eq!(
            normalize_company_key("  Acme   Corp ", Some("Manufacturing"), None),
            "acme corp|manufacturing|"
        );
        assert_eq!(
            normalize_company_key("ACME CORP", Some("manufacturing"), Some("Berlin")),
            normalize_company_key("acme corp", Some("Manufacturing"), Some("berlin"))
        );
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResearchCache::new(store.clone());
        let now = 1_000;

        store
            .put_research_entry(&entry("acme||", now - 1, 0.9), &[1.0, 0.0])
            .await
            .unwrap();

        assert!(cache.lookup("acme||", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_later_expiry_wins_for_duplicate_keys() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResearchCache::new(store.clone());
        let now = 1_000;

        store
            .put_research_entry(&entry("acme||", now + 100, 0.5), &[1.0, 0.0])
            .await
            .unwrap();
        store
            .put_research_entry(&entry("acme||", now + 500, 0.95), &[1.0, 0.0])
            .await
            .unwrap();

        let hit = cache.lookup("acme||", now).await.unwrap().unwrap();
        assert_eq!(hit.expires_at, now + 500);
        assert!((hit.confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_key_is_absent() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResearchCache::new(store);
        assert!(cache.lookup("nobody||", 0).await.unwrap().is_none());
    }
}
