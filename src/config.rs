use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::RetrievalOptions;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_target_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_match_count")]
    pub match_count: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_company_match_count")]
    pub company_match_count: usize,
    #[serde(default = "default_company_similarity_threshold")]
    pub company_similarity_threshold: f32,
    #[serde(default = "default_include_company_research")]
    pub include_company_research: bool,
    /// Upper bound on total orchestrator latency, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            match_count: default_match_count(),
            similarity_threshold: default_similarity_threshold(),
            company_match_count: default_company_match_count(),
            company_similarity_threshold: default_company_similarity_threshold(),
            include_company_research: default_include_company_research(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetrievalConfig {
    /// Default retrieval options derived from configuration.
    pub fn default_options(&self) -> RetrievalOptions {
        RetrievalOptions {
            match_count: self.match_count,
            similarity_threshold: self.similarity_threshold,
            filter_tags: Vec::new(),
            include_company_research: self.include_company_research,
            company_match_count: self.company_match_count,
            company_similarity_threshold: self.company_similarity_threshold,
        }
    }
}

fn default_match_count() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.35
}
fn default_company_match_count() -> usize {
    2
}
fn default_company_similarity_threshold() -> f32 {
    0.5
}
fn default_include_company_research() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            api_base: default_api_base(),
            max_retries: default_max_retries(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_base: default_api_base(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// TTL for query-cache entries, in seconds.
    #[serde(default = "default_search_ttl_secs")]
    pub search_ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            search_ttl_secs: default_search_ttl_secs(),
        }
    }
}

fn default_search_ttl_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7430".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.target_size == 0 {
        anyhow::bail!("chunking.target_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.target_size {
        anyhow::bail!("chunking.overlap must be < chunking.target_size");
    }

    // Validate retrieval
    if config.retrieval.match_count == 0 {
        anyhow::bail!("retrieval.match_count must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.company_similarity_threshold) {
        anyhow::bail!("retrieval.company_similarity_threshold must be in [-1.0, 1.0]");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.cache.search_ttl_secs < 0 {
        anyhow::bail!("cache.search_ttl_secs must be >= 0");
    }

    Ok(config)
}
