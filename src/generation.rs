//! Answer-generation collaborator.
//!
//! Generation is an opaque external capability: given the merged retrieval
//! context and the user query, produce a natural-language answer. A
//! generation failure never fails the retrieval call — the orchestrator
//! returns the raw context with a `generation_skipped` flag instead — so
//! this seam reports plain `anyhow` errors rather than the engine taxonomy.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::models::{ContextItem, ContextSource};

/// Natural-language generation capability consumed by the orchestrator.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, context: &[ContextItem], query: &str) -> Result<String>;
}

/// Generator backed by an OpenAI-compatible `POST {api_base}/chat/completions`
/// endpoint. Requires the `OPENAI_API_KEY` environment variable.
pub struct HttpGenerator {
    model: String,
    api_base: String,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("generation.model required for openai provider")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            api_base: config.api_base.clone(),
            client,
        })
    }
}

/// Render the merged context into a prompt block, each item labeled with
/// its source for citation.
pub fn render_context(context: &[ContextItem]) -> String {
    let mut out = String::new();
    for item in context {
        let label = match item.source {
            ContextSource::CompanyResearch => "company research",
            ContextSource::Chunk => "knowledge base",
        };
        out.push_str(&format!(
            "[{} | {} | similarity {:.2}]\n{}\n\n",
            label, item.title, item.similarity, item.content
        ));
    }
    out
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, context: &[ContextItem], query: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY not set")?;

        let system = "Answer the user's question using only the provided context. \
                      Cite which context item supports each claim. If the context is \
                      insufficient, say so.";
        let user = format!("Context:\n{}\nQuestion: {}", render_context(context), query);

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("generation API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .context("invalid response: missing message content")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_context_labels_sources() {
        let context = vec![
            ContextItem {
                source: ContextSource::CompanyResearch,
                similarity: 0.91,
                title: "Acme Corp".to_string(),
                content: "Acme builds anvils.".to_string(),
            },
            ContextItem {
                source: ContextSource::Chunk,
                similarity: 0.72,
                title: "Q3 report".to_string(),
                content: "Revenue grew 12%.".to_string(),
            },
        ];
        let rendered = render_context(&context);
        assert!(rendered.contains("[company research | Acme Corp | similarity 0.91]"));
        assert!(rendered.contains("[knowledge base | Q3 report | similarity 0.72]"));
        // Company research comes first in the merged ordering.
        assert!(rendered.find("Acme").unwrap() < rendered.find("Q3").unwrap());
    }
}
