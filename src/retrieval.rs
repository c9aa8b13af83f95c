use async_trait::async_trait;

use crate::config::RetrievalSettings;
use crate::constants::R2R_SEARCH_PATH;
use crate::specs::r2r::{SearchRequest, SearchResponseV3, SearchSettings};
use crate::str_utils::snippet;
use crate::types::{BenchError, Passage, Result};

/// Vector-search backend returning passages in relevance order.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Passage>>;
}

/// Joins passages into one context block, preserving backend order.
pub fn join_passages(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// R2R-compatible `/v3/retrieval/search` client.
pub struct HttpRetriever {
    http: reqwest::Client,
    search_url: String,
    api_key: String,
}

impl HttpRetriever {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            search_url: format!("{}{}", base_url.trim_end_matches('/'), R2R_SEARCH_PATH),
            api_key: api_key.to_string(),
        }
    }

    pub fn from_settings(http: reqwest::Client, settings: &RetrievalSettings) -> Result<Self> {
        match settings.resolve_api_key() {
            Some(key) => Ok(Self::new(http, &settings.base_url, &key)),
            None => Err(BenchError::Config(format!(
                "retrieval backend has no API key (set {})",
                settings.api_key_env
            ))
            .into()),
        }
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    #[tracing::instrument(level = "debug", skip(self, query), fields(url = %self.search_url))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Passage>> {
        let body = SearchRequest {
            query,
            search_settings: SearchSettings { limit },
        };

        let response = self
            .http
            .post(&self.search_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| BenchError::Retrieval(format!("transport: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BenchError::Retrieval(format!("body read: {}", e)))?;
        if !status.is_success() {
            return Err(BenchError::Retrieval(format!(
                "HTTP {}: {}",
                status,
                snippet(&text, 300)
            ))
            .into());
        }

        let parsed: SearchResponseV3 = serde_json::from_str(&text)
            .map_err(|e| BenchError::Retrieval(format!("unexpected response shape: {}", e)))?;
        let passages = parsed.into_passages();
        tracing::info!("[RETRIEVAL] {} passages (limit {})", passages.len(), limit);
        Ok(passages)
    }
}
