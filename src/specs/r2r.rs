use crate::types::Passage;
use serde::{Deserialize, Serialize};

/// --- R2R v3 RETRIEVAL SCHEMA ---

#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub search_settings: SearchSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchSettings {
    pub limit: usize,
}

/// `POST /v3/retrieval/search` response. Fields without a default are required.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponseV3 {
    pub results: SearchResults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResults {
    pub chunk_search_results: Vec<ChunkSearchResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkSearchResult {
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl From<ChunkSearchResult> for Passage {
    fn from(chunk: ChunkSearchResult) -> Self {
        Passage {
            text: chunk.text,
            relevance_score: chunk.score,
            metadata: chunk.metadata,
        }
    }
}

impl SearchResponseV3 {
    pub fn into_passages(self) -> Vec<Passage> {
        self.results
            .chunk_search_results
            .into_iter()
            .map(Passage::from)
            .collect()
    }
}
