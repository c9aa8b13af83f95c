/// Default knowledge-base backend.
pub const R2R_BASE_URL: &str = "https://api.cloud.sciphi.ai";
pub const R2R_SEARCH_PATH: &str = "/v3/retrieval/search";
pub const DEFAULT_RETRIEVAL_LIMIT: usize = 20;

/// Completion gateways
pub const REQUESTY_CHAT_COMPLETIONS: &str = "https://router.requesty.ai/v1/chat/completions";
pub const OPENROUTER_CHAT_COMPLETIONS: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Credential environment variables
pub const R2R_API_KEY_ENV: &str = "R2R_API_KEY";
pub const REQUESTY_API_KEY_ENV: &str = "REQUESTY_API_KEY";
pub const OPENROUTER_API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Stage models
pub const DATABASE_MODEL: &str = "deepinfra/meta-llama/Llama-3.3-70B-Instruct-Turbo";
pub const WEB_PRIMARY_MODEL: &str = "perplexity/sonar-reasoning";
pub const WEB_FALLBACK_MODEL: &str = "perplexity/sonar";
pub const MERGE_MODEL: &str = "google/gemini-2.0-flash-001";

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_FIRST_TOKEN_TIMEOUT_SECS: u64 = 45;

/// Attribution headers sent to the gateways.
pub const DEFAULT_REFERER: &str = "http://localhost:3000";
pub const DEFAULT_APP_TITLE: &str = "LCA Analysis Tool";

/// Context sent to the web stage in place of retrieved passages.
pub const WEB_STAGE_CONTEXT: &str =
    "Please search the web for relevant LCA and environmental metrics data.";

/// Streaming wire format
pub const SSE_DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;
pub const MAX_STREAM_DELTAS: usize = 100_000;

/// Server keep-alive cadence for the analyze SSE stream.
pub const SSE_KEEPALIVE_SECS: u64 = 15;
