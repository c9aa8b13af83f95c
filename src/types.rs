use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing_error::SpanTrace;

/// --- PIPELINE VOCABULARY ---

/// Output stream a chunk belongs to. `Table` is the merge stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Database,
    Web,
    Table,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Web => "web",
            Self::Table => "table",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-submitted query text. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Query(String);

impl Query {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(BenchError::InvalidQuery("query must not be empty".to_string()).into());
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 60)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One retrieved knowledge-base passage, in backend order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passage {
    pub text: String,
    pub relevance_score: f64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The unit emitted to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenChunk {
    pub stage: Stage,
    pub content: String,
}

impl TokenChunk {
    pub fn new(stage: Stage, content: impl Into<String>) -> Self {
        Self {
            stage,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Completion error at {endpoint} (model {model}): {cause}")]
    Completion {
        endpoint: String,
        model: String,
        cause: String,
    },

    #[error(
        "No first token within {:.1}s from model(s) {}{}",
        .timeout.as_secs_f64(),
        .models.join(" -> "),
        describe_cause(.last_error)
    )]
    FirstTokenTimeout {
        models: Vec<String>,
        timeout: Duration,
        last_error: Option<String>,
    },

    #[error("Stream from model {model} stalled for {:.1}s after first token", .idle.as_secs_f64())]
    StreamStalled { model: String, idle: Duration },

    #[error("Stage '{stage}' failed (model(s): {}): {source}", .models.join(", "))]
    Stage {
        stage: Stage,
        models: Vec<String>,
        /// True when chunks had already reached the caller.
        partial: bool,
        #[source]
        source: Box<BenchError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_cause(cause: &Option<String>) -> String {
    match cause {
        Some(c) => format!(" (last error: {})", c),
        None => String::new(),
    }
}

impl BenchError {
    /// Stage the failure happened in, if it was raised by a pipeline stage.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Tells "halted after partial output" apart from "no output at all".
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Stage { partial: true, .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Retrieval(_) => "RETRIEVAL_ERROR",
            Self::Completion { .. } => "COMPLETION_ERROR",
            Self::FirstTokenTimeout { .. } => "TIMEOUT_ERROR",
            Self::StreamStalled { .. } => "STREAM_STALLED",
            Self::Stage { source, .. } => source.code(),
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Timeouts are propagated exactly like completion failures.
    pub fn is_completion_failure(&self) -> bool {
        match self {
            Self::Completion { .. } | Self::FirstTokenTimeout { .. } | Self::StreamStalled { .. } => {
                true
            }
            Self::Stage { source, .. } => source.is_completion_failure(),
            _ => false,
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self.inner {
            BenchError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            BenchError::Retrieval(_)
            | BenchError::Completion { .. }
            | BenchError::Stage { .. } => StatusCode::BAD_GATEWAY,
            BenchError::FirstTokenTimeout { .. } | BenchError::StreamStalled { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            BenchError::Config(_)
            | BenchError::Io(_)
            | BenchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": self.inner.to_string(),
                "code": self.inner.code(),
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: BenchError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<BenchError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
