use crate::types::Usage;
use serde::{Deserialize, Serialize};

/// --- OPENAI-COMPATIBLE CHAT COMPLETIONS SCHEMA ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Built fresh per stage and per attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    pub stream: bool,
}

impl ChatCompletionRequest {
    /// Same request for a different model, or with streaming toggled.
    pub fn with_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }

    pub fn non_streaming(&self) -> Self {
        Self {
            stream: false,
            ..self.clone()
        }
    }
}

/// Non-streaming response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChoice {
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    pub fn into_content(self) -> Option<String> {
        self.choices.into_iter().next().and_then(|c| c.message.content)
    }
}

/// One streamed `data:` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamPulse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<PulseChoice>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PulseChoice {
    #[serde(default)]
    pub delta: PulseDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PulseDelta {
    pub content: Option<String>,
}

/// Error object some gateways send mid-stream instead of a pulse.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderError {
    pub error: ProviderErrorDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderErrorDetails {
    pub message: String,
    pub code: Option<serde_json::Value>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
