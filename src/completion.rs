use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::config::EndpointSettings;
use crate::constants::{MAX_LINE_LENGTH, MAX_STREAM_DELTAS};
use crate::logging::StreamMetric;
use crate::specs::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::sse::{parse_frame, FrameEvent};
use crate::str_utils::snippet;
use crate::types::{BenchError, ObservedError, Result, Stage};

/// Lazy sequence of non-empty text deltas from one completion attempt.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone)]
pub struct CompletionEndpoint {
    pub name: String,
    pub url: String,
    api_key: String,
    pub referer: Option<String>,
    pub title: Option<String>,
}

impl CompletionEndpoint {
    pub fn new(name: &str, url: &str, api_key: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            api_key: api_key.to_string(),
            referer: None,
            title: None,
        }
    }

    pub fn from_settings(name: &str, settings: &EndpointSettings) -> Result<Self> {
        let api_key = match settings.resolve_api_key() {
            Some(k) => k,
            None => {
                return Err(BenchError::Config(format!(
                    "endpoint '{}' has no API key (set {})",
                    name, settings.api_key_env
                ))
                .into())
            }
        };
        Ok(Self {
            name: name.to_string(),
            url: settings.url.clone(),
            api_key,
            referer: settings.referer.clone(),
            title: settings.title.clone(),
        })
    }
}

/// One OpenAI-compatible chat completions backend. Cheap to clone; clones
/// share the connection pool and the in-flight limit.
#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    endpoint: Arc<CompletionEndpoint>,
    limiter: Arc<Semaphore>,
    max_deltas: usize,
}

enum Attempt {
    Finished,
    /// Nothing reached the caller yet; the non-streaming call may still succeed.
    FailedEarly(String),
    FailedMidStream(String),
}

impl CompletionClient {
    pub fn new(http: reqwest::Client, endpoint: CompletionEndpoint, max_concurrent: usize) -> Self {
        Self {
            http,
            endpoint: Arc::new(endpoint),
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_deltas: MAX_STREAM_DELTAS,
        }
    }

    /// Caps content frames per stream; keepalives and separators are not counted.
    pub fn with_max_deltas(mut self, max_deltas: usize) -> Self {
        self.max_deltas = max_deltas.max(1);
        self
    }

    fn error(&self, model: &str, cause: impl Into<String>) -> ObservedError {
        BenchError::Completion {
            endpoint: self.endpoint.name.clone(),
            model: model.to_string(),
            cause: cause.into(),
        }
        .into()
    }

    fn post(&self, request: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(&self.endpoint.url)
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .json(request);
        if let Some(referer) = &self.endpoint.referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.endpoint.title {
            builder = builder.header("X-Title", title);
        }
        builder
    }

    async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BenchError::Internal("completion limiter closed".to_string()).into())
    }

    /// Single non-streaming call returning `choices[0].message.content`.
    pub async fn complete(&self, request: &ChatCompletionRequest) -> Result<String> {
        let _permit = self.acquire().await?;
        self.complete_unbounded(&request.non_streaming()).await
    }

    async fn complete_unbounded(&self, request: &ChatCompletionRequest) -> Result<String> {
        let model = request.model.as_str();
        let response = self
            .post(request)
            .send()
            .await
            .map_err(|e| self.error(model, format!("transport: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.error(model, format!("body read: {}", e)))?;
        if !status.is_success() {
            return Err(self.error(model, format!("HTTP {}: {}", status, snippet(&body, 300))));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| self.error(model, format!("unparsable body: {}", e)))?;
        match parsed.into_content() {
            Some(content) => Ok(content),
            None => Err(self.error(model, "response has no choices[0].message.content")),
        }
    }

    /// Streams the completion. On failure before the first delta, exactly one
    /// non-streaming call replaces the stream; a failure after that is final.
    pub fn stream(&self, request: ChatCompletionRequest, stage: Stage) -> DeltaStream {
        let client = self.clone();
        Box::pin(try_stream! {
            let _permit = client.acquire().await?;
            let mut metric = StreamMetric::new(stage, &request.model);

            if !request.stream {
                let text = client.complete_unbounded(&request).await?;
                metric.record_delta(&text);
                metric.log_summary();
                if !text.is_empty() {
                    yield text;
                }
            } else {
                let mut yielded = 0usize;
                let mut outcome = Attempt::Finished;

                match client.open(&request).await {
                    Err(cause) => outcome = Attempt::FailedEarly(cause),
                    Ok(response) => {
                        let bytes_stream = response
                            .bytes_stream()
                            .map(|r| r.map_err(std::io::Error::other));
                        let mut lines = FramedRead::new(
                            tokio_util::io::StreamReader::new(bytes_stream),
                            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
                        );
                        let mut delta_frames = 0usize;

                        while let Some(line_result) = lines.next().await {
                            let failure = match line_result {
                                Err(e) => Some(format!("body read: {}", e)),
                                Ok(line) => match parse_frame(&line) {
                                    FrameEvent::Delta { content, usage } => {
                                        delta_frames += 1;
                                        if usage.is_some() {
                                            metric.usage = usage;
                                        }
                                        if delta_frames > client.max_deltas {
                                            Some(format!("stream exceeded {} delta frames", client.max_deltas))
                                        } else {
                                            if !content.is_empty() {
                                                metric.record_delta(&content);
                                                yielded += 1;
                                                yield content;
                                            }
                                            None
                                        }
                                    }
                                    FrameEvent::Done => break,
                                    FrameEvent::Keepalive => {
                                        metric.keepalives += 1;
                                        None
                                    }
                                    FrameEvent::Malformed(reason) => {
                                        metric.record_malformed(&reason);
                                        None
                                    }
                                    FrameEvent::ProviderError(message) => {
                                        Some(format!("provider error frame: {}", message))
                                    }
                                },
                            };

                            if let Some(cause) = failure {
                                outcome = if yielded == 0 {
                                    Attempt::FailedEarly(cause)
                                } else {
                                    Attempt::FailedMidStream(cause)
                                };
                                break;
                            }
                        }
                    }
                }

                match outcome {
                    Attempt::Finished => metric.log_summary(),
                    Attempt::FailedMidStream(cause) => {
                        tracing::error!(
                            "[☁️  -> ⚙️ ] {} stream from {} failed after {} deltas: {}",
                            stage, request.model, yielded, cause
                        );
                        metric.log_summary();
                        Err::<(), _>(client.error(&request.model, format!("mid-stream failure: {}", cause)))?;
                    }
                    Attempt::FailedEarly(cause) => {
                        tracing::warn!(
                            "[☁️  -> ⚙️ ] {} stream from {} failed before first delta ({}), retrying without streaming",
                            stage, request.model, cause
                        );
                        metric.mode_fallback = true;
                        let text = client
                            .complete_unbounded(&request.non_streaming())
                            .await
                            .map_err(|e| {
                                let detail = match e.inner {
                                    BenchError::Completion { cause: detail, .. } => detail,
                                    other => other.to_string(),
                                };
                                client.error(
                                    &request.model,
                                    format!("streaming failed ({}); fallback failed: {}", cause, detail),
                                )
                            })?;
                        metric.record_delta(&text);
                        metric.log_summary();
                        if !text.is_empty() {
                            yield text;
                        }
                    }
                }
            }
        })
    }

    /// Sends the streaming request; an error string means nothing was received.
    async fn open(&self, request: &ChatCompletionRequest) -> std::result::Result<reqwest::Response, String> {
        tracing::debug!(
            "[⚙️  -> ☁️ ] POST {} model={} stream=true",
            self.endpoint.name,
            request.model
        );
        let response = self
            .post(request)
            .send()
            .await
            .map_err(|e| format!("transport: {}", e))?;

        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] {} status: {}", self.endpoint.name, status);
        if status.is_success() {
            return Ok(response);
        }
        let body = match response.text().await {
            Ok(text) => text,
            Err(_) => "Unknown error (failed to read response text)".to_string(),
        };
        Err(format!("HTTP {}: {}", status, snippet(&body, 300)))
    }
}
