use async_stream::try_stream;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::timeout;

use crate::completion::{CompletionClient, DeltaStream};
use crate::specs::openai::ChatCompletionRequest;
use crate::types::{BenchError, Result, Stage};

#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    pub primary: String,
    pub fallback: Option<String>,
    pub first_token_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl FallbackPolicy {
    pub fn new(primary: &str, first_token_timeout: Duration) -> Self {
        Self {
            primary: primary.to_string(),
            fallback: None,
            first_token_timeout,
            idle_timeout: None,
        }
    }

    pub fn with_fallback(mut self, model: Option<String>) -> Self {
        self.fallback = model;
        self
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    WaitingFirstToken,
    FallbackAttempt,
    Streaming,
    Done,
    Failed,
}

/// An attempt that produced its first token (or finished empty).
pub struct SupervisedStream {
    pub model: String,
    pub fell_back: bool,
    pub attempted: Vec<String>,
    pub stream: DeltaStream,
}

/// Wraps a completion client with a first-token deadline and model fallback.
#[derive(Clone)]
pub struct Supervisor {
    client: CompletionClient,
    policy: FallbackPolicy,
}

enum FirstToken {
    Token(String),
    Empty,
    Failed(crate::types::ObservedError),
    TimedOut,
}

impl Supervisor {
    pub fn new(client: CompletionClient, policy: FallbackPolicy) -> Self {
        Self { client, policy }
    }

    async fn first_token(&self, stream: &mut DeltaStream) -> FirstToken {
        match timeout(self.policy.first_token_timeout, stream.next()).await {
            Ok(Some(Ok(token))) => FirstToken::Token(token),
            Ok(Some(Err(e))) => FirstToken::Failed(e),
            Ok(None) => FirstToken::Empty,
            Err(_) => FirstToken::TimedOut,
        }
    }

    fn transition(&self, stage: Stage, from: SupervisorState, to: SupervisorState, model: &str) {
        tracing::debug!("[SUPERVISOR] {} {:?} -> {:?} (model {})", stage, from, to, model);
    }

    /// Resolves once the first token arrives. The request's model is replaced
    /// per attempt; the messages are shared by both attempts.
    #[tracing::instrument(level = "debug", skip_all, fields(stage = %stage, primary = %self.policy.primary))]
    pub async fn open(&self, request: &ChatCompletionRequest, stage: Stage) -> Result<SupervisedStream> {
        let mut attempted = vec![self.policy.primary.clone()];
        let mut state = SupervisorState::WaitingFirstToken;

        let mut stream = self.client.stream(request.with_model(&self.policy.primary), stage);
        match self.first_token(&mut stream).await {
            FirstToken::Token(first) => {
                self.transition(stage, state, SupervisorState::Streaming, &self.policy.primary);
                return Ok(self.streaming(self.policy.primary.clone(), false, attempted, first, stream));
            }
            FirstToken::Empty => {
                self.transition(stage, state, SupervisorState::Done, &self.policy.primary);
                return Ok(empty(self.policy.primary.clone(), false, attempted));
            }
            FirstToken::Failed(e) => {
                self.transition(stage, state, SupervisorState::Failed, &self.policy.primary);
                return Err(e);
            }
            FirstToken::TimedOut => {
                // Dropping the attempt releases its connection and permit
                drop(stream);
            }
        }

        let fallback = match &self.policy.fallback {
            Some(f) => f.clone(),
            None => {
                self.transition(stage, state, SupervisorState::Failed, &self.policy.primary);
                return Err(BenchError::FirstTokenTimeout {
                    models: attempted,
                    timeout: self.policy.first_token_timeout,
                    last_error: None,
                }
                .into());
            }
        };

        tracing::warn!(
            "[SUPERVISOR] {} model {} produced no token within {:?}, falling back to {}",
            stage,
            self.policy.primary,
            self.policy.first_token_timeout,
            fallback
        );
        self.transition(stage, state, SupervisorState::FallbackAttempt, &fallback);
        state = SupervisorState::FallbackAttempt;
        attempted.push(fallback.clone());

        let mut stream = self.client.stream(request.with_model(&fallback), stage);
        match self.first_token(&mut stream).await {
            FirstToken::Token(first) => {
                self.transition(stage, state, SupervisorState::Streaming, &fallback);
                Ok(self.streaming(fallback, true, attempted, first, stream))
            }
            FirstToken::Empty => {
                self.transition(stage, state, SupervisorState::Done, &fallback);
                Ok(empty(fallback, true, attempted))
            }
            FirstToken::Failed(e) => {
                self.transition(stage, state, SupervisorState::Failed, &fallback);
                Err(BenchError::FirstTokenTimeout {
                    models: attempted,
                    timeout: self.policy.first_token_timeout,
                    last_error: Some(e.inner.to_string()),
                }
                .into())
            }
            FirstToken::TimedOut => {
                self.transition(stage, state, SupervisorState::Failed, &fallback);
                Err(BenchError::FirstTokenTimeout {
                    models: attempted,
                    timeout: self.policy.first_token_timeout,
                    last_error: None,
                }
                .into())
            }
        }
    }

    fn streaming(
        &self,
        model: String,
        fell_back: bool,
        attempted: Vec<String>,
        first: String,
        mut rest: DeltaStream,
    ) -> SupervisedStream {
        let idle = self.policy.idle_timeout;
        let stalled_model = model.clone();
        let stream: DeltaStream = Box::pin(try_stream! {
            yield first;
            loop {
                let next = match idle {
                    Some(limit) => match timeout(limit, rest.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            Err::<(), _>(BenchError::StreamStalled {
                                model: stalled_model.clone(),
                                idle: limit,
                            })?;
                            None
                        }
                    },
                    None => rest.next().await,
                };
                match next {
                    Some(item) => {
                        let delta = item?;
                        yield delta;
                    }
                    None => break,
                }
            }
        });
        SupervisedStream {
            model,
            fell_back,
            attempted,
            stream,
        }
    }
}

fn empty(model: String, fell_back: bool, attempted: Vec<String>) -> SupervisedStream {
    SupervisedStream {
        model,
        fell_back,
        attempted,
        stream: Box::pin(futures_util::stream::empty()),
    }
}
