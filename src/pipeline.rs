use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tracing::Instrument;

use crate::accumulator::{AccumulatedResult, StageAccumulator};
use crate::completion::{CompletionClient, CompletionEndpoint};
use crate::config::{PipelineConfig, Scheduling};
use crate::constants::WEB_STAGE_CONTEXT;
use crate::retrieval::{join_passages, HttpRetriever, Retriever};
use crate::specs::openai::{ChatCompletionRequest, ChatMessage};
use crate::supervisor::{FallbackPolicy, Supervisor};
use crate::types::{BenchError, ObservedError, Query, Result, Stage, TokenChunk};

type ChunkStream = Pin<Box<dyn Stream<Item = Result<TokenChunk>> + Send>>;
type TaggedStream = Pin<Box<dyn Stream<Item = (Stage, Result<StageEvent>)> + Send>>;

enum StageEvent {
    Chunk(TokenChunk),
    Finished(AccumulatedResult),
}

/// User message shared by every stage.
pub fn user_message(query: &str, context: &str) -> String {
    format!("Query: {}\n\nContext: {}", query, context)
}

pub fn merge_context(query: &str, db: &str, web: &str, passages: Option<&str>) -> String {
    let mut context = format!(
        "User Query (with values to benchmark):\n{}\n\nDatabase Results:\n{}\n\nWeb Search Results:\n{}",
        query, db, web
    );
    if let Some(p) = passages {
        context.push_str("\n\nRetrieved Passages:\n");
        context.push_str(p);
    }
    context
}

/// Output of one `analyze` call: `{stage, content}` chunks in emission order.
/// Per-stage results are recorded as each stage completes.
pub struct AnalysisStream {
    pub request_id: String,
    pub stages: Vec<Stage>,
    inner: ChunkStream,
    results: Arc<Mutex<Vec<AccumulatedResult>>>,
}

impl AnalysisStream {
    pub fn results(&self) -> Vec<AccumulatedResult> {
        match self.results.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Stream for AnalysisStream {
    type Item = Result<TokenChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    retriever: Arc<dyn Retriever>,
    clients: HashMap<String, CompletionClient>,
}

impl Pipeline {
    /// Endpoints without credentials are skipped here and reported when a
    /// request needs them.
    pub fn new(
        config: PipelineConfig,
        retriever: Arc<dyn Retriever>,
        http: reqwest::Client,
    ) -> Result<Self> {
        config.validate()?;
        let mut clients = HashMap::new();
        for (name, settings) in &config.endpoints {
            match CompletionEndpoint::from_settings(name, settings) {
                Ok(endpoint) => {
                    clients.insert(
                        name.clone(),
                        CompletionClient::new(http.clone(), endpoint, settings.max_concurrent),
                    );
                }
                Err(e) => tracing::warn!("[PIPELINE] endpoint '{}' unavailable: {}", name, e.inner),
            }
        }
        Ok(Self {
            config: Arc::new(config),
            retriever,
            clients,
        })
    }

    pub fn from_config(config: PipelineConfig, http: reqwest::Client) -> Result<Self> {
        let retriever = HttpRetriever::from_settings(http.clone(), &config.retrieval)?;
        Self::new(config, Arc::new(retriever), http)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn supervisor(&self, stage: Stage) -> Result<Supervisor> {
        let settings = self.config.stage(stage);
        let client = match self.clients.get(&settings.endpoint) {
            Some(c) => c.clone(),
            None => {
                return Err(BenchError::Config(format!(
                    "{} stage needs endpoint '{}', which has no credentials",
                    stage, settings.endpoint
                ))
                .into())
            }
        };
        let policy = FallbackPolicy::new(&settings.model, self.config.timeouts.first_token())
            .with_fallback(settings.fallback_model.clone())
            .with_idle_timeout(self.config.timeouts.idle());
        Ok(Supervisor::new(client, policy))
    }

    fn request(&self, stage: Stage, messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        let settings = self.config.stage(stage);
        ChatCompletionRequest {
            model: settings.model.clone(),
            messages,
            temperature: settings.temperature,
            top_p: settings.top_p,
            stream: settings.stream,
        }
    }

    /// Retrieves passages, then returns the lazy stage stream. A retrieval
    /// failure is returned here, before any output exists.
    #[tracing::instrument(skip_all, fields(request_id = tracing::field::Empty, query = %query.short()))]
    pub async fn analyze(&self, query: &Query, include_web_search: bool) -> Result<AnalysisStream> {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", request_id.as_str());

        let stages = self.config.active_stages(include_web_search);
        // Resolve every stage up front so a missing credential is not a mid-stream failure
        let mut supervisors = HashMap::new();
        let mut prompts = HashMap::new();
        for stage in &stages {
            supervisors.insert(*stage, self.supervisor(*stage)?);
            prompts.insert(*stage, self.config.system_prompt(*stage)?);
        }

        let passages = self
            .retriever
            .search(query.as_str(), self.config.retrieval.limit)
            .await
            .map_err(|e| match e.inner {
                BenchError::Retrieval(_) => e,
                other => BenchError::Retrieval(other.to_string()).into(),
            })?;
        let context = join_passages(&passages);
        tracing::info!(
            "[PIPELINE] {} passages retrieved, stages: {:?}, scheduling: {:?}",
            passages.len(),
            stages,
            self.config.scheduling
        );

        let mut stage_streams: Vec<TaggedStream> = Vec::new();
        let db_request = self.request(
            Stage::Database,
            vec![
                ChatMessage::system(prompt_for(&mut prompts, Stage::Database)),
                ChatMessage::user(user_message(query.as_str(), &context)),
            ],
        );
        stage_streams.push(tagged(
            supervisor_for(&mut supervisors, Stage::Database)?,
            db_request,
            Stage::Database,
        ));
        if stages.contains(&Stage::Web) {
            let web_request = self.request(
                Stage::Web,
                vec![
                    ChatMessage::system(prompt_for(&mut prompts, Stage::Web)),
                    ChatMessage::user(user_message(query.as_str(), WEB_STAGE_CONTEXT)),
                ],
            );
            stage_streams.push(tagged(
                supervisor_for(&mut supervisors, Stage::Web)?,
                web_request,
                Stage::Web,
            ));
        }

        let upstream: TaggedStream = match self.config.scheduling {
            Scheduling::Overlapped if stage_streams.len() > 1 => {
                Box::pin(futures_util::stream::select_all(stage_streams))
            }
            _ => Box::pin(futures_util::stream::iter(stage_streams).flatten()),
        };

        let merge = if stages.contains(&Stage::Table) {
            // User message is appended once both upstream texts exist
            let template = self.request(
                Stage::Table,
                vec![ChatMessage::system(prompt_for(&mut prompts, Stage::Table))],
            );
            Some((supervisor_for(&mut supervisors, Stage::Table)?, template))
        } else {
            None
        };

        let results = Arc::new(Mutex::new(Vec::new()));
        let inner = run_stages(
            upstream,
            merge,
            query.as_str().to_string(),
            self.config.merge_includes_passages.then_some(context),
            results.clone(),
        );
        let span = tracing::info_span!("analysis", request_id = %request_id);

        Ok(AnalysisStream {
            request_id,
            stages,
            inner: Box::pin(InstrumentedStream { inner, span }),
            results,
        })
    }
}

fn prompt_for(prompts: &mut HashMap<Stage, String>, stage: Stage) -> String {
    prompts.remove(&stage).unwrap_or_default()
}

fn supervisor_for(supervisors: &mut HashMap<Stage, Supervisor>, stage: Stage) -> Result<Supervisor> {
    match supervisors.remove(&stage) {
        Some(s) => Ok(s),
        None => Err(BenchError::Internal(format!("no supervisor for {} stage", stage)).into()),
    }
}

fn stage_failure(stage: Stage, models: Vec<String>, emitted: usize, e: ObservedError) -> ObservedError {
    tracing::error!("[PIPELINE] {} stage failed after {} chunks: {}", stage, emitted, e.inner);
    BenchError::Stage {
        stage,
        models,
        partial: emitted > 0,
        source: Box::new(e.inner),
    }
    .into()
}

/// One stage as a stream of chunks followed by its accumulated result.
fn tagged(supervisor: Supervisor, request: ChatCompletionRequest, stage: Stage) -> TaggedStream {
    let events = try_stream! {
        let span = tracing::info_span!("stage", stage = %stage);
        let opened = supervisor.open(&request, stage).instrument(span).await?;
        let mut acc = StageAccumulator::new(stage, &opened.model, opened.fell_back);
        let mut deltas = opened.stream;
        while let Some(delta) = deltas.next().await {
            let delta = delta?;
            if let Some(chunk) = acc.accept(&delta) {
                yield StageEvent::Chunk(chunk);
            }
        }
        yield StageEvent::Finished(acc.finish());
    };
    let events: Pin<Box<dyn Stream<Item = Result<StageEvent>> + Send>> = Box::pin(events);
    Box::pin(events.map(move |event| (stage, event)))
}

fn run_stages(
    mut upstream: TaggedStream,
    merge: Option<(Supervisor, ChatCompletionRequest)>,
    query: String,
    passages: Option<String>,
    results: Arc<Mutex<Vec<AccumulatedResult>>>,
) -> ChunkStream {
    let record = move |result: AccumulatedResult| {
        if let Ok(mut r) = results.lock() {
            r.push(result);
        }
    };

    Box::pin(try_stream! {
        let mut emitted = 0usize;
        let mut db_text = String::new();
        let mut web_text = String::new();

        while let Some((stage, event)) = upstream.next().await {
            match event {
                Ok(StageEvent::Chunk(chunk)) => {
                    emitted += 1;
                    yield chunk;
                }
                Ok(StageEvent::Finished(result)) => {
                    match stage {
                        Stage::Database => db_text = result.text.clone(),
                        Stage::Web => web_text = result.text.clone(),
                        Stage::Table => {}
                    }
                    record(result);
                }
                Err(e) => {
                    let attempted = failed_models(&e);
                    Err::<(), _>(stage_failure(stage, attempted, emitted, e))?;
                }
            }
        }
        // Both upstream stages are fully accumulated at this point
        drop(upstream);

        if let Some((supervisor, template)) = merge {
            let context = merge_context(&query, &db_text, &web_text, passages.as_deref());
            let mut request = template;
            request.messages.push(ChatMessage::user(user_message(&query, &context)));
            let mut table = tagged(supervisor, request, Stage::Table);
            while let Some((stage, event)) = table.next().await {
                match event {
                    Ok(StageEvent::Chunk(chunk)) => {
                        emitted += 1;
                        yield chunk;
                    }
                    Ok(StageEvent::Finished(result)) => record(result),
                    Err(e) => {
                        let attempted = failed_models(&e);
                        Err::<(), _>(stage_failure(stage, attempted, emitted, e))?;
                    }
                }
            }
        }
    })
}

/// Models named by the underlying failure.
fn failed_models(e: &ObservedError) -> Vec<String> {
    match &e.inner {
        BenchError::FirstTokenTimeout { models, .. } => models.clone(),
        BenchError::StreamStalled { model, .. } | BenchError::Completion { model, .. } => {
            vec![model.clone()]
        }
        _ => Vec::new(),
    }
}

/// Enters the analysis span around every poll of the chunk stream.
struct InstrumentedStream {
    inner: ChunkStream,
    span: tracing::Span,
}

impl Stream for InstrumentedStream {
    type Item = Result<TokenChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let _entered = this.span.enter();
        this.inner.as_mut().poll_next(cx)
    }
}
