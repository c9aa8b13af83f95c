#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use lca_benchmarker::config::{EndpointSettings, PipelineConfig};
use lca_benchmarker::retrieval::Retriever;
use lca_benchmarker::types::{BenchError, Passage, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DB_MODEL: &str = "db-model";
pub const WEB_MODEL: &str = "web-primary";
pub const WEB_FALLBACK: &str = "web-fallback";
pub const MERGE_MODEL: &str = "merge-model";

/// Scripted behaviour for one (model, stream) pair.
#[derive(Clone, Debug)]
pub enum Script {
    /// SSE frames for each token, then `[DONE]`.
    Stream(Vec<&'static str>),
    /// Like `Stream`, sleeping before every token.
    Paced(Vec<&'static str>, Duration),
    /// Tokens, then the connection is aborted mid-body.
    StreamThenDrop(Vec<&'static str>),
    /// Raw body lines, sent as-is.
    Raw(Vec<&'static str>),
    /// Never answers.
    Hang,
    /// Non-streaming JSON body with `choices[0].message.content`.
    Full(&'static str),
    Status(u16),
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub model: String,
    pub stream: bool,
    pub body: Value,
    pub authorization: Option<String>,
    pub title: Option<String>,
    pub referer: Option<String>,
}

impl RecordedRequest {
    pub fn user_content(&self) -> String {
        self.body["messages"]
            .as_array()
            .and_then(|m| m.iter().find(|msg| msg["role"] == "user"))
            .and_then(|msg| msg["content"].as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn system_content(&self) -> String {
        self.body["messages"][0]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<(String, bool), Script>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// OpenAI-compatible completion backend on an ephemeral port.
pub struct MockLlm {
    pub base_url: String,
    state: Arc<MockState>,
}

pub fn frame(token: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"index": 0, "delta": {"content": token}}]})
    )
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

async fn completions(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let stream = body["stream"].as_bool().unwrap_or(false);
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    state.requests.lock().unwrap().push(RecordedRequest {
        model: model.clone(),
        stream,
        body: body.clone(),
        authorization: header("authorization"),
        title: header("x-title"),
        referer: header("http-referer"),
    });

    let script = state
        .scripts
        .lock()
        .unwrap()
        .get(&(model.clone(), stream))
        .cloned();

    match script {
        None => (StatusCode::NOT_FOUND, format!("no script for {} stream={}", model, stream))
            .into_response(),
        Some(Script::Stream(tokens)) => {
            let mut text: String = tokens.iter().map(|t| frame(t)).collect();
            text.push_str("data: [DONE]\n\n");
            sse_response(Body::from(text))
        }
        Some(Script::Paced(tokens, delay)) => {
            let body = async_stream::stream! {
                for token in tokens {
                    tokio::time::sleep(delay).await;
                    yield Ok::<Bytes, std::io::Error>(Bytes::from(frame(token)));
                }
                yield Ok(Bytes::from("data: [DONE]\n\n"));
            };
            sse_response(Body::from_stream(body))
        }
        Some(Script::StreamThenDrop(tokens)) => {
            let body = async_stream::stream! {
                for token in tokens {
                    yield Ok::<Bytes, std::io::Error>(Bytes::from(frame(token)));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                yield Err(std::io::Error::other("connection dropped"));
            };
            sse_response(Body::from_stream(body))
        }
        Some(Script::Raw(lines)) => {
            let mut text = lines.join("\n");
            text.push('\n');
            sse_response(Body::from(text))
        }
        Some(Script::Hang) => futures_util::future::pending::<Response>().await,
        Some(Script::Full(content)) => Json(json!({
            "id": "cmpl-test",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        }))
        .into_response(),
        Some(Script::Status(code)) => (
            StatusCode::from_u16(code).unwrap(),
            Json(json!({"error": {"message": "scripted failure", "code": code}})),
        )
            .into_response(),
    }
}

pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

impl MockLlm {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let router = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(state.clone());
        let base_url = serve(router).await;
        Self { base_url, state }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    pub fn script(&self, model: &str, stream: bool, script: Script) -> &Self {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert((model.to_string(), stream), script);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, model: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.model == model)
            .collect()
    }
}

/// Every stage pointed at the mock, with inline keys and a short deadline.
pub fn test_config(mock: &MockLlm) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    let mut endpoint = EndpointSettings::new(mock.completions_url(), "LCA_BENCH_TEST_UNUSED");
    endpoint.api_key = Some("test-key".to_string());
    cfg.endpoints = BTreeMap::from([("mock".to_string(), endpoint)]);

    cfg.database.endpoint = "mock".into();
    cfg.database.model = DB_MODEL.into();
    cfg.web.endpoint = "mock".into();
    cfg.web.model = WEB_MODEL.into();
    cfg.web.fallback_model = Some(WEB_FALLBACK.into());
    cfg.merge.endpoint = "mock".into();
    cfg.merge.model = MERGE_MODEL.into();

    cfg.retrieval.api_key = Some("r2r-test-key".to_string());
    cfg.timeouts.first_token_ms = 2_000;
    cfg
}

pub struct StaticRetriever {
    pub passages: Vec<Passage>,
    pub calls: Mutex<Vec<(String, usize)>>,
}

impl StaticRetriever {
    pub fn new(texts: &[&str]) -> Self {
        Self {
            passages: texts
                .iter()
                .enumerate()
                .map(|(i, t)| Passage {
                    text: t.to_string(),
                    relevance_score: 1.0 - i as f64 * 0.1,
                    metadata: serde_json::Map::new(),
                })
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Retriever for StaticRetriever {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Passage>> {
        self.calls.lock().unwrap().push((query.to_string(), limit));
        Ok(self.passages.clone())
    }
}

pub struct FailingRetriever;

#[async_trait::async_trait]
impl Retriever for FailingRetriever {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<Passage>> {
        Err(BenchError::Retrieval("HTTP 503 Service Unavailable: index offline".into()).into())
    }
}
