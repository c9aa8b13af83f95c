use axum::response::sse::{Event, KeepAlive};
use axum::{
    extract::State,
    middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::accumulator::AccumulatedResult;
use crate::constants::SSE_KEEPALIVE_SECS;
use crate::health;
use crate::logging::request_id_middleware;
use crate::pipeline::AnalysisStream;
use crate::types::{ObservedError, Query, Stage};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub query: String,
    #[serde(default)]
    pub include_web_search: bool,
}

#[derive(Debug, Serialize)]
struct StageSummary {
    stage: Stage,
    model: String,
    fell_back: bool,
    chunks: usize,
    chars: usize,
}

impl From<&AccumulatedResult> for StageSummary {
    fn from(r: &AccumulatedResult) -> Self {
        Self {
            stage: r.stage,
            model: r.model.clone(),
            fell_back: r.fell_back,
            chunks: r.chunks,
            chars: r.text.chars().count(),
        }
    }
}

pub fn router(state: Arc<AppState>, max_body_size: usize) -> Router {
    Router::new()
        .route("/v1/analyze", post(analyze_handler))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AnalyzeRequest>,
) -> Response {
    let query = match Query::new(body.query) {
        Ok(q) => q,
        Err(e) => return e.into_response(),
    };
    tracing::info!(
        "[⚙️  <- 👤] analyze: \"{}\" (web: {})",
        query.short(),
        body.include_web_search
    );

    let analysis = match state.pipeline.analyze(&query, body.include_web_search).await {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("[⚙️  <- 👤] analysis rejected: {}", e.inner);
            return e.into_response();
        }
    };

    Sse::new(sse_events(analysis))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
                .text("keepalive"),
        )
        .into_response()
}

fn json_event(name: &str, payload: serde_json::Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

fn error_event(e: &ObservedError, emitted: usize) -> Event {
    json_event(
        "error",
        serde_json::json!({
            "error": e.inner.to_string(),
            "code": e.inner.code(),
            "stage": e.inner.stage(),
            "partial": e.inner.is_partial() || emitted > 0,
        }),
    )
}

/// One named event per chunk, then exactly one `done` or `error` event.
/// Dropping the SSE body drops the analysis and its upstream requests.
fn sse_events(mut analysis: AnalysisStream) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut emitted = 0usize;
        let mut failed = false;

        while let Some(item) = analysis.next().await {
            match item {
                Ok(chunk) => {
                    emitted += 1;
                    let payload = serde_json::json!({
                        "stage": chunk.stage,
                        "content": chunk.content,
                    });
                    yield Ok(json_event(chunk.stage.as_str(), payload));
                }
                Err(e) => {
                    failed = true;
                    yield Ok(error_event(&e, emitted));
                    break;
                }
            }
        }

        if !failed {
            let stages: Vec<StageSummary> = analysis.results().iter().map(StageSummary::from).collect();
            tracing::info!(
                "[⚙️  -> 👤] analysis {} done: {} chunks",
                analysis.request_id,
                emitted
            );
            yield Ok(json_event(
                "done",
                serde_json::json!({
                    "request_id": analysis.request_id,
                    "stages": stages,
                    "finished_at": chrono::Utc::now().to_rfc3339(),
                }),
            ));
        }
    }
}
