mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::*;
use lca_benchmarker::pipeline::Pipeline;
use lca_benchmarker::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

fn app(pipeline: Pipeline) -> axum::Router {
    lca_benchmarker::server::router(Arc::new(AppState::new(pipeline)), 64 * 1024)
}

fn analyze_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/analyze")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// (event name, data) pairs from an SSE body, comments skipped.
fn parse_events(text: &str) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    for block in text.split("\n\n") {
        let mut name = None;
        let mut data = None;
        for line in block.lines() {
            if let Some(n) = line.strip_prefix("event:") {
                name = Some(n.trim().to_string());
            } else if let Some(d) = line.strip_prefix("data:") {
                data = serde_json::from_str::<Value>(d.trim()).ok();
            }
        }
        if let (Some(n), Some(d)) = (name, data) {
            events.push((n, d));
        }
    }
    events
}

#[tokio::test]
async fn test_health_endpoints() {
    let mock = MockLlm::start().await;
    let pipeline = Pipeline::new(test_config(&mock), Arc::new(StaticRetriever::new(&[])), reqwest::Client::new()).unwrap();
    let app = app(pipeline);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["status"], "ok");

    let response = app
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["missing_credentials"], json!([]));
}

#[tokio::test]
async fn test_analyze_streams_stage_events_then_done() {
    let mock = MockLlm::start().await;
    mock.script(DB_MODEL, true, Script::Stream(vec!["Glass", " bottle: 0.45 kg CO2eq/kg"]));
    let pipeline = Pipeline::new(test_config(&mock), Arc::new(StaticRetriever::new(&["p"])), reqwest::Client::new()).unwrap();

    let response = app(pipeline)
        .oneshot(analyze_request(json!({"query": "glass bottle"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let events = parse_events(&body_text(response).await);

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].0, "database");
    assert_eq!(events[0].1, json!({"stage": "database", "content": "Glass"}));
    assert_eq!(events[1].1["content"], " bottle: 0.45 kg CO2eq/kg");

    let (name, done) = &events[2];
    assert_eq!(name, "done");
    assert!(done["request_id"].as_str().is_some());
    assert_eq!(done["stages"][0]["stage"], "database");
    assert_eq!(done["stages"][0]["model"], DB_MODEL);
    assert_eq!(done["stages"][0]["chunks"], 2);
    assert!(done["finished_at"].as_str().is_some());
}

#[tokio::test]
async fn test_stage_failure_ends_with_error_event() {
    let mock = MockLlm::start().await;
    mock.script(DB_MODEL, true, Script::StreamThenDrop(vec!["partial"]));
    let pipeline = Pipeline::new(test_config(&mock), Arc::new(StaticRetriever::new(&["p"])), reqwest::Client::new()).unwrap();

    let response = app(pipeline)
        .oneshot(analyze_request(json!({"query": "q"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let events = parse_events(&body_text(response).await);

    assert_eq!(events.first().map(|e| e.0.as_str()), Some("database"));
    let (name, error) = events.last().unwrap();
    assert_eq!(name, "error");
    assert_eq!(error["stage"], "database");
    assert_eq!(error["partial"], true);
    assert_eq!(error["code"], "COMPLETION_ERROR");
    assert!(!events.iter().any(|(n, _)| n == "done"));
}

#[tokio::test]
async fn test_empty_query_is_rejected() {
    let mock = MockLlm::start().await;
    let pipeline = Pipeline::new(test_config(&mock), Arc::new(StaticRetriever::new(&[])), reqwest::Client::new()).unwrap();

    let response = app(pipeline)
        .oneshot(analyze_request(json!({"query": "   "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "INVALID_QUERY");
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_retrieval_failure_is_bad_gateway() {
    let mock = MockLlm::start().await;
    let pipeline = Pipeline::new(test_config(&mock), Arc::new(FailingRetriever), reqwest::Client::new()).unwrap();

    let response = app(pipeline)
        .oneshot(analyze_request(json!({"query": "q", "include_web_search": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["code"], "RETRIEVAL_ERROR");
    assert!(body["error"].as_str().unwrap().contains("index offline"));
}
