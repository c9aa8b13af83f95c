mod common;

use common::*;
use futures_util::StreamExt;
use lca_benchmarker::completion::{CompletionClient, CompletionEndpoint};
use lca_benchmarker::specs::openai::{ChatCompletionRequest, ChatMessage};
use lca_benchmarker::supervisor::{FallbackPolicy, Supervisor};
use lca_benchmarker::types::{BenchError, Stage};
use std::time::{Duration, Instant};

fn supervisor(mock: &MockLlm, policy: FallbackPolicy) -> Supervisor {
    let endpoint = CompletionEndpoint::new("mock", &mock.completions_url(), "test-key");
    Supervisor::new(CompletionClient::new(reqwest::Client::new(), endpoint, 4), policy)
}

fn request() -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: "placeholder".into(),
        messages: vec![
            ChatMessage::system("web search prompt"),
            ChatMessage::user("Query: PET bottle\n\nContext: search the web"),
        ],
        temperature: 0.0,
        top_p: Some(0.0),
        stream: true,
    }
}

async fn drain(mut stream: lca_benchmarker::completion::DeltaStream) -> (String, Option<BenchError>) {
    let mut text = String::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(d) => text.push_str(&d),
            Err(e) => return (text, Some(e.inner)),
        }
    }
    (text, None)
}

#[tokio::test]
async fn test_fast_primary_does_not_fall_back() {
    let mock = MockLlm::start().await;
    mock.script(WEB_MODEL, true, Script::Stream(vec!["PET: ", "2.15 kg"]));

    let policy = FallbackPolicy::new(WEB_MODEL, Duration::from_millis(500))
        .with_fallback(Some(WEB_FALLBACK.into()));
    let opened = supervisor(&mock, policy).open(&request(), Stage::Web).await.unwrap();
    assert_eq!(opened.model, WEB_MODEL);
    assert!(!opened.fell_back);

    let (text, err) = drain(opened.stream).await;
    assert!(err.is_none());
    assert_eq!(text, "PET: 2.15 kg");
    assert!(mock.requests_for(WEB_FALLBACK).is_empty());
}

#[tokio::test]
async fn test_first_token_timeout_uses_fallback_model() {
    let mock = MockLlm::start().await;
    mock.script(WEB_MODEL, true, Script::Hang)
        .script(WEB_FALLBACK, true, Script::Stream(vec!["from ", "fallback"]));

    let policy = FallbackPolicy::new(WEB_MODEL, Duration::from_millis(200))
        .with_fallback(Some(WEB_FALLBACK.into()));
    let opened = supervisor(&mock, policy).open(&request(), Stage::Web).await.unwrap();
    assert_eq!(opened.model, WEB_FALLBACK);
    assert!(opened.fell_back);
    assert_eq!(opened.attempted, vec![WEB_MODEL, WEB_FALLBACK]);

    let (text, err) = drain(opened.stream).await;
    assert!(err.is_none());
    assert_eq!(text, "from fallback");

    // Same messages for both attempts
    let primary = &mock.requests_for(WEB_MODEL)[0];
    let fallback = &mock.requests_for(WEB_FALLBACK)[0];
    assert_eq!(primary.body["messages"], fallback.body["messages"]);
    assert_eq!(fallback.body["top_p"], 0.0);
}

#[tokio::test]
async fn test_timeout_without_fallback_names_primary() {
    let mock = MockLlm::start().await;
    mock.script(DB_MODEL, true, Script::Hang);

    let started = Instant::now();
    let policy = FallbackPolicy::new(DB_MODEL, Duration::from_millis(150));
    let err = match supervisor(&mock, policy).open(&request(), Stage::Database).await {
        Err(e) => e.inner,
        Ok(_) => panic!("Expected timeout"),
    };
    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
        BenchError::FirstTokenTimeout { models, timeout, .. } => {
            assert_eq!(models, vec![DB_MODEL]);
            assert_eq!(timeout, Duration::from_millis(150));
        }
        other => panic!("Expected FirstTokenTimeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_both_models_timing_out_names_both() {
    let mock = MockLlm::start().await;
    mock.script(WEB_MODEL, true, Script::Hang)
        .script(WEB_FALLBACK, true, Script::Hang);

    let policy = FallbackPolicy::new(WEB_MODEL, Duration::from_millis(100))
        .with_fallback(Some(WEB_FALLBACK.into()));
    let err = match supervisor(&mock, policy).open(&request(), Stage::Web).await {
        Err(e) => e.inner,
        Ok(_) => panic!("Expected timeout"),
    };
    match &err {
        BenchError::FirstTokenTimeout { models, .. } => {
            assert_eq!(models, &vec![WEB_MODEL.to_string(), WEB_FALLBACK.to_string()]);
        }
        other => panic!("Expected FirstTokenTimeout, got {:?}", other),
    }
    assert!(err.to_string().contains("web-primary -> web-fallback"));
}

#[tokio::test]
async fn test_failing_fallback_is_reported_as_timeout() {
    let mock = MockLlm::start().await;
    mock.script(WEB_MODEL, true, Script::Hang)
        .script(WEB_FALLBACK, true, Script::Status(500))
        .script(WEB_FALLBACK, false, Script::Status(500));

    let policy = FallbackPolicy::new(WEB_MODEL, Duration::from_millis(100))
        .with_fallback(Some(WEB_FALLBACK.into()));
    let err = match supervisor(&mock, policy).open(&request(), Stage::Web).await {
        Err(e) => e.inner,
        Ok(_) => panic!("Expected failure"),
    };
    match err {
        BenchError::FirstTokenTimeout { models, last_error, .. } => {
            assert_eq!(models.len(), 2);
            assert!(last_error.unwrap_or_default().contains("HTTP 500"));
        }
        other => panic!("Expected FirstTokenTimeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_primary_error_is_not_a_timeout() {
    let mock = MockLlm::start().await;
    mock.script(WEB_MODEL, true, Script::Status(401))
        .script(WEB_MODEL, false, Script::Status(401))
        .script(WEB_FALLBACK, true, Script::Stream(vec!["unused"]));

    let policy = FallbackPolicy::new(WEB_MODEL, Duration::from_secs(2))
        .with_fallback(Some(WEB_FALLBACK.into()));
    let err = match supervisor(&mock, policy).open(&request(), Stage::Web).await {
        Err(e) => e.inner,
        Ok(_) => panic!("Expected failure"),
    };
    assert!(matches!(err, BenchError::Completion { .. }));
    assert!(mock.requests_for(WEB_FALLBACK).is_empty());
}

#[tokio::test]
async fn test_idle_timeout_after_first_token_stalls() {
    let mock = MockLlm::start().await;
    mock.script(
        DB_MODEL,
        true,
        Script::Paced(vec!["quick", "slow"], Duration::from_millis(300)),
    );

    let policy = FallbackPolicy::new(DB_MODEL, Duration::from_secs(2))
        .with_idle_timeout(Some(Duration::from_millis(100)));
    let opened = supervisor(&mock, policy).open(&request(), Stage::Database).await.unwrap();
    let (text, err) = drain(opened.stream).await;
    assert_eq!(text, "quick");
    match err {
        Some(BenchError::StreamStalled { model, idle }) => {
            assert_eq!(model, DB_MODEL);
            assert_eq!(idle, Duration::from_millis(100));
        }
        other => panic!("Expected StreamStalled, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deadline_stops_applying_after_first_token() {
    let mock = MockLlm::start().await;
    mock.script(
        WEB_MODEL,
        true,
        Script::Paced(vec!["a", "b", "c"], Duration::from_millis(150)),
    )
    .script(WEB_FALLBACK, true, Script::Stream(vec!["unused"]));

    // Each gap is under the deadline, the whole stream is not
    let policy = FallbackPolicy::new(WEB_MODEL, Duration::from_millis(200))
        .with_fallback(Some(WEB_FALLBACK.into()));
    let opened = supervisor(&mock, policy).open(&request(), Stage::Web).await.unwrap();
    assert_eq!(opened.model, WEB_MODEL);
    assert!(!opened.fell_back);

    let (text, err) = drain(opened.stream).await;
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(text, "abc");
    assert!(mock.requests_for(WEB_FALLBACK).is_empty());
}
