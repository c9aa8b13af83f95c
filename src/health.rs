use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub uptime_secs: i64,
    pub missing_credentials: Vec<String>,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Ready when every backend the pipeline may call has credentials.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let missing = state.pipeline.config().missing_credentials();
    if !missing.is_empty() {
        tracing::error!("Readiness check: missing credentials {:?}", missing);
    }

    let ready = missing.is_empty();
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
            missing_credentials: missing,
        }),
    )
}
