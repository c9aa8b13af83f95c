use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, Span};
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

use crate::redaction_layer::RedactingWriter;
use crate::types::{Stage, Usage};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DEFAULT_LOG_FILTER: &str = "lca_benchmarker=info,lca_bench=info";

/// Installs the global subscriber: env filter, console layer, redacted daily
/// log file and span-trace capture. Keep the guard alive for the process.
pub fn init_tracing(log_dir: &str, json: bool) -> WorkerGuard {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_LOG_FILTER.into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "lca-bench.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_writer = move || RedactingWriter::new(non_blocking.clone());

    let console = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics through tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every HTTP request with a fresh request id header and span.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("http", request_id = %request_id);
    next.run(req).instrument(span).await
}

/// Per stage-attempt stream statistics, logged once when the attempt ends.
#[derive(Debug)]
pub struct StreamMetric {
    pub stage: Stage,
    pub model: String,
    pub deltas: usize,
    pub text_chars: usize,
    pub malformed: usize,
    pub keepalives: usize,
    pub usage: Option<Usage>,
    pub mode_fallback: bool,
    started: Instant,
    first_token: Option<Duration>,
}

impl StreamMetric {
    pub fn new(stage: Stage, model: &str) -> Self {
        Self {
            stage,
            model: model.to_string(),
            deltas: 0,
            text_chars: 0,
            malformed: 0,
            keepalives: 0,
            usage: None,
            mode_fallback: false,
            started: Instant::now(),
            first_token: None,
        }
    }

    pub fn record_delta(&mut self, content: &str) {
        if content.is_empty() {
            return;
        }
        if self.first_token.is_none() {
            self.first_token = Some(self.started.elapsed());
        }
        self.deltas += 1;
        self.text_chars += content.chars().count();
    }

    pub fn record_malformed(&mut self, reason: &str) {
        self.malformed += 1;
        debug!("[☁️  -> ⚙️ ] Malformed frame skipped: {}", reason);
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token
    }

    pub fn log_summary(&self) {
        let ttft = match self.first_token {
            Some(d) => format!("{}ms", d.as_millis()),
            None => "n/a".to_string(),
        };
        let tokens = match &self.usage {
            Some(u) => u.total_tokens.to_string(),
            None => "?".to_string(),
        };

        info!(
            target: "flight_recorder",
            "[STREAM END] RequestID: {} | Stage: {} | Model: {} | Deltas: {} | Text: {} chars | TTFT: {} | Malformed: {} | Keepalives: {} | Tokens: {} | ModeFallback: {} | Elapsed: {}ms",
            get_request_id(),
            self.stage,
            self.model,
            self.deltas,
            self.text_chars,
            ttft,
            self.malformed,
            self.keepalives,
            tokens,
            self.mode_fallback,
            self.started.elapsed().as_millis()
        );
    }
}

pub fn get_request_id() -> String {
    match Span::current().field("request_id").map(|v| v.to_string()) {
        Some(id) => id,
        None => "unknown".to_string(),
    }
}
