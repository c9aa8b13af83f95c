use lca_benchmarker::pipeline::Pipeline;
use lca_benchmarker::*;

use clap::Parser;
use colored::*;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _guard = lca_benchmarker::logging::init_tracing(&args.log_dir, args.log_json);
    lca_benchmarker::logging::setup_panic_hook();

    let config = match args.pipeline_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e.inner);
            std::process::exit(1);
        }
    };

    let client = match args.http_client() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{}", e.inner);
            std::process::exit(1);
        }
    };

    let pipeline = match Pipeline::from_config(config, client) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to start pipeline: {}", e.inner);
            eprintln!("Set the API keys in your .env file or environment.");
            std::process::exit(1);
        }
    };

    if let Some(query) = &args.query {
        if let Err(e) = lca_benchmarker::cli::run_once(&pipeline, query, args.web).await {
            eprintln!("{} {}", "Analysis failed:".bold().red(), e.inner);
            std::process::exit(1);
        }
        return;
    }

    let state = Arc::new(AppState::new(pipeline));
    let missing = state.pipeline.config().missing_credentials();
    if !missing.is_empty() {
        tracing::warn!("Missing credentials, /readyz will report unready: {:?}", missing);
    }

    let app = lca_benchmarker::server::router(state, args.max_body_size);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("LCA benchmarker listening on {}", addr);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutting down");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
