use crate::config::{load_config, PipelineConfig};
use crate::pipeline::Pipeline;
use crate::types::*;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "LCA benchmarking assistant: retrieval, web search and merge over streaming LLMs", long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// Pipeline TOML file; built-in defaults when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value = ".")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_body_size: usize,
    /// Run a single analysis, print it and exit instead of serving.
    #[arg(long)]
    pub query: Option<String>,
    /// Include the web search and merge stages in one-shot mode.
    #[arg(long, default_value_t = false)]
    pub web: bool,
}

impl Args {
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        match &self.config {
            Some(path) => load_config(path),
            None => {
                let config = PipelineConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// No total request timeout: streams may legitimately run for minutes.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()
            .map_err(|e| BenchError::Config(format!("failed to build HTTP client: {}", e)).into())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            started_at: chrono::Utc::now(),
        }
    }
}
