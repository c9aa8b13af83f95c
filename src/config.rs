use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::types::{BenchError, Result, Stage};

const RETRIEVAL_PROMPT: &str = include_str!("../prompts/retrieval.md");
const WEB_SEARCH_PROMPT: &str = include_str!("../prompts/web_search.md");
const MERGER_PROMPT: &str = include_str!("../prompts/merger.md");

/// Full pipeline configuration. Every section has defaults matching the
/// hosted deployment, so an empty TOML file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default = "default_endpoints")]
    pub endpoints: BTreeMap<String, EndpointSettings>,
    #[serde(default = "default_database_stage")]
    pub database: StageSettings,
    #[serde(default = "default_web_stage")]
    pub web: StageSettings,
    #[serde(default = "default_merge_stage")]
    pub merge: StageSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub scheduling: Scheduling,
    /// Appends the raw retrieved passages to the merge context.
    #[serde(default)]
    pub merge_includes_passages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_retrieval_url")]
    pub base_url: String,
    #[serde(default = "default_retrieval_key_env")]
    pub api_key_env: String,
    /// Inline key; takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            base_url: default_retrieval_url(),
            api_key_env: default_retrieval_key_env(),
            api_key: None,
            limit: default_limit(),
        }
    }
}

impl RetrievalSettings {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub url: String,
    pub api_key_env: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_referer")]
    pub referer: Option<String>,
    #[serde(default = "default_title")]
    pub title: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl EndpointSettings {
    pub fn new(url: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key_env: api_key_env.into(),
            api_key: None,
            referer: default_referer(),
            title: default_title(),
            max_concurrent: default_max_concurrent(),
        }
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_key(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Key into `endpoints`.
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default = "default_enabled")]
    pub stream: bool,
    /// Inline prompt text. Wins over `system_prompt_file`.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
}

impl StageSettings {
    pub fn new(endpoint: &str, model: &str) -> Self {
        Self {
            enabled: true,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            fallback_model: None,
            temperature: DEFAULT_TEMPERATURE,
            top_p: None,
            stream: true,
            system_prompt: None,
            system_prompt_file: None,
        }
    }

    /// Every model this stage may call, primary first.
    pub fn models(&self) -> Vec<String> {
        let mut models = vec![self.model.clone()];
        if let Some(f) = &self.fallback_model {
            models.push(f.clone());
        }
        models
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_first_token_ms")]
    pub first_token_ms: u64,
    /// Gap allowed between deltas once streaming; unset means unbounded.
    #[serde(default)]
    pub idle_ms: Option<u64>,
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            first_token_ms: default_first_token_ms(),
            idle_ms: None,
            connect_ms: default_connect_ms(),
        }
    }
}

impl TimeoutSettings {
    pub fn first_token(&self) -> Duration {
        Duration::from_millis(self.first_token_ms)
    }

    pub fn idle(&self) -> Option<Duration> {
        self.idle_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scheduling {
    /// Database stage completes before the web stage starts.
    #[default]
    Sequential,
    /// Database and web stages stream concurrently, interleaved.
    Overlapped,
}

fn resolve_key(inline: &Option<String>, env_name: &str) -> Option<String> {
    if let Some(k) = inline {
        if !k.is_empty() {
            return Some(k.clone());
        }
    }
    match std::env::var(env_name) {
        Ok(k) if !k.is_empty() => Some(k),
        _ => None,
    }
}

fn default_retrieval_url() -> String {
    R2R_BASE_URL.to_string()
}
fn default_retrieval_key_env() -> String {
    R2R_API_KEY_ENV.to_string()
}
fn default_limit() -> usize {
    DEFAULT_RETRIEVAL_LIMIT
}
fn default_referer() -> Option<String> {
    Some(DEFAULT_REFERER.to_string())
}
fn default_title() -> Option<String> {
    Some(DEFAULT_APP_TITLE.to_string())
}
fn default_max_concurrent() -> usize {
    8
}
fn default_enabled() -> bool {
    true
}
fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}
fn default_first_token_ms() -> u64 {
    DEFAULT_FIRST_TOKEN_TIMEOUT_SECS * 1000
}
fn default_connect_ms() -> u64 {
    10_000
}

pub const REQUESTY: &str = "requesty";
pub const OPENROUTER: &str = "openrouter";

fn default_endpoints() -> BTreeMap<String, EndpointSettings> {
    let mut endpoints = BTreeMap::new();
    endpoints.insert(
        REQUESTY.to_string(),
        EndpointSettings::new(REQUESTY_CHAT_COMPLETIONS, REQUESTY_API_KEY_ENV),
    );
    endpoints.insert(
        OPENROUTER.to_string(),
        EndpointSettings::new(OPENROUTER_CHAT_COMPLETIONS, OPENROUTER_API_KEY_ENV),
    );
    endpoints
}

fn default_database_stage() -> StageSettings {
    StageSettings::new(REQUESTY, DATABASE_MODEL)
}

fn default_web_stage() -> StageSettings {
    StageSettings {
        fallback_model: Some(WEB_FALLBACK_MODEL.to_string()),
        temperature: 0.0,
        top_p: Some(0.0),
        ..StageSettings::new(OPENROUTER, WEB_PRIMARY_MODEL)
    }
}

fn default_merge_stage() -> StageSettings {
    StageSettings::new(REQUESTY, MERGE_MODEL)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalSettings::default(),
            endpoints: default_endpoints(),
            database: default_database_stage(),
            web: default_web_stage(),
            merge: default_merge_stage(),
            timeouts: TimeoutSettings::default(),
            scheduling: Scheduling::default(),
            merge_includes_passages: false,
        }
    }
}

impl PipelineConfig {
    pub fn stage(&self, stage: Stage) -> &StageSettings {
        match stage {
            Stage::Database => &self.database,
            Stage::Web => &self.web,
            Stage::Table => &self.merge,
        }
    }

    pub fn endpoint_for(&self, stage: Stage) -> Result<&EndpointSettings> {
        let name = &self.stage(stage).endpoint;
        match self.endpoints.get(name) {
            Some(e) => Ok(e),
            None => Err(BenchError::Config(format!(
                "{} stage references unknown endpoint '{}'",
                stage, name
            ))
            .into()),
        }
    }

    /// Stages that can run given the request's web flag. The merge stage
    /// only runs alongside the web stage.
    pub fn active_stages(&self, include_web: bool) -> Vec<Stage> {
        let mut stages = vec![Stage::Database];
        if include_web && self.web.enabled {
            stages.push(Stage::Web);
            if self.merge.enabled {
                stages.push(Stage::Table);
            }
        }
        stages
    }

    /// System prompt for a stage: inline text, then file, then the shipped default.
    pub fn system_prompt(&self, stage: Stage) -> Result<String> {
        let settings = self.stage(stage);
        if let Some(text) = &settings.system_prompt {
            return Ok(text.clone());
        }
        if let Some(path) = &settings.system_prompt_file {
            return std::fs::read_to_string(path).map_err(|e| {
                BenchError::Config(format!(
                    "failed to read {} prompt file {}: {}",
                    stage,
                    path.display(),
                    e
                ))
                .into()
            });
        }
        let builtin = match stage {
            Stage::Database => RETRIEVAL_PROMPT,
            Stage::Web => WEB_SEARCH_PROMPT,
            Stage::Table => MERGER_PROMPT,
        };
        Ok(builtin.trim_end().to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.limit < 1 {
            return Err(BenchError::Config("retrieval.limit must be >= 1".into()).into());
        }
        check_url("retrieval.base_url", &self.retrieval.base_url)?;

        if self.timeouts.first_token_ms == 0 {
            return Err(BenchError::Config("timeouts.first_token_ms must be > 0".into()).into());
        }
        if self.timeouts.idle_ms == Some(0) {
            return Err(BenchError::Config("timeouts.idle_ms must be > 0 when set".into()).into());
        }

        for (name, endpoint) in &self.endpoints {
            check_url(&format!("endpoints.{}.url", name), &endpoint.url)?;
            if endpoint.max_concurrent == 0 {
                return Err(BenchError::Config(format!(
                    "endpoints.{}.max_concurrent must be >= 1",
                    name
                ))
                .into());
            }
        }

        for stage in [Stage::Database, Stage::Web, Stage::Table] {
            let settings = self.stage(stage);
            if settings.model.trim().is_empty() {
                return Err(BenchError::Config(format!("{} stage model must not be empty", stage)).into());
            }
            if let Some(f) = &settings.fallback_model {
                if f.trim().is_empty() {
                    return Err(BenchError::Config(format!(
                        "{} stage fallback_model must not be empty when set",
                        stage
                    ))
                    .into());
                }
            }
            if !(0.0..=2.0).contains(&settings.temperature) {
                return Err(BenchError::Config(format!(
                    "{} stage temperature must be in [0.0, 2.0]",
                    stage
                ))
                .into());
            }
            if let Some(p) = settings.top_p {
                if !(0.0..=1.0).contains(&p) {
                    return Err(BenchError::Config(format!(
                        "{} stage top_p must be in [0.0, 1.0]",
                        stage
                    ))
                    .into());
                }
            }
            self.endpoint_for(stage)?;
        }
        Ok(())
    }

    /// Names of endpoints in use whose credentials cannot be resolved.
    pub fn missing_credentials(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.retrieval.resolve_api_key().is_none() {
            missing.push(self.retrieval.api_key_env.clone());
        }
        for stage in self.active_stages(true) {
            if let Ok(endpoint) = self.endpoint_for(stage) {
                if endpoint.resolve_api_key().is_none() && !missing.contains(&endpoint.api_key_env) {
                    missing.push(endpoint.api_key_env.clone());
                }
            }
        }
        missing
    }
}

fn check_url(field: &str, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(BenchError::Config(format!("{} must be an http(s) URL, got '{}'", field, url)).into())
    }
}

pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        BenchError::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let config: PipelineConfig = toml::from_str(&content)
        .map_err(|e| BenchError::Config(format!("Failed to parse config file: {}", e)))?;

    config.validate()?;
    Ok(config)
}
