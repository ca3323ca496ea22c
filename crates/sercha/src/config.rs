//! TOML configuration parsing and validation.
//!
//! Every section is optional; omitted fields take the defaults below.
//!
//! ```toml
//! [db]
//! path = "./data/sercha.sqlite"
//!
//! [scheduler]
//! enabled = true
//! tick_secs = 60
//!
//! [scheduler.tasks.document-sync]
//! interval_secs = 1800
//!
//! [retrieval]
//! keyword_weight = 1.0
//! semantic_weight = 1.0
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [[pipeline.processors]]
//! name = "chunker"
//! [pipeline.processors.options]
//! chunk_size = 800
//! overlap = 100
//!
//! [oauth.gmail]
//! token_url = "https://oauth2.googleapis.com/token"
//! client_id = "..."
//! client_secret_env = "SERCHA_GMAIL_CLIENT_SECRET"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sercha_core::pipeline::ProcessorSpec;
use sercha_core::scheduler::{SchedulerConfig, TaskConfig};
use sercha_core::search::FusionParams;

/// Written by `sercha init` when no config file exists yet.
pub const DEFAULT_CONFIG: &str = r#"[db]
path = "./data/sercha.sqlite"

[scheduler]
enabled = true
tick_secs = 60

[retrieval]
keyword_weight = 1.0
semantic_weight = 1.0
default_limit = 20

[embedding]
provider = "disabled"

[llm]
provider = "disabled"
"#;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// OAuth refresh endpoints keyed by connector type.
    #[serde(default)]
    pub oauth: HashMap<String, OAuthClientConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/sercha.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default)]
    pub tasks: HashMap<String, TaskSection>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: default_tick_secs(),
            tasks: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaskSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interval_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}
fn default_tick_secs() -> u64 {
    60
}

impl SchedulerSection {
    /// Built-in task defaults overlaid with the configured tasks.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig {
            enabled: self.enabled,
            tick: Duration::from_secs(self.tick_secs),
            ..SchedulerConfig::default()
        };
        for (id, section) in &self.tasks {
            let interval = section
                .interval_secs
                .map(Duration::from_secs)
                .or_else(|| config.tasks.get(id).and_then(|t| t.interval));
            config.tasks.insert(
                id.clone(),
                TaskConfig {
                    enabled: section.enabled,
                    interval,
                },
            );
        }
        config
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_true")]
    pub llm_fallback: bool,
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_weight: default_weight(),
            semantic_weight: default_weight(),
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            default_limit: default_limit(),
            llm_fallback: true,
            max_expansions: default_max_expansions(),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}
fn default_candidate_k() -> usize {
    100
}
fn default_limit() -> usize {
    20
}
fn default_max_expansions() -> usize {
    3
}

impl RetrievalConfig {
    pub fn to_fusion_params(&self) -> FusionParams {
        FusionParams {
            keyword_weight: self.keyword_weight,
            semantic_weight: self.semantic_weight,
            candidate_k_keyword: self.candidate_k_keyword,
            candidate_k_vector: self.candidate_k_vector,
            default_limit: self.default_limit,
            llm_fallback: self.llm_fallback,
            max_expansions: self.max_expansions,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PipelineConfig {
    /// Post-processor chain in order; empty means a single default chunker.
    #[serde(default)]
    pub processors: Vec<ProcessorSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    /// Environment variable holding the client secret.
    #[serde(default)]
    pub client_secret_env: Option<String>,
}

const PROVIDERS: [&str; 3] = ["disabled", "openai", "ollama"];

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_secs == 0 {
            bail!("scheduler.tick_secs must be > 0");
        }
        for (id, task) in &self.scheduler.tasks {
            if task.interval_secs == Some(0) {
                bail!("scheduler.tasks.{id}.interval_secs must be > 0");
            }
        }

        self.retrieval
            .to_fusion_params()
            .validate()
            .map_err(|e| anyhow::anyhow!("retrieval: {e}"))?;
        if self.retrieval.default_limit == 0 {
            bail!("retrieval.default_limit must be >= 1");
        }

        if !PROVIDERS.contains(&self.embedding.provider.as_str()) {
            bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                self.embedding.provider
            );
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.unwrap_or(0) == 0 {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        if !PROVIDERS.contains(&self.llm.provider.as_str()) {
            bail!(
                "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
                self.llm.provider
            );
        }
        if self.llm.is_enabled() && self.llm.model.is_none() {
            bail!(
                "llm.model must be specified when provider is '{}'",
                self.llm.provider
            );
        }

        for (source_type, client) in &self.oauth {
            if client.token_url.is_empty() || client.client_id.is_empty() {
                bail!("oauth.{source_type} needs token_url and client_id");
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml(&content)
}
