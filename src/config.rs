use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_secs: default_poll_secs(),
            lease_secs: default_lease_secs(),
            page_size: default_page_size(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_poll_secs() -> u64 {
    5
}
fn default_lease_secs() -> i64 {
    300
}
fn default_page_size() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// `rules` (built-in heuristics) or `openai` (chat-completions API).
    #[serde(default = "default_extraction_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
    /// OpenAI-compatible base URL; override for self-hosted endpoints.
    #[serde(default = "default_openai_base_url")]
    pub api_url: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_extraction_provider(),
            model: None,
            timeout_secs: default_extraction_timeout_secs(),
            api_url: default_openai_base_url(),
        }
    }
}

fn default_extraction_provider() -> String {
    "rules".to_string()
}
fn default_extraction_timeout_secs() -> u64 {
    30
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// OpenAI-compatible base URL; override for self-hosted endpoints.
    #[serde(default = "default_openai_base_url")]
    pub api_url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            max_retries: default_embedding_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
            api_url: default_openai_base_url(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// Hard cap on items returned per category by the context query.
    /// The commits category is allowed twice this cap.
    #[serde(default = "default_max_per_category")]
    pub max_per_category: i64,
    #[serde(default = "default_traverse_depth")]
    pub traverse_depth: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_per_category: default_max_per_category(),
            traverse_depth: default_traverse_depth(),
        }
    }
}

fn default_max_per_category() -> i64 {
    10
}
fn default_traverse_depth() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub github: BTreeMap<String, GithubConnectorConfig>,
    #[serde(default)]
    pub slack: BTreeMap<String, SlackConnectorConfig>,
    #[serde(default)]
    pub discord: BTreeMap<String, DiscordConnectorConfig>,
}

impl ConnectorsConfig {
    pub fn is_empty(&self) -> bool {
        self.github.is_empty() && self.slack.is_empty() && self.discord.is_empty()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConnectorConfig {
    pub owner: String,
    pub repo: String,
    /// Environment variable holding the API token. The token value itself
    /// never appears in config files or logs.
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    #[serde(default = "default_github_events")]
    pub events: Vec<String>,
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_github_events() -> Vec<String> {
    vec![
        "commits".to_string(),
        "pulls".to_string(),
        "issues".to_string(),
    ]
}
fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConnectorConfig {
    pub channel_id: String,
    #[serde(default = "default_slack_token_env")]
    pub token_env: String,
    #[serde(default = "default_slack_api_url")]
    pub api_url: String,
}

fn default_slack_token_env() -> String {
    "SLACK_TOKEN".to_string()
}
fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConnectorConfig {
    pub channel_id: String,
    #[serde(default = "default_discord_token_env")]
    pub token_env: String,
    #[serde(default = "default_discord_api_url")]
    pub api_url: String,
}

fn default_discord_token_env() -> String {
    "DISCORD_TOKEN".to_string()
}
fn default_discord_api_url() -> String {
    "https://discord.com/api/v10".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;

    let config: Config =
        toml::from_str(&content).with_context(|| format!("invalid TOML in {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.scheduler.workers == 0 {
        anyhow::bail!("scheduler.workers must be >= 1");
    }
    if config.scheduler.page_size == 0 {
        anyhow::bail!("scheduler.page_size must be >= 1");
    }
    if config.scheduler.lease_secs < 1 {
        anyhow::bail!("scheduler.lease_secs must be >= 1");
    }

    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        anyhow::bail!("retry.base_delay_ms must be <= retry.max_delay_ms");
    }

    match config.extraction.provider.as_str() {
        "rules" => {}
        "openai" => {
            if config.extraction.model.is_none() {
                anyhow::bail!("extraction.model must be set when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be rules or openai.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be set when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.query.max_per_category < 1 {
        anyhow::bail!("query.max_per_category must be >= 1");
    }
    if config.query.traverse_depth == 0 {
        anyhow::bail!("query.traverse_depth must be >= 1");
    }

    for (name, gh) in &config.connectors.github {
        if gh.owner.is_empty() || gh.repo.is_empty() {
            anyhow::bail!("connectors.github.{}: owner and repo are required", name);
        }
        for event in &gh.events {
            match event.as_str() {
                "commits" | "pulls" | "issues" => {}
                other => anyhow::bail!(
                    "connectors.github.{}: unknown event stream '{}'",
                    name,
                    other
                ),
            }
        }
    }
    for (name, slack) in &config.connectors.slack {
        if slack.channel_id.is_empty() {
            anyhow::bail!("connectors.slack.{}: channel_id is required", name);
        }
    }
    for (name, discord) in &config.connectors.discord {
        if discord.channel_id.is_empty() {
            anyhow::bail!("connectors.discord.{}: channel_id is required", name);
        }
    }

    Ok(())
}
