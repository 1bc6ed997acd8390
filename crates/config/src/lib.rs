//! Configuration management for Sortie
//!
//! Loads and saves agent, shell, retry and provider parameters from
//! `~/.sortie/config.json`. Every field carries a serde default so a partial
//! file (or no file at all) yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod paths;

pub use paths::{config_path, data_dir, expand_home, workspace_path};

/// Errors in configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("CONFIG IO ERROR: {0}")]
    Io(#[from] std::io::Error),

    #[error("CONFIG PARSE ERROR: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CONFIG NOT FOUND: {0}")]
    NotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Credentials for one OpenAI-compatible endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

/// All known provider endpoints
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openrouter: ProviderConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub vllm: ProviderConfig,
}

/// Agent loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_workspace() -> String {
    "~/.sortie/workspace".to_string()
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_iterations() -> u32 {
    50
}

/// Shell process runner parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// How long a command may run before it is handed back as a background task
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Wait between SIGTERM and SIGKILL during cleanup
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Wait after writing stdin before collecting output
    #[serde(default = "default_settle_ms")]
    pub stdin_settle_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            stdin_settle_ms: default_settle_ms(),
        }
    }
}

impl ShellConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn stdin_settle(&self) -> Duration {
        Duration::from_millis(self.stdin_settle_ms)
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_kill_grace_ms() -> u64 {
    500
}

fn default_settle_ms() -> u64 {
    300
}

/// Retry executor parameters for network calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_slow_mode_delay_ms")]
    pub slow_mode_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            slow_mode_delay_ms: default_slow_mode_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_slow_mode_delay_ms() -> u64 {
    2000
}

/// Tool dispatcher parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_max_output_bytes() -> usize {
    12 * 1024
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Config {
    /// Load from the default location
    pub async fn load() -> Result<Self> {
        let path = config_path();
        Self::load_from(&path).await
    }

    /// Load from specific location
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("◆ NO CONFIG AT {:?}, USING DEFAULTS", path);
            return Ok(Config::default());
        }

        debug!("◆ READING CONFIG FROM {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save to the default location
    pub async fn save(&self) -> Result<()> {
        let path = config_path();
        self.save_to(&path).await
    }

    /// Save to specific location
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        debug!("◆ WRITING CONFIG TO {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Working directory for shell commands
    pub fn workspace_path(&self) -> PathBuf {
        expand_home(&self.agent.workspace)
    }

    /// First configured API key, in provider priority order
    pub fn api_key(&self) -> Option<String> {
        [
            &self.providers.openrouter,
            &self.providers.openai,
            &self.providers.vllm,
        ]
        .into_iter()
        .map(|p| p.api_key.clone())
        .find(|key| !key.is_empty())
    }

    /// API base matching the selected key
    pub fn api_base(&self) -> Option<String> {
        if !self.providers.openrouter.api_key.is_empty() {
            return self
                .providers
                .openrouter
                .api_base
                .clone()
                .or_else(|| Some("https://openrouter.ai/api/v1".to_string()));
        }

        if !self.providers.openai.api_key.is_empty() {
            return self.providers.openai.api_base.clone();
        }

        match self.providers.vllm.api_base {
            Some(ref api_base) if !api_base.is_empty() => Some(api_base.clone()),
            _ => None,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key().is_some()
    }

    pub fn default_model(&self) -> String {
        self.agent.model.clone()
    }
}

/// Write a default config (if missing) and create the workspace
pub async fn init() -> Result<Config> {
    let config_path = config_path();

    if config_path.exists() {
        warn!("◆ CONFIG ALREADY PRESENT AT {:?}", config_path);
    } else {
        let config = Config::default();
        config.save().await?;
        info!("◆ CONFIG WRITTEN TO {:?}", config_path);
    }

    let config = Config::load().await?;
    let workspace = config.workspace_path();
    tokio::fs::create_dir_all(&workspace).await?;
    info!("◆ WORKSPACE READY AT {:?}", workspace);

    Ok(config)
}
