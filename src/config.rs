//! TOML configuration and environment secrets.
//!
//! Every section has defaults, so a missing config file yields a usable
//! [`Config`]. Secrets (the completion API key and the admin secret) never
//! live in the file; the file only names the environment variables that
//! hold them. See [`Secrets::from_env`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::prompt::PromptMode;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_path")]
    pub path: PathBuf,
    /// Maximum characters kept in the knowledge file.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            path: default_knowledge_path(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_knowledge_path() -> PathBuf {
    PathBuf::from("./data/knowledge.txt")
}
fn default_max_chars() -> usize {
    4500
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}
fn default_model() -> String {
    "nvidia/nemotron-3-nano-30b-a3b:free".to_string()
}
fn default_max_output_tokens() -> u32 {
    80
}
fn default_temperature() -> f32 {
    0.4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default)]
    pub mode: PromptMode,
    /// Number of most recent turns (including the pending one) sent as context.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// Cap on each per-session log; oldest entries are evicted first.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Replaces the built-in instruction for `mode` when set.
    #[serde(default)]
    pub system_instruction: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            mode: PromptMode::default(),
            history_turns: default_history_turns(),
            max_history: default_max_history(),
            greeting: default_greeting(),
            system_instruction: None,
        }
    }
}

fn default_history_turns() -> usize {
    3
}
fn default_max_history() -> usize {
    200
}
fn default_greeting() -> String {
    "Hi! I'm here to help you. Ask me anything!".to_string()
}

/// How the admin secret is entered.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnlockMethod {
    /// Typed inline in the chat stream while the admin context is active.
    #[default]
    Chat,
    /// Submitted through the dedicated unlock endpoint.
    Password,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default)]
    pub unlock: UnlockMethod,
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            unlock: UnlockMethod::default(),
            secret_env: default_secret_env(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

fn default_secret_env() -> String {
    "KCHAT_ADMIN_SECRET".to_string()
}
fn default_max_failed_attempts() -> u32 {
    5
}
fn default_lockout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Sessions untouched for this long are dropped.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

fn default_session_idle_secs() -> u64 {
    3600
}

/// Loads and validates the configuration.
///
/// A missing file is not an error; all defaults apply.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.knowledge.max_chars == 0 {
        bail!("knowledge.max_chars must be > 0");
    }

    if config.completion.endpoint.trim().is_empty() {
        bail!("completion.endpoint must not be empty");
    }
    if config.completion.model.trim().is_empty() {
        bail!("completion.model must not be empty");
    }
    if config.completion.max_output_tokens == 0 {
        bail!("completion.max_output_tokens must be > 0");
    }
    if !(0.0..=2.0).contains(&config.completion.temperature) {
        bail!("completion.temperature must be in [0.0, 2.0]");
    }
    if config.completion.timeout_secs == 0 {
        bail!("completion.timeout_secs must be > 0");
    }

    if config.chat.max_history == 0 {
        bail!("chat.max_history must be > 0");
    }

    if config.admin.max_failed_attempts == 0 {
        bail!("admin.max_failed_attempts must be >= 1");
    }

    if config.server.session_idle_secs == 0 {
        bail!("server.session_idle_secs must be > 0");
    }

    Ok(())
}

/// Secrets resolved from the environment at startup.
#[derive(Clone)]
pub struct Secrets {
    pub api_key: String,
    pub admin_secret: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("api_key", &"<redacted>")
            .field("admin_secret", &"<redacted>")
            .finish()
    }
}

impl Secrets {
    /// Reads both secrets. Fails when either variable is unset or blank;
    /// there is no built-in admin secret.
    pub fn from_env(config: &Config) -> Result<Self> {
        Ok(Self {
            api_key: api_key_from_env(config)?,
            admin_secret: required_env(&config.admin.secret_env, "admin secret")?,
        })
    }
}

/// Reads only the completion API key (for commands that never unlock admin).
pub fn api_key_from_env(config: &Config) -> Result<String> {
    required_env(&config.completion.api_key_env, "completion API key")
}

fn required_env(var: &str, what: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("{} missing: set the {} environment variable", what, var),
    }
}
