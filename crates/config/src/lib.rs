//! Configuration loading, validation, and management for Clinscribe.
//!
//! Loads configuration from `~/.clinscribe/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use clinscribe_core::tool::ToolKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard ceiling for any iteration cap.
pub const MAX_ITERATION_CAP: u32 = 50;

/// The root configuration structure.
///
/// Maps directly to `~/.clinscribe/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Completion service
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Per-user admission control
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Exploration sub-loop settings
    #[serde(default)]
    pub exploration: ExplorationConfig,

    /// Session store settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Practice-management backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Personas by name
    #[serde(default = "default_personas")]
    pub personas: BTreeMap<String, PersonaConfig>,
}

fn default_log_level() -> String {
    "info".into()
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Deadline for one streamed completion call
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4.1".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_completion_timeout() -> u64 {
    120
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_completion_timeout(),
        }
    }
}

impl std::fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Concurrent turns allowed per user
    #[serde(default = "default_max_requests_per_user")]
    pub max_requests_per_user: usize,

    /// How often idle slots are reclaimed (0 = never in the background)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_requests_per_user() -> usize {
    10
}
fn default_sweep_interval() -> u64 {
    300
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_requests_per_user: default_max_requests_per_user(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Completion calls per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Stored messages replayed into each turn
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Capacity of the per-turn stream channel
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

fn default_max_iterations() -> u32 {
    6
}
fn default_tool_timeout() -> u64 {
    30
}
fn default_history_limit() -> usize {
    20
}
fn default_stream_buffer() -> usize {
    64
}

impl AgentConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_timeout_secs: default_tool_timeout(),
            history_limit: default_history_limit(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: u32,

    /// Estimated tokens per retrieved segment
    #[serde(default = "default_avg_tokens_per_item")]
    pub avg_tokens_per_item: u32,

    #[serde(default = "default_exploration_iterations")]
    pub max_iterations: u32,

    /// Corpora with at most this many sources are pulled in full
    #[serde(default = "default_small_corpus_threshold")]
    pub small_corpus_threshold: usize,

    /// Items returned by a preview
    #[serde(default = "default_preview_limit")]
    pub preview_limit: usize,

    /// Items returned by a targeted search
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

fn default_token_budget() -> u32 {
    60_000
}
fn default_avg_tokens_per_item() -> u32 {
    75
}
fn default_exploration_iterations() -> u32 {
    25
}
fn default_small_corpus_threshold() -> usize {
    3
}
fn default_preview_limit() -> usize {
    10
}
fn default_search_limit() -> usize {
    20
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            avg_tokens_per_item: default_avg_tokens_per_item(),
            max_iterations: default_exploration_iterations(),
            small_corpus_threshold: default_small_corpus_threshold(),
            preview_limit: default_preview_limit(),
            search_limit: default_search_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// "in_memory" or "file"
    #[serde(default = "default_session_backend")]
    pub backend: String,

    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,

    /// How often expired sessions are purged
    #[serde(default = "default_session_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Directory for the file backend (default: ~/.clinscribe/sessions)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_session_backend() -> String {
    "in_memory".into()
}
fn default_ttl_minutes() -> u64 {
    240
}
fn default_session_sweep_interval() -> u64 {
    300
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("sessions"))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_session_backend(),
            ttl_minutes: default_ttl_minutes(),
            sweep_interval_secs: default_session_sweep_interval(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the practice-management REST API (without the `/api/v1` prefix)
    #[serde(default = "default_backend_url")]
    pub api_url: String,

    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

fn default_backend_url() -> String {
    "http://localhost:8080".into()
}
fn default_backend_timeout() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: default_backend_url(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

/// A persona: system prompt, model parameters and the tools it may use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub display_name: String,

    pub system_prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tool wire names. Empty = no tools.
    #[serde(default)]
    pub tools: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl PersonaConfig {
    /// Parsed tool identities. Unknown names are a validation error.
    pub fn tool_kinds(&self) -> Result<Vec<ToolKind>, ConfigError> {
        self.tools
            .iter()
            .map(|name| {
                name.parse::<ToolKind>().map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "persona '{}' lists unknown tool '{name}'",
                        self.display_name
                    ))
                })
            })
            .collect()
    }
}

/// Name of the practitioner-facing persona.
pub const WEB_ASSISTANT: &str = "web_assistant";
/// Name of the client-facing supportive persona.
pub const THERAPIST: &str = "therapist";

const WEB_ASSISTANT_PROMPT: &str = "You are an AI assistant for a mental health practice management system. \
You help practitioners with client management, session review, document generation and administrative tasks. \
Always maintain professional boundaries.\n\n\
Tool chaining rules:\n\
1. For a client NAME, call search_clients first, then use the returned client_id.\n\
2. For conversations with a client, use get_latest_conversation or get_conversations with the client_id.\n\
3. To load a session, search_sessions, then validate_sessions, then set_client_selection, then load_session_direct.\n\
4. Before answering questions about loaded sessions, call get_loaded_sessions and use the exact session_id it returns.\n\
5. Format session lists as numbered lists so the user can refer to them by number.";

const THERAPIST_PROMPT: &str = "You are a warm, empathetic supportive companion. \
Use active listening and validation, offer practical coping strategies, and ask thoughtful follow-up questions. \
You are not a replacement for professional therapy: encourage professional help for serious concerns \
and always prioritise the person's safety.";

fn default_personas() -> BTreeMap<String, PersonaConfig> {
    let web_tools = ToolKind::ALL
        .iter()
        .filter(|k| {
            !matches!(
                k,
                ToolKind::MoodCheckIn | ToolKind::CopingStrategies | ToolKind::BreathingExercise
            )
        })
        .map(|k| k.as_str().to_string())
        .collect();

    let mut personas = BTreeMap::new();
    personas.insert(
        WEB_ASSISTANT.to_string(),
        PersonaConfig {
            display_name: "AI Assistant".into(),
            system_prompt: WEB_ASSISTANT_PROMPT.into(),
            model: None,
            temperature: None,
            max_tokens: Some(32_768),
            tools: web_tools,
            max_iterations: None,
        },
    );
    personas.insert(
        THERAPIST.to_string(),
        PersonaConfig {
            display_name: "Supportive Companion".into(),
            system_prompt: THERAPIST_PROMPT.into(),
            model: None,
            temperature: Some(0.8),
            max_tokens: Some(1_000),
            tools: vec![
                ToolKind::MoodCheckIn.as_str().into(),
                ToolKind::CopingStrategies.as_str().into(),
                ToolKind::BreathingExercise.as_str().into(),
            ],
            max_iterations: Some(3),
        },
    );
    personas
}

impl AppConfig {
    /// Load configuration from the default path (~/.clinscribe/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `CLINSCRIBE_API_KEY`, then `OPENAI_API_KEY`
    /// - `CLINSCRIBE_MODEL`, `CLINSCRIBE_API_URL`
    /// - `MAX_REQUESTS_PER_USER`, `SESSION_TIMEOUT_MINUTES`, `LOG_LEVEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through a lookup function.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if self.completion.api_key.is_none() {
            self.completion.api_key = var("CLINSCRIBE_API_KEY").or_else(|| var("OPENAI_API_KEY"));
        }
        if let Some(model) = var("CLINSCRIBE_MODEL") {
            self.completion.model = model;
        }
        if let Some(url) = var("CLINSCRIBE_API_URL") {
            self.completion.api_url = url;
        }
        if let Some(raw) = var("MAX_REQUESTS_PER_USER") {
            self.admission.max_requests_per_user = parse_env("MAX_REQUESTS_PER_USER", &raw)?;
        }
        if let Some(raw) = var("SESSION_TIMEOUT_MINUTES") {
            self.session.ttl_minutes = parse_env("SESSION_TIMEOUT_MINUTES", &raw)?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".clinscribe")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.completion.temperature) {
            return Err(ConfigError::ValidationError(
                "completion.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.admission.max_requests_per_user == 0 {
            return Err(ConfigError::ValidationError(
                "admission.max_requests_per_user must be > 0".into(),
            ));
        }

        check_iterations("agent.max_iterations", self.agent.max_iterations)?;
        check_iterations("exploration.max_iterations", self.exploration.max_iterations)?;

        if self.agent.stream_buffer == 0 {
            return Err(ConfigError::ValidationError("agent.stream_buffer must be > 0".into()));
        }

        if self.exploration.token_budget == 0 || self.exploration.avg_tokens_per_item == 0 {
            return Err(ConfigError::ValidationError(
                "exploration.token_budget and exploration.avg_tokens_per_item must be > 0".into(),
            ));
        }

        if self.session.ttl_minutes == 0 {
            return Err(ConfigError::ValidationError("session.ttl_minutes must be > 0".into()));
        }

        if self.session.sweep_interval_secs == 0 || self.admission.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError("sweep intervals must be > 0".into()));
        }

        if !matches!(self.session.backend.as_str(), "in_memory" | "file") {
            return Err(ConfigError::ValidationError(format!(
                "session.backend must be 'in_memory' or 'file', got '{}'",
                self.session.backend
            )));
        }

        for (name, persona) in &self.personas {
            persona.tool_kinds()?;
            if let Some(cap) = persona.max_iterations {
                check_iterations(&format!("personas.{name}.max_iterations"), cap)?;
            }
            if let Some(t) = persona.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(ConfigError::ValidationError(format!(
                        "personas.{name}.temperature must be between 0.0 and 2.0"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.completion.api_key.is_some()
    }

    /// Look up a persona by name.
    pub fn persona(&self, name: &str) -> Option<&PersonaConfig> {
        self.personas.get(name)
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn check_iterations(field: &str, value: u32) -> Result<(), ConfigError> {
    if value == 0 || value > MAX_ITERATION_CAP {
        return Err(ConfigError::ValidationError(format!(
            "{field} must be between 1 and {MAX_ITERATION_CAP}, got {value}"
        )));
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} has invalid value '{raw}'")))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            completion: CompletionConfig::default(),
            admission: AdmissionConfig::default(),
            agent: AgentConfig::default(),
            exploration: ExplorationConfig::default(),
            session: SessionConfig::default(),
            backend: BackendConfig::default(),
            personas: default_personas(),
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `log_level` is used as the filter.
pub fn init_tracing(log_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .try_init();
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for clinscribe_core::Error {
    fn from(e: ConfigError) -> Self {
        clinscribe_core::Error::Config { message: e.to_string() }
    }
}
