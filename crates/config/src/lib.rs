//! Configuration loading, validation, and management for capstan.
//!
//! Loads configuration from `~/.capstan/config.toml` with environment
//! variable overrides. Validates all settings at startup, including the
//! cross-references between tool entries and remote server definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use capstan_core::tool::{ToolDefinition, ToolEnvironment};

/// The root configuration structure.
///
/// Maps directly to `~/.capstan/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Model endpoint and sampling settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Turn loop settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Local tool execution settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Tool declarations
    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    /// Remote tool servers, keyed by the name used for namespacing
    #[serde(default)]
    pub remote_servers: HashMap<String, RemoteServerConfig>,
}

/// How tool calls travel between the model and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Structured tool-call deltas in the response stream
    #[serde(rename = "openai-compat")]
    OpenAiCompat,

    /// Tool calls embedded in the answer text as tagged JSON blocks
    #[serde(rename = "marker")]
    Marker,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Whole-request timeout for the streaming HTTP call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::OpenAiCompat
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("top_p", &self.top_p)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum model rounds per turn before forced completion
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Default budget for host-environment tool calls
    #[serde(default = "default_timeout_ms")]
    pub host_timeout_ms: u64,

    /// System prompt inserted at the head of every conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Files whose contents are appended to the system prompt
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_files: Vec<String>,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            host_timeout_ms: default_timeout_ms(),
            system_prompt: None,
            context_files: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// "node" for the built-in harness, "command" for a custom runtime
    #[serde(default = "default_sandbox_runtime")]
    pub runtime: String,

    /// The runtime executable when `runtime = "command"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Default budget for local tool calls
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Whether sandbox subprocesses see the parent environment
    #[serde(default)]
    pub inherit_env: bool,
}

fn default_sandbox_runtime() -> String {
    "node".into()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: default_sandbox_runtime(),
            command: None,
            args: vec![],
            default_timeout_ms: default_timeout_ms(),
            inherit_env: false,
        }
    }
}

/// One declared tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema for the arguments
    #[serde(default = "default_schema")]
    pub parameters: serde_json::Value,

    /// JSON Schema for the result (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<serde_json::Value>,

    /// Per-tool budget; falls back to the environment's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// "local", "host", or "remote"
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Code to run in the sandbox (`environment = "local"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Remote server name (`environment = "remote"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// The tool's name on the remote server, when it differs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({})
}
fn default_environment() -> String {
    "local".into()
}
fn default_true() -> bool {
    true
}

/// A remote tool server definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    #[serde(flatten)]
    pub transport: RemoteTransport,

    /// Per-request budget for this server
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// How to reach a remote tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum RemoteTransport {
    /// Spawn a subprocess and speak line-delimited JSON-RPC on its stdio
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },

    /// POST JSON-RPC to an HTTP endpoint
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl AppConfig {
    /// Load configuration from the default path (~/.capstan/config.toml).
    ///
    /// Also checks environment variables:
    /// - `CAPSTAN_API_KEY` (falls back to `OPENAI_API_KEY`)
    /// - `CAPSTAN_BASE_URL`
    /// - `CAPSTAN_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        if config.provider.api_key.is_none() {
            config.provider.api_key = std::env::var("CAPSTAN_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(base_url) = std::env::var("CAPSTAN_BASE_URL") {
            config.provider.base_url = base_url;
        }

        if let Ok(model) = std::env::var("CAPSTAN_MODEL") {
            config.provider.model = model;
        }

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

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".capstan")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if let Some(top_p) = self.provider.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ConfigError::ValidationError(
                    "provider.top_p must be between 0.0 and 1.0".into(),
                ));
            }
        }

        if self.engine.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_iterations must be at least 1".into(),
            ));
        }

        match self.sandbox.runtime.as_str() {
            "node" => {}
            "command" => {
                if self.sandbox.command.is_none() {
                    return Err(ConfigError::ValidationError(
                        "sandbox.command is required when sandbox.runtime = \"command\"".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown sandbox.runtime \"{other}\" (expected \"node\" or \"command\")"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if tool.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "tool entries must have a name".into(),
                ));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
            match tool.environment.as_str() {
                "local" => {
                    if tool.code.is_none() {
                        return Err(ConfigError::ValidationError(format!(
                            "tool {} is local but has no code",
                            tool.name
                        )));
                    }
                }
                "host" => {}
                "remote" => {
                    let Some(server) = &tool.server else {
                        return Err(ConfigError::ValidationError(format!(
                            "tool {} is remote but names no server",
                            tool.name
                        )));
                    };
                    if !self.remote_servers.contains_key(server) {
                        return Err(ConfigError::ValidationError(format!(
                            "tool {} references unknown remote server {}",
                            tool.name, server
                        )));
                    }
                }
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "tool {} has unknown environment \"{other}\" (expected \"local\", \"host\", or \"remote\")",
                        tool.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Build catalog definitions from the `[[tools]]` entries.
    ///
    /// Missing per-tool timeouts fall back to the owning environment's
    /// default: the sandbox default for local tools, the engine host
    /// timeout for host tools, and the server timeout for remote tools.
    pub fn tool_definitions(&self) -> Result<Vec<ToolDefinition>, ConfigError> {
        self.validate()?;
        let mut definitions = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            let (environment, fallback_timeout) = match tool.environment.as_str() {
                "local" => (
                    ToolEnvironment::Local {
                        code: tool.code.clone().unwrap_or_default(),
                    },
                    self.sandbox.default_timeout_ms,
                ),
                "host" => (ToolEnvironment::Host, self.engine.host_timeout_ms),
                // validate() has already checked the reference
                _ => {
                    let server = tool.server.clone().unwrap_or_default();
                    let timeout = self
                        .remote_servers
                        .get(&server)
                        .map(|s| s.timeout_ms)
                        .unwrap_or_else(default_timeout_ms);
                    (
                        ToolEnvironment::Remote {
                            server,
                            remote_name: tool
                                .remote_name
                                .clone()
                                .unwrap_or_else(|| tool.name.clone()),
                        },
                        timeout,
                    )
                }
            };
            definitions.push(ToolDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters_schema: tool.parameters.clone(),
                returns_schema: tool.returns.clone(),
                timeout_ms: tool.timeout_ms.unwrap_or(fallback_timeout),
                enabled: tool.enabled,
                environment,
            });
        }
        Ok(definitions)
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string (for `onboard`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
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
