#![warn(missing_docs)]

//! # toolgate-config
//!
//! Configuration loading for the toolgate orchestration gateway.
//!
//! Settings come from a single JSON configuration file discovered on a
//! precedence chain (project directory, then the user's home, then the XDG
//! config directory), with environment variable overrides on top and
//! `${ENV_VAR}` expansion inside the file text.
//!
//! ## Example
//!
//! ```json
//! {
//!   "servers": {
//!     "files": { "transport": "stdio", "command": "files-server", "args": ["--root", "."] },
//!     "web":   { "transport": "http", "url": "https://tools.example.com/stream",
//!                "headers": { "Authorization": "Bearer ${WEB_TOKEN}" } }
//!   },
//!   "pool": { "maxConcurrent": 100, "queueSize": 200, "queueTimeoutMs": 30000 },
//!   "rateLimit": { "maxRequests": 30, "windowMs": 60000 }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming an explicit config file path.
pub const CONFIG_PATH_ENV: &str = "TOOLGATE_CONFIG";

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "TOOLGATE_STATE_DIR";

/// Errors from config discovery and parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the JSON document.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level toolgate configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Downstream server configurations, keyed by server name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,

    /// Sandbox engine and execution settings.
    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// Downstream pool admission settings.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Per-client rate limit settings.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditSettings,

    /// Schema cache settings.
    #[serde(default)]
    pub schema_cache: SchemaCacheSettings,

    /// Optional namespace prefix stripped from fully-qualified tool names.
    #[serde(default)]
    pub tool_prefix: Option<String>,

    /// Listen address for the HTTP front-end (e.g. "127.0.0.1:7070").
    /// When absent, only the stdio front-end is served.
    #[serde(default)]
    pub http_listen: Option<String>,

    /// State directory override. Environment beats this; both beat the
    /// default of `<user config dir>/toolgate`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Configuration for a single downstream tool server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Transport type: "stdio" or "http".
    pub transport: String,

    /// Command to execute (stdio transport).
    #[serde(default)]
    pub command: Option<String>,

    /// Command arguments (stdio transport).
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overlay for the child process (stdio transport).
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Server URL (http transport).
    #[serde(default)]
    pub url: Option<String>,

    /// HTTP headers (http transport).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-call timeout in milliseconds for this server.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// Consecutive failures before the circuit opens.
    #[serde(default)]
    pub failure_threshold: Option<u32>,

    /// Circuit cooldown before a half-open probe, in milliseconds.
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
}

/// Sandbox engine and execution settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SandboxSettings {
    /// Command for the script-language engine.
    #[serde(default)]
    pub script_engine: Option<EngineCommand>,

    /// Command for the WebAssembly engine.
    #[serde(default)]
    pub wasm_engine: Option<EngineCommand>,

    /// Default execution wall clock in milliseconds.
    #[serde(default = "default_sandbox_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Maximum sandbox code size in bytes.
    #[serde(default = "default_max_code_size")]
    pub max_code_size: usize,

    /// Per-stream output capture cap in bytes.
    #[serde(default = "default_capture_cap")]
    pub capture_cap_bytes: usize,

    /// Grace period after the deadline before the kill signal, in ms.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Roots that requested read/write paths must resolve under. Empty
    /// means no containment restriction.
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,
}

/// A sandbox engine launch command.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineCommand {
    /// The executable to run.
    pub command: String,
    /// Arguments to the executable.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Downstream pool admission settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PoolSettings {
    /// Maximum concurrent downstream calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum entries waiting for admission.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// How long a call may wait in the queue, in milliseconds.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Default per-call timeout in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

/// Per-client rate limit settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RateLimitSettings {
    /// Requests allowed per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Burst capacity. Defaults to `max_requests` when absent.
    #[serde(default)]
    pub burst: Option<u32>,
}

/// Audit log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AuditSettings {
    /// Whether audit logging is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Days to retain daily log files, clamped to 1..=365.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Schema cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SchemaCacheSettings {
    /// Maximum cached descriptors.
    #[serde(default = "default_cache_size")]
    pub max_entries: usize,

    /// Descriptor time-to-live in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_sandbox_timeout_ms() -> u64 {
    30_000
}
fn default_max_code_size() -> usize {
    100 * 1024
}
fn default_capture_cap() -> usize {
    4 * 1024 * 1024
}
fn default_grace_ms() -> u64 {
    2_000
}
fn default_max_concurrent() -> usize {
    100
}
fn default_queue_size() -> usize {
    200
}
fn default_queue_timeout_ms() -> u64 {
    30_000
}
fn default_call_timeout_ms() -> u64 {
    60_000
}
fn default_max_requests() -> u32 {
    30
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_true() -> bool {
    true
}
fn default_retention_days() -> u32 {
    30
}
fn default_cache_size() -> usize {
    1000
}
fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            script_engine: None,
            wasm_engine: None,
            default_timeout_ms: default_sandbox_timeout_ms(),
            max_code_size: default_max_code_size(),
            capture_cap_bytes: default_capture_cap(),
            grace_ms: default_grace_ms(),
            allowed_roots: Vec::new(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_size: default_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            burst: None,
        }
    }
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_retention_days(),
        }
    }
}

impl Default for SchemaCacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_size(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl GatewayConfig {
    /// Parse a config from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = if json_str.trim().is_empty() {
            GatewayConfig::default()
        } else {
            serde_json::from_str(json_str)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a JSON string, expanding `${ENV_VAR}` references.
    pub fn from_json_with_env(json_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(json_str);
        let mut config = Self::from_json(&expanded)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path, expanding environment variables and
    /// applying env overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_with_env(&content)
    }

    /// Resolve the state directory: env override, then config value, then
    /// `<user config dir>/toolgate`.
    pub fn resolve_state_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("toolgate")
    }

    /// Apply recognized environment variable overrides on top of file values.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<bool>("TOOLGATE_AUDIT_ENABLED") {
            self.audit.enabled = v;
        }
        if let Some(v) = env_parse::<u32>("TOOLGATE_AUDIT_RETENTION_DAYS") {
            self.audit.retention_days = v;
        }
        if let Some(v) = env_parse::<usize>("TOOLGATE_MAX_CONCURRENT") {
            self.pool.max_concurrent = v;
        }
        if let Some(v) = env_parse::<usize>("TOOLGATE_QUEUE_SIZE") {
            self.pool.queue_size = v;
        }
        if let Some(v) = env_parse::<u64>("TOOLGATE_QUEUE_TIMEOUT_MS") {
            self.pool.queue_timeout_ms = v;
        }
        if let Some(v) = env_parse::<usize>("TOOLGATE_SCHEMA_CACHE_SIZE") {
            self.schema_cache.max_entries = v;
        }
        if let Ok(bin) = std::env::var("TOOLGATE_SCRIPT_ENGINE_BIN") {
            if !bin.is_empty() {
                self.sandbox.script_engine = Some(EngineCommand {
                    command: bin,
                    args: Vec::new(),
                });
            }
        }
        if let Ok(bin) = std::env::var("TOOLGATE_WASM_ENGINE_BIN") {
            if !bin.is_empty() {
                self.sandbox.wasm_engine = Some(EngineCommand {
                    command: bin,
                    args: Vec::new(),
                });
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, server) in &self.servers {
            match server.transport.as_str() {
                "stdio" => {
                    if server.command.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "server '{}': stdio transport requires 'command'",
                            name
                        )));
                    }
                }
                "http" => {
                    if server.url.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "server '{}': http transport requires 'url'",
                            name
                        )));
                    }
                }
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "server '{}': unsupported transport '{}', supported: stdio, http",
                        name, other
                    )));
                }
            }
        }
        if !(1..=365).contains(&self.audit.retention_days) {
            return Err(ConfigError::Invalid(format!(
                "audit.retentionDays must be in 1..=365, got {}",
                self.audit.retention_days
            )));
        }
        if self.pool.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "pool.maxConcurrent must be at least 1".into(),
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "rateLimit.maxRequests must be at least 1".into(),
            ));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid(
                "rateLimit.windowMs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl RateLimitSettings {
    /// The effective burst capacity: explicit value or `max_requests`.
    pub fn effective_burst(&self) -> u32 {
        self.burst.unwrap_or(self.max_requests)
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `TOOLGATE_CONFIG` environment variable
/// 2. `./toolgate.json` in the current directory
/// 3. `~/.toolgate.json`
/// 4. `<XDG config dir>/toolgate/config.json`
/// 5. None (no config file found; not an error)
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("toolgate.json");
    if cwd.exists() {
        return Some(cwd);
    }

    if let Some(home) = dirs::home_dir() {
        let p = home.join(".toolgate.json");
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let p = config_dir.join("toolgate").join("config.json");
        if p.exists() {
            return Some(p);
        }
    }

    None
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
