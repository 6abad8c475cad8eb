use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level project configuration loaded from `.fastband/config.yaml`.
///
/// The file is an external concern and is consumed read-only; missing file
/// or missing sections fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub tickets: TicketsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            tickets: TicketsConfig::default(),
            memory: MemoryConfig::default(),
            hub: HubConfig::default(),
            webhooks: WebhooksConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `<project>/.fastband/config.yaml`, falling back to
    /// defaults when the file does not exist.
    pub fn load(project_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = project_root.as_ref().join(".fastband").join("config.yaml");
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_project_name() -> String {
    "fastband".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketsConfig {
    /// Storage backend: "json" or "sqlite".
    #[serde(default = "default_ticket_backend")]
    pub backend: String,
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            backend: default_ticket_backend(),
        }
    }
}

fn default_ticket_backend() -> String {
    "json".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Base token allocation for a new session budget.
    #[serde(default = "default_base_allocation")]
    pub base_allocation: u64,
    /// Maximum number of budget expansions per session.
    #[serde(default = "default_max_expansions")]
    pub max_expansions: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_allocation: default_base_allocation(),
            max_expansions: default_max_expansions(),
        }
    }
}

fn default_base_allocation() -> u64 {
    20_000
}
fn default_max_expansions() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_per_ip: default_max_per_ip(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}
fn default_max_per_ip() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    /// Request timeout in seconds.
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: u64,
    /// Number of retries after the initial attempt.
    #[serde(default = "default_webhook_retries")]
    pub max_retries: u32,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_webhook_timeout(),
            max_retries: default_webhook_retries(),
        }
    }
}

fn default_webhook_timeout() -> u64 {
    10
}
fn default_webhook_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Soft cap on simultaneously active tools.
    #[serde(default = "default_max_active_tools")]
    pub max_active: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_active: default_max_active_tools(),
        }
    }
}

fn default_max_active_tools() -> usize {
    60
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
