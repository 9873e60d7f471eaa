use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_MAX_CONCURRENT_AGENTS, DEFAULT_SERVER_PORT, STUCK_TIMEOUT_SECS,
};
use crate::models::Project;
use crate::{AdtError, Result};


/// Resolve the ADT home directory (`ADT_HOME` overrides `~/.adt`).
pub fn adt_home() -> PathBuf {
    if let Ok(home) = std::env::var("ADT_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".adt")
}

/// Ensure the home directory structure exists.
pub fn ensure_adt_home(home: &Path) -> Result<()> {
    std::fs::create_dir_all(home.join("data"))?;
    std::fs::create_dir_all(home.join("agents"))?;
    std::fs::create_dir_all(home.join("processes"))?;
    std::fs::create_dir_all(home.join("logs").join("agents"))?;
    std::fs::create_dir_all(home.join("logs").join("processes"))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: TlsConfig::default(),
        }
    }
}

/// A named way of launching an agent child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider kind tag, e.g. "claude-cli", "cursor-agent".
    #[serde(rename = "type")]
    pub kind: String,
    /// Binary to invoke; defaults derived from `kind` when absent.
    pub command: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_stuck_timeout")]
    pub stuck_timeout: i64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

fn default_stuck_timeout() -> i64 {
    STUCK_TIMEOUT_SECS
}

fn default_retry_limit() -> u32 {
    crate::constants::DEFAULT_MAX_RETRIES
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            stuck_timeout: default_stuck_timeout(),
            retry_limit: default_retry_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_provider_name")]
    pub default_provider: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// When false the orchestrator must be started explicitly.
    #[serde(default)]
    pub auto_spawn: bool,
    #[serde(default)]
    pub escalation: EscalationConfig,
}

fn default_provider_name() -> String {
    "claude".to_string()
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_AGENTS
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider_name(),
            max_concurrent: default_max_concurrent(),
            auto_spawn: false,
            escalation: EscalationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bot token; `${NAME}` references resolve via the vault then the env.
    pub token: Option<String>,
    #[serde(default)]
    pub allowed_users: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscoveryConfig {
    /// Base URL of an Ollama-style generate API used to classify dev
    /// processes; the fixed heuristics apply when unset or unreachable.
    pub llm_endpoint: Option<String>,
}

/// Main configuration, loaded from `<home>/config.yml` layered with
/// `ADT_`-prefixed environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl Config {
    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join("config.yml");
        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()));
        }
        builder = builder.add_source(config::Environment::with_prefix("ADT").separator("__"));
        let settings = builder
            .build()
            .map_err(|e| AdtError::Configuration(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| AdtError::Configuration(e.to_string()))
    }

    /// Get a provider by name, falling back to the configured default.
    pub fn provider(&self, name: Option<&str>) -> Option<(String, ProviderConfig)> {
        if let Some(name) = name {
            return self
                .providers
                .get(name)
                .map(|p| (name.to_string(), p.clone()));
        }
        if let Some(p) = self.providers.get(&self.agents.default_provider) {
            return Some((self.agents.default_provider.clone(), p.clone()));
        }
        self.providers
            .iter()
            .find(|(_, p)| p.default)
            .map(|(n, p)| (n.clone(), p.clone()))
    }
}

/// Default config file template written by `config init`.
pub const CONFIG_TEMPLATE: &str = r#"# adt-core configuration
# Secret values can be referenced as ${NAME}; they resolve against the
# vault first, then the process environment.

server:
  host: "127.0.0.1"
  port: 8420

providers:
  claude:
    type: claude-cli
    default: true

agents:
  default_provider: claude
  max_concurrent: 3
  auto_spawn: false
  escalation:
    stuck_timeout: 300
    retry_limit: 3

channels:
  discord:
    enabled: false
    # token: ${DISCORD_BOT_TOKEN}
    # allowed_users: [123456789]

# Process discovery: point at an Ollama-style endpoint to classify dev
# processes with a local model; heuristics apply when unset.
# discovery:
#   llm_endpoint: "http://127.0.0.1:11434"
"#;

/// Read-only view onto the external project registry (`projects.json`).
///
/// The registry is owned by an external collaborator; the core only looks
/// projects up by name.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    path: PathBuf,
}

impl ProjectRegistry {
    pub fn new(home: &Path) -> Self {
        Self {
            path: home.join("projects.json"),
        }
    }

    pub fn list(&self) -> Result<Vec<Project>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn get(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.list()?.into_iter().find(|p| p.name == name))
    }
}
