//! Configuration loading
//!
//! Settings come from `.research.toml`, found by walking up from the current
//! directory and then in `~/.config/research/`. Missing keys fall back to
//! defaults; the built-in provider definitions are kept unless the file
//! redefines a provider of the same name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the settings file
pub const CONFIG_FILE: &str = ".research.toml";

/// Find a config file by walking up the directory tree, then checking global config.
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("research").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

/// Invalid settings
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    #[error("Role '{role}' uses undefined provider '{provider}'")]
    UnknownProvider { role: String, provider: String },

    #[error("Provider '{provider}' has an invalid base_url: {reason}")]
    InvalidUrl { provider: String, reason: String },

    #[error("Provider '{provider}': {reason}")]
    InvalidProvider { provider: String, reason: String },
}

// ============================================================================
// Settings
// ============================================================================

/// Immutable runtime settings, built once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Upper bound on concurrently running research units
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,

    /// Per-call timeout in seconds; 0 disables it
    #[serde(default)]
    pub agent_timeout_secs: u64,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Provider used by roles that do not name one
    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default)]
    pub roles: RolesConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/sessions.db")
}

fn default_max_parallel_agents() -> usize {
    10
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_provider() -> String {
    "claude_cli".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_parallel_agents: default_max_parallel_agents(),
            agent_timeout_secs: 0,
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            default_provider: default_provider(),
            roles: RolesConfig::default(),
            synthesis: SynthesisConfig::default(),
            providers: builtin_providers(),
        }
    }
}

impl Settings {
    /// Load settings from `.research.toml`, falling back to defaults
    pub fn load() -> Result<Self> {
        if let Some(config_path) = find_config_file(CONFIG_FILE) {
            tracing::debug!("Loading config from: {}", config_path.display());
            return Self::load_from_path(&config_path);
        }

        tracing::debug!("No {} found, using defaults", CONFIG_FILE);
        Ok(Self::default())
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Parse settings from TOML text and merge in the built-in providers
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut settings: Settings = toml::from_str(content)?;
        for (name, provider) in builtin_providers() {
            settings.providers.entry(name).or_insert(provider);
        }
        Ok(settings)
    }

    /// Check ranges and cross references
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_range(
            "max_parallel_agents",
            self.max_parallel_agents as u64,
            1,
            50,
        )?;
        check_range(
            "checkpoint_interval_secs",
            self.checkpoint_interval_secs,
            10,
            300,
        )?;

        for role in Role::ALL {
            let provider = self.provider_for(role);
            if !self.providers.contains_key(provider) {
                return Err(ConfigError::UnknownProvider {
                    role: role.to_string(),
                    provider: provider.to_string(),
                });
            }
        }

        for (name, provider) in &self.providers {
            provider.validate(name)?;
        }

        Ok(())
    }

    /// Per-call timeout, `None` when disabled
    pub fn agent_timeout(&self) -> Option<Duration> {
        (self.agent_timeout_secs > 0).then(|| Duration::from_secs(self.agent_timeout_secs))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn role(&self, role: Role) -> &RoleConfig {
        match role {
            Role::Planner => &self.roles.planner,
            Role::Researcher => &self.roles.researcher,
            Role::Synthesizer => &self.roles.synthesizer,
        }
    }

    /// Provider name for a role, after applying the default
    pub fn provider_for(&self, role: Role) -> &str {
        self.role(role)
            .provider
            .as_deref()
            .unwrap_or(&self.default_provider)
    }
}

fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> std::result::Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

// ============================================================================
// Roles
// ============================================================================

/// The three agent roles of a research workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Researcher,
    Synthesizer,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Planner, Role::Researcher, Role::Synthesizer];
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Planner => write!(f, "planner"),
            Role::Researcher => write!(f, "researcher"),
            Role::Synthesizer => write!(f, "synthesizer"),
        }
    }
}

/// Model and provider choice for one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Logical model alias (`opus`, `sonnet`, ...) or a provider model id
    pub model: String,
    #[serde(default)]
    pub provider: Option<String>,
}

impl RoleConfig {
    fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            provider: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesConfig {
    #[serde(default = "default_planner")]
    pub planner: RoleConfig,
    #[serde(default = "default_researcher")]
    pub researcher: RoleConfig,
    #[serde(default = "default_synthesizer")]
    pub synthesizer: RoleConfig,
}

fn default_planner() -> RoleConfig {
    RoleConfig::with_model("opus")
}

fn default_researcher() -> RoleConfig {
    RoleConfig::with_model("sonnet")
}

fn default_synthesizer() -> RoleConfig {
    RoleConfig::with_model("opus")
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            planner: default_planner(),
            researcher: default_researcher(),
            synthesizer: default_synthesizer(),
        }
    }
}

// ============================================================================
// Synthesis
// ============================================================================

/// What to do when research finishes without a single result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyResultsPolicy {
    /// Fail the session with `NO_RESULTS`
    #[default]
    Fail,
    /// Run synthesis anyway
    Synthesize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default)]
    pub on_empty_results: EmptyResultsPolicy,
}

// ============================================================================
// Providers
// ============================================================================

/// How a provider is reached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Subprocess(SubprocessConfig),
    Http(HttpConfig),
}

impl ProviderConfig {
    /// Logical alias to provider model id table
    pub fn models(&self) -> &HashMap<String, String> {
        match self {
            ProviderConfig::Subprocess(cfg) => &cfg.models,
            ProviderConfig::Http(cfg) => &cfg.models,
        }
    }

    /// Map a logical model alias to this provider's model id.
    ///
    /// Values that already are provider ids, and unknown names, pass through.
    pub fn map_model(&self, logical: &str) -> String {
        let models = self.models();
        if models.values().any(|id| id == logical) {
            return logical.to_string();
        }
        models
            .get(logical)
            .cloned()
            .unwrap_or_else(|| logical.to_string())
    }

    fn validate(&self, name: &str) -> std::result::Result<(), ConfigError> {
        match self {
            ProviderConfig::Subprocess(cfg) if cfg.command.trim().is_empty() => {
                Err(ConfigError::InvalidProvider {
                    provider: name.to_string(),
                    reason: "command is empty".to_string(),
                })
            }
            ProviderConfig::Subprocess(_) => Ok(()),
            ProviderConfig::Http(cfg) => {
                let parsed = url::Url::parse(&cfg.base_url).map_err(|e| ConfigError::InvalidUrl {
                    provider: name.to_string(),
                    reason: e.to_string(),
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigError::InvalidUrl {
                        provider: name.to_string(),
                        reason: format!("unsupported scheme '{}'", parsed.scheme()),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Output format spoken by a subprocess backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// `claude --output-format stream-json`
    ClaudeCli,
    /// `codex exec --json`
    CodexCli,
}

/// Where the prompt is handed to the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptDelivery {
    /// As the final command-line argument
    #[default]
    Argument,
    /// Written to stdin, which is then closed
    Stdin,
}

/// A command-line agent, one process per call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessConfig {
    pub dialect: Dialect,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment for the child; values are expanded (`$HOME`, `${VAR}`)
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub prompt_delivery: PromptDelivery,
    /// Flag that precedes the model id; omitted when unset
    #[serde(default)]
    pub model_flag: Option<String>,
    /// Flag that precedes the system prompt; when unset the system prompt
    /// is merged in front of the prompt
    #[serde(default)]
    pub system_prompt_flag: Option<String>,
    /// Insert `--` before an argument-delivered prompt
    #[serde(default)]
    pub prompt_separator: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub models: HashMap<String, String>,
}

/// A remote agent server reached over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub base_url: String,
    /// Provider id used when a model has no `provider/` prefix
    #[serde(default = "default_remote_provider")]
    pub default_provider_id: String,
    #[serde(default)]
    pub models: HashMap<String, String>,
}

fn default_remote_provider() -> String {
    "opencode".to_string()
}

fn string_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Providers available without any configuration
pub fn builtin_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();

    providers.insert(
        "claude_cli".to_string(),
        ProviderConfig::Subprocess(SubprocessConfig {
            dialect: Dialect::ClaudeCli,
            command: "claude".to_string(),
            args: [
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--allowedTools",
                "WebSearch,WebFetch",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            env: HashMap::new(),
            prompt_delivery: PromptDelivery::Argument,
            model_flag: Some("--model".to_string()),
            system_prompt_flag: Some("--system-prompt".to_string()),
            prompt_separator: true,
            working_dir: None,
            models: string_map(&[("opus", "opus"), ("sonnet", "sonnet"), ("haiku", "haiku")]),
        }),
    );

    providers.insert(
        "codex_cli".to_string(),
        ProviderConfig::Subprocess(SubprocessConfig {
            dialect: Dialect::CodexCli,
            command: "codex".to_string(),
            args: vec!["exec".to_string(), "--json".to_string()],
            env: HashMap::new(),
            prompt_delivery: PromptDelivery::Stdin,
            model_flag: Some("-m".to_string()),
            system_prompt_flag: None,
            prompt_separator: false,
            working_dir: None,
            models: string_map(&[("opus", "gpt-5.2"), ("sonnet", "gpt-5.2"), ("haiku", "gpt-5.2-mini")]),
        }),
    );

    providers.insert(
        "opencode".to_string(),
        ProviderConfig::Http(HttpConfig {
            base_url: "http://127.0.0.1:4096".to_string(),
            default_provider_id: default_remote_provider(),
            models: string_map(&[
                ("opus", "anthropic/claude-opus-4-5"),
                ("sonnet", "anthropic/claude-sonnet-4-5"),
                ("haiku", "anthropic/claude-haiku-4-5"),
            ]),
        }),
    );

    providers
}
