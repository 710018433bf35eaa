use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{DEFAULT_HIL_BUDGET, DEFAULT_HIL_COUNT, DEFAULT_SUBTYPE};

/// Top-level configuration loaded from `~/.reagent/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Config {
    /// Load config from `~/.reagent/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.agents.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        data_dir().join("config.toml")
    }
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".reagent")
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
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "general.log_level must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// The database path with a leading `~/` expanded to the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        match self.path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest),
            None => PathBuf::from(&self.path),
        }
    }
}

fn default_store_path() -> String {
    "~/.reagent/agents.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_subtype")]
    pub default_subtype: String,
    #[serde(default = "default_hil_budget")]
    pub default_hil_budget: f64,
    #[serde(default = "default_hil_count")]
    pub default_hil_count: u32,
    #[serde(default = "default_completion_poll_ms")]
    pub completion_poll_ms: u64,
    #[serde(default = "default_max_history_in_prompt")]
    pub max_history_in_prompt: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_subtype: default_subtype(),
            default_hil_budget: default_hil_budget(),
            default_hil_count: default_hil_count(),
            completion_poll_ms: default_completion_poll_ms(),
            max_history_in_prompt: default_max_history_in_prompt(),
        }
    }
}

impl AgentsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.completion_poll_ms == 0 {
            return Err(ConfigError::Validation(
                "agents.completion_poll_ms must be greater than 0".into(),
            ));
        }
        if !self.default_hil_budget.is_finite() || self.default_hil_budget < 0.0 {
            return Err(ConfigError::Validation(format!(
                "agents.default_hil_budget must be a non-negative number, got {}",
                self.default_hil_budget
            )));
        }
        if self.default_subtype.trim().is_empty() {
            return Err(ConfigError::Validation(
                "agents.default_subtype must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_subtype() -> String {
    DEFAULT_SUBTYPE.into()
}
fn default_hil_budget() -> f64 {
    DEFAULT_HIL_BUDGET
}
fn default_hil_count() -> u32 {
    DEFAULT_HIL_COUNT
}
fn default_completion_poll_ms() -> u64 {
    1000
}
fn default_max_history_in_prompt() -> usize {
    50
}
