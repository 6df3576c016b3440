//! Workflow configuration.
//!
//! Loaded from TOML, then overridden from `PHONELINK_*` environment variables.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`WorkflowConfig::handshake_timeout_secs`].
pub const ENV_HANDSHAKE_TIMEOUT: &str = "PHONELINK_HANDSHAKE_TIMEOUT_SECS";
/// Environment variable overriding [`WorkflowConfig::event_history`].
pub const ENV_EVENT_HISTORY: &str = "PHONELINK_EVENT_HISTORY";

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

const fn default_event_history() -> usize {
    phonelink_core::event_hub::DEFAULT_HISTORY
}

/// Settings for [`crate::ActivationWorkflow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Stop and evict a session that is not `Ready` this many seconds after
    /// activation. Absent or zero means wait indefinitely.
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,

    /// Events retained per number for late subscribers.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: None,
            event_history: default_event_history(),
        }
    }
}

impl WorkflowConfig {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns error if the TOML is malformed.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    /// Returns error if a variable is set but not a number.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    ///
    /// # Errors
    /// Returns error if a value is present but not a number.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_HANDSHAKE_TIMEOUT) {
            self.handshake_timeout_secs = Some(parse_env(ENV_HANDSHAKE_TIMEOUT, value)?);
        }
        if let Some(value) = lookup(ENV_EVENT_HISTORY) {
            self.event_history = parse_env(ENV_EVENT_HISTORY, value)?;
        }
        Ok(self)
    }

    /// Handshake deadline, if one is configured.
    #[must_use]
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}
