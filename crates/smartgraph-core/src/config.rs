use crate::{Result, SmartGraphError, DEFAULT_NOTIFICATION_CAPACITY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Buffer size of each notifier's broadcast channel.
    #[serde(default = "NotificationConfig::default_capacity")]
    pub capacity: usize,
}

impl NotificationConfig {
    fn default_capacity() -> usize {
        DEFAULT_NOTIFICATION_CAPACITY
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuleConfig {
    /// Emit a debug event for every rule execution.
    #[serde(default)]
    pub trace_execution: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub rules: RuleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s)
            .map_err(|e| SmartGraphError::configuration_with("invalid TOML configuration", e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load by file extension: `.json` is JSON, anything else TOML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SmartGraphError::configuration_with("cannot encode configuration", e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.notifications.capacity == 0 {
            return Err(SmartGraphError::configuration(
                "notifications.capacity must be greater than zero",
            ));
        }
        let level = self.logging.level.to_ascii_lowercase();
        if !LEVELS.contains(&level.as_str()) {
            return Err(SmartGraphError::configuration(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }
        Ok(())
    }
}
