//! Configuration using Figment.
//!
//! Configuration is loaded from, in increasing order of precedence:
//! 1. built-in defaults
//! 2. a TOML file (`config/daq_actions.toml` unless another path is given)
//! 3. environment variables prefixed with `DAQ_ACTIONS_`, with `__`
//!    separating nested keys
//!
//! ```text
//! DAQ_ACTIONS_APPLICATION__LOG_LEVEL=debug
//! DAQ_ACTIONS_ENGINE__PROGRESS_INTERVAL_MS=100
//! DAQ_ACTIONS_ACTION_LOG__BACKEND=jsonl
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_actions::config::EngineConfig;
//!
//! let config = EngineConfig::load_from("config/daq_actions.toml")?;
//! println!("Controls: {}", config.controls.len());
//! # Ok::<(), daq_actions::config::ConfigError>(())
//! ```

use crate::action::TreeSettings;
use crate::action_log::{ActionLog, JsonLinesActionLog, NullActionLog, TracingActionLog};
use crate::control::SimulatedControlConfig;
use crate::error::EngineResult;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_actions.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DAQ_ACTIONS_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::LoadError(Box::new(e))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub action_log: ActionLogConfig,
    /// Simulated controls available to workflows
    #[serde(default)]
    pub controls: Vec<SimulatedControlConfig>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Action engine tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Period between progress re-estimations of running leaves
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Capacity of the action event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Capacity of the supervisor command queue
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl EngineSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn tree_settings(&self) -> TreeSettings {
        TreeSettings {
            progress_interval: self.progress_interval(),
            event_capacity: self.event_capacity,
        }
    }
}

/// Where completed actions are recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionLogBackend {
    #[default]
    Tracing,
    Jsonl,
    None,
}

/// Action log configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionLogConfig {
    #[serde(default)]
    pub backend: ActionLogBackend,
    /// Output file for the `jsonl` backend
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ActionLogConfig {
    /// Open the configured backend.
    pub fn open(&self) -> EngineResult<Arc<dyn ActionLog>> {
        Ok(match self.backend {
            ActionLogBackend::Tracing => Arc::new(TracingActionLog),
            ActionLogBackend::None => Arc::new(NullActionLog),
            ActionLogBackend::Jsonl => {
                let path = self.path.as_ref().ok_or_else(|| {
                    ConfigError::ValidationError("action_log.path is required for jsonl".into())
                })?;
                Arc::new(JsonLinesActionLog::create(path)?)
            }
        })
    }
}

fn default_name() -> String {
    "daq-actions".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    256
}

fn default_command_capacity() -> usize {
    32
}

impl EngineConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.progress_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.progress_interval_ms must be greater than 0".into(),
            ));
        }
        if self.engine.event_capacity == 0 || self.engine.command_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "engine channel capacities must be greater than 0".into(),
            ));
        }

        if self.action_log.backend == ActionLogBackend::Jsonl && self.action_log.path.is_none() {
            return Err(ConfigError::ValidationError(
                "action_log.path is required when backend is 'jsonl'".into(),
            ));
        }

        let mut names = HashSet::new();
        for control in &self.controls {
            if !names.insert(control.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate control name: '{}'",
                    control.name
                )));
            }
            if control.min >= control.max {
                return Err(ConfigError::ValidationError(format!(
                    "Control '{}': min ({}) must be below max ({})",
                    control.name, control.min, control.max
                )));
            }
            if control.position < control.min || control.position > control.max {
                return Err(ConfigError::ValidationError(format!(
                    "Control '{}': initial position {} is outside [{}, {}]",
                    control.name, control.position, control.min, control.max
                )));
            }
            if control.speed <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "Control '{}': speed must be positive",
                    control.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = EngineConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.engine.progress_interval(), Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn test_load_file() {
        let file = write_config(
            r#"
            [application]
            name = "bench"
            log_level = "debug"
            log_format = "json"

            [engine]
            progress_interval_ms = 100

            [[controls]]
            name = "x"
            min = -5.0
            max = 5.0
            speed = 2.5
            "#,
        );

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.engine.progress_interval_ms, 100);
        assert_eq!(config.engine.event_capacity, 256);
        assert_eq!(config.controls.len(), 1);
        assert!(config.controls[0].can_stop);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[engine]\nprogress_interval_ms = 100\n");
        std::env::set_var("DAQ_ACTIONS_ENGINE__PROGRESS_INTERVAL_MS", "40");
        let result = EngineConfig::load_from(file.path());
        std::env::remove_var("DAQ_ACTIONS_ENGINE__PROGRESS_INTERVAL_MS");

        assert_eq!(result.unwrap().engine.progress_interval_ms, 40);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.application.log_level = "verbose".into();
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = EngineConfig::default();
        config.controls = vec![SimulatedControlConfig::new("x"), SimulatedControlConfig::new("x")];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate control name"));

        let mut config = EngineConfig::default();
        config.action_log.backend = ActionLogBackend::Jsonl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tree_settings_follow_engine_section() {
        let settings = EngineSettings {
            progress_interval_ms: 50,
            event_capacity: 8,
            command_capacity: 4,
        };
        let tree = settings.tree_settings();
        assert_eq!(tree.progress_interval, Duration::from_millis(50));
        assert_eq!(tree.event_capacity, 8);
    }
}
