//! Runner configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TRACEPAT_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracepat_core::HandlerConfig;

/// Runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine configuration.
    pub engine: EngineConfig,
    /// State store configuration.
    pub store: StoreConfig,
    /// Output configuration.
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from `path` if given, else from `TRACEPAT_CONFIG`,
    /// then applies environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("TRACEPAT_CONFIG") {
                Ok(path) => Self::from_file(path)?,
                Err(_) => Self::default(),
            },
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    fn apply_env_overrides(&mut self) {
        self.engine.apply_env_overrides();
        self.store.apply_env_overrides();
        self.output.apply_env_overrides();
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.synthetic_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "engine.synthetic_prefix must not be empty".to_string(),
            ));
        }
        if self.engine.automatic_chain_limit == Some(0) {
            return Err(ConfigError::Validation(
                "engine.automatic_chain_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of synthetic event names.
    pub synthetic_prefix: String,
    /// Most automatic transitions chained on one event (default: states of the FSM).
    pub automatic_chain_limit: Option<usize>,
    /// Most nested spawns triggered by one event.
    pub max_spawn_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let handler = HandlerConfig::default();
        Self {
            synthetic_prefix: handler.synthetic_prefix,
            automatic_chain_limit: handler.automatic_chain_limit,
            max_spawn_depth: handler.max_spawn_depth,
        }
    }
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(prefix) = std::env::var("TRACEPAT_SYNTHETIC_PREFIX") {
            self.synthetic_prefix = prefix;
        }

        if let Ok(limit) = std::env::var("TRACEPAT_CHAIN_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.automatic_chain_limit = Some(n);
            }
        }
    }

    /// Builds the handler configuration.
    pub fn handler_config(&self) -> HandlerConfig {
        let config = HandlerConfig::new()
            .with_synthetic_prefix(self.synthetic_prefix.clone())
            .with_max_spawn_depth(self.max_spawn_depth);
        match self.automatic_chain_limit {
            Some(limit) => config.with_automatic_chain_limit(limit),
            None => config,
        }
    }
}

/// State store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Start of the trace in nanoseconds.
    pub start_time: i64,
    /// Where to save a snapshot of the store once the trace ends.
    pub snapshot: Option<PathBuf>,
}

impl StoreConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(start) = std::env::var("TRACEPAT_START_TIME") {
            if let Ok(ns) = start.parse() {
                self.start_time = ns;
            }
        }

        if let Ok(path) = std::env::var("TRACEPAT_SNAPSHOT") {
            if !path.is_empty() {
                self.snapshot = Some(PathBuf::from(path));
            }
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Pretty-print synthetic events instead of one JSON object per line.
    pub pretty: bool,
    /// Print a scenario summary to stderr when the run ends.
    pub summary: bool,
}

impl OutputConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(summary) = std::env::var("TRACEPAT_SUMMARY") {
            self.summary = summary == "1" || summary.to_lowercase() == "true";
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, #[source] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
