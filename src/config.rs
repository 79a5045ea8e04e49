//! Process-wide configuration consumed by the dispatch core
//!
//! Read once when a [`crate::Process`] is created: a TOML file (optional),
//! then `BINDERY_*` environment overrides, then validation.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Upper bound on pool threads (spawned plus joined)
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Pool threads never retire below this count
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,

    /// Idle time after which a surplus pool thread exits
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Outstanding-call duration after which a warning is logged
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

fn default_max_threads() -> usize { 15 }
fn default_min_threads() -> usize { 1 }
fn default_idle_timeout_ms() -> u64 { 30_000 }
fn default_reply_timeout_ms() -> u64 { 5_000 }

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            min_threads: default_min_threads(),
            idle_timeout_ms: default_idle_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

impl ProcessConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Layer `BINDERY_*` environment variables over this config
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_number("BINDERY_MAX_THREADS")? {
            self.max_threads = value as usize;
        }
        if let Some(value) = env_number("BINDERY_MIN_THREADS")? {
            self.min_threads = value as usize;
        }
        if let Some(value) = env_number("BINDERY_IDLE_TIMEOUT_MS")? {
            self.idle_timeout_ms = value;
        }
        if let Some(value) = env_number("BINDERY_REPLY_TIMEOUT_MS")? {
            self.reply_timeout_ms = value;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::Invalid("max_threads must be at least 1".into()));
        }
        if self.min_threads > self.max_threads {
            return Err(ConfigError::Invalid(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

fn env_number(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{} is not a number: {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}
