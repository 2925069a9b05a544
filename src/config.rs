//! Configuration management for dirmon
//!
//! Defaults can be overridden from a TOML file, then from `DIRMON_*`
//! environment variables, then from command-line flags.

use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Global configuration for dirmon
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Watch loop configuration
    pub watcher: WatcherConfig,
    /// Background thread configuration
    pub controller: ControllerConfig,
}

/// Which backend drives the watch loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Built-in OS notification loop where available, `notify` elsewhere
    #[default]
    Auto,
    /// The `notify` crate's recommended native watcher
    Notify,
    /// Use polling-based watching
    Polling,
}

/// Configuration for the watch loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Backend selection
    pub mode: WatchMode,
    /// Size of the notification buffer in bytes
    pub buffer_size: usize,
    /// How long one OS wait may block before the run flag is re-checked
    pub wait_timeout_ms: u64,
    /// Scan interval for polling mode
    pub poll_interval_ms: u64,
}

/// Configuration for the lifecycle controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How long `stop` waits for the watch thread to finish
    pub stop_timeout_ms: u64,
}

pub const MIN_BUFFER_SIZE: usize = 1024;
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            buffer_size: 64 * 1024,
            wait_timeout_ms: 250,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 2000,
        }
    }
}

impl WatcherConfig {
    /// Get the bounded wait duration
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Get the polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ControllerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load from `path` when given, otherwise defaults, then apply the
    /// environment on top
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self::load(path)?.with_env()),
            None => Ok(Self::from_env()),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Override fields with environment variables if present
    pub fn with_env(mut self) -> Self {
        if let Ok(val) = std::env::var("DIRMON_MODE") {
            match WatchMode::from_str(&val, true) {
                Ok(mode) => self.watcher.mode = mode,
                Err(_) => tracing::warn!("Ignoring invalid DIRMON_MODE: {}", val),
            }
        }

        if let Some(size) = env_number("DIRMON_BUFFER_SIZE") {
            self.watcher.buffer_size = size as usize;
        }

        if let Some(ms) = env_number("DIRMON_WAIT_TIMEOUT_MS") {
            self.watcher.wait_timeout_ms = ms;
        }

        if let Some(ms) = env_number("DIRMON_POLL_INTERVAL_MS") {
            self.watcher.poll_interval_ms = ms;
        }

        if let Some(ms) = env_number("DIRMON_STOP_TIMEOUT_MS") {
            self.controller.stop_timeout_ms = ms;
        }

        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.watcher.buffer_size < MIN_BUFFER_SIZE || self.watcher.buffer_size > MAX_BUFFER_SIZE {
            return Err(format!(
                "buffer_size must be between {} and {} bytes",
                MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            ));
        }

        if self.watcher.wait_timeout_ms == 0 {
            return Err("wait_timeout_ms must be greater than 0".to_string());
        }

        if self.watcher.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn env_number(key: &str) -> Option<u64> {
    let val = std::env::var(key).ok()?;
    match val.parse::<u64>() {
        Ok(number) => Some(number),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}: {}", key, val);
            None
        }
    }
}
