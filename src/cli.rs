use std::path::PathBuf;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use crate::config::{MonitorConfig, WatchMode};

#[derive(Parser)]
#[command(name = "dirmon")]
#[command(version)]
#[command(about = "Watch a directory and report files being added, removed, modified and renamed")]
#[command(long_about = "dirmon watches a single directory using the operating system's native change notifications and prints every structural change as it happens. Subdirectories are not watched.")]
pub struct Cli {
    /// Directory to watch for changes
    #[arg(value_name = "PATH", help = "Path to watch (defaults to current directory)")]
    pub path: Option<PathBuf>,

    /// Backend override
    #[arg(short, long, help = "Watch backend (overrides the config file)")]
    pub mode: Option<WatchMode>,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", help = "TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Print the current snapshot and exit
    #[arg(long, help = "List the files in PATH and exit")]
    pub snapshot: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Disable colors in output
    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,

    /// Output format
    #[arg(long, default_value = "text", help = "Output format")]
    pub output: OutputFormat,

    /// Polling interval in milliseconds (for polling mode)
    #[arg(long, help = "Polling interval in ms (overrides the config file)")]
    pub poll_interval: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Timestamped plain text (default)
    Text,
    /// JSON output for scripting
    Json,
    /// Compact single-line format
    Compact,
}

impl Cli {
    pub fn get_watch_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// Config file, then environment, then flags.
    pub fn resolve_config(&self) -> Result<MonitorConfig> {
        let mut config = MonitorConfig::load_or_default(self.config.as_deref())?;

        if let Some(mode) = self.mode {
            config.watcher.mode = mode;
        }
        if let Some(ms) = self.poll_interval {
            config.watcher.poll_interval_ms = ms;
        }

        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        // stdout carries the event stream, so logs go to stderr.
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(!self.no_color)
            .init();
    }

    pub fn validate(&self) -> Result<(), String> {
        let path = self.get_watch_path();

        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()));
        }

        if !path.is_dir() {
            return Err(format!("Path is not a directory: {}", path.display()));
        }

        if self.poll_interval == Some(0) {
            return Err("Poll interval must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            path: None,
            mode: None,
            config: None,
            snapshot: false,
            verbose: false,
            no_color: false,
            output: OutputFormat::Text,
            poll_interval: None,
        }
    }
}
