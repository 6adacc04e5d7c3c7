//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/expstats/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/expstats/` (~/.config/expstats/)
//! - Data: `$XDG_DATA_HOME/expstats/` (~/.local/share/expstats/)
//! - State/Logs: `$XDG_STATE_HOME/expstats/` (~/.local/state/expstats/)

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Statistics aggregation configuration
    #[serde(default)]
    pub stats: StatsConfig,

    /// Answer summary configuration
    #[serde(default)]
    pub answers: AnswersConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Statistics aggregation configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    /// Date the legacy per-state counters stopped being written.
    ///
    /// Legacy counters are attributed to the exploration version that was
    /// current at this instant.
    #[serde(default = "default_migration_cutoff")]
    pub migration_cutoff: DateTime<Utc>,

    /// State name that legacy counters used as the end of an exploration
    #[serde(default = "default_legacy_terminal_state")]
    pub legacy_terminal_state: String,

    /// Number of parallel reduce workers for batch runs
    #[serde(default = "default_reduce_workers")]
    pub reduce_workers: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            migration_cutoff: default_migration_cutoff(),
            legacy_terminal_state: default_legacy_terminal_state(),
            reduce_workers: default_reduce_workers(),
        }
    }
}

impl StatsConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.reduce_workers == 0 {
            return Err(Error::Config(
                "stats.reduce_workers must be at least 1".to_string(),
            ));
        }
        if self.legacy_terminal_state.trim().is_empty() {
            return Err(Error::Config(
                "stats.legacy_terminal_state must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_migration_cutoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2014, 10, 11, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

fn default_legacy_terminal_state() -> String {
    "END".to_string()
}

fn default_reduce_workers() -> usize {
    4
}

/// Answer summary configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct AnswersConfig {
    /// Calculations that should not be registered
    #[serde(default)]
    pub disabled_calculations: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.stats.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/expstats/config.toml` (~/.config/expstats/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("expstats").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/expstats/` (~/.local/share/expstats/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("expstats")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/expstats/` (~/.local/state/expstats/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("expstats")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/expstats/stats.db` (~/.local/share/expstats/stats.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("stats.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/expstats/expstats.log` (~/.local/state/expstats/expstats.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("expstats.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
