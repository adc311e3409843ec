//! Coordinator configuration.
//!
//! Configuration comes from an optional TOML file; every field has a
//! default, so a missing file or a partial file is fine. CLI flags override
//! the file (see `main.rs`).

use chrono::Duration;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Scheduling and retention policy.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Resource capacities, name to units. Unlisted resources default to 1.
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the RPC server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Scheduling and retention policy.
///
/// The `*_secs` fields are plain integers in the file; the accessor methods
/// hand out `chrono::Duration`s for the policy code.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds a FAILED task waits before becoming eligible again.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Seconds of inactivity before a task no worker references is evicted.
    #[serde(default = "default_remove_delay_secs")]
    pub remove_delay_secs: u64,

    /// Seconds of silence before a worker is considered gone.
    #[serde(default = "default_worker_disconnect_delay_secs")]
    pub worker_disconnect_delay_secs: u64,

    /// Sliding window, in seconds, for counting failures.
    #[serde(default = "default_disable_window_secs")]
    pub disable_window_secs: u64,

    /// Failures within the window that trip auto-disable. Unset turns
    /// auto-disable off.
    #[serde(default)]
    pub disable_failures: Option<u32>,

    /// Seconds a disabled task stays disabled.
    #[serde(default = "default_disable_persist_secs")]
    pub disable_persist_secs: u64,

    /// Cap on tasks returned by list and graph operations.
    #[serde(default = "default_max_shown_tasks")]
    pub max_shown_tasks: usize,

    /// Seconds between pruner sweeps.
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,

    /// Seconds between periodic state dumps.
    #[serde(default = "default_dump_interval_secs")]
    pub dump_interval_secs: u64,

    /// Where the state snapshot lives.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// JSONL task-history log. Unset disables history recording.
    #[serde(default)]
    pub history_path: Option<PathBuf>,
}

impl SchedulerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::seconds(self.retry_delay_secs as i64)
    }

    pub fn remove_delay(&self) -> Duration {
        Duration::seconds(self.remove_delay_secs as i64)
    }

    pub fn worker_disconnect_delay(&self) -> Duration {
        Duration::seconds(self.worker_disconnect_delay_secs as i64)
    }

    pub fn disable_window(&self) -> Duration {
        Duration::seconds(self.disable_window_secs as i64)
    }

    pub fn disable_persist(&self) -> Duration {
        Duration::seconds(self.disable_persist_secs as i64)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: default_retry_delay_secs(),
            remove_delay_secs: default_remove_delay_secs(),
            worker_disconnect_delay_secs: default_worker_disconnect_delay_secs(),
            disable_window_secs: default_disable_window_secs(),
            disable_failures: None,
            disable_persist_secs: default_disable_persist_secs(),
            max_shown_tasks: default_max_shown_tasks(),
            prune_interval_secs: default_prune_interval_secs(),
            dump_interval_secs: default_dump_interval_secs(),
            state_path: default_state_path(),
            history_path: None,
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8082".to_string()
}

fn default_retry_delay_secs() -> u64 {
    900
}

fn default_remove_delay_secs() -> u64 {
    600
}

fn default_worker_disconnect_delay_secs() -> u64 {
    60
}

fn default_disable_window_secs() -> u64 {
    3600
}

fn default_disable_persist_secs() -> u64 {
    86_400
}

fn default_max_shown_tasks() -> usize {
    100_000
}

fn default_prune_interval_secs() -> u64 {
    60
}

fn default_dump_interval_secs() -> u64 {
    300
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/foreman/state.json")
}
