//! Persistent application configuration model and defaults.

use std::path::{Path, PathBuf};

use log::warn;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Override for the application data directory.
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    /// Drive mounting and liveness behavior.
    pub network: NetworkConfig,
    #[serde(default)]
    /// Library scanning preferences.
    pub library: LibraryConfig,
}

/// Drive mounting, liveness, and retry behavior.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NetworkConfig {
    /// Seconds between liveness probes per connected drive.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Seconds to wait before a reconnect attempt after a failed probe.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Consecutive failed reconnects before the drive goes terminal.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Read/write attempts against a live backend before giving up.
    #[serde(default = "default_io_retry_attempts")]
    pub io_retry_attempts: u32,
    /// Base backoff in milliseconds; attempt N sleeps N times this value.
    #[serde(default = "default_io_retry_backoff_ms")]
    pub io_retry_backoff_ms: u64,
    /// Polls while waiting for another caller's in-flight mount.
    #[serde(default = "default_remount_wait_polls")]
    pub remount_wait_polls: u32,
    /// Milliseconds between those polls.
    #[serde(default = "default_remount_wait_poll_ms")]
    pub remount_wait_poll_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            io_retry_attempts: default_io_retry_attempts(),
            io_retry_backoff_ms: default_io_retry_backoff_ms(),
            remount_wait_polls: default_remount_wait_polls(),
            remount_wait_poll_ms: default_remount_wait_poll_ms(),
        }
    }
}

/// Library scanning preferences persisted between sessions.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LibraryConfig {
    /// Scan roots; local paths or `network://<driveId>/<path>` URIs.
    #[serde(default)]
    pub folders: Vec<String>,
}

fn default_monitor_interval_secs() -> u64 {
    120
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_io_retry_attempts() -> u32 {
    3
}

fn default_io_retry_backoff_ms() -> u64 {
    1000
}

fn default_remount_wait_polls() -> u32 {
    50
}

fn default_remount_wait_poll_ms() -> u64 {
    100
}

impl Config {
    /// Loads config from `path`, falling back to defaults when the file is
    /// absent or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    warn!("Failed to parse {}: {err}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persists config as TOML.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|err| format!("failed to serialize config: {err}"))?;
        crate::persist::atomic_write(path, content.as_bytes())
    }

    /// Resolves the application data directory, honoring the override.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nettune")
    }
}
