//! Persisted drive-definition store, independent of mount state.
//!
//! The registry survives manager restarts and crashes; it records what drives
//! are configured, never which are currently live.

use std::collections::HashMap;
use std::path::PathBuf;

use log::warn;

use crate::persist;
use crate::protocol::DriveConfig;

const REGISTRY_VERSION: u32 = 1;

/// On-disk shape of `drive-registry.json`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistryFile {
    version: u32,
    /// Unix milliseconds of the last save.
    timestamp: i64,
    drive_configs: Vec<(String, DriveConfig)>,
}

/// Key -> config store for drive definitions.
pub struct DriveRegistry {
    path: PathBuf,
    configs: HashMap<String, DriveConfig>,
}

impl DriveRegistry {
    /// Opens (or initializes) the registry at `path`.
    pub fn open(path: PathBuf) -> Self {
        let configs = match persist::read_json::<RegistryFile>(&path) {
            Ok(Some(file)) => file.drive_configs.into_iter().collect(),
            Ok(None) => HashMap::new(),
            Err(err) => {
                warn!("DriveRegistry: {err}; starting empty");
                HashMap::new()
            }
        };
        Self { path, configs }
    }

    /// Registers a new drive config; rejects duplicate ids. Updates go
    /// through explicit unregister + register.
    pub fn register(&mut self, config: DriveConfig) -> Result<(), String> {
        if config.id.trim().is_empty() {
            return Err("drive id must not be empty".to_string());
        }
        if self.configs.contains_key(&config.id) {
            return Err(format!("drive '{}' is already registered", config.id));
        }
        self.configs.insert(config.id.clone(), config);
        self.save()
    }

    /// Inserts or replaces a config; used by the mount path, which persists
    /// the config it just mounted with.
    pub fn upsert(&mut self, config: DriveConfig) -> Result<(), String> {
        if config.id.trim().is_empty() {
            return Err("drive id must not be empty".to_string());
        }
        self.configs.insert(config.id.clone(), config);
        self.save()
    }

    /// Removes a config; returns whether it existed.
    pub fn unregister(&mut self, drive_id: &str) -> Result<bool, String> {
        let removed = self.configs.remove(drive_id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn get(&self, drive_id: &str) -> Option<&DriveConfig> {
        self.configs.get(drive_id)
    }

    /// All configs sorted by id for stable iteration and persistence.
    pub fn list(&self) -> Vec<DriveConfig> {
        let mut configs: Vec<DriveConfig> = self.configs.values().cloned().collect();
        configs.sort_by(|left, right| left.id.cmp(&right.id));
        configs
    }

    fn save(&self) -> Result<(), String> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            timestamp: persist::now_unix_ms(),
            drive_configs: self
                .list()
                .into_iter()
                .map(|config| (config.id.clone(), config))
                .collect(),
        };
        persist::write_json(&self.path, &file)
    }
}
