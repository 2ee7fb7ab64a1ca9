//! On-disk library cache document: tracks, playlists, scan statistics.

use std::path::PathBuf;

use log::warn;

use crate::persist;
use crate::protocol::{CacheEntry, Playlist};

/// Aggregate counters recomputed on every save.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub total_tracks: usize,
    /// Sum of cataloged file sizes in bytes.
    pub total_size: u64,
    pub total_playlists: usize,
    /// Unix milliseconds of the last completed scan; 0 before the first.
    #[serde(default)]
    pub last_scan_time: i64,
    /// Duration of the last completed scan in milliseconds.
    #[serde(default)]
    pub scan_duration: u64,
}

/// On-disk shape of `music-library-cache.json`.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryCacheFile {
    /// Unix milliseconds of the last save.
    #[serde(default)]
    pub last_updated: i64,
    /// Scan roots last used, display form.
    #[serde(default)]
    pub scanned_directories: Vec<String>,
    #[serde(default)]
    pub tracks: Vec<CacheEntry>,
    #[serde(default)]
    pub playlists: Vec<Playlist>,
    #[serde(default)]
    pub statistics: CacheStatistics,
}

/// Load/save wrapper around the cache document path.
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Loads the cache document; absent or corrupt files yield an empty
    /// document rather than an error.
    pub fn load(&self) -> LibraryCacheFile {
        match persist::read_json::<LibraryCacheFile>(&self.path) {
            Ok(Some(file)) => file,
            Ok(None) => LibraryCacheFile::default(),
            Err(err) => {
                warn!("CacheStore: {err}; starting with an empty cache");
                LibraryCacheFile::default()
            }
        }
    }

    /// Persists the document with freshly recomputed statistics.
    pub fn save(&self, file: &mut LibraryCacheFile) -> Result<(), String> {
        file.last_updated = persist::now_unix_ms();
        file.statistics.total_tracks = file.tracks.len();
        file.statistics.total_size = file.tracks.iter().map(|track| track.file_size).sum();
        file.statistics.total_playlists = file.playlists.len();
        persist::write_json(&self.path, file)
    }
}
