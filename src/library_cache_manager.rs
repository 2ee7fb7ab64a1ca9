//! Library catalog: scanning, fingerprint validation, and playlists.
//!
//! The manager owns the in-memory track and playlist tables, persists them
//! through [`CacheStore`], and services cache commands from the bus on its
//! own thread. Remote files are reached through the network file adapter;
//! local files go straight to `std::fs`.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::cache_store::CacheStore;
use crate::metadata::MetadataParser;
use crate::network_file_adapter::{NetworkEntry, NetworkFileAdapter, NETWORK_PATH_PREFIX};
use crate::persist;
use crate::protocol::{CacheEntry, CacheMessage, Message, Playlist, ValidationProgress};

/// Extensions recognized as audio during a scan, lowercase.
const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "wav", "ogg", "m4a", "aac", "opus", "aiff", "wma",
];

/// Scan progress is published every this many indexed files.
const SCAN_PROGRESS_STRIDE: usize = 20;

/// Error substrings that mark a failure as connectivity, not file loss.
const UNVERIFIABLE_MARKERS: &[&str] = &["not connected", "not mounted"];

/// Outcome of validating one cached track against its backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackValidation {
    /// Backing file matches the stored fingerprint, or cannot currently be
    /// verified (drive unreachable).
    Valid,
    /// Backing file exists but its fingerprint changed.
    Modified,
    /// Backing file is gone.
    Invalid(String),
}

/// Content fingerprint over `(path, size, mtime)`.
///
/// Remote timestamps are truncated to whole seconds before hashing because
/// WebDAV and SMB servers commonly report second-granularity mtimes; without
/// this a rescan over a different backend round-trip would churn every id.
pub fn fingerprint(path: &str, size: u64, modified_ms: i64) -> String {
    let mtime = if path.starts_with(NETWORK_PATH_PREFIX) {
        (modified_ms / 1000) * 1000
    } else {
        modified_ms
    };
    format!("{:x}", md5::compute(format!("{path}|{size}|{mtime}")))
}

pub struct LibraryCacheManager {
    bus_producer: Sender<Message>,
    store: CacheStore,
    adapter: Option<Arc<NetworkFileAdapter>>,
    metadata_parser: Box<dyn MetadataParser>,
    tracks: HashMap<String, CacheEntry>,
    playlists: Vec<Playlist>,
    scanned_directories: Vec<String>,
    statistics: crate::cache_store::CacheStatistics,
    /// File ids classified invalid by the last validation pass; consumed by
    /// the explicit prune command.
    last_invalid: Vec<String>,
    /// File ids classified modified by the last validation pass; consumed by
    /// the explicit refresh command.
    last_modified: Vec<String>,
}

impl LibraryCacheManager {
    pub fn new(
        bus_producer: Sender<Message>,
        store: CacheStore,
        adapter: Option<Arc<NetworkFileAdapter>>,
        metadata_parser: Box<dyn MetadataParser>,
    ) -> Self {
        let file = store.load();
        let tracks = file
            .tracks
            .into_iter()
            .map(|track| (track.file_id.clone(), track))
            .collect();
        Self {
            bus_producer,
            store,
            adapter,
            metadata_parser,
            tracks,
            playlists: file.playlists,
            scanned_directories: file.scanned_directories,
            statistics: file.statistics,
            last_invalid: Vec::new(),
            last_modified: Vec::new(),
        }
    }

    fn emit(&self, message: CacheMessage) {
        let _ = self.bus_producer.send(Message::Cache(message));
    }

    pub fn track(&self, file_id: &str) -> Option<&CacheEntry> {
        self.tracks.get(file_id)
    }

    /// All tracks sorted by path for stable presentation and persistence.
    pub fn tracks(&self) -> Vec<CacheEntry> {
        let mut tracks: Vec<CacheEntry> = self.tracks.values().cloned().collect();
        tracks.sort_by(|left, right| left.file_path.cmp(&right.file_path));
        tracks
    }

    pub fn playlists(&self) -> Vec<Playlist> {
        self.playlists.clone()
    }

    pub fn remove_track(&mut self, file_id: &str) -> bool {
        self.tracks.remove(file_id).is_some()
    }

    /// Persists the current tables; statistics are recomputed by the store.
    pub fn save(&mut self) -> Result<(), String> {
        let mut file = crate::cache_store::LibraryCacheFile {
            last_updated: 0,
            scanned_directories: self.scanned_directories.clone(),
            tracks: self.tracks(),
            playlists: self.playlists.clone(),
            statistics: self.statistics,
        };
        self.store.save(&mut file)?;
        self.statistics = file.statistics;
        Ok(())
    }

    // ---- scanning ----

    /// Walks the given roots iteratively (no recursion, remote trees can be
    /// deep), indexing every audio file found. A failing subtree is logged
    /// and skipped; the scan fails only if every root is unlistable.
    pub fn scan_directories(&mut self, roots: Vec<String>) {
        self.emit(CacheMessage::ScanStarted);
        let started = Instant::now();
        let mut discovered = 0usize;
        let mut indexed = 0usize;
        let mut listable_roots = 0usize;
        let mut first_error = None;

        let mut queue: VecDeque<(String, bool)> =
            roots.iter().map(|root| (root.clone(), true)).collect();
        while let Some((dir, is_root)) = queue.pop_front() {
            let entries = match self.list_directory(&dir) {
                Ok(entries) => {
                    if is_root {
                        listable_roots += 1;
                    }
                    entries
                }
                Err(err) => {
                    warn!("Scan: skipping '{dir}': {err}");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    continue;
                }
            };
            for entry in entries {
                if entry.is_dir {
                    queue.push_back((entry.path, false));
                    continue;
                }
                if !has_audio_extension(&entry.name) {
                    continue;
                }
                discovered += 1;
                self.index_file(&entry);
                indexed += 1;
                if indexed % SCAN_PROGRESS_STRIDE == 0 {
                    self.emit(CacheMessage::ScanProgress { discovered, indexed });
                }
            }
        }

        if listable_roots == 0 && !roots.is_empty() {
            let error = first_error.unwrap_or_else(|| "no scan roots given".to_string());
            warn!("Scan failed: {error}");
            self.emit(CacheMessage::ScanFailed(error));
            return;
        }

        self.scanned_directories = roots;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.statistics.last_scan_time = persist::now_unix_ms();
        self.statistics.scan_duration = duration_ms;
        if let Err(err) = self.save() {
            warn!("Scan: failed to persist cache: {err}");
            self.emit(CacheMessage::CacheOperationFailed {
                action: "scan".to_string(),
                error: err,
            });
        }
        info!("Scan completed: {indexed} track(s) in {duration_ms} ms");
        self.emit(CacheMessage::ScanCompleted {
            indexed_tracks: indexed,
            duration_ms,
        });
    }

    fn list_directory(&self, dir: &str) -> Result<Vec<NetworkEntry>, String> {
        if NetworkFileAdapter::is_network_path(dir) {
            let adapter = self
                .adapter
                .as_ref()
                .ok_or_else(|| "no network adapter configured".to_string())?;
            adapter.read_dir(dir)
        } else {
            list_local_directory(dir)
        }
    }

    fn index_file(&mut self, entry: &NetworkEntry) {
        let file_id = fingerprint(&entry.path, entry.size, entry.modified);
        if self.tracks.contains_key(&file_id) {
            return;
        }

        let metadata = match self.metadata_parser.parse(&entry.path) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Metadata parse failed for '{}': {err}", entry.path);
                crate::metadata::TrackMetadata {
                    title: entry.name.clone(),
                    ..Default::default()
                }
            }
        };

        let previous = self
            .tracks
            .values()
            .find(|track| track.file_path == entry.path)
            .map(|track| (track.file_id.clone(), track.added_to_cache));
        let added_to_cache = previous
            .as_ref()
            .map(|(_, added)| *added)
            .unwrap_or_else(persist::now_unix_ms);

        let new_entry = CacheEntry {
            file_id: file_id.clone(),
            file_path: entry.path.clone(),
            file_name: entry.name.clone(),
            file_size: entry.size,
            last_modified: entry.modified,
            added_to_cache,
            title: metadata.title,
            artist: metadata.artist,
            album: metadata.album,
            duration: metadata.duration,
            has_cover: metadata.has_cover,
        };

        match previous {
            Some((old_id, _)) => self.replace_track(&old_id, new_entry),
            None => {
                self.tracks.insert(file_id, new_entry);
            }
        }
    }

    /// Replaces a track under a new fingerprint, remapping playlist
    /// references so membership survives a content change.
    fn replace_track(&mut self, old_id: &str, new_entry: CacheEntry) {
        let new_id = new_entry.file_id.clone();
        self.tracks.remove(old_id);
        self.tracks.insert(new_id.clone(), new_entry);
        for playlist in &mut self.playlists {
            for track_id in &mut playlist.track_ids {
                if track_id == old_id {
                    *track_id = new_id.clone();
                }
            }
        }
    }

    // ---- validation ----

    /// Classifies one cached track. Connectivity problems never condemn a
    /// track: an unreachable drive leaves the entry valid-unverifiable.
    fn classify_track(&self, track: &CacheEntry) -> TrackValidation {
        if NetworkFileAdapter::is_network_path(&track.file_path) {
            let Some(adapter) = &self.adapter else {
                return TrackValidation::Valid;
            };
            match adapter.stat(&track.file_path) {
                Ok(stat) => {
                    if fingerprint(&track.file_path, stat.size, stat.modified) == track.file_id {
                        TrackValidation::Valid
                    } else {
                        TrackValidation::Modified
                    }
                }
                Err(err) if is_unverifiable(&err) => TrackValidation::Valid,
                Err(err) => match adapter.exists(&track.file_path) {
                    Ok(false) => TrackValidation::Invalid(err),
                    // Present but unstatable, or unreachable: keep it.
                    Ok(true) | Err(_) => TrackValidation::Valid,
                },
            }
        } else {
            match fs::metadata(&track.file_path) {
                Ok(metadata) => {
                    let modified = metadata
                        .modified()
                        .ok()
                        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
                        .map(|duration| duration.as_millis() as i64)
                        .unwrap_or(0);
                    if fingerprint(&track.file_path, metadata.len(), modified) == track.file_id {
                        TrackValidation::Valid
                    } else {
                        TrackValidation::Modified
                    }
                }
                Err(err) => TrackValidation::Invalid(format!(
                    "missing local file '{}': {err}",
                    track.file_path
                )),
            }
        }
    }

    /// Validates every cached track. Read-only: it records invalid and
    /// modified ids for the explicit prune/refresh commands, so it is safe
    /// to run at any time. Returns `(valid, invalid, modified)` counts.
    pub fn validate_cached_tracks(&mut self) -> (usize, usize, usize) {
        let ids: Vec<String> = self.tracks.keys().cloned().collect();
        let total = ids.len();
        let mut progress = ValidationProgress {
            total,
            ..ValidationProgress::default()
        };
        self.last_invalid.clear();
        self.last_modified.clear();

        for file_id in ids {
            let Some(track) = self.tracks.get(&file_id) else {
                continue;
            };
            progress.current += 1;
            match self.classify_track(track) {
                TrackValidation::Valid => progress.valid += 1,
                TrackValidation::Modified => {
                    progress.modified += 1;
                    self.last_modified.push(file_id);
                }
                TrackValidation::Invalid(reason) => {
                    progress.invalid += 1;
                    warn!("Validation: '{}' invalid: {reason}", track.file_path);
                    self.last_invalid.push(file_id);
                }
            }
            self.emit(CacheMessage::ValidationProgress(progress));
        }

        info!(
            "Validation completed: {} valid, {} invalid, {} modified",
            progress.valid, progress.invalid, progress.modified
        );
        (progress.valid, progress.invalid, progress.modified)
    }

    /// Re-stats a modified file and rewrites its entry under the new
    /// fingerprint, keeping metadata and playlist membership.
    fn refresh_modified_track(&mut self, track: &CacheEntry) -> bool {
        let stat = if NetworkFileAdapter::is_network_path(&track.file_path) {
            let Some(adapter) = &self.adapter else {
                return false;
            };
            match adapter.stat(&track.file_path) {
                Ok(stat) => (stat.size, stat.modified),
                Err(_) => return false,
            }
        } else {
            match fs::metadata(&track.file_path) {
                Ok(metadata) => {
                    let modified = metadata
                        .modified()
                        .ok()
                        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
                        .map(|duration| duration.as_millis() as i64)
                        .unwrap_or(0);
                    (metadata.len(), modified)
                }
                Err(_) => return false,
            }
        };

        let mut refreshed = track.clone();
        refreshed.file_size = stat.0;
        refreshed.last_modified = stat.1;
        refreshed.file_id = fingerprint(&track.file_path, stat.0, stat.1);
        self.replace_track(&track.file_id, refreshed);
        true
    }

    /// Re-stats the tracks the last validation pass classified modified and
    /// rewrites them under their new fingerprints. Returns the refresh count.
    pub fn refresh_modified_tracks(&mut self) -> usize {
        let modified = std::mem::take(&mut self.last_modified);
        let mut refreshed = 0;
        for file_id in modified {
            let Some(track) = self.tracks.get(&file_id).cloned() else {
                continue;
            };
            if self.refresh_modified_track(&track) {
                refreshed += 1;
            }
        }
        if refreshed > 0 {
            if let Err(err) = self.save() {
                warn!("Refresh: failed to persist cache: {err}");
            }
            info!("Refreshed {refreshed} modified track(s)");
        }
        refreshed
    }

    /// Removes the tracks the last validation pass classified invalid.
    /// Playlist references are left dangling until an explicit cleanup.
    pub fn prune_invalid_tracks(&mut self) -> usize {
        let invalid = std::mem::take(&mut self.last_invalid);
        let mut removed = 0;
        for file_id in invalid {
            if self.tracks.remove(&file_id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            if let Err(err) = self.save() {
                warn!("Prune: failed to persist cache: {err}");
            }
            info!("Pruned {removed} invalid track(s)");
        }
        removed
    }

    // ---- playlists ----

    pub fn create_playlist(&mut self, name: &str, description: &str) -> Result<Playlist, String> {
        let name = name.trim();
        if name.is_empty() {
            return Err("playlist name must not be empty".to_string());
        }
        let now = persist::now_unix_ms();
        let playlist = Playlist {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            track_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            cover_image: None,
        };
        self.playlists.push(playlist.clone());
        self.save()?;
        Ok(playlist)
    }

    pub fn delete_playlist(&mut self, playlist_id: &str) -> Result<bool, String> {
        let before = self.playlists.len();
        self.playlists.retain(|playlist| playlist.id != playlist_id);
        let removed = self.playlists.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn rename_playlist(&mut self, playlist_id: &str, name: &str) -> Result<(), String> {
        let name = name.trim();
        if name.is_empty() {
            return Err("playlist name must not be empty".to_string());
        }
        let playlist = self
            .playlists
            .iter_mut()
            .find(|playlist| playlist.id == playlist_id)
            .ok_or_else(|| format!("unknown playlist '{playlist_id}'"))?;
        playlist.name = name.to_string();
        playlist.updated_at = persist::now_unix_ms();
        self.save()
    }

    /// Adds a cataloged track to a playlist; rejects unknown tracks and
    /// duplicate membership.
    pub fn add_track_to_playlist(
        &mut self,
        playlist_id: &str,
        file_id: &str,
    ) -> Result<(), String> {
        if !self.tracks.contains_key(file_id) {
            return Err(format!("unknown track '{file_id}'"));
        }
        let playlist = self
            .playlists
            .iter_mut()
            .find(|playlist| playlist.id == playlist_id)
            .ok_or_else(|| format!("unknown playlist '{playlist_id}'"))?;
        if playlist.track_ids.iter().any(|id| id == file_id) {
            return Err(format!(
                "track '{file_id}' is already in playlist '{}'",
                playlist.name
            ));
        }
        playlist.track_ids.push(file_id.to_string());
        playlist.updated_at = persist::now_unix_ms();
        self.save()
    }

    pub fn remove_track_from_playlist(
        &mut self,
        playlist_id: &str,
        file_id: &str,
    ) -> Result<(), String> {
        let playlist = self
            .playlists
            .iter_mut()
            .find(|playlist| playlist.id == playlist_id)
            .ok_or_else(|| format!("unknown playlist '{playlist_id}'"))?;
        let before = playlist.track_ids.len();
        playlist.track_ids.retain(|id| id != file_id);
        if playlist.track_ids.len() == before {
            return Err(format!(
                "track '{file_id}' is not in playlist '{}'",
                playlist.name
            ));
        }
        playlist.updated_at = persist::now_unix_ms();
        self.save()
    }

    /// Drops playlist references to tracks no longer in the catalog.
    /// Returns the number of references removed.
    pub fn cleanup_playlist_tracks(&mut self) -> usize {
        let now = persist::now_unix_ms();
        let mut removed = 0;
        for playlist in &mut self.playlists {
            let before = playlist.track_ids.len();
            let tracks = &self.tracks;
            playlist.track_ids.retain(|id| tracks.contains_key(id));
            let dropped = before - playlist.track_ids.len();
            if dropped > 0 {
                playlist.updated_at = now;
                removed += dropped;
            }
        }
        if removed > 0 {
            if let Err(err) = self.save() {
                warn!("Playlist cleanup: failed to persist cache: {err}");
            }
            info!("Playlist cleanup removed {removed} dangling reference(s)");
        }
        removed
    }

    // ---- bus loop ----

    /// Blocking command loop; exits when the bus closes.
    pub fn run(mut self, mut bus_consumer: Receiver<Message>) {
        loop {
            match bus_consumer.blocking_recv() {
                Ok(Message::Cache(message)) => self.handle_message(message),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("LibraryCacheManager lagged on control bus, skipped {skipped} message(s)");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn handle_message(&mut self, message: CacheMessage) {
        match message {
            CacheMessage::ScanDirectories(roots) => self.scan_directories(roots),
            CacheMessage::RequestValidation => {
                let (valid, invalid, modified) = self.validate_cached_tracks();
                self.emit(CacheMessage::ValidationCompleted {
                    valid,
                    invalid,
                    modified,
                });
            }
            CacheMessage::PruneInvalidTracks => {
                self.prune_invalid_tracks();
            }
            CacheMessage::RefreshModifiedTracks => {
                self.refresh_modified_tracks();
            }
            CacheMessage::CreatePlaylist { name, description } => {
                self.playlist_op("create playlist", |manager| {
                    manager.create_playlist(&name, &description).map(|_| ())
                });
            }
            CacheMessage::DeletePlaylist { playlist_id } => {
                self.playlist_op("delete playlist", |manager| {
                    manager.delete_playlist(&playlist_id).map(|_| ())
                });
            }
            CacheMessage::RenamePlaylist { playlist_id, name } => {
                self.playlist_op("rename playlist", |manager| {
                    manager.rename_playlist(&playlist_id, &name)
                });
            }
            CacheMessage::AddTrackToPlaylist { playlist_id, file_id } => {
                self.playlist_op("add track to playlist", |manager| {
                    manager.add_track_to_playlist(&playlist_id, &file_id)
                });
            }
            CacheMessage::RemoveTrackFromPlaylist { playlist_id, file_id } => {
                self.playlist_op("remove track from playlist", |manager| {
                    manager.remove_track_from_playlist(&playlist_id, &file_id)
                });
            }
            CacheMessage::CleanupPlaylistTracks => {
                if self.cleanup_playlist_tracks() > 0 {
                    self.emit(CacheMessage::PlaylistsUpdated(self.playlists()));
                }
            }
            // Notifications we publish ourselves.
            CacheMessage::ScanStarted
            | CacheMessage::ScanProgress { .. }
            | CacheMessage::ScanCompleted { .. }
            | CacheMessage::ScanFailed(_)
            | CacheMessage::ValidationProgress(_)
            | CacheMessage::ValidationCompleted { .. }
            | CacheMessage::PlaylistsUpdated(_)
            | CacheMessage::CacheOperationFailed { .. } => {}
        }
    }

    fn playlist_op(
        &mut self,
        action: &str,
        op: impl FnOnce(&mut Self) -> Result<(), String>,
    ) {
        match op(self) {
            Ok(()) => self.emit(CacheMessage::PlaylistsUpdated(self.playlists())),
            Err(error) => {
                warn!("{action} failed: {error}");
                self.emit(CacheMessage::CacheOperationFailed {
                    action: action.to_string(),
                    error,
                });
            }
        }
    }
}

fn has_audio_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_unverifiable(error: &str) -> bool {
    UNVERIFIABLE_MARKERS
        .iter()
        .any(|marker| error.contains(marker))
}

/// Lists one local directory as scan entries.
fn list_local_directory(dir: &str) -> Result<Vec<NetworkEntry>, String> {
    let entries =
        fs::read_dir(dir).map_err(|err| format!("failed to list '{dir}': {err}"))?;
    let mut listing = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| format!("failed to list '{dir}': {err}"))?;
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Scan: skipping unreadable entry in '{dir}': {err}");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        let modified = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0);
        listing.push(NetworkEntry {
            path: entry.path().to_string_lossy().to_string(),
            name,
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified,
        });
    }
    listing.sort_unstable_by(|left, right| left.name.cmp(&right.name));
    Ok(listing)
}
